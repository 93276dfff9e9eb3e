use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{ConvError, ConvResult};

use super::filler::Filler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Direct loops over canonical data.
    Reference,
    /// Compiled primitives from a registered library.
    #[default]
    Accelerated,
}

/// Static configuration of a convolution layer. Spatial pairs are `[h, w]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvolutionParams {
    pub name: String,
    pub num_output: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub group: usize,
    pub bias_term: bool,
    pub weight_filler: Filler,
    pub bias_filler: Filler,
    pub engine: EngineKind,
    /// Registered primitive library used by the accelerated engine.
    pub library: String,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        ConvolutionParams {
            name: "conv".to_string(),
            num_output: 1,
            kernel: [1, 1],
            stride: [1, 1],
            pad: [0, 0],
            group: 1,
            bias_term: true,
            weight_filler: Filler::Xavier,
            bias_filler: Filler::Constant { value: 0.0 },
            engine: EngineKind::Accelerated,
            library: "faer".to_string(),
        }
    }
}

impl ConvolutionParams {
    /// Square kernel, unit stride, no padding.
    pub fn new(name: impl Into<String>, num_output: usize, kernel: usize) -> Self {
        ConvolutionParams {
            name: name.into(),
            num_output,
            kernel: [kernel, kernel],
            ..Default::default()
        }
    }

    pub fn with_kernel(mut self, kernel_h: usize, kernel_w: usize) -> Self {
        self.kernel = [kernel_h, kernel_w];
        self
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride = [stride_h, stride_w];
        self
    }

    pub fn with_pad(mut self, pad_h: usize, pad_w: usize) -> Self {
        self.pad = [pad_h, pad_w];
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_bias(mut self, bias_term: bool) -> Self {
        self.bias_term = bias_term;
        self
    }

    pub fn with_weight_filler(mut self, filler: Filler) -> Self {
        self.weight_filler = filler;
        self
    }

    pub fn with_bias_filler(mut self, filler: Filler) -> Self {
        self.bias_filler = filler;
        self
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.library = library.into();
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let params: ConvolutionParams =
            serde_json::from_str(json).context("failed to parse convolution params")?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> ConvResult<()> {
        let name = &self.name;
        if self.num_output == 0 {
            return Err(ConvError::invalid_config(format!(
                "{name}: num_output must be > 0"
            )));
        }
        if self.kernel.contains(&0) {
            return Err(ConvError::invalid_config(format!(
                "{name}: kernel size must be > 0, got {:?}",
                self.kernel
            )));
        }
        if self.stride.contains(&0) {
            return Err(ConvError::invalid_config(format!(
                "{name}: stride must be > 0, got {:?}",
                self.stride
            )));
        }
        if self.group == 0 || self.num_output % self.group != 0 {
            return Err(ConvError::invalid_config(format!(
                "{name}: num_output ({}) must be divisible by group ({})",
                self.num_output, self.group
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_defaults() {
        let params = ConvolutionParams::from_json(
            r#"{
                "name": "conv1",
                "num_output": 8,
                "kernel": [3, 3],
                "pad": [1, 1],
                "group": 2,
                "weight_filler": { "type": "gaussian", "std": 0.01 },
                "engine": "reference"
            }"#,
        )
        .unwrap();
        assert_eq!(params.stride, [1, 1]);
        assert!(params.bias_term);
        assert_eq!(params.engine, EngineKind::Reference);
        assert_eq!(params.weight_filler, Filler::Gaussian { std: 0.01 });
        assert_eq!(params.library, "faer");
    }

    #[test]
    fn group_must_divide_outputs() {
        let err = ConvolutionParams::new("conv", 6, 3)
            .with_group(4)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("divisible"), "{err}");
    }

    #[test]
    fn unknown_engine_is_a_parse_error() {
        assert!(ConvolutionParams::from_json(r#"{"engine": "gpu"}"#).is_err());
    }
}
