use crate::error::ConvResult;
use crate::ops::conv;
use crate::tensor::Blob;

use super::base::ConvolutionBase;
use super::executor::ConvExecutor;

/// Direct loops over canonical data.
///
/// Parameter gradients are added to the existing diffs on every call, so micro-batch
/// accumulation needs no extra buffers; `iter_size` is ignored.
#[derive(Debug, Default)]
pub struct ReferenceExecutor {
    generation: u64,
    filter_scratch: Vec<f32>,
    bias_scratch: Vec<f32>,
}

impl ReferenceExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

fn accumulate(src: &[f32], dst: &mut [f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

impl ConvExecutor for ReferenceExecutor {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn init(&mut self, base: &ConvolutionBase) -> ConvResult<()> {
        base.geometry()?;
        self.generation += 1;
        Ok(())
    }

    fn reshape(&mut self, base: &ConvolutionBase) -> ConvResult<bool> {
        if self.generation == 0 {
            self.init(base)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn forward(
        &mut self,
        base: &mut ConvolutionBase,
        bottom: &mut Blob,
        top: &mut Blob,
    ) -> ConvResult<()> {
        base.check_shapes(bottom.shape(), top.shape())?;
        let g = base.geometry()?;
        let src = bottom.canonical_data()?;
        let (weight, bias) = base.blobs_mut();
        let filter = weight.canonical_data()?;
        let bias = match bias {
            Some(bias) => Some(bias.canonical_data()?),
            None => None,
        };
        conv::forward(&g, src, filter, bias, top.mutable_canonical_data()?);
        Ok(())
    }

    fn backward(
        &mut self,
        base: &mut ConvolutionBase,
        top: &mut Blob,
        propagate_down: bool,
        bottom: &mut Blob,
        _iter_size: usize,
    ) -> ConvResult<()> {
        base.check_shapes(bottom.shape(), top.shape())?;
        let g = base.geometry()?;
        let diff_dst = top.canonical_diff()?;

        if base.param_propagate_down(0) {
            self.filter_scratch.resize(g.filter_len(), 0.0);
            conv::backward_filter(&g, bottom.canonical_data()?, diff_dst, &mut self.filter_scratch);
            accumulate(&self.filter_scratch, base.weight_mut().mutable_canonical_diff()?);
        }

        if base.param_propagate_down(1) {
            if let Some(bias) = base.bias_mut() {
                self.bias_scratch.resize(g.out_channels, 0.0);
                conv::backward_bias(&g, diff_dst, &mut self.bias_scratch);
                accumulate(&self.bias_scratch, bias.mutable_canonical_diff()?);
            }
        }

        if propagate_down {
            let filter = base.weight_mut().canonical_data()?;
            conv::backward_data(&g, diff_dst, filter, bottom.mutable_canonical_diff()?);
        }
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}
