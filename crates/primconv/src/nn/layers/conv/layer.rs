use anyhow::{ensure, Context, Result};
use rand::Rng;

use crate::error::ConvError;
use crate::library::RawPrimitive;
use crate::module::{Module, VisitParamsFn, VisitParamsMutFn};
use crate::profiling;
use crate::tensor::{Blob, Shape};

use super::base::ConvolutionBase;
use super::executor::{ConvExecutor, Engine};
use super::params::ConvolutionParams;

/// 2-D convolution layer with a pluggable executor.
///
/// Call [`setup`](Self::setup) once with the first input shape, then
/// [`reshape`](Self::reshape) whenever the input shape may have changed.
pub struct ConvolutionLayer {
    base: ConvolutionBase,
    executor: Box<dyn ConvExecutor>,
    iter_size: usize,
}

impl ConvolutionLayer {
    /// Allocates parameters for inputs shaped like `bottom`. No primitives are
    /// built until `setup`.
    pub fn new(
        params: ConvolutionParams,
        engine: Engine,
        bottom: &Shape,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let name = params.name.clone();
        let base = ConvolutionBase::new(params, bottom, rng)
            .with_context(|| format!("failed to create convolution layer '{name}'"))?;
        Ok(ConvolutionLayer {
            base,
            executor: engine.into_executor(),
            iter_size: 1,
        })
    }

    /// Like [`new`](Self::new), with the engine taken from `params` and the
    /// environment overrides.
    pub fn from_params(params: ConvolutionParams, bottom: &Shape, rng: &mut impl Rng) -> Result<Self> {
        let engine = Engine::from_params(&params)?;
        Self::new(params, engine, bottom, rng)
    }

    /// Sizes `top` for `bottom` and builds the executor state.
    pub fn setup(&mut self, bottom: &Shape, top: &mut Blob) -> Result<()> {
        self.base.reshape(bottom, top)?;
        self.executor
            .init(&self.base)
            .with_context(|| format!("failed to set up convolution layer '{}'", self.base.name()))?;
        Ok(())
    }

    /// Resizes `top` for `bottom`. Returns `true` iff the executor had to rebuild.
    pub fn reshape(&mut self, bottom: &Shape, top: &mut Blob) -> Result<bool> {
        self.base.reshape(bottom, top)?;
        let rebuilt = self.executor.reshape(&self.base).with_context(|| {
            format!("failed to reshape convolution layer '{}'", self.base.name())
        })?;
        Ok(rebuilt)
    }

    pub fn forward(&mut self, bottom: &mut Blob, top: &mut Blob) -> Result<()> {
        let _prof_guard = profiling::layer_scope("ConvolutionLayer::forward");
        self.executor.forward(&mut self.base, bottom, top)?;
        Ok(())
    }

    /// Writes the bottom diff when `propagate_down` and the parameter diffs selected
    /// by the base's `param_propagate_down` flags.
    pub fn backward(&mut self, top: &mut Blob, propagate_down: bool, bottom: &mut Blob) -> Result<()> {
        let _prof_guard = profiling::layer_scope("ConvolutionLayer::backward");
        self.executor
            .backward(&mut self.base, top, propagate_down, bottom, self.iter_size)?;
        Ok(())
    }

    pub fn forward_gpu(&mut self, _bottom: &mut Blob, _top: &mut Blob) -> Result<()> {
        Err(ConvError::NotImplemented { op: "forward_gpu" }.into())
    }

    pub fn backward_gpu(
        &mut self,
        _top: &mut Blob,
        _propagate_down: bool,
        _bottom: &mut Blob,
    ) -> Result<()> {
        Err(ConvError::NotImplemented { op: "backward_gpu" }.into())
    }

    /// Number of backward passes summed into the parameter diffs before an update.
    pub fn set_iter_size(&mut self, iter_size: usize) -> Result<()> {
        ensure!(iter_size >= 1, "iter_size must be at least 1, got {iter_size}");
        self.iter_size = iter_size;
        Ok(())
    }

    pub fn iter_size(&self) -> usize {
        self.iter_size
    }

    /// Changes whenever the executor rebuilt its compiled state.
    pub fn primitive_generation(&self) -> u64 {
        self.executor.generation()
    }

    pub fn forward_handle(&self) -> Option<RawPrimitive> {
        self.executor.forward_handle()
    }

    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    pub fn params(&self) -> &ConvolutionParams {
        self.base.params()
    }

    pub fn base(&self) -> &ConvolutionBase {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut ConvolutionBase {
        &mut self.base
    }

    pub fn weight(&self) -> &Blob {
        self.base.weight()
    }

    pub fn weight_mut(&mut self) -> &mut Blob {
        self.base.weight_mut()
    }

    pub fn bias(&self) -> Option<&Blob> {
        self.base.bias()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Blob> {
        self.base.bias_mut()
    }
}

impl Module for ConvolutionLayer {
    fn visit_params(&self, f: &mut VisitParamsFn<'_>) -> Result<()> {
        f("weight", self.base.weight())?;
        if let Some(bias) = self.base.bias() {
            f("bias", bias)?;
        }
        Ok(())
    }

    fn visit_params_mut(&mut self, f: &mut VisitParamsMutFn<'_>) -> Result<()> {
        let (weight, bias) = self.base.blobs_mut();
        f("weight", weight)?;
        if let Some(bias) = bias {
            f("bias", bias)?;
        }
        Ok(())
    }
}
