//! Convolution through a primitive library.
//!
//! Primitives are compiled once per input shape and cached in a [`PrimitiveSet`].
//! Every pass feeds each primitive slot through its layout descriptor, which keeps
//! converted copies either on the blob itself (filters, biases, diffs flowing
//! between layers) or in descriptor-owned scratch buffers.

use std::sync::Arc;

use crate::error::{ConvError, ConvResult};
use crate::library::{Capabilities, PrimitiveLibrary, RawPrimitive, ResourceRole, Resources};
use crate::tensor::{Blob, StorageKind};

use super::base::ConvolutionBase;
use super::executor::ConvExecutor;
use super::primitive_set::PrimitiveSet;
use super::resolver::ResolvedConvolution;

pub struct AcceleratedExecutor {
    library: Arc<dyn PrimitiveLibrary>,
    capabilities: Capabilities,
    resolved: Option<ResolvedConvolution>,
    primitives: Option<PrimitiveSet>,
    generation: u64,
}

impl AcceleratedExecutor {
    /// Executor with capabilities detected from the library build.
    pub fn new(library: Arc<dyn PrimitiveLibrary>) -> Self {
        let capabilities = Capabilities::detect(&library.build());
        Self::with_capabilities(library, capabilities)
    }

    pub fn with_capabilities(library: Arc<dyn PrimitiveLibrary>, capabilities: Capabilities) -> Self {
        AcceleratedExecutor {
            library,
            capabilities,
            resolved: None,
            primitives: None,
            generation: 0,
        }
    }

    pub fn library(&self) -> &Arc<dyn PrimitiveLibrary> {
        &self.library
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn resolved(&self) -> Option<&ResolvedConvolution> {
        self.resolved.as_ref()
    }

    pub fn primitives(&self) -> Option<&PrimitiveSet> {
        self.primitives.as_ref()
    }

    fn backward_data(
        set: &mut PrimitiveSet,
        base: &mut ConvolutionBase,
        top: &mut Blob,
        bottom: &mut Blob,
    ) -> ConvResult<()> {
        let top_at = set.bwdd_top_diff.prepare(top, StorageKind::Diff, true, None)?;
        let weight = base.weight_mut();
        let filter_at = set
            .bwdd_filter_data
            .prepare(weight, StorageKind::Data, false, None)?;
        let diff_src = if set.bwdd_bottom_diff.conversion_needed() {
            bottom.set_private_diff_descriptor(set.bwdd_bottom_diff.descriptor())?;
            bottom.mutable_private_diff()?
        } else {
            bottom.mutable_canonical_diff()?
        };

        let set = &*set;
        let mut resources = Resources::new();
        resources
            .bind_input(
                ResourceRole::DiffDst,
                set.bwdd_top_diff.view(top_at, top, StorageKind::Diff, None)?,
            )
            .bind_input(
                ResourceRole::Filter,
                set.bwdd_filter_data
                    .view(filter_at, weight, StorageKind::Data, None)?,
            )
            .bind_output(ResourceRole::DiffSrc, diff_src);
        set.backward_data.execute(&mut resources)
    }

    fn backward_filter(
        set: &mut PrimitiveSet,
        base: &mut ConvolutionBase,
        top: &mut Blob,
        bottom: &mut Blob,
        accumulate: bool,
    ) -> ConvResult<()> {
        let top_at = set.bwdf_top_diff.prepare(top, StorageKind::Diff, true, None)?;
        let bottom_at = set.bwdf_bottom_data.prepare(
            bottom,
            StorageKind::Data,
            false,
            Some(&set.fwd_bottom_data),
        )?;

        let weight = base.weight_mut();
        let diff_private = set.bwdf_filter_diff.conversion_needed();
        if diff_private {
            weight.set_private_diff_descriptor(set.bwdf_filter_diff.descriptor())?;
        }

        {
            let diff_filter = if let Some(adapter) = set.filter_diff_adapter.as_mut() {
                adapter.prv_buffer_mut()
            } else if accumulate {
                set.bwdf_filter_diff_iter.prv_buffer_mut()
            } else if diff_private {
                weight.mutable_private_diff()?
            } else {
                weight.mutable_canonical_diff()?
            };
            let mut resources = Resources::new();
            resources
                .bind_input(
                    ResourceRole::DiffDst,
                    set.bwdf_top_diff.view(top_at, top, StorageKind::Diff, None)?,
                )
                .bind_input(
                    ResourceRole::Src,
                    set.bwdf_bottom_data.view(
                        bottom_at,
                        bottom,
                        StorageKind::Data,
                        Some(&set.fwd_bottom_data),
                    )?,
                )
                .bind_output(ResourceRole::DiffFilter, diff_filter);
            set.backward_filter.execute(&mut resources)?;
        }

        if let Some(adapter) = set.filter_diff_adapter.as_ref() {
            let target = if accumulate {
                set.bwdf_filter_diff_iter.prv_buffer_mut()
            } else if diff_private {
                weight.mutable_private_diff()?
            } else {
                weight.mutable_canonical_diff()?
            };
            adapter.convert_from_private(adapter.prv_buffer(), target)?;
        }

        if accumulate {
            let diff = if diff_private {
                weight.mutable_private_diff()?
            } else {
                weight.mutable_canonical_diff()?
            };
            axpy(set.bwdf_filter_diff_iter.prv_buffer(), diff, "filter diff")?;
        }
        Ok(())
    }

    fn backward_bias(
        set: &mut PrimitiveSet,
        base: &mut ConvolutionBase,
        top: &mut Blob,
        accumulate: bool,
    ) -> ConvResult<()> {
        let bias_set = set.backward_bias.as_mut().ok_or(ConvError::NotInitialized)?;
        let bias = base.bias_mut().ok_or(ConvError::NotInitialized)?;
        let top_at = bias_set.top_diff.prepare(top, StorageKind::Diff, true, None)?;

        let diff_private = bias_set.bias_diff.conversion_needed();
        if diff_private {
            bias.set_private_diff_descriptor(bias_set.bias_diff.descriptor())?;
        }

        {
            let diff_bias = if accumulate {
                bias_set.bias_diff_iter.prv_buffer_mut()
            } else if diff_private {
                bias.mutable_private_diff()?
            } else {
                bias.mutable_canonical_diff()?
            };
            let mut resources = Resources::new();
            resources
                .bind_input(
                    ResourceRole::DiffDst,
                    bias_set.top_diff.view(top_at, top, StorageKind::Diff, None)?,
                )
                .bind_output(ResourceRole::DiffBias, diff_bias);
            bias_set.primitive.execute(&mut resources)?;
        }

        if accumulate {
            let diff = if diff_private {
                bias.mutable_private_diff()?
            } else {
                bias.mutable_canonical_diff()?
            };
            axpy(bias_set.bias_diff_iter.prv_buffer(), diff, "bias diff")?;
        }
        Ok(())
    }
}

/// `y += x` over the whole private buffer, padding included.
fn axpy(x: &[f32], y: &mut [f32], what: &str) -> ConvResult<()> {
    if x.len() != y.len() {
        return Err(ConvError::layout(format!(
            "cannot accumulate {what}: {} values into {}",
            x.len(),
            y.len()
        )));
    }
    for (y, x) in y.iter_mut().zip(x) {
        *y += x;
    }
    Ok(())
}

impl ConvExecutor for AcceleratedExecutor {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn init(&mut self, base: &ConvolutionBase) -> ConvResult<()> {
        // Old handles go first so a rebuild never holds two sets at once.
        self.primitives = None;
        self.resolved = None;
        let resolved = ResolvedConvolution::resolve(base, self.capabilities)?;
        self.generation += 1;
        tracing::debug!(
            layer = base.name(),
            library = self.library.name(),
            generation = self.generation,
            input = ?resolved.input_key(),
            groups = resolved.geometry.groups,
            "initializing convolution primitives"
        );
        let set = PrimitiveSet::build(
            &self.library,
            self.capabilities,
            &resolved,
            base.name(),
            self.generation,
        )?;
        self.resolved = Some(resolved);
        self.primitives = Some(set);
        Ok(())
    }

    fn reshape(&mut self, base: &ConvolutionBase) -> ConvResult<bool> {
        let [n, c, h, w] = base.input_dims().ok_or(ConvError::NotInitialized)?;
        let unchanged = match (&self.resolved, &self.primitives) {
            (Some(resolved), Some(_)) => resolved.input_key() == [w, h, c, n],
            _ => false,
        };
        if unchanged {
            return Ok(false);
        }
        self.init(base)?;
        Ok(true)
    }

    fn forward(
        &mut self,
        base: &mut ConvolutionBase,
        bottom: &mut Blob,
        top: &mut Blob,
    ) -> ConvResult<()> {
        base.check_shapes(bottom.shape(), top.shape())?;
        let set = self.primitives.as_mut().ok_or(ConvError::NotInitialized)?;

        let bottom_at = set
            .fwd_bottom_data
            .prepare(bottom, StorageKind::Data, false, None)?;
        let (weight, mut bias) = base.blobs_mut();
        let filter_at = set
            .fwd_filter_data
            .prepare(weight, StorageKind::Data, true, None)?;
        let bias_at = match (set.fwd_bias_data.as_mut(), bias.as_deref_mut()) {
            (Some(descriptor), Some(blob)) => {
                Some(descriptor.prepare(blob, StorageKind::Data, true, None)?)
            }
            (None, None) => None,
            _ => return Err(ConvError::NotInitialized),
        };
        let dst = if set.fwd_top_data.conversion_needed() {
            top.set_private_data_descriptor(set.fwd_top_data.descriptor())?;
            top.mutable_private_data()?
        } else {
            top.mutable_canonical_data()?
        };

        let set = &*set;
        let mut resources = Resources::new();
        resources
            .bind_input(
                ResourceRole::Src,
                set.fwd_bottom_data
                    .view(bottom_at, bottom, StorageKind::Data, None)?,
            )
            .bind_input(
                ResourceRole::Filter,
                set.fwd_filter_data
                    .view(filter_at, weight, StorageKind::Data, None)?,
            );
        if let (Some(at), Some(descriptor), Some(blob)) =
            (bias_at, set.fwd_bias_data.as_ref(), bias.as_deref())
        {
            resources.bind_input(
                ResourceRole::Bias,
                descriptor.view(at, blob, StorageKind::Data, None)?,
            );
        }
        resources.bind_output(ResourceRole::Dst, dst);
        set.forward.execute(&mut resources)
    }

    fn backward(
        &mut self,
        base: &mut ConvolutionBase,
        top: &mut Blob,
        propagate_down: bool,
        bottom: &mut Blob,
        iter_size: usize,
    ) -> ConvResult<()> {
        base.check_shapes(bottom.shape(), top.shape())?;
        let accumulate = iter_size > 1;
        let set = self.primitives.as_mut().ok_or(ConvError::NotInitialized)?;

        if propagate_down {
            Self::backward_data(set, base, top, bottom)?;
        }
        if base.param_propagate_down(0) {
            Self::backward_filter(set, base, top, bottom, accumulate)?;
        }
        if base.bias_term() && base.param_propagate_down(1) {
            Self::backward_bias(set, base, top, accumulate)?;
        }
        Ok(())
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn forward_handle(&self) -> Option<RawPrimitive> {
        self.primitives.as_ref().map(|set| set.forward.raw())
    }
}
