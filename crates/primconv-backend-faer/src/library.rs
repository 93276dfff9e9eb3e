use std::sync::Arc;

use primconv::layout::{self, Layout};
use primconv::library::{
    BiasGradDesc, ConvolutionDesc, ConvolutionOp, HandleTable, LibraryBuild, LibraryResult,
    PrimitiveLibrary, RawPrimitive, ResourceRole, Resources, Status, BACKWARD_BIAS_ROLES,
    CONVERSION_ROLES,
};
use primconv::ops::ConvGeometry;

use crate::kernels;

/// Channel block of every blocked layout this library reports.
pub const CHANNEL_BLOCK: usize = 8;

/// Private layouts of one convolution primitive.
#[derive(Debug, Clone)]
struct ConvLayouts {
    src: Layout,
    dst: Layout,
    filter: Layout,
    diff_filter: Layout,
    bias: Layout,
}

impl ConvLayouts {
    fn new(desc: &ConvolutionDesc) -> Self {
        ConvLayouts {
            src: Layout::blocked(&desc.src_sizes, 2, CHANNEL_BLOCK),
            dst: Layout::blocked(&desc.dst_sizes, 2, CHANNEL_BLOCK),
            // {kw, kh, ic/g, oc(/g), [g]}: forward weights block output channels,
            // weight gradients block input channels.
            filter: Layout::blocked(&desc.filter_sizes, 3, CHANNEL_BLOCK),
            diff_filter: Layout::blocked(&desc.filter_sizes, 2, CHANNEL_BLOCK),
            bias: desc.bias_layout(),
        }
    }

    fn canonical(desc: &ConvolutionDesc) -> ConvLayouts {
        ConvLayouts {
            src: desc.src_layout(),
            dst: desc.dst_layout(),
            filter: desc.filter_layout(),
            diff_filter: desc.filter_layout(),
            bias: desc.bias_layout(),
        }
    }
}

enum Compiled {
    Convolution {
        op: ConvolutionOp,
        geometry: ConvGeometry,
        layouts: ConvLayouts,
        canonical: ConvLayouts,
    },
    BackwardBias {
        geometry: ConvGeometry,
        diff_dst: Layout,
        canonical_diff_dst: Layout,
        bias: Layout,
    },
    Conversion {
        from: Layout,
        to: Layout,
    },
}

impl Compiled {
    fn roles(&self) -> &'static [ResourceRole] {
        match self {
            Compiled::Convolution { op, .. } => op.roles(),
            Compiled::BackwardBias { .. } => BACKWARD_BIAS_ROLES,
            Compiled::Conversion { .. } => CONVERSION_ROLES,
        }
    }

    fn layout(&self, role: ResourceRole) -> LibraryResult<&Layout> {
        if !self.roles().contains(&role) {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        Ok(match (self, role) {
            (Compiled::Convolution { layouts, .. }, ResourceRole::Src | ResourceRole::DiffSrc) => {
                &layouts.src
            }
            (Compiled::Convolution { layouts, .. }, ResourceRole::Dst | ResourceRole::DiffDst) => {
                &layouts.dst
            }
            (Compiled::Convolution { layouts, .. }, ResourceRole::Filter) => &layouts.filter,
            (Compiled::Convolution { layouts, .. }, ResourceRole::DiffFilter) => {
                &layouts.diff_filter
            }
            (Compiled::Convolution { layouts, .. }, _) => &layouts.bias,
            (Compiled::BackwardBias { diff_dst, .. }, ResourceRole::DiffDst) => diff_dst,
            (Compiled::BackwardBias { bias, .. }, _) => bias,
            (Compiled::Conversion { from, .. }, ResourceRole::From) => from,
            (Compiled::Conversion { to, .. }, _) => to,
        })
    }
}

/// Library running convolutions as faer GEMMs over channel-blocked private layouts.
///
/// Inputs are unpacked into canonical scratch, lowered with im2col and multiplied
/// per group; outputs are packed back into the reported private layout.
pub struct FaerLibrary {
    handles: HandleTable<Compiled>,
}

impl Default for FaerLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl FaerLibrary {
    pub const BUILD_DATE: u32 = 20170720;

    pub fn new() -> Self {
        FaerLibrary {
            handles: HandleTable::new(),
        }
    }

    pub fn create() -> Arc<dyn PrimitiveLibrary> {
        Arc::new(Self::new())
    }
}

/// Unpacks a bound input from `private` into a canonical copy.
fn unpack(
    resources: &Resources<'_>,
    role: ResourceRole,
    private: &Layout,
    canonical: &Layout,
) -> LibraryResult<Vec<f32>> {
    let data = resources.require_input(role, private.memory_size())?;
    let mut out = vec![0.0; canonical.memory_size()];
    layout::convert(private, data, canonical, &mut out)
        .map_err(|_| Status::INCORRECT_INPUT_PARAMETER)?;
    Ok(out)
}

/// Packs a canonical result into the bound output's private layout.
fn pack(
    resources: &mut Resources<'_>,
    role: ResourceRole,
    canonical: &Layout,
    values: &[f32],
    private: &Layout,
) -> LibraryResult<()> {
    let dst = resources.require_output(role, private.memory_size())?;
    layout::convert(canonical, values, private, dst).map_err(|_| Status::INCORRECT_INPUT_PARAMETER)
}

fn run_convolution(
    op: ConvolutionOp,
    g: &ConvGeometry,
    private: &ConvLayouts,
    canonical: &ConvLayouts,
    resources: &mut Resources<'_>,
) -> LibraryResult<()> {
    match op {
        ConvolutionOp::Forward | ConvolutionOp::ForwardBias => {
            let src = unpack(resources, ResourceRole::Src, &private.src, &canonical.src)?;
            let filter = unpack(
                resources,
                ResourceRole::Filter,
                &private.filter,
                &canonical.filter,
            )?;
            let bias = match op {
                ConvolutionOp::ForwardBias => {
                    Some(resources.require_input(ResourceRole::Bias, private.bias.memory_size())?)
                }
                _ => None,
            };
            let mut dst = vec![0.0; g.dst_len()];
            kernels::forward(g, &src, &filter, bias, &mut dst);
            pack(resources, ResourceRole::Dst, &canonical.dst, &dst, &private.dst)
        }
        ConvolutionOp::BackwardData => {
            let diff_dst = unpack(resources, ResourceRole::DiffDst, &private.dst, &canonical.dst)?;
            let filter = unpack(
                resources,
                ResourceRole::Filter,
                &private.filter,
                &canonical.filter,
            )?;
            let mut diff_src = vec![0.0; g.src_len()];
            kernels::backward_data(g, &diff_dst, &filter, &mut diff_src);
            pack(
                resources,
                ResourceRole::DiffSrc,
                &canonical.src,
                &diff_src,
                &private.src,
            )
        }
        ConvolutionOp::BackwardFilter => {
            let src = unpack(resources, ResourceRole::Src, &private.src, &canonical.src)?;
            let diff_dst = unpack(resources, ResourceRole::DiffDst, &private.dst, &canonical.dst)?;
            let mut diff_filter = vec![0.0; g.filter_len()];
            kernels::backward_filter(g, &src, &diff_dst, &mut diff_filter);
            pack(
                resources,
                ResourceRole::DiffFilter,
                &canonical.diff_filter,
                &diff_filter,
                &private.diff_filter,
            )
        }
    }
}

impl PrimitiveLibrary for FaerLibrary {
    fn name(&self) -> &str {
        "faer"
    }

    fn build(&self) -> LibraryBuild {
        LibraryBuild::new(env!("CARGO_PKG_VERSION"), Self::BUILD_DATE)
    }

    fn create_convolution(
        &self,
        op: ConvolutionOp,
        desc: &ConvolutionDesc,
    ) -> LibraryResult<RawPrimitive> {
        let geometry = desc.geometry()?;
        let layouts = ConvLayouts::new(desc);
        tracing::debug!(
            library = "faer",
            ?op,
            src = %layouts.src,
            filter = %layouts.filter,
            flops = geometry.forward_flops(),
            "compiling convolution"
        );
        Ok(self.handles.insert(Compiled::Convolution {
            op,
            geometry,
            layouts,
            canonical: ConvLayouts::canonical(desc),
        }))
    }

    fn create_backward_bias(&self, desc: &BiasGradDesc) -> LibraryResult<RawPrimitive> {
        desc.validate()?;
        let [ow, oh, oc, n] = desc.dst_sizes;
        let geometry = ConvGeometry {
            batch: n,
            in_channels: oc,
            in_h: oh,
            in_w: ow,
            out_channels: oc,
            out_h: oh,
            out_w: ow,
            kernel_h: 1,
            kernel_w: 1,
            stride_h: 1,
            stride_w: 1,
            pad_h: 0,
            pad_w: 0,
            groups: desc.groups,
        };
        Ok(self.handles.insert(Compiled::BackwardBias {
            geometry,
            diff_dst: Layout::blocked(&desc.dst_sizes, 2, CHANNEL_BLOCK),
            canonical_diff_dst: desc.dst_layout(),
            bias: desc.bias_layout(),
        }))
    }

    fn create_conversion(&self, from: &Layout, to: &Layout) -> LibraryResult<RawPrimitive> {
        if from.sizes() != to.sizes() {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        tracing::trace!(library = "faer", %from, %to, "compiling conversion");
        Ok(self.handles.insert(Compiled::Conversion {
            from: from.clone(),
            to: to.clone(),
        }))
    }

    fn layout_of(&self, primitive: RawPrimitive, role: ResourceRole) -> LibraryResult<Layout> {
        self.handles.get(primitive)?.layout(role).cloned()
    }

    fn execute(&self, primitive: RawPrimitive, resources: &mut Resources<'_>) -> LibraryResult<()> {
        let compiled = self.handles.get(primitive)?;
        if compiled.roles().iter().any(|role| !resources.is_bound(*role)) {
            return Err(Status::UNEXPECTED_NULL_POINTER);
        }
        match compiled.as_ref() {
            Compiled::Convolution {
                op,
                geometry,
                layouts,
                canonical,
            } => run_convolution(*op, geometry, layouts, canonical, resources),
            Compiled::BackwardBias {
                geometry,
                diff_dst,
                canonical_diff_dst,
                bias,
            } => {
                let dy = unpack(resources, ResourceRole::DiffDst, diff_dst, canonical_diff_dst)?;
                let diff_bias = resources.require_output(ResourceRole::DiffBias, bias.memory_size())?;
                kernels::backward_bias(geometry, &dy, diff_bias);
                Ok(())
            }
            Compiled::Conversion { from, to } => {
                let src = resources.require_input(ResourceRole::From, from.memory_size())?;
                let dst = resources.require_output(ResourceRole::To, to.memory_size())?;
                layout::convert(from, src, to, dst).map_err(|_| Status::INCORRECT_INPUT_PARAMETER)
            }
        }
    }

    fn release(&self, primitive: RawPrimitive) -> LibraryResult<()> {
        self.handles.remove(primitive)
    }

    fn live_primitives(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use primconv::library::BorderMode;
    use smallvec::smallvec;

    use super::*;

    fn desc() -> ConvolutionDesc {
        ConvolutionDesc {
            groups: 2,
            dimension: 4,
            src_sizes: [5, 5, 4, 2],
            dst_sizes: [5, 5, 6, 2],
            filter_sizes: smallvec![3, 3, 2, 3, 2],
            strides: [1, 1],
            input_offset: [-1, -1],
            border: BorderMode::Zeros,
        }
    }

    #[test]
    fn weight_gradient_layout_differs_from_forward_filter() {
        let library = FaerLibrary::new();
        let d = desc();
        let forward = library.create_convolution(ConvolutionOp::Forward, &d).unwrap();
        let backward = library
            .create_convolution(ConvolutionOp::BackwardFilter, &d)
            .unwrap();
        let filter = library.layout_of(forward, ResourceRole::Filter).unwrap();
        let diff_filter = library.layout_of(backward, ResourceRole::DiffFilter).unwrap();
        assert_ne!(filter, diff_filter);
        assert_eq!(filter.sizes(), diff_filter.sizes());
        assert_ne!(filter, d.filter_layout());

        let src = library.layout_of(forward, ResourceRole::Src).unwrap();
        assert_eq!(src.memory_size(), 5 * 5 * 8 * 2);
        assert_eq!(library.live_primitives(), 2);
    }

    #[test]
    fn forward_rejects_short_bindings() {
        let library = FaerLibrary::new();
        let d = desc();
        let forward = library.create_convolution(ConvolutionOp::Forward, &d).unwrap();
        let src = vec![0.0; 5 * 5 * 4 * 2];
        let filter = vec![0.0; 1024];
        let mut dst = vec![0.0; 1024];
        let mut resources = Resources::new();
        resources
            .bind_input(ResourceRole::Src, &src)
            .bind_input(ResourceRole::Filter, &filter)
            .bind_output(ResourceRole::Dst, &mut dst);
        assert_eq!(
            library.execute(forward, &mut resources),
            Err(Status::INCORRECT_INPUT_PARAMETER)
        );
    }
}
