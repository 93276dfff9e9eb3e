use std::sync::Arc;

use primconv::layout::{self, Layout};
use primconv::library::capability::GROUPED_FILTER_MIN_BUILD;
use primconv::library::{
    BiasGradDesc, ConvolutionDesc, ConvolutionOp, HandleTable, LibraryBuild, LibraryResult,
    PrimitiveLibrary, RawPrimitive, ResourceRole, Resources, Status, BACKWARD_BIAS_ROLES,
    CONVERSION_ROLES,
};
use primconv::ops::conv::{self, ConvGeometry};

enum Compiled {
    Convolution {
        op: ConvolutionOp,
        geometry: ConvGeometry,
        desc: ConvolutionDesc,
    },
    BackwardBias {
        geometry: ConvGeometry,
        desc: BiasGradDesc,
    },
    Conversion {
        from: Layout,
        to: Layout,
    },
}

impl Compiled {
    fn layout(&self, role: ResourceRole) -> LibraryResult<Layout> {
        match self {
            Compiled::Convolution { op, desc, .. } => {
                if !op.roles().contains(&role) {
                    return Err(Status::INCORRECT_INPUT_PARAMETER);
                }
                Ok(match role {
                    ResourceRole::Src | ResourceRole::DiffSrc => desc.src_layout(),
                    ResourceRole::Dst | ResourceRole::DiffDst => desc.dst_layout(),
                    ResourceRole::Filter | ResourceRole::DiffFilter => desc.filter_layout(),
                    _ => desc.bias_layout(),
                })
            }
            Compiled::BackwardBias { desc, .. } => match role {
                ResourceRole::DiffDst => Ok(desc.dst_layout()),
                ResourceRole::DiffBias => Ok(desc.bias_layout()),
                _ => Err(Status::INCORRECT_INPUT_PARAMETER),
            },
            Compiled::Conversion { from, to } => match role {
                ResourceRole::From => Ok(from.clone()),
                ResourceRole::To => Ok(to.clone()),
                _ => Err(Status::INCORRECT_INPUT_PARAMETER),
            },
        }
    }

    fn roles(&self) -> &'static [ResourceRole] {
        match self {
            Compiled::Convolution { op, .. } => op.roles(),
            Compiled::BackwardBias { .. } => BACKWARD_BIAS_ROLES,
            Compiled::Conversion { .. } => CONVERSION_ROLES,
        }
    }
}

/// Geometry covering only what the bias reduction reads.
fn bias_geometry(desc: &BiasGradDesc) -> ConvGeometry {
    let [ow, oh, oc, n] = desc.dst_sizes;
    ConvGeometry {
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
    }
}

/// Primitive library whose private layouts are the canonical ones.
pub struct RefCpuLibrary {
    build: LibraryBuild,
    handles: HandleTable<Compiled>,
}

impl Default for RefCpuLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCpuLibrary {
    pub const BUILD_DATE: u32 = 20170425;

    pub fn new() -> Self {
        Self::with_build(LibraryBuild::new(env!("CARGO_PKG_VERSION"), Self::BUILD_DATE))
    }

    /// Library reporting `build`, e.g. an old build date to exercise legacy capabilities.
    pub fn with_build(build: LibraryBuild) -> Self {
        RefCpuLibrary {
            build,
            handles: HandleTable::new(),
        }
    }

    pub fn create() -> Arc<dyn PrimitiveLibrary> {
        Arc::new(Self::new())
    }

    fn run_convolution(
        op: ConvolutionOp,
        g: &ConvGeometry,
        resources: &mut Resources<'_>,
    ) -> LibraryResult<()> {
        match op {
            ConvolutionOp::Forward | ConvolutionOp::ForwardBias => {
                let src = resources.require_input(ResourceRole::Src, g.src_len())?;
                let filter = resources.require_input(ResourceRole::Filter, g.filter_len())?;
                let bias = match op {
                    ConvolutionOp::ForwardBias => {
                        Some(resources.require_input(ResourceRole::Bias, g.out_channels)?)
                    }
                    _ => None,
                };
                let dst = resources.require_output(ResourceRole::Dst, g.dst_len())?;
                conv::forward(g, src, filter, bias, dst);
            }
            ConvolutionOp::BackwardData => {
                let diff_dst = resources.require_input(ResourceRole::DiffDst, g.dst_len())?;
                let filter = resources.require_input(ResourceRole::Filter, g.filter_len())?;
                let diff_src = resources.require_output(ResourceRole::DiffSrc, g.src_len())?;
                conv::backward_data(g, diff_dst, filter, diff_src);
            }
            ConvolutionOp::BackwardFilter => {
                let src = resources.require_input(ResourceRole::Src, g.src_len())?;
                let diff_dst = resources.require_input(ResourceRole::DiffDst, g.dst_len())?;
                let diff_filter =
                    resources.require_output(ResourceRole::DiffFilter, g.filter_len())?;
                conv::backward_filter(g, src, diff_dst, diff_filter);
            }
        }
        Ok(())
    }
}

impl PrimitiveLibrary for RefCpuLibrary {
    fn name(&self) -> &str {
        "ref-cpu"
    }

    fn build(&self) -> LibraryBuild {
        self.build.clone()
    }

    fn create_convolution(
        &self,
        op: ConvolutionOp,
        desc: &ConvolutionDesc,
    ) -> LibraryResult<RawPrimitive> {
        let geometry = desc.geometry()?;
        if desc.filter_sizes.len() == 5 && self.build.build_date < GROUPED_FILTER_MIN_BUILD {
            return Err(Status::UNSUPPORTED_DIMENSION);
        }
        let handle = self.handles.insert(Compiled::Convolution {
            op,
            geometry,
            desc: desc.clone(),
        });
        tracing::debug!(library = "ref-cpu", ?op, handle = handle.0, "created convolution");
        Ok(handle)
    }

    fn create_backward_bias(&self, desc: &BiasGradDesc) -> LibraryResult<RawPrimitive> {
        desc.validate()?;
        Ok(self.handles.insert(Compiled::BackwardBias {
            geometry: bias_geometry(desc),
            desc: desc.clone(),
        }))
    }

    fn create_conversion(&self, from: &Layout, to: &Layout) -> LibraryResult<RawPrimitive> {
        if from.sizes() != to.sizes() {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        Ok(self.handles.insert(Compiled::Conversion {
            from: from.clone(),
            to: to.clone(),
        }))
    }

    fn layout_of(&self, primitive: RawPrimitive, role: ResourceRole) -> LibraryResult<Layout> {
        self.handles.get(primitive)?.layout(role)
    }

    fn execute(&self, primitive: RawPrimitive, resources: &mut Resources<'_>) -> LibraryResult<()> {
        let compiled = self.handles.get(primitive)?;
        if let Some(missing) = compiled.roles().iter().find(|r| !resources.is_bound(**r)) {
            tracing::debug!(library = "ref-cpu", role = %missing, "unbound resource");
            return Err(Status::UNEXPECTED_NULL_POINTER);
        }
        match compiled.as_ref() {
            Compiled::Convolution { op, geometry, .. } => {
                Self::run_convolution(*op, geometry, resources)
            }
            Compiled::BackwardBias { geometry, .. } => {
                let diff_dst = resources.require_input(ResourceRole::DiffDst, geometry.dst_len())?;
                let diff_bias =
                    resources.require_output(ResourceRole::DiffBias, geometry.out_channels)?;
                conv::backward_bias(geometry, diff_dst, diff_bias);
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
    use primconv::layout::Dims;
    use primconv::library::BorderMode;

    use super::*;

    fn desc(filter_sizes: Dims) -> ConvolutionDesc {
        ConvolutionDesc {
            groups: 2,
            dimension: 4,
            src_sizes: [4, 4, 4, 1],
            dst_sizes: [4, 4, 2, 1],
            filter_sizes,
            strides: [1, 1],
            input_offset: [-1, -1],
            border: BorderMode::Zeros,
        }
    }

    #[test]
    fn old_builds_reject_grouped_filters() {
        let library = RefCpuLibrary::with_build(LibraryBuild::new("old", 20160101));
        let grouped = desc(Dims::from_slice(&[3, 3, 2, 1, 2]));
        assert_eq!(
            library.create_convolution(ConvolutionOp::Forward, &grouped),
            Err(Status::UNSUPPORTED_DIMENSION)
        );
        let flat = desc(Dims::from_slice(&[3, 3, 2, 2]));
        assert!(library.create_convolution(ConvolutionOp::Forward, &flat).is_ok());
        assert_eq!(library.live_primitives(), 1);
    }

    #[test]
    fn layouts_are_canonical_and_roles_checked() {
        let library = RefCpuLibrary::new();
        let d = desc(Dims::from_slice(&[3, 3, 2, 1, 2]));
        let forward = library.create_convolution(ConvolutionOp::Forward, &d).unwrap();
        assert_eq!(
            library.layout_of(forward, ResourceRole::Filter).unwrap(),
            Layout::packed(&[3, 3, 2, 1, 2])
        );
        assert_eq!(
            library.layout_of(forward, ResourceRole::Bias),
            Err(Status::INCORRECT_INPUT_PARAMETER)
        );
        assert_eq!(
            library.execute(forward, &mut Resources::new()),
            Err(Status::UNEXPECTED_NULL_POINTER)
        );
        library.release(forward).unwrap();
        assert_eq!(library.release(forward), Err(Status::INCORRECT_INPUT_PARAMETER));
    }
}
