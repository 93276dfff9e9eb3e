use std::fmt;
use std::sync::Arc;

use crate::error::{ConvError, ConvResult};
use crate::layout::Layout;
use crate::profiling;

use super::{
    BiasGradDesc, ConvolutionDesc, ConvolutionOp, PrimitiveLibrary, RawPrimitive, ResourceRole,
    Resources,
};

/// Owned library primitive, released when dropped.
pub struct Primitive {
    raw: RawPrimitive,
    op: &'static str,
    library: Arc<dyn PrimitiveLibrary>,
}

impl Primitive {
    pub fn convolution(
        library: &Arc<dyn PrimitiveLibrary>,
        op: ConvolutionOp,
        desc: &ConvolutionDesc,
    ) -> ConvResult<Self> {
        let raw = library
            .create_convolution(op, desc)
            .map_err(|status| ConvError::primitive(op.create_name(), status))?;
        let name = match op {
            ConvolutionOp::Forward | ConvolutionOp::ForwardBias => "forward convolution",
            ConvolutionOp::BackwardData => "backward-data convolution",
            ConvolutionOp::BackwardFilter => "backward-filter convolution",
        };
        Ok(Primitive::from_raw(library, raw, name))
    }

    pub fn backward_bias(
        library: &Arc<dyn PrimitiveLibrary>,
        desc: &BiasGradDesc,
    ) -> ConvResult<Self> {
        let raw = library
            .create_backward_bias(desc)
            .map_err(|status| ConvError::primitive("create backward-bias convolution", status))?;
        Ok(Primitive::from_raw(library, raw, "backward-bias convolution"))
    }

    pub fn conversion(
        library: &Arc<dyn PrimitiveLibrary>,
        from: &Layout,
        to: &Layout,
    ) -> ConvResult<Self> {
        let raw = library
            .create_conversion(from, to)
            .map_err(|status| ConvError::primitive("create layout conversion", status))?;
        Ok(Primitive::from_raw(library, raw, "layout conversion"))
    }

    fn from_raw(library: &Arc<dyn PrimitiveLibrary>, raw: RawPrimitive, op: &'static str) -> Self {
        Primitive {
            raw,
            op,
            library: Arc::clone(library),
        }
    }

    pub fn raw(&self) -> RawPrimitive {
        self.raw
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn library(&self) -> &Arc<dyn PrimitiveLibrary> {
        &self.library
    }

    pub fn layout(&self, role: ResourceRole) -> ConvResult<Layout> {
        self.library
            .layout_of(self.raw, role)
            .map_err(|status| ConvError::primitive("query primitive layout", status))
    }

    pub fn execute(&self, resources: &mut Resources<'_>) -> ConvResult<()> {
        let _scope = profiling::primitive_scope(self.op);
        self.library
            .execute(self.raw, resources)
            .map_err(|status| ConvError::primitive(self.op, status))
    }
}

impl Drop for Primitive {
    fn drop(&mut self) {
        if let Err(status) = self.library.release(self.raw) {
            tracing::warn!(
                library = self.library.name(),
                op = self.op,
                handle = self.raw.0,
                %status,
                "failed to release primitive"
            );
        }
    }
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Primitive")
            .field("raw", &self.raw)
            .field("op", &self.op)
            .field("library", &self.library.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::library::{HandleTable, LibraryBuild, LibraryResult, Status};

    #[derive(Default)]
    struct CountingLibrary {
        handles: HandleTable<()>,
        releases: AtomicUsize,
    }

    impl PrimitiveLibrary for CountingLibrary {
        fn name(&self) -> &str {
            "counting"
        }

        fn build(&self) -> LibraryBuild {
            LibraryBuild::new("test", 20170101)
        }

        fn create_convolution(
            &self,
            _op: ConvolutionOp,
            _desc: &ConvolutionDesc,
        ) -> LibraryResult<RawPrimitive> {
            Err(Status::UNIMPLEMENTED)
        }

        fn create_backward_bias(&self, _desc: &BiasGradDesc) -> LibraryResult<RawPrimitive> {
            Err(Status::UNIMPLEMENTED)
        }

        fn create_conversion(&self, _from: &Layout, _to: &Layout) -> LibraryResult<RawPrimitive> {
            Ok(self.handles.insert(()))
        }

        fn layout_of(&self, _p: RawPrimitive, _role: ResourceRole) -> LibraryResult<Layout> {
            Err(Status::UNIMPLEMENTED)
        }

        fn execute(&self, p: RawPrimitive, _resources: &mut Resources<'_>) -> LibraryResult<()> {
            self.handles.get(p).map(|_| ())
        }

        fn release(&self, p: RawPrimitive) -> LibraryResult<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.handles.remove(p)
        }

        fn live_primitives(&self) -> usize {
            self.handles.len()
        }
    }

    #[test]
    fn drop_releases_exactly_once() {
        let counting = Arc::new(CountingLibrary::default());
        let library: Arc<dyn PrimitiveLibrary> = counting.clone();
        let layout = Layout::packed(&[4]);
        {
            let primitive = Primitive::conversion(&library, &layout, &layout).unwrap();
            primitive.execute(&mut Resources::new()).unwrap();
            assert_eq!(library.live_primitives(), 1);
        }
        assert_eq!(library.live_primitives(), 0);
        assert_eq!(counting.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn creation_failure_carries_operation_and_status() {
        let library: Arc<dyn PrimitiveLibrary> = Arc::new(CountingLibrary::default());
        let desc = BiasGradDesc {
            groups: 1,
            dimension: 4,
            dst_sizes: [1, 1, 1, 1],
        };
        let err = Primitive::backward_bias(&library, &desc).unwrap_err();
        assert_eq!(err.status(), Some(Status::UNIMPLEMENTED));
        assert!(err.to_string().contains("backward-bias"), "{err}");
    }
}
