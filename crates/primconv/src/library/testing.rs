//! In-crate library that only knows layout conversions, for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::layout::{self, Layout};

use super::{
    BiasGradDesc, ConvolutionDesc, ConvolutionOp, HandleTable, LibraryBuild, LibraryResult,
    PrimitiveLibrary, RawPrimitive, ResourceRole, Resources, Status,
};

#[derive(Default)]
pub(crate) struct ConversionLibrary {
    handles: HandleTable<(Layout, Layout)>,
    pub(crate) executions: AtomicUsize,
}

impl ConversionLibrary {
    pub(crate) fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl PrimitiveLibrary for ConversionLibrary {
    fn name(&self) -> &str {
        "conversion-only"
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

    fn create_conversion(&self, from: &Layout, to: &Layout) -> LibraryResult<RawPrimitive> {
        if from.sizes() != to.sizes() {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        Ok(self.handles.insert((from.clone(), to.clone())))
    }

    fn layout_of(&self, primitive: RawPrimitive, role: ResourceRole) -> LibraryResult<Layout> {
        let entry = self.handles.get(primitive)?;
        match role {
            ResourceRole::From => Ok(entry.0.clone()),
            ResourceRole::To => Ok(entry.1.clone()),
            _ => Err(Status::INCORRECT_INPUT_PARAMETER),
        }
    }

    fn execute(&self, primitive: RawPrimitive, resources: &mut Resources<'_>) -> LibraryResult<()> {
        let entry = self.handles.get(primitive)?;
        let src = resources
            .input(ResourceRole::From)
            .ok_or(Status::UNEXPECTED_NULL_POINTER)?;
        let dst = resources
            .take_output(ResourceRole::To)
            .ok_or(Status::UNEXPECTED_NULL_POINTER)?;
        layout::convert(&entry.0, src, &entry.1, dst)
            .map_err(|_| Status::INCORRECT_INPUT_PARAMETER)?;
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self, primitive: RawPrimitive) -> LibraryResult<()> {
        self.handles.remove(primitive)
    }

    fn live_primitives(&self) -> usize {
        self.handles.len()
    }
}
