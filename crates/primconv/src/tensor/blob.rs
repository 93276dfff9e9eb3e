use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::error::{ConvError, ConvResult};
use crate::layout::Layout;

use super::shape::Shape;
use super::storage::{PrivateDescriptor, SyncedStorage};

static NEXT_BLOB_ID: AtomicU64 = AtomicU64::new(1);

/// Which half of a blob an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Data,
    Diff,
}

/// Values and gradients of one tensor, each with an optional private-layout view.
#[derive(Debug)]
pub struct Blob {
    id: u64,
    shape: Shape,
    data: SyncedStorage,
    diff: SyncedStorage,
}

impl Blob {
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Blob {
            id: NEXT_BLOB_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            data: SyncedStorage::zeros(len),
            diff: SyncedStorage::zeros(len),
        }
    }

    pub fn from_vec(shape: Shape, data: Vec<f32>) -> ConvResult<Self> {
        if shape.num_elements() != data.len() {
            return Err(ConvError::invalid_config(format!(
                "blob data length {} does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        let mut blob = Blob::zeros(shape);
        blob.data = SyncedStorage::from_vec(data);
        Ok(blob)
    }

    /// Gaussian values with standard deviation `std` (Box-Muller).
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        let mut blob = Blob::zeros(shape);
        blob.data = SyncedStorage::from_vec(values);
        blob
    }

    /// Process-unique identity, stable across reshapes.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn count(&self) -> usize {
        self.shape.num_elements()
    }

    pub fn canonical_layout(&self) -> Layout {
        self.shape.canonical_layout()
    }

    /// Changes the shape; storage is reallocated only when the element count changes.
    pub fn reshape(&mut self, shape: Shape) {
        let len = shape.num_elements();
        self.shape = shape;
        self.data.resize(len);
        self.diff.resize(len);
    }

    pub fn storage(&self, kind: StorageKind) -> &SyncedStorage {
        match kind {
            StorageKind::Data => &self.data,
            StorageKind::Diff => &self.diff,
        }
    }

    pub fn storage_mut(&mut self, kind: StorageKind) -> &mut SyncedStorage {
        match kind {
            StorageKind::Data => &mut self.data,
            StorageKind::Diff => &mut self.diff,
        }
    }

    pub fn canonical_data(&mut self) -> ConvResult<&[f32]> {
        self.data.canonical()
    }

    pub fn mutable_canonical_data(&mut self) -> ConvResult<&mut [f32]> {
        self.data.canonical_mut()
    }

    pub fn canonical_diff(&mut self) -> ConvResult<&[f32]> {
        self.diff.canonical()
    }

    pub fn mutable_canonical_diff(&mut self) -> ConvResult<&mut [f32]> {
        self.diff.canonical_mut()
    }

    /// Private values if a private view is attached and current.
    pub fn private_data(&self) -> Option<&[f32]> {
        self.data.private().map(|(_, values)| values)
    }

    pub fn private_diff(&self) -> Option<&[f32]> {
        self.diff.private().map(|(_, values)| values)
    }

    pub fn set_private_data_descriptor(
        &mut self,
        descriptor: Arc<dyn PrivateDescriptor>,
    ) -> ConvResult<()> {
        self.data.set_descriptor(descriptor)
    }

    pub fn set_private_diff_descriptor(
        &mut self,
        descriptor: Arc<dyn PrivateDescriptor>,
    ) -> ConvResult<()> {
        self.diff.set_descriptor(descriptor)
    }

    pub fn mutable_private_data(&mut self) -> ConvResult<&mut [f32]> {
        self.data.private_mut()
    }

    pub fn mutable_private_diff(&mut self) -> ConvResult<&mut [f32]> {
        self.diff.private_mut()
    }

    /// Overwrites the values with `values` in canonical layout.
    pub fn set_data(&mut self, values: &[f32]) -> ConvResult<()> {
        let data = self.data.canonical_mut()?;
        if data.len() != values.len() {
            return Err(ConvError::invalid_config(format!(
                "expected {} values, got {}",
                data.len(),
                values.len()
            )));
        }
        data.copy_from_slice(values);
        Ok(())
    }

    pub fn set_diff(&mut self, values: &[f32]) -> ConvResult<()> {
        let diff = self.diff.canonical_mut()?;
        if diff.len() != values.len() {
            return Err(ConvError::invalid_config(format!(
                "expected {} gradient values, got {}",
                diff.len(),
                values.len()
            )));
        }
        diff.copy_from_slice(values);
        Ok(())
    }

    pub fn zero_diff(&mut self) {
        self.diff.zero();
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::tensor::storage::tests::Reversed;

    #[test]
    fn reshape_keeps_identity_and_resets_storage_on_resize() {
        let mut blob = Blob::from_vec(Shape::new([1, 2, 1, 1]), vec![1.0, 2.0]).unwrap();
        let id = blob.id();
        blob.reshape(Shape::new([1, 1, 2, 1]));
        assert_eq!(blob.canonical_data().unwrap(), &[1.0, 2.0]);
        blob.reshape(Shape::new([2, 2, 1, 1]));
        assert_eq!(blob.id(), id);
        assert_eq!(blob.canonical_data().unwrap(), &[0.0; 4]);
    }

    #[test]
    fn data_and_diff_have_independent_private_views() {
        let mut blob = Blob::from_vec(Shape::new([2]), vec![1.0, 2.0]).unwrap();
        blob.set_private_diff_descriptor(Reversed::new(2)).unwrap();
        blob.mutable_private_diff().unwrap()[0] = 7.0;
        assert!(blob.storage(StorageKind::Data).private().is_none());
        assert_eq!(blob.canonical_diff().unwrap(), &[0.0, 7.0]);
        assert_eq!(blob.canonical_data().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn randn_is_deterministic_for_a_seed() {
        let a = Blob::randn(Shape::new([3, 3]), 0.5, &mut StdRng::seed_from_u64(7));
        let mut b = Blob::randn(Shape::new([3, 3]), 0.5, &mut StdRng::seed_from_u64(7));
        let a_values = a.storage(StorageKind::Data).canonical_view().unwrap().to_vec();
        assert_eq!(b.canonical_data().unwrap(), a_values.as_slice());
    }
}
