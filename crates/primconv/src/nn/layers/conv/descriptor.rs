//! Layout descriptors: one per primitive resource slot.
//!
//! A descriptor pairs the blob's canonical layout with the layout a primitive wants
//! for one slot, owns the two conversion primitives between them and, when a blob
//! cannot hold the private copy itself, a scratch buffer in the private layout.
//!
//! Feeding a slot is split in two phases. [`LayoutDescriptor::prepare`] does every
//! mutation (syncing, converting, attaching a private view to the blob) and reports
//! where the converted values ended up; [`LayoutDescriptor::view`] then borrows that
//! location immutably for binding.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::error::{ConvError, ConvResult};
use crate::layout::Layout;
use crate::library::{Primitive, PrimitiveLibrary, ResourceRole, Resources};
use crate::profiling;
use crate::tensor::{Blob, PrivateDescriptor, StorageKind};

struct Conversions {
    to_private: Primitive,
    to_canonical: Primitive,
}

/// Canonical/private layout pair with lazily created conversion primitives.
///
/// Shared as the blob-side [`PrivateDescriptor`], so a blob carrying a private view
/// keeps the conversions alive after the layer rebuilt its primitives.
pub struct LayoutBinding {
    name: String,
    library: Arc<dyn PrimitiveLibrary>,
    canonical: Layout,
    private: Layout,
    conversions: OnceCell<Conversions>,
}

impl LayoutBinding {
    pub fn new(
        library: Arc<dyn PrimitiveLibrary>,
        name: impl Into<String>,
        canonical: Layout,
        private: Layout,
    ) -> ConvResult<Self> {
        if canonical.sizes() != private.sizes() {
            return Err(ConvError::layout(format!(
                "canonical {canonical} and private {private} layouts describe different tensors"
            )));
        }
        Ok(LayoutBinding {
            name: name.into(),
            library,
            canonical,
            private,
            conversions: OnceCell::new(),
        })
    }

    pub fn canonical_layout(&self) -> &Layout {
        &self.canonical
    }

    pub fn conversion_needed(&self) -> bool {
        self.canonical != self.private
    }

    fn conversions(&self) -> ConvResult<&Conversions> {
        self.conversions.get_or_try_init(|| {
            tracing::debug!(
                descriptor = %self.name,
                canonical = %self.canonical,
                private = %self.private,
                "creating layout conversions"
            );
            Ok(Conversions {
                to_private: Primitive::conversion(&self.library, &self.canonical, &self.private)?,
                to_canonical: Primitive::conversion(&self.library, &self.private, &self.canonical)?,
            })
        })
    }

    fn run(primitive: &Primitive, src: &[f32], dst: &mut [f32]) -> ConvResult<()> {
        let mut resources = Resources::new();
        resources
            .bind_input(ResourceRole::From, src)
            .bind_output(ResourceRole::To, dst);
        primitive.execute(&mut resources)
    }

    pub fn convert_to_private(&self, canonical: &[f32], private: &mut [f32]) -> ConvResult<()> {
        Self::run(&self.conversions()?.to_private, canonical, private)
    }

    pub fn convert_from_private(&self, private: &[f32], canonical: &mut [f32]) -> ConvResult<()> {
        Self::run(&self.conversions()?.to_canonical, private, canonical)
    }

    /// Converts values held in some other private layout `from` into this binding's
    /// private layout through a one-off conversion primitive.
    pub fn convert_from_layout(&self, from: &Layout, src: &[f32], dst: &mut [f32]) -> ConvResult<()> {
        if from == &self.private {
            if src.len() != dst.len() {
                return Err(ConvError::layout(format!(
                    "{}: copying {} values into a buffer of {}",
                    self.name,
                    src.len(),
                    dst.len()
                )));
            }
            dst.copy_from_slice(src);
            return Ok(());
        }
        let primitive = Primitive::conversion(&self.library, from, &self.private)?;
        Self::run(&primitive, src, dst)
    }
}

impl PrivateDescriptor for LayoutBinding {
    fn name(&self) -> &str {
        &self.name
    }

    fn private_layout(&self) -> &Layout {
        &self.private
    }

    fn to_private(&self, canonical: &[f32], private: &mut [f32]) -> ConvResult<()> {
        self.convert_to_private(canonical, private)
    }

    fn to_canonical(&self, private: &[f32], canonical: &mut [f32]) -> ConvResult<()> {
        self.convert_from_private(private, canonical)
    }
}

impl fmt::Debug for LayoutBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutBinding")
            .field("name", &self.name)
            .field("canonical", &self.canonical)
            .field("private", &self.private)
            .field("conversions_created", &self.conversions.get().is_some())
            .finish()
    }
}

/// Where [`LayoutDescriptor::prepare`] left the values for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converted {
    /// The slot takes the blob's canonical buffer.
    Canonical,
    /// The blob's own private view is current and in the slot's layout.
    BlobPrivate,
    /// The descriptor's scratch buffer holds a converted copy.
    Own,
    /// Another descriptor's scratch buffer already holds this exact conversion.
    Reused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Source {
    blob: u64,
    kind: StorageKind,
    version: u64,
}

impl Source {
    fn of(blob: &Blob, kind: StorageKind) -> Self {
        Source {
            blob: blob.id(),
            kind,
            version: blob.storage(kind).version(),
        }
    }
}

#[derive(Debug)]
pub struct LayoutDescriptor {
    binding: Arc<LayoutBinding>,
    buffer: Vec<f32>,
    converted_from: Option<Source>,
}

impl LayoutDescriptor {
    pub fn new(
        library: Arc<dyn PrimitiveLibrary>,
        name: impl Into<String>,
        canonical: Layout,
        private: Layout,
    ) -> ConvResult<Self> {
        Ok(LayoutDescriptor {
            binding: Arc::new(LayoutBinding::new(library, name, canonical, private)?),
            buffer: Vec::new(),
            converted_from: None,
        })
    }

    /// Descriptor whose private layout is what `primitive` expects for `role`.
    pub fn from_primitive(
        primitive: &Primitive,
        role: ResourceRole,
        canonical: Layout,
        name: impl Into<String>,
    ) -> ConvResult<Self> {
        let private = primitive.layout(role)?;
        Self::new(Arc::clone(primitive.library()), name, canonical, private)
    }

    pub fn name(&self) -> &str {
        &self.binding.name
    }

    pub fn binding(&self) -> &LayoutBinding {
        &self.binding
    }

    pub fn private_layout(&self) -> &Layout {
        &self.binding.private
    }

    pub fn canonical_layout(&self) -> &Layout {
        &self.binding.canonical
    }

    pub fn conversion_needed(&self) -> bool {
        self.binding.conversion_needed()
    }

    /// Shared handle suitable for attaching to a blob.
    pub fn descriptor(&self) -> Arc<dyn PrivateDescriptor> {
        self.binding.clone()
    }

    /// Scratch buffer in the private layout, allocated on first use. Any cached
    /// conversion is forgotten since the caller is about to overwrite it.
    pub fn prv_buffer_mut(&mut self) -> &mut [f32] {
        let needed = self.binding.private.memory_size();
        if self.buffer.len() != needed {
            self.buffer = vec![0.0; needed];
        }
        self.converted_from = None;
        &mut self.buffer
    }

    pub fn prv_buffer(&self) -> &[f32] {
        &self.buffer
    }

    pub fn convert_to_private(&self, canonical: &[f32], private: &mut [f32]) -> ConvResult<()> {
        self.binding.convert_to_private(canonical, private)
    }

    pub fn convert_from_private(&self, private: &[f32], canonical: &mut [f32]) -> ConvResult<()> {
        self.binding.convert_from_private(private, canonical)
    }

    /// Brings `blob`'s `kind` values into this descriptor's private layout.
    ///
    /// With `attach`, a canonical blob receives this descriptor as its private view
    /// so later layers and iterations find the converted copy on the blob itself.
    /// `reuse` names a descriptor whose scratch buffer may already hold the same
    /// conversion of the same blob version.
    pub fn prepare(
        &mut self,
        blob: &mut Blob,
        kind: StorageKind,
        attach: bool,
        reuse: Option<&LayoutDescriptor>,
    ) -> ConvResult<Converted> {
        if !self.conversion_needed() {
            blob.storage_mut(kind).canonical()?;
            return Ok(Converted::Canonical);
        }

        if let Some((descriptor, _)) = blob.storage(kind).private() {
            if descriptor.private_layout() == self.private_layout() {
                tracing::trace!(descriptor = self.name(), "using blob's private view");
                return Ok(Converted::BlobPrivate);
            }
        }

        let source = Source::of(blob, kind);
        if let Some(other) = reuse {
            if other.private_layout() == self.private_layout()
                && other.converted_from == Some(source)
            {
                tracing::trace!(
                    descriptor = self.name(),
                    from = other.name(),
                    "reusing converted buffer"
                );
                return Ok(Converted::Reused);
            }
        }
        if self.converted_from == Some(source) {
            return Ok(Converted::Own);
        }

        let storage = blob.storage_mut(kind);
        if let Some((descriptor, values)) = storage.private() {
            let from = descriptor.private_layout().clone();
            tracing::debug!(
                descriptor = self.name(),
                from = descriptor.name(),
                from_layout = %from,
                to_layout = %self.binding.private,
                "converting between private layouts"
            );
            let _scope = profiling::conversion_scope("private_to_private", values.len());
            let binding = Arc::clone(&self.binding);
            binding.convert_from_layout(&from, values, self.prv_buffer_mut())?;
            self.converted_from = Some(source);
            return Ok(Converted::Own);
        }

        if attach {
            storage.attach_synced(self.descriptor())?;
            return Ok(Converted::BlobPrivate);
        }

        let canonical = storage.canonical()?;
        let _scope = profiling::conversion_scope("canonical_to_private", canonical.len());
        let binding = Arc::clone(&self.binding);
        binding.convert_to_private(canonical, self.prv_buffer_mut())?;
        self.converted_from = Some(source);
        Ok(Converted::Own)
    }

    /// Values placed by a preceding [`prepare`](Self::prepare) call.
    pub fn view<'a>(
        &'a self,
        converted: Converted,
        blob: &'a Blob,
        kind: StorageKind,
        reuse: Option<&'a LayoutDescriptor>,
    ) -> ConvResult<&'a [f32]> {
        let missing = || ConvError::layout(format!("{}: prepared values are gone", self.name()));
        match converted {
            Converted::Canonical => blob.storage(kind).canonical_view().ok_or_else(missing),
            Converted::BlobPrivate => blob
                .storage(kind)
                .private()
                .map(|(_, values)| values)
                .ok_or_else(missing),
            Converted::Own => Ok(&self.buffer),
            Converted::Reused => reuse.map(|other| other.prv_buffer()).ok_or_else(missing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::testing::ConversionLibrary;
    use crate::tensor::Shape;

    fn blob() -> Blob {
        let values: Vec<f32> = (0..24).map(|v| v as f32).collect();
        Blob::from_vec(Shape::new([1, 3, 2, 4]), values).unwrap()
    }

    fn descriptor(library: &Arc<ConversionLibrary>, name: &str, block: usize) -> LayoutDescriptor {
        let sizes = [4, 2, 3, 1];
        LayoutDescriptor::new(
            library.clone(),
            name,
            Layout::packed(&sizes),
            Layout::blocked(&sizes, 2, block),
        )
        .unwrap()
    }

    #[test]
    fn equal_layouts_pass_canonical_through() {
        let library = Arc::new(ConversionLibrary::default());
        let sizes = [4, 2, 3, 1];
        let mut d = LayoutDescriptor::new(
            library.clone(),
            "src",
            Layout::packed(&sizes),
            Layout::packed(&sizes),
        )
        .unwrap();
        let mut b = blob();
        let converted = d.prepare(&mut b, StorageKind::Data, true, None).unwrap();
        assert_eq!(converted, Converted::Canonical);
        assert_eq!(d.view(converted, &b, StorageKind::Data, None).unwrap()[5], 5.0);
        assert_eq!(library.live_primitives(), 0);
    }

    #[test]
    fn canonical_blob_is_converted_into_scratch_once() {
        let library = Arc::new(ConversionLibrary::default());
        let mut d = descriptor(&library, "src", 2);
        let mut b = blob();

        assert_eq!(d.prepare(&mut b, StorageKind::Data, false, None).unwrap(), Converted::Own);
        assert_eq!(d.prv_buffer().len(), 32);
        assert_eq!(library.executions(), 1);
        assert_eq!(d.prepare(&mut b, StorageKind::Data, false, None).unwrap(), Converted::Own);
        assert_eq!(library.executions(), 1, "unchanged blob is not converted again");

        b.mutable_canonical_data().unwrap()[0] = -1.0;
        d.prepare(&mut b, StorageKind::Data, false, None).unwrap();
        assert_eq!(library.executions(), 2);
        assert_eq!(d.prv_buffer()[0], -1.0);
    }

    #[test]
    fn attach_leaves_private_view_on_blob() {
        let library = Arc::new(ConversionLibrary::default());
        let mut d = descriptor(&library, "filter", 2);
        let mut b = blob();
        let converted = d.prepare(&mut b, StorageKind::Data, true, None).unwrap();
        assert_eq!(converted, Converted::BlobPrivate);
        let (attached, _) = b.storage(StorageKind::Data).private().unwrap();
        assert_eq!(attached.name(), "filter");
        assert!(d.prv_buffer().is_empty());

        let mut other = descriptor(&library, "filter again", 2);
        assert_eq!(
            other.prepare(&mut b, StorageKind::Data, false, None).unwrap(),
            Converted::BlobPrivate
        );
    }

    #[test]
    fn foreign_private_layout_is_converted_directly() {
        let library = Arc::new(ConversionLibrary::default());
        let producer = descriptor(&library, "producer", 2);
        let mut consumer = descriptor(&library, "consumer", 3);
        let mut b = blob();
        b.set_private_data_descriptor(producer.descriptor()).unwrap();
        b.mutable_private_data().unwrap();

        let converted = consumer.prepare(&mut b, StorageKind::Data, true, None).unwrap();
        assert_eq!(converted, Converted::Own);
        let values = consumer.view(converted, &b, StorageKind::Data, None).unwrap();
        let mut canonical = vec![0.0; 24];
        consumer.convert_from_private(values, &mut canonical).unwrap();
        assert_eq!(canonical, (0..24).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn matching_conversion_is_reused_until_blob_changes() {
        let library = Arc::new(ConversionLibrary::default());
        let mut forward = descriptor(&library, "fwd", 2);
        let mut backward = descriptor(&library, "bwd", 2);
        let mut b = blob();
        forward.prepare(&mut b, StorageKind::Data, false, None).unwrap();

        let converted = backward
            .prepare(&mut b, StorageKind::Data, false, Some(&forward))
            .unwrap();
        assert_eq!(converted, Converted::Reused);
        assert_eq!(
            backward.view(converted, &b, StorageKind::Data, Some(&forward)).unwrap(),
            forward.prv_buffer()
        );

        b.mutable_canonical_data().unwrap();
        let converted = backward
            .prepare(&mut b, StorageKind::Data, false, Some(&forward))
            .unwrap();
        assert_eq!(converted, Converted::Own);
    }

    #[test]
    fn conversions_are_released_with_last_owner() {
        let library = Arc::new(ConversionLibrary::default());
        let mut b = blob();
        {
            let mut d = descriptor(&library, "src", 2);
            d.prepare(&mut b, StorageKind::Data, true, None).unwrap();
            assert_eq!(library.live_primitives(), 2);
        }
        assert_eq!(library.live_primitives(), 2, "blob still holds the binding");
        b.reshape(Shape::new([1, 1, 1, 1]));
        assert_eq!(library.live_primitives(), 0);
    }
}
