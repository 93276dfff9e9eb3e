//! Head-tracked storage holding a canonical buffer and an optional private view.
//!
//! The head records which copy is authoritative. Reading the canonical copy after a
//! private write converts back; mutating the private copy after a canonical write
//! converts forward first. Layers that understand a private layout can therefore pass
//! it along without a round trip, while every other reader still sees canonical data.

use std::fmt;
use std::sync::Arc;

use crate::error::{ConvError, ConvResult};
use crate::layout::Layout;
use crate::profiling;

/// Conversion between a blob's canonical layout and one private layout.
pub trait PrivateDescriptor: Send + Sync {
    fn name(&self) -> &str;

    fn private_layout(&self) -> &Layout;

    /// Slots a private buffer needs, padding included.
    fn private_count(&self) -> usize {
        self.private_layout().memory_size()
    }

    fn to_private(&self, canonical: &[f32], private: &mut [f32]) -> ConvResult<()>;

    fn to_canonical(&self, private: &[f32], canonical: &mut [f32]) -> ConvResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    Canonical,
    Private,
    Synced,
}

struct PrivateView {
    descriptor: Arc<dyn PrivateDescriptor>,
    buffer: Vec<f32>,
}

pub struct SyncedStorage {
    canonical: Vec<f32>,
    private: Option<PrivateView>,
    head: Head,
    version: u64,
}

impl SyncedStorage {
    pub fn zeros(len: usize) -> Self {
        Self::from_vec(vec![0.0; len])
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        SyncedStorage {
            canonical: values,
            private: None,
            head: Head::Canonical,
            version: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }

    pub fn head(&self) -> Head {
        self.head
    }

    /// Bumped on every mutable access; lets caches detect stale conversions.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn descriptor(&self) -> Option<&Arc<dyn PrivateDescriptor>> {
        self.private.as_ref().map(|view| &view.descriptor)
    }

    fn sync_to_canonical(&mut self) -> ConvResult<()> {
        if self.head != Head::Private {
            return Ok(());
        }
        let view = self
            .private
            .as_ref()
            .ok_or_else(|| ConvError::layout("private head without a private view"))?;
        let _scope = profiling::conversion_scope("private_to_canonical", self.canonical.len());
        view.descriptor.to_canonical(&view.buffer, &mut self.canonical)?;
        self.head = Head::Synced;
        Ok(())
    }

    fn sync_to_private(&mut self) -> ConvResult<()> {
        if self.head != Head::Canonical {
            return Ok(());
        }
        let Some(view) = self.private.as_mut() else {
            return Ok(());
        };
        let _scope = profiling::conversion_scope("canonical_to_private", self.canonical.len());
        view.descriptor.to_private(&self.canonical, &mut view.buffer)?;
        self.head = Head::Synced;
        Ok(())
    }

    pub fn canonical(&mut self) -> ConvResult<&[f32]> {
        self.sync_to_canonical()?;
        Ok(&self.canonical)
    }

    /// Canonical values if they are current, without converting.
    pub fn canonical_view(&self) -> Option<&[f32]> {
        (self.head != Head::Private).then_some(self.canonical.as_slice())
    }

    pub fn canonical_mut(&mut self) -> ConvResult<&mut [f32]> {
        self.sync_to_canonical()?;
        self.head = Head::Canonical;
        self.version += 1;
        Ok(&mut self.canonical)
    }

    /// Private values if they are current.
    pub fn private(&self) -> Option<(&Arc<dyn PrivateDescriptor>, &[f32])> {
        match (&self.private, self.head) {
            (Some(view), Head::Private | Head::Synced) => {
                Some((&view.descriptor, view.buffer.as_slice()))
            }
            _ => None,
        }
    }

    pub fn private_mut(&mut self) -> ConvResult<&mut [f32]> {
        if self.private.is_none() {
            return Err(ConvError::layout("no private layout attached"));
        }
        self.sync_to_private()?;
        self.head = Head::Private;
        self.version += 1;
        match self.private.as_mut() {
            Some(view) => Ok(&mut view.buffer),
            None => Err(ConvError::layout("no private layout attached")),
        }
    }

    /// Attaches `descriptor` as the private view. An existing view with an equal
    /// layout is kept; otherwise current private values are synced back first.
    pub fn set_descriptor(&mut self, descriptor: Arc<dyn PrivateDescriptor>) -> ConvResult<()> {
        if let Some(view) = self.private.as_mut() {
            if view.descriptor.private_layout() == descriptor.private_layout() {
                view.descriptor = descriptor;
                return Ok(());
            }
        }
        self.sync_to_canonical()?;
        let buffer = vec![0.0; descriptor.private_count()];
        self.private = Some(PrivateView { descriptor, buffer });
        self.head = Head::Canonical;
        Ok(())
    }

    /// Attaches `descriptor` and fills its buffer from the canonical values, leaving
    /// both copies current.
    pub fn attach_synced(&mut self, descriptor: Arc<dyn PrivateDescriptor>) -> ConvResult<()> {
        self.set_descriptor(descriptor)?;
        self.sync_to_private()
    }

    /// Zeroes both copies.
    pub fn zero(&mut self) {
        self.canonical.fill(0.0);
        match self.private.as_mut() {
            Some(view) => {
                view.buffer.fill(0.0);
                self.head = Head::Synced;
            }
            None => self.head = Head::Canonical,
        }
        self.version += 1;
    }

    /// Resizes the canonical buffer. Any private view is dropped.
    pub fn resize(&mut self, len: usize) {
        if len == self.canonical.len() {
            return;
        }
        self.canonical = vec![0.0; len];
        self.private = None;
        self.head = Head::Canonical;
        self.version += 1;
    }
}

impl fmt::Debug for SyncedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncedStorage")
            .field("len", &self.canonical.len())
            .field("head", &self.head)
            .field("private", &self.descriptor().map(|d| d.name().to_string()))
            .field("version", &self.version)
            .finish()
    }
}
