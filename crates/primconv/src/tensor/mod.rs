//! Blob container: canonical storage plus optional private-layout views.

mod blob;
pub mod shape;
pub mod storage;

pub use blob::{Blob, StorageKind};
pub use shape::Shape;
pub use storage::{Head, PrivateDescriptor, SyncedStorage};
