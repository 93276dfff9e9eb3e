use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{LibraryResult, RawPrimitive, Status};

/// Handle bookkeeping for library implementations.
///
/// Issues monotonically increasing ids and keeps the compiled state alive until the
/// handle is released. Releasing an unknown or already released handle reports
/// `INCORRECT_INPUT_PARAMETER`, which makes double releases observable.
pub struct HandleTable<T> {
    next: AtomicU64,
    entries: Mutex<HashMap<u64, Arc<T>>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        HandleTable {
            next: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, value: T) -> RawPrimitive {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries().insert(id, Arc::new(value));
        RawPrimitive(id)
    }

    pub fn get(&self, handle: RawPrimitive) -> LibraryResult<Arc<T>> {
        self.entries()
            .get(&handle.0)
            .cloned()
            .ok_or(Status::INCORRECT_INPUT_PARAMETER)
    }

    pub fn remove(&self, handle: RawPrimitive) -> LibraryResult<()> {
        self.entries()
            .remove(&handle.0)
            .map(|_| ())
            .ok_or(Status::INCORRECT_INPUT_PARAMETER)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_remove_is_reported() {
        let table = HandleTable::new();
        let a = table.insert("forward");
        let b = table.insert("backward");
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(*table.get(a).unwrap(), "forward");
        table.remove(a).unwrap();
        assert_eq!(table.remove(a), Err(Status::INCORRECT_INPUT_PARAMETER));
        assert!(table.get(a).is_err());
        assert_eq!(table.len(), 1);
    }
}
