//! Runtime registry of primitive libraries.
//!
//! Libraries register a constructor under a name; layers pick one at construction
//! time from configuration (see [`crate::nn::layers::conv::Engine`]). Library crates
//! register themselves on load and also expose an explicit `register_*` function.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use super::PrimitiveLibrary;

/// Factory producing a fresh library instance.
pub type LibraryConstructor = Box<dyn Fn() -> Arc<dyn PrimitiveLibrary> + Send + Sync>;

struct LibraryRegistry {
    libraries: RwLock<HashMap<String, LibraryConstructor>>,
}

impl LibraryRegistry {
    fn new() -> Self {
        Self {
            libraries: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, name: String, constructor: LibraryConstructor) {
        self.libraries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Arc<dyn PrimitiveLibrary>> {
        let registry = self.libraries.read().unwrap_or_else(PoisonError::into_inner);
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn contains(&self, name: &str) -> bool {
        self.libraries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

static GLOBAL_REGISTRY: OnceLock<LibraryRegistry> = OnceLock::new();

fn global_registry() -> &'static LibraryRegistry {
    GLOBAL_REGISTRY.get_or_init(LibraryRegistry::new)
}

/// Register a library by name. Registering an existing name replaces it.
///
/// # Example
/// ```ignore
/// use primconv::library::registry::register_library;
///
/// pub fn register() {
///     register_library("my-library", || Arc::new(MyLibrary::new()));
/// }
/// ```
pub fn register_library<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn PrimitiveLibrary> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Create a library instance by name, `None` if nothing is registered under it.
pub fn create_library(name: &str) -> Option<Arc<dyn PrimitiveLibrary>> {
    global_registry().create(name)
}

/// Registered library names, sorted.
pub fn list_libraries() -> Vec<String> {
    global_registry().list()
}

pub fn has_library(name: &str) -> bool {
    global_registry().contains(name)
}
