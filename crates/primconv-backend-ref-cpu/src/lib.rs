//! Reference primitive library: canonical private layouts and direct loops.
//!
//! Every layout this library reports equals the canonical one, so the convolution
//! layer never converts data for it. It doubles as the ground truth the blocked
//! libraries are checked against.

mod library;

pub use library::RefCpuLibrary;

/// Register the reference library with the global library registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the library is registered.
pub fn register_ref_cpu_library() {
    primconv::library::registry::register_library("ref-cpu", RefCpuLibrary::create);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_REF_CPU_LIBRARY: extern "C" fn() = {
    extern "C" fn register() {
        register_ref_cpu_library();
    }
    register
};
