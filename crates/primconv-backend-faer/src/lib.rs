//! faer-backed primitive library with channel-blocked private layouts.

mod kernels;
mod library;

pub use library::{FaerLibrary, CHANNEL_BLOCK};

/// Register the faer library with the global library registry.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the library is registered.
pub fn register_faer_library() {
    primconv::library::registry::register_library("faer", FaerLibrary::create);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_FAER_LIBRARY: extern "C" fn() = {
    extern "C" fn register() {
        register_faer_library();
    }
    register
};
