use std::fmt;
use std::sync::Arc;

use crate::env;
use crate::error::{ConvError, ConvResult};
use crate::library::{registry, Capabilities, PrimitiveLibrary, RawPrimitive};
use crate::tensor::Blob;

use super::accelerated::AcceleratedExecutor;
use super::base::ConvolutionBase;
use super::params::{ConvolutionParams, EngineKind};
use super::reference::ReferenceExecutor;

/// Computation strategy behind a [`ConvolutionLayer`](super::ConvolutionLayer).
///
/// `base` always carries the shape recorded by the latest reshape; executors read
/// their geometry from it and own whatever compiled state that geometry implies.
pub trait ConvExecutor: Send {
    fn name(&self) -> &'static str;

    /// Builds executor state for the current shape from scratch.
    fn init(&mut self, base: &ConvolutionBase) -> ConvResult<()>;

    /// Returns `true` iff the shape change forced a rebuild.
    fn reshape(&mut self, base: &ConvolutionBase) -> ConvResult<bool>;

    fn forward(
        &mut self,
        base: &mut ConvolutionBase,
        bottom: &mut Blob,
        top: &mut Blob,
    ) -> ConvResult<()>;

    fn backward(
        &mut self,
        base: &mut ConvolutionBase,
        top: &mut Blob,
        propagate_down: bool,
        bottom: &mut Blob,
        iter_size: usize,
    ) -> ConvResult<()>;

    /// Incremented on every rebuild.
    fn generation(&self) -> u64;

    /// Handle of the compiled forward convolution, if the executor compiles one.
    fn forward_handle(&self) -> Option<RawPrimitive> {
        None
    }
}

/// Engine selection for a convolution layer.
#[derive(Clone)]
pub enum Engine {
    Reference,
    Accelerated {
        library: Arc<dyn PrimitiveLibrary>,
        /// Detected from the library build when `None`.
        capabilities: Option<Capabilities>,
    },
}

impl Engine {
    pub fn accelerated(library: Arc<dyn PrimitiveLibrary>) -> Self {
        Engine::Accelerated {
            library,
            capabilities: None,
        }
    }

    pub fn accelerated_with(library: Arc<dyn PrimitiveLibrary>, capabilities: Capabilities) -> Self {
        Engine::Accelerated {
            library,
            capabilities: Some(capabilities),
        }
    }

    /// Resolves the configured engine, honouring `PRIMCONV_ENGINE` and
    /// `PRIMCONV_LIBRARY`, and instantiates the library from the registry.
    pub fn from_params(params: &ConvolutionParams) -> ConvResult<Self> {
        let kind = env::engine_override().unwrap_or(params.engine);
        match kind {
            EngineKind::Reference => Ok(Engine::Reference),
            EngineKind::Accelerated => {
                let name = env::library_override().unwrap_or(params.library.as_str());
                let library = registry::create_library(name)
                    .ok_or_else(|| ConvError::UnknownLibrary(name.to_string()))?;
                Ok(Engine::accelerated(library))
            }
        }
    }

    pub fn kind(&self) -> EngineKind {
        match self {
            Engine::Reference => EngineKind::Reference,
            Engine::Accelerated { .. } => EngineKind::Accelerated,
        }
    }

    pub(crate) fn into_executor(self) -> Box<dyn ConvExecutor> {
        match self {
            Engine::Reference => Box::new(ReferenceExecutor::new()),
            Engine::Accelerated {
                library,
                capabilities,
            } => {
                let executor = match capabilities {
                    Some(capabilities) => AcceleratedExecutor::with_capabilities(library, capabilities),
                    None => AcceleratedExecutor::new(library),
                };
                Box::new(executor)
            }
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Reference => f.write_str("Reference"),
            Engine::Accelerated {
                library,
                capabilities,
            } => f
                .debug_struct("Accelerated")
                .field("library", &library.name())
                .field("capabilities", capabilities)
                .finish(),
        }
    }
}
