//! Convolution layer.
//!
//! [`ConvolutionLayer`] combines engine-independent bookkeeping ([`ConvolutionBase`])
//! with a [`ConvExecutor`]. The accelerated executor resolves library-facing size
//! vectors ([`ResolvedConvolution`]), compiles a [`PrimitiveSet`] per input shape and
//! routes every tensor through [`LayoutDescriptor`]s.

mod accelerated;
mod base;
mod descriptor;
mod executor;
mod filler;
mod layer;
mod params;
mod primitive_set;
mod reference;
mod resolver;

pub use accelerated::AcceleratedExecutor;
pub use base::ConvolutionBase;
pub use descriptor::{Converted, LayoutBinding, LayoutDescriptor};
pub use executor::{ConvExecutor, Engine};
pub use filler::Filler;
pub use layer::ConvolutionLayer;
pub use params::{ConvolutionParams, EngineKind};
pub use primitive_set::{BiasBackward, PrimitiveSet};
pub use reference::ReferenceExecutor;
pub use resolver::ResolvedConvolution;
