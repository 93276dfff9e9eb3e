mod env;
pub mod error;
pub mod layout;
pub mod library;
pub mod module;
pub mod nn;
pub mod ops;
pub mod profiling;
pub mod tensor;
pub mod train;

pub use error::{ConvError, ConvResult};
pub use layout::Layout;
pub use library::{Capabilities, LibraryBuild, PrimitiveLibrary};
pub use nn::layers::conv::{ConvolutionLayer, ConvolutionParams, Engine, EngineKind, Filler};
pub use tensor::{Blob, Shape};
