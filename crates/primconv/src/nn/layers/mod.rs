pub mod conv;

pub use conv::{ConvolutionLayer, ConvolutionParams, Engine, EngineKind};
