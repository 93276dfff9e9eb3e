//! Neural network layers operating on [`Blob`](crate::tensor::Blob)s.

pub mod layers;

pub use layers::*;
