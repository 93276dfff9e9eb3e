//! Numeric kernels shared by the reference executor and primitive libraries.

pub mod conv;

pub use conv::{conv_out_dim, ConvGeometry};
