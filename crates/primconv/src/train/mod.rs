pub mod optim;

pub use optim::{Optimizer, Sgd};
