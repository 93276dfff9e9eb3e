use std::collections::HashMap;

use anyhow::{ensure, Result};

use crate::module::Module;

pub trait Optimizer {
    fn step(&mut self, module: &mut dyn Module) -> Result<()>;

    /// Clears every parameter diff. Call once per logical batch, before the first of
    /// `iter_size` backward passes.
    fn zero_grad(&mut self, module: &mut dyn Module) -> Result<()> {
        module.visit_params_mut(&mut |_, blob| {
            blob.zero_diff();
            Ok(())
        })
    }
}

/// Stochastic gradient descent with momentum and L2 weight decay.
///
/// Diffs summed over `iter_size` micro-batches are averaged before the update.
pub struct Sgd {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    iter_size: usize,
    velocity: HashMap<String, Vec<f32>>,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Sgd {
            lr,
            momentum: 0.0,
            weight_decay: 0.0,
            iter_size: 1,
            velocity: HashMap::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_iter_size(mut self, iter_size: usize) -> Result<Self> {
        ensure!(iter_size >= 1, "iter_size must be at least 1, got {iter_size}");
        self.iter_size = iter_size;
        Ok(self)
    }

    pub fn iter_size(&self) -> usize {
        self.iter_size
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, module: &mut dyn Module) -> Result<()> {
        let (lr, momentum, weight_decay) = (self.lr, self.momentum, self.weight_decay);
        let scale = 1.0 / self.iter_size as f32;
        let velocity = &mut self.velocity;
        module.visit_params_mut(&mut |name, blob| {
            let grad = blob.canonical_diff()?.to_vec();
            let values = blob.mutable_canonical_data()?;
            let v = velocity
                .entry(name.to_string())
                .or_insert_with(|| vec![0.0; values.len()]);
            ensure!(
                v.len() == values.len(),
                "parameter '{name}' changed size from {} to {}",
                v.len(),
                values.len()
            );
            for ((w, g), v) in values.iter_mut().zip(&grad).zip(v.iter_mut()) {
                *v = momentum * *v + lr * (scale * g + weight_decay * *w);
                *w -= *v;
            }
            Ok(())
        })
    }
}
