use rand::Rng;
use serde::{Deserialize, Serialize};

/// Initial value distribution for a parameter blob.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filler {
    Constant { value: f32 },
    Gaussian { std: f32 },
    Uniform { min: f32, max: f32 },
    /// Uniform in `[-sqrt(3 / fan_in), sqrt(3 / fan_in)]`.
    Xavier,
}

impl Filler {
    pub fn fill(&self, values: &mut [f32], fan_in: usize, rng: &mut impl Rng) {
        match *self {
            Filler::Constant { value } => values.fill(value),
            Filler::Gaussian { std } => {
                for pair in values.chunks_mut(2) {
                    let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
                    let u2: f32 = rng.gen::<f32>();
                    let r = (-2.0 * u1.ln()).sqrt() * std;
                    let theta = 2.0 * std::f32::consts::PI * u2;
                    pair[0] = r * theta.cos();
                    if let Some(second) = pair.get_mut(1) {
                        *second = r * theta.sin();
                    }
                }
            }
            Filler::Uniform { min, max } => {
                for v in values.iter_mut() {
                    *v = min + (max - min) * rng.gen::<f32>();
                }
            }
            Filler::Xavier => {
                let scale = (3.0 / fan_in.max(1) as f32).sqrt();
                for v in values.iter_mut() {
                    *v = rng.gen_range(-scale..=scale);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn xavier_respects_fan_in_bound() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut values = vec![0.0; 512];
        Filler::Xavier.fill(&mut values, 27, &mut rng);
        let bound = (3.0f32 / 27.0).sqrt();
        assert!(values.iter().all(|v| v.abs() <= bound));
        assert!(values.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn gaussian_fills_odd_lengths() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut values = vec![f32::NAN; 7];
        Filler::Gaussian { std: 0.1 }.fill(&mut values, 1, &mut rng);
        assert!(values.iter().all(|v| v.is_finite()));
    }
}
