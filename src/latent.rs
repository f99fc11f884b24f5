//! Latent-space sampling and straight-line interpolation

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::DecodeError;

/// A point in the latent space
pub type LatentVector = Vec<f32>;

/// Draws latent vectors from a standard multivariate normal
pub struct LatentSampler {
    latent_dim: usize,
    rng: StdRng,
}

impl LatentSampler {
    /// Sampler seeded from OS entropy
    pub fn new(latent_dim: usize) -> Self {
        Self {
            latent_dim,
            rng: StdRng::from_entropy(),
        }
    }

    /// Sampler with a fixed seed, for reproducible sessions
    pub fn seeded(latent_dim: usize, seed: u64) -> Self {
        Self {
            latent_dim,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Draw `count` independent latent vectors
    pub fn sample(&mut self, count: usize) -> Result<Vec<LatentVector>> {
        if count == 0 {
            anyhow::bail!(DecodeError::invalid_input("sample count must be positive"));
        }
        Ok((0..count).map(|_| self.sample_one()).collect())
    }

    /// Draw a single latent vector
    pub fn sample_one(&mut self) -> LatentVector {
        (0..self.latent_dim)
            .map(|_| self.rng.sample::<f32, _>(StandardNormal))
            .collect()
    }
}

/// Evenly spaced path from `start` to `end`, both included
///
/// Point `i` is `start + t * (end - start)` with `t = i / (steps - 1)`,
/// computed per dimension. The first point is exactly `start` and the last
/// exactly `end`; values are clamped to the endpoint range so every
/// dimension stays monotone under rounding.
pub fn interpolate(start: &[f32], end: &[f32], steps: usize) -> Result<Vec<LatentVector>> {
    if steps < 2 {
        anyhow::bail!(DecodeError::invalid_input(format!(
            "interpolation needs at least 2 steps, got {steps}"
        )));
    }
    if start.len() != end.len() {
        anyhow::bail!(DecodeError::invalid_input(format!(
            "interpolation endpoints differ in dimensionality ({} vs {})",
            start.len(),
            end.len()
        )));
    }

    let last = steps - 1;
    let path = (0..steps)
        .map(|i| {
            if i == 0 {
                return start.to_vec();
            }
            if i == last {
                return end.to_vec();
            }
            let t = i as f64 / last as f64;
            start
                .iter()
                .zip(end)
                .map(|(&s, &e)| {
                    let (s, e) = (f64::from(s), f64::from(e));
                    let value = s + t * (e - s);
                    value.clamp(s.min(e), s.max(e)) as f32
                })
                .collect()
        })
        .collect();

    Ok(path)
}
