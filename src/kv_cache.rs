//! Self-attention KV-cache for incremental transformer decoding
//!
//! Each generation step feeds one token; the keys and values of earlier
//! positions are kept here so a step costs one new projection per layer
//! instead of re-running the whole prefix.
//!
//! Each layer stores:
//! - keys: `[batch, num_heads, seq_len, head_dim]`
//! - values: `[batch, num_heads, seq_len, head_dim]`
//!
//! A cache lives for exactly one `decode` call, so decoding never mutates
//! shared decoder state.

use anyhow::Result;
use candle_core::Tensor;

/// Per-layer key/value history of one decode call
#[derive(Debug, Clone)]
pub struct KVCache {
    pub keys: Vec<Option<Tensor>>,
    pub values: Vec<Option<Tensor>>,
}

impl KVCache {
    /// Create an empty cache for `n_layers` decoder layers
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Number of cached positions (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    /// Append new keys/values for `layer` along the sequence axis and return
    /// the full history for that layer
    pub fn append(&mut self, layer: usize, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        let (cache_k, cache_v) = (&mut self.keys[layer], &mut self.values[layer]);
        let (k, v) = match (cache_k.as_ref(), cache_v.as_ref()) {
            (Some(prev_k), Some(prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
            _ => (k, v),
        };
        *cache_k = Some(k.clone());
        *cache_v = Some(v.clone());
        Ok((k, v))
    }
}
