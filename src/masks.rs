//! Causal attention mask for whole-prefix transformer passes
//!
//! Causal masks are cached by `(seq_len, device, dtype)`; the cache hands
//! out shallow clones (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

type MaskKey = (usize, usize, DType);

static CAUSAL_MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A poisoned lock only means another thread panicked mid-insert; the map
/// itself is still valid
fn mask_cache() -> MutexGuard<'static, HashMap<MaskKey, Tensor>> {
    CAUSAL_MASK_CACHE
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Causal mask of shape `[1, 1, seq_len, seq_len]`
///
/// `0.0` where position `j <= i` may be attended, `-inf` elsewhere:
///
/// ```text
/// [[[[0, -inf, -inf],
///    [0,    0, -inf],
///    [0,    0,    0]]]]
/// ```
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = (seq_len, device_id(device), dtype);
    if let Some(cached) = mask_cache().get(&key) {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    mask_cache().insert(key, mask.clone());
    Ok(mask)
}

pub fn clear_mask_caches() {
    mask_cache().clear();
}
