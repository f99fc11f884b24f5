//! Trained-parameter loading from safetensors checkpoints
//!
//! The checkpoint is read once, every tensor the decoder expects is checked
//! by name and shape, and the result is handed to candle as a `VarBuilder`.
//! Tensors the decoder does not use (encoder weights of the full VAE, for
//! instance) are ignored.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

use crate::error::DecodeError;

/// Load `expected` parameters from the safetensors file at `path`
///
/// Every name in `expected` must be present with exactly the listed shape;
/// anything else is a configuration error naming the offending tensor.
/// Half-precision tensors are widened to F32.
pub fn load_parameters(
    path: &Path,
    expected: &[(String, Vec<usize>)],
    device: &Device,
) -> Result<VarBuilder<'static>> {
    if !path.exists() {
        anyhow::bail!(DecodeError::ResourceNotFound(path.to_path_buf()));
    }

    info!("Loading checkpoint from {}", path.display());
    let data =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let st = SafeTensors::deserialize(&data).map_err(|e| {
        DecodeError::config(format!("{} is not a safetensors file: {e}", path.display()))
    })?;

    let mut tensors = HashMap::with_capacity(expected.len());
    for (name, shape) in expected {
        let view = st.tensor(name).map_err(|_| {
            DecodeError::config(format!(
                "checkpoint {} has no tensor {name:?}",
                path.display()
            ))
        })?;
        if view.shape() != shape.as_slice() {
            anyhow::bail!(DecodeError::config(format!(
                "tensor {name:?} has shape {:?}, decoder expects {shape:?}",
                view.shape()
            )));
        }
        tensors.insert(name.clone(), tensor_from_view(name, &view, device)?);
    }

    let extra = st.names().len().saturating_sub(expected.len());
    if extra > 0 {
        debug!("Ignoring {extra} checkpoint tensors the decoder does not use");
    }
    info!("Loaded {} parameter tensors", tensors.len());

    Ok(VarBuilder::from_tensors(tensors, DType::F32, device))
}

fn tensor_from_view(
    name: &str,
    view: &safetensors::tensor::TensorView<'_>,
    device: &Device,
) -> Result<Tensor> {
    let dtype = match view.dtype() {
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::F32 => DType::F32,
        other => anyhow::bail!(DecodeError::config(format!(
            "tensor {name:?} has unsupported dtype {other:?}"
        ))),
    };
    let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
    Ok(tensor.to_dtype(DType::F32)?)
}
