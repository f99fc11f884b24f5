//! Transformer decoder forward pass
//!
//! Post-norm decoder stack in the `torch.nn.TransformerDecoder` layout. The
//! latent is projected to a single memory slot that every layer
//! cross-attends to. Parameter names:
//!
//! - `embedding.weight`: `[vocab, dim_model]`, scaled by `sqrt(dim_model)`
//! - `latent2memory.{weight,bias}`: latent -> memory slot
//! - `decoder.layers.{i}.self_attn.{in_proj_weight,in_proj_bias}`: packed q/k/v
//! - `decoder.layers.{i}.self_attn.out_proj.{weight,bias}`
//! - `decoder.layers.{i}.multihead_attn.*`: same layout, cross-attention
//! - `decoder.layers.{i}.linear{1,2}.{weight,bias}`: feed-forward
//! - `decoder.layers.{i}.norm{1,2,3}.{weight,bias}`
//! - `outputs2vocab.{weight,bias}`
//!
//! Positions use the fixed sinusoidal encoding, so nothing is stored for
//! them. Incremental decoding keeps self-attention keys/values in a
//! [`KVCache`]; the memory keys/values are computed once per decode.

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, layer_norm, linear, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::info;

use crate::decoder::{
    greedy_decode, DecodeSettings, DecoderConfig, DecoderVariant, SequenceDecoder, StepModel,
};
use crate::error::DecodeError;
use crate::kv_cache::KVCache;
use crate::masks::create_causal_mask;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Attention-variant architecture knobs
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    pub dim_model: usize,
    pub nhead: usize,
    pub dim_feedforward: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            dim_model: 256,
            nhead: 4,
            dim_feedforward: 256,
        }
    }
}

impl AttentionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dim_model == 0 || self.nhead == 0 || self.dim_feedforward == 0 {
            anyhow::bail!(DecodeError::config(
                "dim_model, nhead and dim_feedforward must be positive"
            ));
        }
        if self.dim_model % self.nhead != 0 {
            anyhow::bail!(DecodeError::config(format!(
                "dim_model {} is not divisible by nhead {}",
                self.dim_model, self.nhead
            )));
        }
        Ok(())
    }
}

/// `[max_len, dim]` table of sin/cos position features
fn sinusoidal_table(max_len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut table = vec![0f32; max_len * dim];
    for pos in 0..max_len {
        for i in (0..dim).step_by(2) {
            let freq = (-(i as f64) * 10000f64.ln() / dim as f64).exp();
            let angle = pos as f64 * freq;
            table[pos * dim + i] = angle.sin() as f32;
            if i + 1 < dim {
                table[pos * dim + i + 1] = angle.cos() as f32;
            }
        }
    }
    Ok(Tensor::from_vec(table, (max_len, dim), device)?)
}

struct MultiheadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MultiheadAttention {
    fn load(vb: VarBuilder, dim: usize, num_heads: usize) -> Result<Self> {
        let w = vb.get((3 * dim, dim), "in_proj_weight")?;
        let b = vb.get(3 * dim, "in_proj_bias")?;
        let part = |k: usize| -> Result<Linear> {
            Ok(Linear::new(
                w.narrow(0, k * dim, dim)?.contiguous()?,
                Some(b.narrow(0, k * dim, dim)?.contiguous()?),
            ))
        };

        Ok(Self {
            q_proj: part(0)?,
            k_proj: part(1)?,
            v_proj: part(2)?,
            out_proj: linear(dim, dim, vb.pp("out_proj"))?,
            num_heads,
            head_dim: dim / num_heads,
        })
    }

    /// `[batch, seq, dim]` -> `[batch, heads, seq, head_dim]`
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        Ok(x
            .reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn project_kv(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok((
            self.split_heads(&self.k_proj.forward(x)?)?,
            self.split_heads(&self.v_proj.forward(x)?)?,
        ))
    }

    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, _, s, _) = q.dims4()?;
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let weights = match mask {
            Some(mask) => weights.broadcast_add(mask)?,
            None => weights,
        };
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;

        let out = weights.matmul(v)?;
        let out = out.transpose(1, 2)?.reshape((b, s, ()))?;
        Ok(self.out_proj.forward(&out)?)
    }

    /// Self-attention of one new position `x` over the cached prefix and
    /// itself; nothing later exists yet, so no mask is needed
    fn forward_cached(&self, x: &Tensor, layer: usize, cache: &mut KVCache) -> Result<Tensor> {
        let q = self.split_heads(&self.q_proj.forward(x)?)?;
        let (k, v) = self.project_kv(x)?;
        let (k, v) = cache.append(layer, k, v)?;
        self.attend(&q, &k, &v, None)
    }

    /// Causally masked self-attention over a whole sequence
    fn forward_causal(&self, x: &Tensor) -> Result<Tensor> {
        let q = self.split_heads(&self.q_proj.forward(x)?)?;
        let (k, v) = self.project_kv(x)?;
        let mask = create_causal_mask(x.dim(1)?, x.device(), x.dtype())?;
        self.attend(&q, &k, &v, Some(&mask))
    }

    /// Attention onto precomputed memory keys/values
    fn forward_memory(&self, x: &Tensor, memory: &(Tensor, Tensor)) -> Result<Tensor> {
        let q = self.split_heads(&self.q_proj.forward(x)?)?;
        self.attend(&q, &memory.0, &memory.1, None)
    }
}

struct DecoderLayer {
    self_attn: MultiheadAttention,
    multihead_attn: MultiheadAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &AttentionConfig) -> Result<Self> {
        let d = config.dim_model;
        Ok(Self {
            self_attn: MultiheadAttention::load(vb.pp("self_attn"), d, config.nhead)?,
            multihead_attn: MultiheadAttention::load(vb.pp("multihead_attn"), d, config.nhead)?,
            linear1: linear(d, config.dim_feedforward, vb.pp("linear1"))?,
            linear2: linear(config.dim_feedforward, d, vb.pp("linear2"))?,
            norm1: layer_norm(d, LAYER_NORM_EPS, vb.pp("norm1"))?,
            norm2: layer_norm(d, LAYER_NORM_EPS, vb.pp("norm2"))?,
            norm3: layer_norm(d, LAYER_NORM_EPS, vb.pp("norm3"))?,
        })
    }

    /// Residual + norm around cross-attention and feed-forward, given the
    /// self-attention output `sa`
    fn finish(&self, x: &Tensor, sa: &Tensor, memory: &(Tensor, Tensor)) -> Result<Tensor> {
        let x = self.norm1.forward(&x.add(sa)?)?;
        let ca = self.multihead_attn.forward_memory(&x, memory)?;
        let x = self.norm2.forward(&x.add(&ca)?)?;
        let ff = self
            .linear2
            .forward(&self.linear1.forward(&x)?.relu()?)?;
        Ok(self.norm3.forward(&x.add(&ff)?)?)
    }

    fn forward_with_cache(
        &self,
        x: &Tensor,
        layer: usize,
        cache: &mut KVCache,
        memory: &(Tensor, Tensor),
    ) -> Result<Tensor> {
        let sa = self.self_attn.forward_cached(x, layer, cache)?;
        self.finish(x, &sa, memory)
    }

    fn forward(&self, x: &Tensor, memory: &(Tensor, Tensor)) -> Result<Tensor> {
        let sa = self.self_attn.forward_causal(x)?;
        self.finish(x, &sa, memory)
    }
}

/// Self-attention history plus per-layer memory keys/values
pub struct AttentionState {
    cache: KVCache,
    memory: Vec<(Tensor, Tensor)>,
}

/// Transformer latent-to-sequence decoder
pub struct AttentionDecoder {
    embedding: Embedding,
    positions: Tensor,
    latent2memory: Linear,
    layers: Vec<DecoderLayer>,
    outputs2vocab: Linear,
    dim_model: usize,
    settings: DecodeSettings,
    device: Device,
}

impl AttentionDecoder {
    /// Parameter names and shapes for `config`
    pub fn parameter_shapes(config: &DecoderConfig) -> Vec<(String, Vec<usize>)> {
        let ac = &config.attention;
        let (v, d, f, z) = (
            config.vocab_size,
            ac.dim_model,
            ac.dim_feedforward,
            config.latent_dim,
        );

        let mut shapes = vec![
            ("embedding.weight".to_string(), vec![v, d]),
            ("latent2memory.weight".to_string(), vec![d, z]),
            ("latent2memory.bias".to_string(), vec![d]),
        ];
        for i in 0..config.num_layers {
            let p = format!("decoder.layers.{i}");
            for attn in ["self_attn", "multihead_attn"] {
                shapes.push((format!("{p}.{attn}.in_proj_weight"), vec![3 * d, d]));
                shapes.push((format!("{p}.{attn}.in_proj_bias"), vec![3 * d]));
                shapes.push((format!("{p}.{attn}.out_proj.weight"), vec![d, d]));
                shapes.push((format!("{p}.{attn}.out_proj.bias"), vec![d]));
            }
            shapes.push((format!("{p}.linear1.weight"), vec![f, d]));
            shapes.push((format!("{p}.linear1.bias"), vec![f]));
            shapes.push((format!("{p}.linear2.weight"), vec![d, f]));
            shapes.push((format!("{p}.linear2.bias"), vec![d]));
            for norm in ["norm1", "norm2", "norm3"] {
                shapes.push((format!("{p}.{norm}.weight"), vec![d]));
                shapes.push((format!("{p}.{norm}.bias"), vec![d]));
            }
        }
        shapes.push(("outputs2vocab.weight".to_string(), vec![v, d]));
        shapes.push(("outputs2vocab.bias".to_string(), vec![v]));
        shapes
    }

    /// Build from parameters in `vb`; `config` must already be validated
    pub fn load(vb: VarBuilder, config: &DecoderConfig, device: &Device) -> Result<Self> {
        let ac = &config.attention;

        info!(
            "Transformer decoder: {} layers, d_model {}, {} heads, feedforward {}",
            config.num_layers, ac.dim_model, ac.nhead, ac.dim_feedforward
        );

        let embedding = embedding(config.vocab_size, ac.dim_model, vb.pp("embedding"))?;
        let latent2memory = linear(config.latent_dim, ac.dim_model, vb.pp("latent2memory"))?;

        let vb_layers = vb.pp("decoder").pp("layers");
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            layers.push(DecoderLayer::load(vb_layers.pp(i), ac)?);
        }

        let outputs2vocab = linear(ac.dim_model, config.vocab_size, vb.pp("outputs2vocab"))?;

        Ok(Self {
            embedding,
            positions: sinusoidal_table(config.max_sequence_length, ac.dim_model, device)?,
            latent2memory,
            layers,
            outputs2vocab,
            dim_model: ac.dim_model,
            settings: config.settings(),
            device: device.clone(),
        })
    }

    /// Scaled token embeddings plus positions `start_pos..`, `[1, seq, dim]`
    fn embed(&self, tokens: &[u32], start_pos: usize) -> Result<Tensor> {
        let max_len = self.settings.max_sequence_length;
        if start_pos + tokens.len() > max_len {
            anyhow::bail!(DecodeError::invalid_input(format!(
                "position {} beyond max_sequence_length {max_len}",
                start_pos + tokens.len() - 1
            )));
        }
        let ids = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let x = (self.embedding.forward(&ids)? * (self.dim_model as f64).sqrt())?;
        let pos = self.positions.narrow(0, start_pos, tokens.len())?;
        Ok(x.broadcast_add(&pos)?)
    }

    fn memory(&self, latent: &Tensor) -> Result<Vec<(Tensor, Tensor)>> {
        // [1, latent] -> [1, 1, dim]
        let memory = self.latent2memory.forward(latent)?.unsqueeze(1)?;
        self.layers
            .iter()
            .map(|layer| layer.multihead_attn.project_kv(&memory))
            .collect()
    }

    /// Logits for every position of a given `tokens` prefix, `[seq, vocab]`
    ///
    /// Row `i` equals the logits incremental decoding produces after feeding
    /// `tokens[..=i]`.
    pub fn forward_full(&self, latent: &[f32], tokens: &[u32]) -> Result<Tensor> {
        if latent.len() != self.settings.latent_dim {
            anyhow::bail!(DecodeError::invalid_input(format!(
                "latent has {} dimensions, decoder expects {}",
                latent.len(),
                self.settings.latent_dim
            )));
        }
        if tokens.is_empty() {
            anyhow::bail!(DecodeError::invalid_input("empty token prefix"));
        }
        let z = Tensor::from_slice(latent, (1, latent.len()), &self.device)?;
        let memory = self.memory(&z)?;

        let mut x = self.embed(tokens, 0)?;
        for (layer, mem) in self.layers.iter().zip(&memory) {
            x = layer.forward(&x, mem)?;
        }
        Ok(self.outputs2vocab.forward(&x.squeeze(0)?)?)
    }
}

impl StepModel for AttentionDecoder {
    type State = AttentionState;

    fn decode_settings(&self) -> &DecodeSettings {
        &self.settings
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn init_state(&self, latent: &Tensor) -> Result<AttentionState> {
        Ok(AttentionState {
            cache: KVCache::new(self.layers.len()),
            memory: self.memory(latent)?,
        })
    }

    fn step(&self, state: &mut AttentionState, token: u32, _position: usize) -> Result<Tensor> {
        // The cache holds exactly the positions fed so far
        let mut x = self.embed(&[token], state.cache.seq_len())?;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward_with_cache(&x, i, &mut state.cache, &state.memory[i])?;
        }
        // [1, 1, vocab] -> [vocab]
        let logits = self.outputs2vocab.forward(&x)?;
        Ok(logits.flatten_all()?.to_dtype(DType::F32)?)
    }
}

impl SequenceDecoder for AttentionDecoder {
    fn variant(&self) -> DecoderVariant {
        DecoderVariant::Attention
    }

    fn settings(&self) -> &DecodeSettings {
        &self.settings
    }

    fn decode(&self, latent: &[f32]) -> Result<Vec<u32>> {
        greedy_decode(self, latent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::Vocabulary;
    use serial_test::serial;
    use std::collections::HashMap;

    fn vocab() -> Vocabulary {
        Vocabulary::from_words(["<sos>", "<eos>", "<pad>", "<unk>", "a", "cat", "sat", "down"])
            .unwrap()
    }

    fn small_config(num_layers: usize) -> DecoderConfig {
        let mut config = DecoderConfig::new(DecoderVariant::Attention, &vocab());
        config.latent_dim = 4;
        config.num_layers = num_layers;
        config.max_sequence_length = 10;
        config.attention = AttentionConfig {
            dim_model: 8,
            nhead: 2,
            dim_feedforward: 12,
        };
        config
    }

    fn random_decoder(config: &DecoderConfig) -> AttentionDecoder {
        let device = Device::Cpu;
        let tensors: HashMap<String, Tensor> = AttentionDecoder::parameter_shapes(config)
            .into_iter()
            .map(|(name, shape)| {
                let t = Tensor::randn(0f32, 0.5, shape, &device).unwrap();
                (name, t)
            })
            .collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        AttentionDecoder::load(vb, config, &device).unwrap()
    }

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(AttentionConfig::default().validate().is_ok());
        let bad = AttentionConfig {
            dim_model: 10,
            nhead: 4,
            dim_feedforward: 8,
        };
        let err = bad.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::Configuration(_))
        ));
    }

    #[test]
    fn test_parameter_shapes() {
        let shapes: HashMap<String, Vec<usize>> = AttentionDecoder::parameter_shapes(&small_config(2))
            .into_iter()
            .collect();

        assert_eq!(shapes["latent2memory.weight"], vec![8, 4]);
        assert_eq!(shapes["decoder.layers.1.self_attn.in_proj_weight"], vec![24, 8]);
        assert_eq!(shapes["decoder.layers.0.multihead_attn.out_proj.bias"], vec![8]);
        assert_eq!(shapes["decoder.layers.1.linear2.weight"], vec![8, 12]);
        assert_eq!(shapes["outputs2vocab.weight"], vec![8, 8]);
        assert_eq!(shapes.len(), 3 + 2 * 18 + 2);
    }

    #[test]
    fn test_sinusoidal_table() {
        let table = sinusoidal_table(3, 4, &Device::Cpu).unwrap();
        let rows: Vec<Vec<f32>> = table.to_vec2().unwrap();
        assert_eq!(rows[0], vec![0.0, 1.0, 0.0, 1.0]);
        assert!((rows[1][0] - 1f32.sin()).abs() < 1e-6);
        assert!((rows[1][1] - 1f32.cos()).abs() < 1e-6);
        assert!((rows[2][2] - (2.0f32 * 0.01).sin()).abs() < 1e-6);
    }

    #[test]
    #[serial]
    fn test_incremental_matches_full_forward() {
        let config = small_config(2);
        let decoder = random_decoder(&config);
        let z = [0.3f32, -0.7, 1.1, 0.0];
        let tokens = [0u32, 4, 5, 6];

        let full = decoder.forward_full(&z, &tokens).unwrap();
        assert_eq!(full.dims(), &[4, 8]);
        let full: Vec<Vec<f32>> = full.to_vec2().unwrap();

        let latent = Tensor::from_slice(&z, (1, 4), &Device::Cpu).unwrap();
        let mut state = decoder.init_state(&latent).unwrap();
        for (pos, &token) in tokens.iter().enumerate() {
            let step = to_vec(&decoder.step(&mut state, token, pos).unwrap());
            for (a, b) in step.iter().zip(&full[pos]) {
                assert!((a - b).abs() < 1e-4, "position {pos}: {a} vs {b}");
            }
        }
        assert_eq!(state.cache.seq_len(), 4);
    }

    #[test]
    fn test_decode_guarantees() {
        for layers in [1, 2] {
            let decoder = random_decoder(&small_config(layers));
            let z = [1.0f32, 0.5, -0.5, -1.0];
            let tokens = decoder.decode(&z).unwrap();

            assert!(!tokens.is_empty() && tokens.len() <= 10);
            assert!(!tokens.contains(&0));
            if let Some(pos) = tokens.iter().position(|&t| t == 1) {
                assert_eq!(pos, tokens.len() - 1);
            }
            assert_eq!(tokens, decoder.decode(&z).unwrap());
        }
    }

    #[test]
    fn test_forward_full_rejects_overlong_prefix() {
        let decoder = random_decoder(&small_config(1));
        let tokens = vec![4u32; 11];
        let err = decoder.forward_full(&[0.0; 4], &tokens).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::InvalidInput(_))
        ));
    }
}
