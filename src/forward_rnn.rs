//! Recurrent decoder forward pass (RNN / GRU / LSTM)
//!
//! Step-wise implementation on candle tensors. Parameter names follow the
//! PyTorch sentence-VAE layout so an exported `state_dict` loads as-is:
//!
//! - `embedding.weight`: `[vocab, dim_embedding]`
//! - `latent2hidden.{weight,bias}`: latent -> initial hidden state of every
//!   layer and direction, laid out `[layer0_fwd, layer0_bwd, layer1_fwd, ...]`
//! - `decoder_rnn.{weight,bias}_{ih,hh}_l{k}[_reverse]`: stacked gate weights
//!   (GRU: r, z, n; LSTM: i, f, g, o)
//! - `outputs2vocab.{weight,bias}`: top-layer output -> vocabulary logits
//!
//! Each step feeds one token through every layer. With `bidirectional`, both
//! directions of a layer advance one step from their own state and their
//! outputs are concatenated into the next layer's input.

use anyhow::Result;
use candle_core::{Device, Module, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, VarBuilder};
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::decoder::{
    greedy_decode, DecodeSettings, DecoderConfig, DecoderVariant, SequenceDecoder, StepModel,
};
use crate::error::DecodeError;

/// Recurrence kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RnnKind {
    /// Elman RNN with tanh
    Rnn,
    Gru,
    Lstm,
}

impl RnnKind {
    /// Number of stacked gate blocks in the weight matrices
    pub fn gates(&self) -> usize {
        match self {
            Self::Rnn => 1,
            Self::Gru => 3,
            Self::Lstm => 4,
        }
    }
}

impl FromStr for RnnKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rnn" => Ok(Self::Rnn),
            "gru" => Ok(Self::Gru),
            "lstm" => Ok(Self::Lstm),
            other => Err(DecodeError::config(format!(
                "unknown rnn_type {other:?} (expected rnn, gru or lstm)"
            ))),
        }
    }
}

impl fmt::Display for RnnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rnn => write!(f, "rnn"),
            Self::Gru => write!(f, "gru"),
            Self::Lstm => write!(f, "lstm"),
        }
    }
}

/// Recurrent-variant architecture knobs
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentConfig {
    pub rnn_type: RnnKind,
    pub dim_embedding: usize,
    pub dim_hidden: usize,
    pub bidirectional: bool,
}

impl Default for RecurrentConfig {
    fn default() -> Self {
        Self {
            rnn_type: RnnKind::Gru,
            dim_embedding: 300,
            dim_hidden: 256,
            bidirectional: false,
        }
    }
}

impl RecurrentConfig {
    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim_embedding == 0 || self.dim_hidden == 0 {
            anyhow::bail!(DecodeError::config(
                "dim_embedding and dim_hidden must be positive"
            ));
        }
        Ok(())
    }
}

fn param_name(kind: &str, layer: usize, reverse: bool) -> String {
    let suffix = if reverse { "_reverse" } else { "" };
    format!("{kind}_l{layer}{suffix}")
}

/// One direction of one layer
struct RecurrentCell {
    ih: Linear,
    hh: Linear,
    kind: RnnKind,
    hidden: usize,
}

impl RecurrentCell {
    fn load(
        vb: &VarBuilder,
        kind: RnnKind,
        input: usize,
        hidden: usize,
        layer: usize,
        reverse: bool,
    ) -> Result<Self> {
        let rows = kind.gates() * hidden;
        let w_ih = vb.get((rows, input), &param_name("weight_ih", layer, reverse))?;
        let w_hh = vb.get((rows, hidden), &param_name("weight_hh", layer, reverse))?;
        let b_ih = vb.get(rows, &param_name("bias_ih", layer, reverse))?;
        let b_hh = vb.get(rows, &param_name("bias_hh", layer, reverse))?;

        Ok(Self {
            ih: Linear::new(w_ih, Some(b_ih)),
            hh: Linear::new(w_hh, Some(b_hh)),
            kind,
            hidden,
        })
    }

    fn gate(&self, x: &Tensor, k: usize) -> Result<Tensor> {
        Ok(x.narrow(1, k * self.hidden, self.hidden)?)
    }

    /// Advance one step. `c` is the LSTM cell state and is ignored otherwise.
    fn forward(&self, x: &Tensor, h: &Tensor, c: Option<&Tensor>) -> Result<(Tensor, Option<Tensor>)> {
        let gi = self.ih.forward(x)?;
        let gh = self.hh.forward(h)?;

        match self.kind {
            RnnKind::Rnn => Ok((gi.add(&gh)?.tanh()?, None)),
            RnnKind::Gru => {
                let r = candle_nn::ops::sigmoid(&self.gate(&gi, 0)?.add(&self.gate(&gh, 0)?)?)?;
                let z = candle_nn::ops::sigmoid(&self.gate(&gi, 1)?.add(&self.gate(&gh, 1)?)?)?;
                let n = self
                    .gate(&gi, 2)?
                    .add(&r.mul(&self.gate(&gh, 2)?)?)?
                    .tanh()?;
                // h' = (1 - z) * n + z * h
                let h_new = n.add(&z.mul(&h.sub(&n)?)?)?;
                Ok((h_new, None))
            }
            RnnKind::Lstm => {
                let c = c.ok_or_else(|| anyhow::anyhow!("LSTM step without cell state"))?;
                let gates = gi.add(&gh)?;
                let i = candle_nn::ops::sigmoid(&self.gate(&gates, 0)?)?;
                let f = candle_nn::ops::sigmoid(&self.gate(&gates, 1)?)?;
                let g = self.gate(&gates, 2)?.tanh()?;
                let o = candle_nn::ops::sigmoid(&self.gate(&gates, 3)?)?;
                let c_new = f.mul(c)?.add(&i.mul(&g)?)?;
                let h_new = o.mul(&c_new.tanh()?)?;
                Ok((h_new, Some(c_new)))
            }
        }
    }
}

/// Hidden (and LSTM cell) state for every layer/direction, `[1, dim_hidden]` each
pub struct RecurrentState {
    h: Vec<Tensor>,
    c: Option<Vec<Tensor>>,
}

/// Recurrent latent-to-sequence decoder
pub struct RecurrentDecoder {
    embedding: Embedding,
    latent2hidden: Linear,
    /// Indexed `layer * num_directions + direction`
    cells: Vec<RecurrentCell>,
    outputs2vocab: Linear,
    kind: RnnKind,
    num_layers: usize,
    num_directions: usize,
    hidden: usize,
    settings: DecodeSettings,
    device: Device,
}

impl RecurrentDecoder {
    /// Parameter names and shapes for `config`
    pub fn parameter_shapes(config: &DecoderConfig) -> Vec<(String, Vec<usize>)> {
        let rc = &config.recurrent;
        let (v, e, h, z) = (
            config.vocab_size,
            rc.dim_embedding,
            rc.dim_hidden,
            config.latent_dim,
        );
        let dirs = rc.num_directions();
        let factor = config.num_layers * dirs;
        let rows = rc.rnn_type.gates() * h;

        let mut shapes = vec![
            ("embedding.weight".to_string(), vec![v, e]),
            ("latent2hidden.weight".to_string(), vec![h * factor, z]),
            ("latent2hidden.bias".to_string(), vec![h * factor]),
        ];
        for layer in 0..config.num_layers {
            let input = if layer == 0 { e } else { h * dirs };
            for dir in 0..dirs {
                let reverse = dir == 1;
                let name = |kind: &str| format!("decoder_rnn.{}", param_name(kind, layer, reverse));
                shapes.push((name("weight_ih"), vec![rows, input]));
                shapes.push((name("weight_hh"), vec![rows, h]));
                shapes.push((name("bias_ih"), vec![rows]));
                shapes.push((name("bias_hh"), vec![rows]));
            }
        }
        shapes.push(("outputs2vocab.weight".to_string(), vec![v, h * dirs]));
        shapes.push(("outputs2vocab.bias".to_string(), vec![v]));
        shapes
    }

    /// Build from parameters in `vb`; `config` must already be validated
    pub fn load(vb: VarBuilder, config: &DecoderConfig, device: &Device) -> Result<Self> {
        let rc = &config.recurrent;
        let dirs = rc.num_directions();
        let factor = config.num_layers * dirs;

        info!(
            "Recurrent decoder: {} x {} layers, hidden {}, embedding {}{}",
            rc.rnn_type,
            config.num_layers,
            rc.dim_hidden,
            rc.dim_embedding,
            if rc.bidirectional {
                ", bidirectional"
            } else {
                ""
            }
        );

        let embedding = embedding(config.vocab_size, rc.dim_embedding, vb.pp("embedding"))?;
        let latent2hidden = linear(
            config.latent_dim,
            rc.dim_hidden * factor,
            vb.pp("latent2hidden"),
        )?;

        let vb_rnn = vb.pp("decoder_rnn");
        let mut cells = Vec::with_capacity(factor);
        for layer in 0..config.num_layers {
            let input = if layer == 0 {
                rc.dim_embedding
            } else {
                rc.dim_hidden * dirs
            };
            for dir in 0..dirs {
                cells.push(RecurrentCell::load(
                    &vb_rnn,
                    rc.rnn_type,
                    input,
                    rc.dim_hidden,
                    layer,
                    dir == 1,
                )?);
            }
        }

        let outputs2vocab = linear(
            rc.dim_hidden * dirs,
            config.vocab_size,
            vb.pp("outputs2vocab"),
        )?;

        Ok(Self {
            embedding,
            latent2hidden,
            cells,
            outputs2vocab,
            kind: rc.rnn_type,
            num_layers: config.num_layers,
            num_directions: dirs,
            hidden: rc.dim_hidden,
            settings: config.settings(),
            device: device.clone(),
        })
    }
}

impl StepModel for RecurrentDecoder {
    type State = RecurrentState;

    fn decode_settings(&self) -> &DecodeSettings {
        &self.settings
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn init_state(&self, latent: &Tensor) -> Result<RecurrentState> {
        let hidden = self.latent2hidden.forward(latent)?;
        let mut h = Vec::with_capacity(self.cells.len());
        for k in 0..self.cells.len() {
            h.push(hidden.narrow(1, k * self.hidden, self.hidden)?.contiguous()?);
        }
        let c = if self.kind == RnnKind::Lstm {
            let zeros = Tensor::zeros((1, self.hidden), latent.dtype(), &self.device)?;
            Some(vec![zeros; self.cells.len()])
        } else {
            None
        };
        Ok(RecurrentState { h, c })
    }

    fn step(&self, state: &mut RecurrentState, token: u32, _position: usize) -> Result<Tensor> {
        let input = Tensor::new(&[token], &self.device)?;
        let mut x = self.embedding.forward(&input)?;

        for layer in 0..self.num_layers {
            let mut outputs = Vec::with_capacity(self.num_directions);
            for dir in 0..self.num_directions {
                let idx = layer * self.num_directions + dir;
                let c_prev = state.c.as_ref().map(|c| &c[idx]);
                let (h_new, c_new) = self.cells[idx].forward(&x, &state.h[idx], c_prev)?;
                if let (Some(c), Some(c_new)) = (state.c.as_mut(), c_new) {
                    c[idx] = c_new;
                }
                state.h[idx] = h_new.clone();
                outputs.push(h_new);
            }
            x = Tensor::cat(&outputs, 1)?;
        }

        Ok(self.outputs2vocab.forward(&x)?.squeeze(0)?)
    }
}

impl SequenceDecoder for RecurrentDecoder {
    fn variant(&self) -> DecoderVariant {
        DecoderVariant::Recurrent
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
    use candle_core::DType;
    use std::collections::HashMap;

    fn vocab() -> Vocabulary {
        Vocabulary::from_words(["<sos>", "<eos>", "<pad>", "<unk>", "a", "cat", "sat", "down"])
            .unwrap()
    }

    fn small_config(kind: RnnKind, num_layers: usize, bidirectional: bool) -> DecoderConfig {
        let mut config = DecoderConfig::new(DecoderVariant::Recurrent, &vocab());
        config.latent_dim = 4;
        config.num_layers = num_layers;
        config.max_sequence_length = 12;
        config.recurrent = RecurrentConfig {
            rnn_type: kind,
            dim_embedding: 5,
            dim_hidden: 6,
            bidirectional,
        };
        config
    }

    fn random_decoder(config: &DecoderConfig) -> RecurrentDecoder {
        let device = Device::Cpu;
        let tensors: HashMap<String, Tensor> = RecurrentDecoder::parameter_shapes(config)
            .into_iter()
            .map(|(name, shape)| (name, Tensor::randn(0f32, 1.0, shape, &device).unwrap()))
            .collect();
        let vb = VarBuilder::from_tensors(tensors, DType::F32, &device);
        RecurrentDecoder::load(vb, config, &device).unwrap()
    }

    #[test]
    fn test_parameter_shapes_bidirectional() {
        let config = small_config(RnnKind::Gru, 2, true);
        let shapes: HashMap<String, Vec<usize>> =
            RecurrentDecoder::parameter_shapes(&config).into_iter().collect();

        assert_eq!(shapes["latent2hidden.weight"], vec![6 * 4, 4]);
        assert_eq!(shapes["decoder_rnn.weight_ih_l0"], vec![18, 5]);
        assert_eq!(shapes["decoder_rnn.weight_ih_l1_reverse"], vec![18, 12]);
        assert_eq!(shapes["decoder_rnn.weight_hh_l1"], vec![18, 6]);
        assert_eq!(shapes["outputs2vocab.weight"], vec![8, 12]);
        assert_eq!(shapes.len(), 3 + 4 * 4 + 2);
    }

    #[test]
    fn test_decode_guarantees_all_kinds() {
        for kind in [RnnKind::Rnn, RnnKind::Gru, RnnKind::Lstm] {
            for (layers, bi) in [(1, false), (2, false), (2, true)] {
                let config = small_config(kind, layers, bi);
                let decoder = random_decoder(&config);
                let z = [0.5f32, -1.0, 0.25, 2.0];
                let tokens = decoder.decode(&z).unwrap();

                assert!(!tokens.is_empty() && tokens.len() <= 12);
                assert!(!tokens.contains(&0), "{kind} emitted <sos>");
                if let Some(pos) = tokens.iter().position(|&t| t == 1) {
                    assert_eq!(pos, tokens.len() - 1);
                }
                assert_eq!(tokens, decoder.decode(&z).unwrap());
            }
        }
    }

    #[test]
    fn test_rejects_wrong_latent_length() {
        let decoder = random_decoder(&small_config(RnnKind::Gru, 1, false));
        let err = decoder.decode(&[0.0; 3]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_gru_cell_matches_reference() {
        // One hidden unit, one input: weights stacked as [r, z, n]
        let device = Device::Cpu;
        let t = |v: &[f32], shape: (usize, usize)| Tensor::from_slice(v, shape, &device).unwrap();
        let b = |v: &[f32]| Tensor::from_slice(v, v.len(), &device).unwrap();
        let cell = RecurrentCell {
            ih: Linear::new(t(&[0.5, -0.3, 0.8], (3, 1)), Some(b(&[0.1, 0.0, -0.2]))),
            hh: Linear::new(t(&[0.2, 0.4, -0.6], (3, 1)), Some(b(&[0.0, 0.1, 0.3]))),
            kind: RnnKind::Gru,
            hidden: 1,
        };
        let (x, h) = (1.5f32, -0.4f32);
        let (h_new, c) = cell
            .forward(&t(&[x], (1, 1)), &t(&[h], (1, 1)), None)
            .unwrap();
        assert!(c.is_none());

        let sig = |v: f32| 1.0 / (1.0 + (-v).exp());
        let r = sig(0.5 * x + 0.1 + 0.2 * h);
        let z = sig(-0.3 * x + 0.4 * h + 0.1);
        let n = (0.8 * x - 0.2 + r * (-0.6 * h + 0.3)).tanh();
        let expected = (1.0 - z) * n + z * h;

        let got: Vec<f32> = h_new.flatten_all().unwrap().to_vec1().unwrap();
        assert!((got[0] - expected).abs() < 1e-5, "{} vs {}", got[0], expected);
    }

    #[test]
    fn test_lstm_cell_state_starts_at_zero() {
        let config = small_config(RnnKind::Lstm, 2, true);
        let decoder = random_decoder(&config);
        let z = Tensor::zeros((1, 4), DType::F32, &Device::Cpu).unwrap();
        let state = decoder.init_state(&z).unwrap();

        assert_eq!(state.h.len(), 4);
        let cells = state.c.as_ref().unwrap();
        assert_eq!(cells.len(), 4);
        let sum: f32 = cells[3].abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }

    #[test]
    fn test_rnn_kind_parsing() {
        assert_eq!("LSTM".parse::<RnnKind>().unwrap(), RnnKind::Lstm);
        assert!("transformer".parse::<RnnKind>().is_err());
    }
}
