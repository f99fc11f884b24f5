//! Latent-to-sequence decoder contract and the shared greedy generation loop
//!
//! Both decoder variants implement [`StepModel`]: they know how to turn a
//! latent vector into an initial generation state and how to advance that
//! state by one token. [`greedy_decode`] owns everything else (input
//! validation, the `<sos>` seed, argmax selection, `<eos>` stopping and
//! truncation at the length bound), so the stopping policy exists once.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::checkpoint::load_parameters;
use crate::error::DecodeError;
use crate::forward_rnn::{RecurrentConfig, RecurrentDecoder};
use crate::forward_transformer::{AttentionConfig, AttentionDecoder};
use crate::vocab::{SpecialTokens, Vocabulary};

/// Supported decoder architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderVariant {
    /// Recurrent (RNN / GRU / LSTM) decoder
    Recurrent,
    /// Transformer decoder cross-attending to the latent
    Attention,
}

impl FromStr for DecoderVariant {
    type Err = DecodeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rnn" | "recurrent" => Ok(Self::Recurrent),
            "transformer" | "attention" => Ok(Self::Attention),
            other => Err(DecodeError::config(format!(
                "unknown decoder variant {other:?} (expected rnn or transformer)"
            ))),
        }
    }
}

impl fmt::Display for DecoderVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recurrent => write!(f, "rnn"),
            Self::Attention => write!(f, "transformer"),
        }
    }
}

/// Everything the generation loop needs besides the network itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeSettings {
    pub vocab_size: usize,
    pub latent_dim: usize,
    pub max_sequence_length: usize,
    pub special: SpecialTokens,
}

/// Full construction input for either decoder variant
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub variant: DecoderVariant,
    pub vocab_size: usize,
    pub special: SpecialTokens,
    pub latent_dim: usize,
    pub num_layers: usize,
    pub max_sequence_length: usize,
    /// Training-only; accepted for parity with the training configuration
    pub word_dropout: f64,
    /// Training-only; accepted for parity with the training configuration
    pub dropout: f64,
    pub recurrent: RecurrentConfig,
    pub attention: AttentionConfig,
}

impl DecoderConfig {
    /// Default architecture for `variant`, sized for `vocab`
    pub fn new(variant: DecoderVariant, vocab: &Vocabulary) -> Self {
        Self {
            variant,
            vocab_size: vocab.len(),
            special: vocab.special(),
            latent_dim: 64,
            num_layers: 1,
            max_sequence_length: 60,
            word_dropout: 0.6,
            dropout: 0.5,
            recurrent: RecurrentConfig::default(),
            attention: AttentionConfig::default(),
        }
    }

    pub fn settings(&self) -> DecodeSettings {
        DecodeSettings {
            vocab_size: self.vocab_size,
            latent_dim: self.latent_dim,
            max_sequence_length: self.max_sequence_length,
            special: self.special,
        }
    }

    /// Check the shared knobs and the active variant's knobs
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("latent_dim", self.latent_dim),
            ("num_layers", self.num_layers),
            ("max_sequence_length", self.max_sequence_length),
        ];
        for (name, value) in positive {
            if value == 0 {
                anyhow::bail!(DecodeError::config(format!("{name} must be positive")));
            }
        }
        if self.special.max_index() as usize >= self.vocab_size {
            anyhow::bail!(DecodeError::config(format!(
                "special token index {} outside vocabulary of size {}",
                self.special.max_index(),
                self.vocab_size
            )));
        }
        match self.variant {
            DecoderVariant::Recurrent => self.recurrent.validate(),
            DecoderVariant::Attention => self.attention.validate(),
        }
    }

    /// Parameter names and shapes the configured decoder expects
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        match self.variant {
            DecoderVariant::Recurrent => RecurrentDecoder::parameter_shapes(self),
            DecoderVariant::Attention => AttentionDecoder::parameter_shapes(self),
        }
    }
}

/// One-step network interface driven by [`greedy_decode`]
pub trait StepModel {
    /// Per-call generation state (hidden states, KV cache, ...)
    type State;

    fn decode_settings(&self) -> &DecodeSettings;

    fn device(&self) -> &Device;

    /// Map a `[1, latent_dim]` latent into the initial state
    fn init_state(&self, latent: &Tensor) -> Result<Self::State>;

    /// Feed `token` at `position` and return next-token logits, shape `[vocab]`
    fn step(&self, state: &mut Self::State, token: u32, position: usize) -> Result<Tensor>;
}

/// Greedy autoregressive decoding shared by all variants
///
/// Returns between 1 and `max_sequence_length` indices. `<sos>` is never
/// selected; generation stops right after `<eos>` is appended, or at the
/// length bound (truncation, not an error).
pub fn greedy_decode<M: StepModel + ?Sized>(model: &M, latent: &[f32]) -> Result<Vec<u32>> {
    let settings = *model.decode_settings();
    if latent.len() != settings.latent_dim {
        anyhow::bail!(DecodeError::invalid_input(format!(
            "latent vector has {} dims, decoder expects {}",
            latent.len(),
            settings.latent_dim
        )));
    }

    let z = Tensor::from_slice(latent, (1, latent.len()), model.device())?;
    let mut state = model.init_state(&z)?;

    let mut tokens = Vec::with_capacity(settings.max_sequence_length);
    let mut prev = settings.special.sos;

    for position in 0..settings.max_sequence_length {
        let logits = model.step(&mut state, prev, position)?;
        let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let next = argmax_excluding(&logits, settings.special.sos)?;

        tokens.push(next);
        if next == settings.special.eos {
            return Ok(tokens);
        }
        prev = next;
    }

    debug!(
        "Generation truncated at {} tokens without <eos>",
        settings.max_sequence_length
    );
    Ok(tokens)
}

/// Argmax over logits, skipping `excluded`; ties go to the lowest index
fn argmax_excluding(logits: &[f32], excluded: u32) -> Result<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in logits.iter().enumerate() {
        if idx == excluded as usize || value.is_nan() {
            continue;
        }
        match best {
            Some((_, best_value)) if value <= best_value => {}
            _ => best = Some((idx, value)),
        }
    }
    let (idx, _) = best.ok_or_else(|| anyhow::anyhow!("No selectable logits"))?;
    Ok(idx as u32)
}

/// Polymorphic latent-to-sequence decoder
pub trait SequenceDecoder {
    fn variant(&self) -> DecoderVariant;

    fn settings(&self) -> &DecodeSettings;

    /// Greedily decode one latent vector into vocabulary indices
    fn decode(&self, latent: &[f32]) -> Result<Vec<u32>>;
}

/// Build a decoder from already-loaded parameters
pub fn build_decoder(
    config: &DecoderConfig,
    vb: VarBuilder,
    device: &Device,
) -> Result<Box<dyn SequenceDecoder>> {
    config.validate()?;
    build_validated(config, vb, device)
}

fn build_validated(
    config: &DecoderConfig,
    vb: VarBuilder,
    device: &Device,
) -> Result<Box<dyn SequenceDecoder>> {
    let decoder: Box<dyn SequenceDecoder> = match config.variant {
        DecoderVariant::Recurrent => Box::new(RecurrentDecoder::load(vb, config, device)?),
        DecoderVariant::Attention => Box::new(AttentionDecoder::load(vb, config, device)?),
    };
    Ok(decoder)
}

/// Validate `config`, load its parameters from `checkpoint` and build the decoder
pub fn load_decoder(
    config: &DecoderConfig,
    checkpoint: &Path,
    device: &Device,
) -> Result<Box<dyn SequenceDecoder>> {
    config.validate()?;
    info!(
        "Building {} decoder: {} layers, latent {}, vocab {}",
        config.variant, config.num_layers, config.latent_dim, config.vocab_size
    );

    let vb = load_parameters(checkpoint, &config.parameter_shapes(), device)?;
    let decoder = build_validated(config, vb, device)
        .with_context(|| format!("Failed to build decoder from {}", checkpoint.display()))?;

    info!("Model loaded from {}", checkpoint.display());
    Ok(decoder)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits a fixed script of tokens, one per step, ignoring the latent
    struct Scripted {
        settings: DecodeSettings,
        script: Vec<u32>,
        device: Device,
    }

    impl Scripted {
        fn new(script: Vec<u32>, max_sequence_length: usize) -> Self {
            Self {
                settings: DecodeSettings {
                    vocab_size: 6,
                    latent_dim: 2,
                    max_sequence_length,
                    special: SpecialTokens {
                        sos: 0,
                        eos: 1,
                        pad: 2,
                        unk: 3,
                    },
                },
                script,
                device: Device::Cpu,
            }
        }
    }

    impl StepModel for Scripted {
        type State = Vec<u32>;

        fn decode_settings(&self) -> &DecodeSettings {
            &self.settings
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn init_state(&self, _latent: &Tensor) -> Result<Self::State> {
            Ok(Vec::new())
        }

        fn step(&self, state: &mut Self::State, token: u32, position: usize) -> Result<Tensor> {
            state.push(token);
            let target = self.script[position % self.script.len()];
            let mut logits = vec![0.0f32; self.settings.vocab_size];
            logits[target as usize] = 5.0;
            Ok(Tensor::new(logits, &self.device)?)
        }
    }

    #[test]
    fn test_stops_after_eos() {
        let model = Scripted::new(vec![4, 5, 1, 4], 10);
        assert_eq!(greedy_decode(&model, &[0.0, 0.0]).unwrap(), vec![4, 5, 1]);
    }

    #[test]
    fn test_truncates_at_max_length() {
        let model = Scripted::new(vec![4, 5], 7);
        let tokens = greedy_decode(&model, &[0.0, 0.0]).unwrap();
        assert_eq!(tokens.len(), 7);
        assert!(!tokens.contains(&1));
    }

    #[test]
    fn test_rejects_wrong_latent_length() {
        let model = Scripted::new(vec![1], 5);
        let err = greedy_decode(&model, &[0.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sos_never_selected() {
        // Script asks for <sos>; the runner-up (all zeros -> lowest index) wins
        let model = Scripted::new(vec![0], 3);
        let tokens = greedy_decode(&model, &[0.0, 0.0]).unwrap();
        assert_eq!(tokens, vec![1]);
    }

    #[test]
    fn test_argmax_ties_and_nan() {
        assert_eq!(argmax_excluding(&[1.0, 3.0, 3.0, 2.0], 0).unwrap(), 1);
        assert_eq!(argmax_excluding(&[9.0, f32::NAN, 2.0], 0).unwrap(), 2);
        assert!(argmax_excluding(&[1.0], 0).is_err());
    }

    #[test]
    fn test_variant_parsing() {
        assert_eq!("rnn".parse::<DecoderVariant>().unwrap(), DecoderVariant::Recurrent);
        assert_eq!(
            "Transformer".parse::<DecoderVariant>().unwrap(),
            DecoderVariant::Attention
        );
        assert!(matches!(
            "wavenet".parse::<DecoderVariant>(),
            Err(DecodeError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let vocab =
            Vocabulary::from_words(["<sos>", "<eos>", "<pad>", "<unk>", "a", "cat"]).unwrap();
        let mut config = DecoderConfig::new(DecoderVariant::Attention, &vocab);
        assert!(config.validate().is_ok());

        config.attention.nhead = 3;
        assert!(config.validate().is_err());

        let mut config = DecoderConfig::new(DecoderVariant::Recurrent, &vocab);
        config.max_sequence_length = 0;
        assert!(config.validate().is_err());

        let mut config = DecoderConfig::new(DecoderVariant::Recurrent, &vocab);
        config.vocab_size = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_config_rejected_before_checkpoint_read() {
        let vocab =
            Vocabulary::from_words(["<sos>", "<eos>", "<pad>", "<unk>", "a", "cat"]).unwrap();
        let mut config = DecoderConfig::new(DecoderVariant::Attention, &vocab);
        config.attention.nhead = 3;

        let err = load_decoder(&config, Path::new("/nonexistent/model.safetensors"), &Device::Cpu)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::Configuration(_))
        ));

        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let err = build_decoder(&config, vb, &Device::Cpu).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::Configuration(_))
        ));
    }
}
