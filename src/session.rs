//! Generation session: pure sampling followed by one interpolation sweep
//!
//! Coordinates vocabulary loading, decoder construction, latent sampling,
//! decoding and rendering.

use anyhow::{Context, Result};
use candle_core::Device;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::decoder::{load_decoder, DecoderConfig, DecoderVariant, SequenceDecoder};
use crate::error::DecodeError;
use crate::forward_rnn::RecurrentConfig;
use crate::forward_transformer::AttentionConfig;
use crate::latent::{interpolate, LatentSampler, LatentVector};
use crate::render::{render_sentence, RenderedSentence};
use crate::vocab::Vocabulary;

pub const SAMPLES_HEADING: &str = "----------SAMPLES----------";
pub const INTERPOLATION_HEADING: &str = "-------INTERPOLATION-------";

/// Configuration for a generation session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding `vocab.json`
    pub data_dir: PathBuf,
    /// Safetensors file with the trained decoder parameters
    pub checkpoint: PathBuf,
    pub num_samples: usize,
    /// Interpolation path length (defaults to `num_samples`)
    pub interpolation_steps: Option<usize>,
    /// Fixed seed for reproducible latents (OS entropy otherwise)
    pub seed: Option<u64>,
    /// Force CPU even when CUDA is available
    pub force_cpu: bool,
    /// Decoder variant name (`rnn` or `transformer`)
    pub model: String,
    pub latent_dim: usize,
    pub num_layers: usize,
    pub max_sequence_length: usize,
    pub word_dropout: f64,
    pub dropout: f64,
    pub recurrent: RecurrentConfig,
    pub attention: AttentionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            checkpoint: PathBuf::from("model.safetensors"),
            num_samples: 10,
            interpolation_steps: None,
            seed: None,
            force_cpu: false,
            model: "rnn".to_string(),
            latent_dim: 64,
            num_layers: 1,
            max_sequence_length: 60,
            word_dropout: 0.6,
            dropout: 0.5,
            recurrent: RecurrentConfig::default(),
            attention: AttentionConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn vocab_path(&self) -> PathBuf {
        self.data_dir.join("vocab.json")
    }

    pub fn interpolation_steps(&self) -> usize {
        self.interpolation_steps.unwrap_or(self.num_samples)
    }

    /// Decoder construction input for `vocab`; fails on an unknown variant
    pub fn decoder_config(&self, vocab: &Vocabulary) -> Result<DecoderConfig> {
        let variant: DecoderVariant = self.model.parse()?;
        Ok(DecoderConfig {
            latent_dim: self.latent_dim,
            num_layers: self.num_layers,
            max_sequence_length: self.max_sequence_length,
            word_dropout: self.word_dropout,
            dropout: self.dropout,
            recurrent: self.recurrent.clone(),
            attention: self.attention.clone(),
            ..DecoderConfig::new(variant, vocab)
        })
    }

    pub fn sampler(&self) -> LatentSampler {
        match self.seed {
            Some(seed) => LatentSampler::seeded(self.latent_dim, seed),
            None => LatentSampler::new(self.latent_dim),
        }
    }
}

/// CUDA when available unless `force_cpu`
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Rendered output of one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResults {
    pub samples: Vec<RenderedSentence>,
    /// In path order, first endpoint to second
    pub interpolation: Vec<RenderedSentence>,
}

impl SessionResults {
    /// Emit both blocks, one sentence per line
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "{SAMPLES_HEADING}")?;
        for sentence in &self.samples {
            writeln!(out, "{}", sentence.text)?;
        }
        writeln!(out)?;
        writeln!(out, "{INTERPOLATION_HEADING}")?;
        for sentence in &self.interpolation {
            writeln!(out, "{}", sentence.text)?;
        }
        Ok(())
    }
}

/// Main session runner
pub struct GenerationSession {
    config: SessionConfig,
    vocab: Vocabulary,
    decoder: Box<dyn SequenceDecoder>,
    sampler: LatentSampler,
}

impl GenerationSession {
    /// Load vocabulary and checkpoint named by `config` and build the decoder
    pub fn load(config: SessionConfig) -> Result<Self> {
        let vocab = Vocabulary::load(&config.vocab_path())?;
        let decoder_config = config.decoder_config(&vocab)?;
        let device = select_device(config.force_cpu);
        let decoder = load_decoder(&decoder_config, &config.checkpoint, &device)?;
        let sampler = config.sampler();
        Self::new(vocab, decoder, sampler, config)
    }

    /// Assemble a session from already-built parts
    ///
    /// The decoder must have been built for `vocab`: same size, same
    /// reserved indices.
    pub fn new(
        vocab: Vocabulary,
        decoder: Box<dyn SequenceDecoder>,
        sampler: LatentSampler,
        config: SessionConfig,
    ) -> Result<Self> {
        let settings = *decoder.settings();
        if settings.vocab_size != vocab.len() || settings.special != vocab.special() {
            anyhow::bail!(DecodeError::config(format!(
                "decoder was built for a vocabulary of {} words with {:?}, got {} words with {:?}",
                settings.vocab_size,
                settings.special,
                vocab.len(),
                vocab.special()
            )));
        }
        if sampler.latent_dim() != settings.latent_dim {
            anyhow::bail!(DecodeError::config(format!(
                "sampler draws {}-dim latents, decoder expects {}",
                sampler.latent_dim(),
                settings.latent_dim
            )));
        }
        if config.num_samples == 0 {
            anyhow::bail!(DecodeError::invalid_input("num_samples must be positive"));
        }
        if config.interpolation_steps() == 0 {
            anyhow::bail!(DecodeError::invalid_input(
                "interpolation_steps must be positive"
            ));
        }

        Ok(Self {
            config,
            vocab,
            decoder,
            sampler,
        })
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn decoder(&self) -> &dyn SequenceDecoder {
        self.decoder.as_ref()
    }

    /// Run sampling then interpolation
    pub fn run(&mut self) -> Result<SessionResults> {
        info!(
            "Starting session: {} decoder, {} samples",
            self.decoder.variant(),
            self.config.num_samples
        );

        let latents = self.sampler.sample(self.config.num_samples)?;
        let samples = self.decode_all(&latents, "sample")?;
        info!("Decoded {} samples", samples.len());

        let endpoints = self.sampler.sample(2)?;
        let path = match self.config.interpolation_steps() {
            // A one-point path is the first endpoint
            1 => vec![endpoints[0].clone()],
            steps => interpolate(&endpoints[0], &endpoints[1], steps)?,
        };
        let interpolation = self.decode_all(&path, "interpolation point")?;
        info!("Decoded {} interpolation points", interpolation.len());

        let truncated = samples
            .iter()
            .chain(&interpolation)
            .filter(|s| s.truncated)
            .count();
        if truncated > 0 {
            debug!("{truncated} sentences reached max_sequence_length without <eos>");
        }

        Ok(SessionResults {
            samples,
            interpolation,
        })
    }

    fn decode_all(&self, latents: &[LatentVector], what: &str) -> Result<Vec<RenderedSentence>> {
        latents
            .iter()
            .enumerate()
            .map(|(i, z)| {
                let tokens = self
                    .decoder
                    .decode(z)
                    .with_context(|| format!("Decoding {what} {i}"))?;
                render_sentence(&tokens, &self.vocab)
                    .with_context(|| format!("Rendering {what} {i}"))
            })
            .collect()
    }
}
