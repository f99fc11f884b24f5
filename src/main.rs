//! latent-text CLI: sample sentences and interpolate in a sentence-VAE latent space

use anyhow::Result;
use clap::Parser;
use latent_text::{
    AttentionConfig, GenerationSession, RecurrentConfig, RnnKind, SessionConfig,
};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "latent-text")]
#[command(about = "Greedy sentence generation from a trained sentence-VAE decoder")]
#[command(version)]
struct Cli {
    /// Safetensors checkpoint with the trained parameters
    #[arg(short = 'c', long)]
    load_checkpoint: PathBuf,

    /// Number of sampled sentences (and default interpolation length)
    #[arg(short = 'n', long, default_value_t = 10)]
    num_samples: usize,

    /// Directory containing vocab.json
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 60)]
    max_sequence_length: usize,

    /// Decoder variant: rnn or transformer
    #[arg(long, default_value = "rnn")]
    model: String,

    #[arg(long, default_value_t = 64)]
    dim_latent: usize,

    #[arg(long, default_value_t = 1)]
    num_layers: usize,

    /// Training-only, accepted for parity with the training run
    #[arg(long, default_value_t = 0.6)]
    word_dropout: f64,

    /// Training-only, accepted for parity with the training run
    #[arg(long, default_value_t = 0.5)]
    dropout: f64,

    // Recurrent decoder
    #[arg(long, default_value_t = 300)]
    dim_embedding: usize,

    /// rnn, gru or lstm
    #[arg(long, default_value = "gru")]
    rnn_type: String,

    #[arg(long, default_value_t = 256)]
    dim_hidden: usize,

    #[arg(long)]
    bidirectional: bool,

    // Transformer decoder
    #[arg(long, default_value_t = 256)]
    dim_model: usize,

    #[arg(long, default_value_t = 4)]
    nhead: usize,

    #[arg(long, default_value_t = 256)]
    dim_feedforward: usize,

    /// Interpolation path length (defaults to --num-samples)
    #[arg(long)]
    interpolation_steps: Option<usize>,

    /// Seed for reproducible latents
    #[arg(long)]
    seed: Option<u64>,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        let rnn_type: RnnKind = self.rnn_type.parse()?;
        Ok(SessionConfig {
            data_dir: self.data_dir.clone(),
            checkpoint: self.load_checkpoint.clone(),
            num_samples: self.num_samples,
            interpolation_steps: self.interpolation_steps,
            seed: self.seed,
            force_cpu: self.cpu,
            model: self.model.clone(),
            latent_dim: self.dim_latent,
            num_layers: self.num_layers,
            max_sequence_length: self.max_sequence_length,
            word_dropout: self.word_dropout,
            dropout: self.dropout,
            recurrent: RecurrentConfig {
                rnn_type,
                dim_embedding: self.dim_embedding,
                dim_hidden: self.dim_hidden,
                bidirectional: self.bidirectional,
            },
            attention: AttentionConfig {
                dim_model: self.dim_model,
                nhead: self.nhead,
                dim_feedforward: self.dim_feedforward,
            },
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.session_config()?;
    info!("Vocabulary: {}", config.vocab_path().display());
    info!("Checkpoint: {}", config.checkpoint.display());

    let mut session = GenerationSession::load(config)?;
    let results = session.run()?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    results.write_to(&mut out)?;
    out.flush()?;

    Ok(())
}
