// Pedantic clippy configuration for numeric code
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in tensor math
#![allow(clippy::cast_possible_truncation)] // usize→u32 for vocabulary indices
#![allow(clippy::many_single_char_names)] // h, c, z, r, n standard in RNN gates
#![allow(clippy::similar_names)] // related variables like `norm1`/`norm2`
#![allow(clippy::module_name_repetitions)] // RecurrentConfig in forward_rnn.rs is fine
// Documentation pedantic:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::needless_pass_by_value)] // VarBuilder is passed by value like candle-nn

//! latent-text: sentence generation from a VAE latent space
//!
//! Decodes points of a trained sentence-VAE latent space into text, either
//! independently sampled or along a straight path between two points.
//!
//! ## Architecture
//!
//! - `vocab`: Word <-> index mapping with the reserved `<sos>`/`<eos>`/`<pad>`/`<unk>`
//! - `latent`: Standard-normal latent sampling and linear interpolation
//! - `decoder`: `SequenceDecoder` trait, shared greedy loop, construction from a checkpoint
//! - `forward_rnn`: Recurrent (RNN / GRU / LSTM) decoder forward pass
//! - `forward_transformer`: Transformer decoder forward pass with KV-cache
//! - `kv_cache`: KV-cache for incremental transformer decoding
//! - `masks`: Cached causal attention masks
//! - `checkpoint`: Safetensors parameter loading and validation
//! - `render`: Token sequence -> sentence text
//! - `session`: Session runner coordinating sampling, interpolation and output
//! - `error`: `DecodeError` kinds raised through anyhow

pub mod checkpoint;
pub mod decoder;
pub mod error;
pub mod forward_rnn;
pub mod forward_transformer;
pub mod kv_cache;
pub mod latent;
pub mod masks;
pub mod render;
pub mod session;
pub mod vocab;

pub use checkpoint::load_parameters;
pub use decoder::{
    build_decoder, greedy_decode, load_decoder, DecodeSettings, DecoderConfig, DecoderVariant,
    SequenceDecoder, StepModel,
};
pub use error::DecodeError;
pub use forward_rnn::{RecurrentConfig, RecurrentDecoder, RnnKind};
pub use forward_transformer::{AttentionConfig, AttentionDecoder};
pub use kv_cache::KVCache;
pub use latent::{interpolate, LatentSampler, LatentVector};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use render::{render, render_sentence, RenderedSentence};
pub use session::{
    select_device, GenerationSession, SessionConfig, SessionResults, INTERPOLATION_HEADING,
    SAMPLES_HEADING,
};
pub use vocab::{SpecialTokens, Vocabulary};
