//! Word-level vocabulary with the four reserved symbols
//!
//! The vocabulary file is the JSON written at corpus-preprocessing time:
//!
//! ```text
//! {"w2i": {"<sos>": 0, "<eos>": 1, ...}, "i2w": {"0": "<sos>", "1": "<eos>", ...}}
//! ```
//!
//! Both maps must describe the same bijection over `0..len`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::DecodeError;

pub const SOS: &str = "<sos>";
pub const EOS: &str = "<eos>";
pub const PAD: &str = "<pad>";
pub const UNK: &str = "<unk>";

/// Indices of the reserved symbols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub sos: u32,
    pub eos: u32,
    pub pad: u32,
    pub unk: u32,
}

impl SpecialTokens {
    /// Largest reserved index, used to validate against a vocabulary size
    pub fn max_index(&self) -> u32 {
        self.sos.max(self.eos).max(self.pad).max(self.unk)
    }
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct VocabFile {
    w2i: HashMap<String, u32>,
    i2w: HashMap<String, String>,
}

/// Immutable word <-> index mapping
#[derive(Debug, Clone)]
pub struct Vocabulary {
    id_to_word: Vec<String>,
    word_to_id: HashMap<String, u32>,
    special: SpecialTokens,
}

impl Vocabulary {
    /// Load a vocabulary from a `vocab.json` file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DecodeError::ResourceNotFound(path.to_path_buf()).into());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocab file: {}", path.display()))?;
        let vocab = Self::from_json(&content)
            .with_context(|| format!("Invalid vocab file: {}", path.display()))?;
        info!("Vocabulary: {} words from {}", vocab.len(), path.display());
        Ok(vocab)
    }

    /// Parse the `{"w2i": .., "i2w": ..}` JSON layout
    pub fn from_json(content: &str) -> Result<Self> {
        let file: VocabFile = serde_json::from_str(content)
            .map_err(|e| DecodeError::config(format!("malformed vocabulary JSON: {e}")))?;

        if file.w2i.len() != file.i2w.len() {
            anyhow::bail!(DecodeError::config(format!(
                "w2i has {} entries but i2w has {}",
                file.w2i.len(),
                file.i2w.len()
            )));
        }

        let mut slots: Vec<Option<String>> = vec![None; file.i2w.len()];
        for (key, word) in file.i2w {
            let idx: usize = key
                .parse()
                .map_err(|_| DecodeError::config(format!("i2w key {key:?} is not an index")))?;
            let slot = slots.get_mut(idx).ok_or_else(|| {
                DecodeError::config(format!("i2w index {idx} outside 0..{}", file.w2i.len()))
            })?;
            *slot = Some(word);
        }

        let mut id_to_word = Vec::with_capacity(slots.len());
        for (idx, slot) in slots.into_iter().enumerate() {
            let word =
                slot.ok_or_else(|| DecodeError::config(format!("i2w has no entry for {idx}")))?;
            match file.w2i.get(&word) {
                Some(&back) if back as usize == idx => {}
                Some(&back) => anyhow::bail!(DecodeError::config(format!(
                    "{word:?} is index {idx} in i2w but {back} in w2i"
                ))),
                None => anyhow::bail!(DecodeError::config(format!(
                    "{word:?} (index {idx}) missing from w2i"
                ))),
            }
            id_to_word.push(word);
        }

        Self::from_parts(id_to_word, file.w2i)
    }

    /// Build from an ordered word list; a word's index is its position
    pub fn from_words<I, S>(words: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id_to_word: Vec<String> = words.into_iter().map(Into::into).collect();
        let mut word_to_id = HashMap::with_capacity(id_to_word.len());
        for (idx, word) in id_to_word.iter().enumerate() {
            if word_to_id.insert(word.clone(), idx as u32).is_some() {
                anyhow::bail!(DecodeError::config(format!("duplicate word {word:?}")));
            }
        }
        Self::from_parts(id_to_word, word_to_id)
    }

    fn from_parts(id_to_word: Vec<String>, word_to_id: HashMap<String, u32>) -> Result<Self> {
        let reserved = |word: &str| {
            word_to_id
                .get(word)
                .copied()
                .ok_or_else(|| DecodeError::config(format!("reserved symbol {word} missing")))
        };
        let special = SpecialTokens {
            sos: reserved(SOS)?,
            eos: reserved(EOS)?,
            pad: reserved(PAD)?,
            unk: reserved(UNK)?,
        };
        Ok(Self {
            id_to_word,
            word_to_id,
            special,
        })
    }

    /// Index of `word`, or the `<unk>` index when absent
    pub fn index_of(&self, word: &str) -> u32 {
        self.word_to_id
            .get(word)
            .copied()
            .unwrap_or(self.special.unk)
    }

    /// Word at `index`
    pub fn word_at(&self, index: u32) -> Result<&str> {
        self.id_to_word
            .get(index as usize)
            .map(String::as_str)
            .ok_or_else(|| {
                DecodeError::Lookup {
                    index,
                    size: self.len(),
                }
                .into()
            })
    }

    /// Number of words, reserved symbols included
    pub fn len(&self) -> usize {
        self.id_to_word.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_word.is_empty()
    }

    pub fn special(&self) -> SpecialTokens {
        self.special
    }

    pub fn sos(&self) -> u32 {
        self.special.sos
    }

    pub fn eos(&self) -> u32 {
        self.special.eos
    }

    pub fn pad(&self) -> u32 {
        self.special.pad
    }

    pub fn unk(&self) -> u32 {
        self.special.unk
    }
}
