//! Token sequence -> display text

use anyhow::Result;

use crate::vocab::Vocabulary;

/// One rendered output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedSentence {
    pub text: String,
    /// No `<eos>` was reached; `text` holds every emitted token
    pub truncated: bool,
}

/// Words of `tokens` strictly before the first `<eos>`, space-joined
///
/// Without `<eos>` the whole sequence is rendered. Fails with a lookup
/// error on an index outside `vocab`.
pub fn render(tokens: &[u32], vocab: &Vocabulary) -> Result<String> {
    Ok(render_sentence(tokens, vocab)?.text)
}

/// [`render`], also reporting whether the sequence was truncated
pub fn render_sentence(tokens: &[u32], vocab: &Vocabulary) -> Result<RenderedSentence> {
    let eos = vocab.eos();
    let end = tokens.iter().position(|&t| t == eos);
    let shown = &tokens[..end.unwrap_or(tokens.len())];

    let words = shown
        .iter()
        .map(|&t| vocab.word_at(t))
        .collect::<Result<Vec<_>>>()?;

    Ok(RenderedSentence {
        text: words.join(" "),
        truncated: end.is_none(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    fn vocab() -> Vocabulary {
        Vocabulary::from_words(["<sos>", "<eos>", "<pad>", "<unk>", "a", "cat"]).unwrap()
    }

    #[test]
    fn test_render_stops_at_eos() {
        assert_eq!(render(&[4, 5, 1], &vocab()).unwrap(), "a cat");
        assert_eq!(render(&[4, 1, 5, 5], &vocab()).unwrap(), "a");
    }

    #[test]
    fn test_eos_first_is_empty() {
        let sentence = render_sentence(&[1], &vocab()).unwrap();
        assert_eq!(sentence.text, "");
        assert!(!sentence.truncated);
    }

    #[test]
    fn test_truncated_renders_everything() {
        let sentence = render_sentence(&[4, 5, 3, 2], &vocab()).unwrap();
        assert_eq!(sentence.text, "a cat <unk> <pad>");
        assert!(sentence.truncated);
    }

    #[test]
    fn test_out_of_range_index() {
        let err = render(&[4, 17, 1], &vocab()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DecodeError>(),
            Some(&DecodeError::Lookup { index: 17, size: 6 })
        );
    }

    #[test]
    fn test_index_after_eos_is_not_looked_up() {
        assert_eq!(render(&[5, 1, 99], &vocab()).unwrap(), "cat");
    }
}
