//! Tokenizer capability
//!
//! Preprocessing only needs `text -> ids`, a pad id and the eos string.
//! Truncation and padding are applied here rather than by the tokenizer so
//! every implementation behaves the same way.

use std::path::Path;

use crate::error::{PipelineError, Result};

/// Image marker inserted where an image belongs in the text
pub const IMAGE_MARKER: &str = "<image>";

/// End-of-chunk marker closing the text attached to an image
pub const END_OF_CHUNK: &str = "<|endofchunk|>";

/// Text to token ids
pub trait Tokenizer: Send + Sync {
    /// Encode `text` without truncation or padding
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Id used for padding positions
    fn pad_token_id(&self) -> u32;

    /// End-of-sequence string appended to training text
    fn eos_token(&self) -> &str;
}

/// How encoded sequences are padded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Pad to the longest sequence of the batch (at batch assembly)
    Longest,
    /// Pad every sequence to the maximum length
    MaxLength,
}

/// Token ids and their attention mask
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Encoded {
    pub ids: Vec<u32>,
    pub mask: Vec<u32>,
}

impl Encoded {
    /// Number of positions, padding included
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether there are no positions
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of attended positions
    pub fn attended(&self) -> usize {
        self.mask.iter().filter(|&&m| m != 0).count()
    }

    /// Pad with `pad_id` up to `length`
    pub fn pad_to(&mut self, length: usize, pad_id: u32) {
        if self.ids.len() < length {
            self.ids.resize(length, pad_id);
            self.mask.resize(length, 0);
        }
    }
}

/// Encode, truncate to `max_length` and pad as requested
pub fn tokenize(
    tokenizer: &dyn Tokenizer,
    text: &str,
    max_length: usize,
    padding: Padding,
) -> Result<Encoded> {
    let mut ids = tokenizer.encode(text)?;
    ids.truncate(max_length);
    let mut encoded = Encoded {
        mask: vec![1; ids.len()],
        ids,
    };
    if padding == Padding::MaxLength {
        encoded.pad_to(max_length, tokenizer.pad_token_id());
    }
    Ok(encoded)
}

/// Adapter over a HuggingFace `tokenizer.json`
///
/// The image and end-of-chunk markers are registered as special tokens so
/// they always encode to a single id.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_token_id: u32,
    eos_token: String,
}

impl HfTokenizer {
    /// Load a tokenizer from a local file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(tokenizer_error)?;
        Self::from_inner(inner)
    }

    /// Load a tokenizer from serialized bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes).map_err(tokenizer_error)?;
        Self::from_inner(inner)
    }

    fn from_inner(mut inner: tokenizers::Tokenizer) -> Result<Self> {
        let eos_token = ["</s>", "<|endoftext|>", "<|end_of_text|>", "<eos>"]
            .into_iter()
            .find(|t| inner.token_to_id(t).is_some())
            .unwrap_or("<|endoftext|>")
            .to_string();

        let markers = [
            tokenizers::AddedToken::from(IMAGE_MARKER, true),
            tokenizers::AddedToken::from(END_OF_CHUNK, true),
            tokenizers::AddedToken::from("<PAD>", true),
        ];
        inner.add_special_tokens(&markers);

        let pad_token_id = ["<pad>", "[PAD]", "<|pad|>", "<PAD>"]
            .into_iter()
            .find_map(|t| inner.token_to_id(t))
            .ok_or_else(|| PipelineError::Tokenizer {
                message: "no pad token available".into(),
            })?;

        Ok(Self {
            inner,
            pad_token_id,
            eos_token,
        })
    }

    /// Override the end-of-sequence string
    pub fn with_eos_token(mut self, eos: impl Into<String>) -> Self {
        self.eos_token = eos.into();
        self
    }

    /// Id of a token, if it is in the vocabulary
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Vocabulary size including added tokens
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false).map_err(tokenizer_error)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    fn eos_token(&self) -> &str {
        &self.eos_token
    }
}

fn tokenizer_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Tokenizer {
        message: e.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::WordTokenizer;
    use super::*;

    #[test]
    fn test_truncate_and_pad() {
        let tok = WordTokenizer::new();
        let encoded = tokenize(&tok, "a b c d e", 3, Padding::MaxLength).unwrap();
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded.attended(), 3);

        let short = tokenize(&tok, "a b", 5, Padding::MaxLength).unwrap();
        assert_eq!(short.ids[2..], [WordTokenizer::PAD; 3]);
        assert_eq!(short.mask, vec![1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_longest_leaves_unpadded() {
        let tok = WordTokenizer::new();
        let encoded = tokenize(&tok, "<image>x<|endofchunk|>", 32, Padding::Longest).unwrap();
        assert_eq!(encoded.len(), 3);
        assert_eq!(encoded.ids[0], tok.id_of("<image>"));
    }
}
