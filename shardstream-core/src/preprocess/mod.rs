//! Per-sample preprocessing
//!
//! A [`Preprocessor`] turns one grouped sample into model-ready tensors or
//! refuses it with a [`Rejection`]. Rejections are ordinary outcomes: the
//! driver logs and counts them, then moves on to the next sample.

pub mod image;
pub mod interleaved;
pub mod paired;
pub mod span_mask;
pub mod text;
pub mod tokenizer;

pub use self::image::{
    decode_image, Augmentation, ClipImageEncoder, ClipImageEncoderConfig, ImageEncoder,
};
pub use interleaved::InterleavedPreprocessor;
pub use paired::PairedPreprocessor;
pub use span_mask::SpanMaskPreprocessor;
pub use tokenizer::{tokenize, Encoded, HfTokenizer, Padding, Tokenizer, END_OF_CHUNK, IMAGE_MARKER};

use ndarray::{Array2, Array3, Array4};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use thiserror::Error;

use crate::data::{DatasetKind, GroupedSample};
use crate::error::{DecodeError, PipelineError};

/// Why a sample produced no tensors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Rejection {
    /// A required field is absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// A payload could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Structurally invalid document
    #[error("Malformed document: {0}")]
    Malformed(String),

    /// Nothing but punctuation (or nothing at all) in the text
    #[error("No sentences in sample")]
    NoSentences,

    /// The masking draw selected no sentence
    #[error("No sentences to mask")]
    NoMaskedSentences,

    /// Every image was filtered out
    #[error("No images in sample")]
    NoImages,

    /// Every text segment was filtered out
    #[error("No text in sample")]
    NoText,

    /// Tokenizer failed on the assembled text
    #[error("Tokenizer failed: {0}")]
    Tokenizer(String),
}

impl From<PipelineError> for Rejection {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Decode(e) => Rejection::Decode(e),
            other => Rejection::Tokenizer(other.to_string()),
        }
    }
}

/// Constants of the three preprocessing policies
#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessConfig {
    /// Token budget of a paired caption
    pub paired_max_tokens: usize,
    /// Token budget of a full text-span or interleaved document
    pub document_max_tokens: usize,
    /// Token budget of one masked sentence
    pub span_max_tokens: usize,
    /// Masked sentence slots per text-span sample
    pub max_masked_sentences: usize,
    /// Chance of masking each sentence
    pub mask_probability: f64,
    /// Image slots per interleaved document
    pub max_images: usize,
    /// Images with a side below this are dropped
    pub min_image_side: u32,
    /// Augmentation applied after encoding
    pub augmentation: Augmentation,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            paired_max_tokens: 32,
            document_max_tokens: 256,
            span_max_tokens: 24,
            max_masked_sentences: 10,
            mask_probability: 0.7,
            max_images: 5,
            min_image_side: 11,
            augmentation: Augmentation::default(),
        }
    }
}

/// External collaborators and constants shared by the preprocessors
#[derive(Clone)]
pub struct PreprocessContext {
    /// Tokenizer for model text
    pub text_tokenizer: Arc<dyn Tokenizer>,
    /// Tokenizer for masked spans; the text tokenizer when unset
    pub span_tokenizer: Option<Arc<dyn Tokenizer>>,
    /// Image feature encoder
    pub image_encoder: Arc<dyn ImageEncoder>,
    /// Policy constants
    pub config: PreprocessConfig,
}

impl PreprocessContext {
    /// Context with default constants and a shared tokenizer
    pub fn new(text_tokenizer: Arc<dyn Tokenizer>, image_encoder: Arc<dyn ImageEncoder>) -> Self {
        Self {
            text_tokenizer,
            span_tokenizer: None,
            image_encoder,
            config: PreprocessConfig::default(),
        }
    }

    /// Use a separate tokenizer for masked spans
    pub fn with_span_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.span_tokenizer = Some(tokenizer);
        self
    }

    /// Replace the policy constants
    pub fn with_config(mut self, config: PreprocessConfig) -> Self {
        self.config = config;
        self
    }

    /// Tokenizer used for masked spans
    pub fn span_tokenizer(&self) -> &dyn Tokenizer {
        self.span_tokenizer
            .as_deref()
            .unwrap_or(self.text_tokenizer.as_ref())
    }
}

/// Tensors of one accepted sample
#[derive(Debug, Clone, PartialEq)]
pub enum SampleTensors {
    /// `[C, H, W]` image plus caption tokens (unpadded)
    Paired { image: Array3<f32>, text: Encoded },
    /// Document tokens plus `[slots, span_len]` masked span tokens
    TextSpan {
        text: Encoded,
        span_ids: Array2<u32>,
        span_mask: Array2<u32>,
    },
    /// `[slots, C, H, W]` images plus document tokens
    Interleaved { images: Array4<f32>, text: Encoded },
}

/// One accepted sample
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedSample {
    /// Key of the grouped sample
    pub key: String,
    /// Model inputs
    pub tensors: SampleTensors,
}

/// Sample preparation policy
pub trait Preprocessor: Send + Sync {
    /// Dataset kind this policy handles
    fn kind(&self) -> DatasetKind;

    /// Prepare `sample`, drawing randomness from `rng`
    fn prepare(
        &self,
        sample: &GroupedSample,
        rng: &mut ChaCha8Rng,
    ) -> Result<PreparedSample, Rejection>;
}

/// Policy for `kind`
pub fn preprocessor_for(kind: DatasetKind, context: PreprocessContext) -> Arc<dyn Preprocessor> {
    match kind {
        DatasetKind::Paired => Arc::new(PairedPreprocessor::new(context)),
        DatasetKind::TextSpan => Arc::new(SpanMaskPreprocessor::new(context)),
        DatasetKind::Interleaved => Arc::new(InterleavedPreprocessor::new(context)),
    }
}

fn utf8_field<'a>(sample: &'a GroupedSample, field: &'static str) -> Result<&'a str, Rejection> {
    let bytes = sample.get(field).ok_or(Rejection::MissingField(field))?;
    std::str::from_utf8(bytes).map_err(|_| Rejection::Decode(DecodeError::Utf8))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_from_pipeline_error() {
        let rejection = Rejection::from(PipelineError::Decode(DecodeError::Utf8));
        assert_eq!(rejection, Rejection::Decode(DecodeError::Utf8));

        let rejection = Rejection::from(PipelineError::Tokenizer {
            message: "boom".into(),
        });
        assert!(matches!(rejection, Rejection::Tokenizer(_)));
    }

    #[test]
    fn test_factory_matches_kind() {
        for kind in [DatasetKind::Paired, DatasetKind::TextSpan, DatasetKind::Interleaved] {
            assert_eq!(preprocessor_for(kind, testing::context()).kind(), kind);
        }
    }
}
