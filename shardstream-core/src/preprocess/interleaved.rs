//! Documents interleaving text and images
//!
//! Input is a JSON object with parallel `interleaved_list` and `is_image`
//! arrays; image entries hold base64 PNG/JPEG bytes. Small images are
//! filtered as icons, at most `max_images` are kept, and every kept image
//! becomes an end-of-chunk plus image marker in the text. The image tensor
//! always has `max_images` slots.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::DynamicImage;
use ndarray::{s, Array4, Axis};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use super::image::decode_image;
use super::text::{
    assemble_marked_text, chunk_image_marker, is_punctuation_only, normalize_whitespace,
};
use super::tokenizer::{tokenize, Padding};
use super::{PreparedSample, PreprocessContext, Preprocessor, Rejection, SampleTensors};
use crate::data::{DatasetKind, GroupedSample};
use crate::error::DecodeError;

/// Flags may be JSON booleans or 0/1
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
enum ImageFlag {
    Bool(bool),
    Int(i64),
}

impl ImageFlag {
    fn is_set(self) -> bool {
        match self {
            ImageFlag::Bool(b) => b,
            ImageFlag::Int(i) => i != 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InterleavedDocument {
    interleaved_list: Vec<String>,
    is_image: Vec<ImageFlag>,
}

enum Segment {
    Text(String),
    Image(DynamicImage),
}

/// Preprocessor for interleaved image-text documents
pub struct InterleavedPreprocessor {
    context: PreprocessContext,
}

impl InterleavedPreprocessor {
    /// Create the policy
    pub fn new(context: PreprocessContext) -> Self {
        Self { context }
    }

    /// Decode and filter images, normalise and filter text.
    ///
    /// Returns the surviving segments in document order.
    fn filter_segments(&self, document: InterleavedDocument) -> Result<Vec<Segment>, Rejection> {
        let config = &self.context.config;
        if document.interleaved_list.len() != document.is_image.len() {
            return Err(Rejection::Malformed(format!(
                "{} segments but {} image flags",
                document.interleaved_list.len(),
                document.is_image.len()
            )));
        }

        let mut valid_images = 0usize;
        let mut segments = Vec::with_capacity(document.interleaved_list.len());
        for (content, flag) in document.interleaved_list.into_iter().zip(document.is_image) {
            if flag.is_set() {
                let bytes = STANDARD
                    .decode(content.trim())
                    .map_err(|e| DecodeError::Base64(e.to_string()))?;
                let image = decode_image(&bytes)?;
                if image.width() < config.min_image_side || image.height() < config.min_image_side {
                    continue;
                }
                valid_images += 1;
                if valid_images <= config.max_images {
                    segments.push(Segment::Image(image));
                }
            } else {
                let text = normalize_whitespace(&content);
                if !text.is_empty() && !is_punctuation_only(&text) {
                    segments.push(Segment::Text(text));
                }
            }
        }

        if valid_images == 0 {
            return Err(Rejection::NoImages);
        }
        if !segments.iter().any(|s| matches!(s, Segment::Text(_))) {
            return Err(Rejection::NoText);
        }
        Ok(segments)
    }
}

impl Preprocessor for InterleavedPreprocessor {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Interleaved
    }

    fn prepare(
        &self,
        sample: &GroupedSample,
        rng: &mut ChaCha8Rng,
    ) -> Result<PreparedSample, Rejection> {
        let config = &self.context.config;
        let raw = sample.get("json").ok_or(Rejection::MissingField("json"))?;
        let document: InterleavedDocument =
            serde_json::from_slice(raw).map_err(|e| DecodeError::Json(e.to_string()))?;

        let segments = self.filter_segments(document)?;

        let marker = chunk_image_marker();
        let mut images = Vec::new();
        let mut parts = Vec::with_capacity(segments.len());
        for segment in segments {
            match segment {
                Segment::Text(text) => parts.push(text),
                Segment::Image(image) => {
                    images.push(self.context.image_encoder.encode(&image));
                    parts.push(marker.clone());
                }
            }
        }

        let document = assemble_marked_text(&parts, self.context.text_tokenizer.eos_token());
        let text = tokenize(
            self.context.text_tokenizer.as_ref(),
            &document,
            config.document_max_tokens,
            Padding::MaxLength,
        )?;

        let views: Vec<_> = images.iter().map(|image| image.view()).collect();
        let mut stacked = ndarray::stack(Axis(0), &views)
            .map_err(|e| Rejection::Malformed(format!("image shapes differ: {}", e)))?;
        config.augmentation.apply(&mut stacked, rng);

        let [c, h, w] = self.context.image_encoder.output_shape();
        let mut slots = Array4::<f32>::zeros((config.max_images, c, h, w));
        slots.slice_mut(s![..images.len(), .., .., ..]).assign(&stacked);

        Ok(PreparedSample {
            key: sample.key.clone(),
            tensors: SampleTensors::Interleaved {
                images: slots,
                text,
            },
        })
    }
}
