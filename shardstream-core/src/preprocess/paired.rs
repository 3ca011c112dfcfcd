//! Image-caption pairs
//!
//! The caption becomes `<image>{caption}<|endofchunk|>{eos}`; the image is
//! encoded then augmented. Captions are left unpadded here and padded to the
//! longest caption when the batch is assembled.

use rand_chacha::ChaCha8Rng;

use super::image::decode_image;
use super::tokenizer::{tokenize, Padding, END_OF_CHUNK, IMAGE_MARKER};
use super::{utf8_field, PreparedSample, PreprocessContext, Preprocessor, Rejection, SampleTensors};
use crate::data::{DatasetKind, GroupedSample};

/// Image extensions in order of preference
pub const IMAGE_FIELDS: [&str; 3] = ["jpg", "png", "jpeg"];

/// Preprocessor for paired image-caption samples
pub struct PairedPreprocessor {
    context: PreprocessContext,
}

impl PairedPreprocessor {
    /// Create the policy
    pub fn new(context: PreprocessContext) -> Self {
        Self { context }
    }

    /// Caption text fed to the tokenizer
    pub fn caption_text(&self, caption: &str) -> String {
        format!(
            "{}{}{}{}",
            IMAGE_MARKER,
            caption.trim(),
            END_OF_CHUNK,
            self.context.text_tokenizer.eos_token()
        )
    }
}

impl Preprocessor for PairedPreprocessor {
    fn kind(&self) -> DatasetKind {
        DatasetKind::Paired
    }

    fn prepare(
        &self,
        sample: &GroupedSample,
        rng: &mut ChaCha8Rng,
    ) -> Result<PreparedSample, Rejection> {
        let (_, image_bytes) = sample
            .first_of(&IMAGE_FIELDS)
            .ok_or(Rejection::MissingField("jpg"))?;
        let caption = utf8_field(sample, "txt")?;

        let decoded = decode_image(image_bytes)?;
        let mut image = self.context.image_encoder.encode(&decoded);
        self.context.config.augmentation.apply(&mut image, rng);

        let text = tokenize(
            self.context.text_tokenizer.as_ref(),
            &self.caption_text(caption),
            self.context.config.paired_max_tokens,
            Padding::Longest,
        )?;

        Ok(PreparedSample {
            key: sample.key.clone(),
            tensors: SampleTensors::Paired { image, text },
        })
    }
}
