//! Text-only samples with masked sentence spans
//!
//! Sentences are drawn for masking independently; each masked sentence is
//! preceded in the document by an end-of-chunk plus image marker, and also
//! tokenized on its own into a fixed number of span slots.

use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::text::{
    assemble_marked_text, chunk_image_marker, is_punctuation_only, normalize_whitespace,
    split_sentences,
};
use super::tokenizer::{tokenize, Padding};
use super::{utf8_field, PreparedSample, PreprocessContext, Preprocessor, Rejection, SampleTensors};
use crate::data::{DatasetKind, GroupedSample};

/// Preprocessor for plain text with masked spans
pub struct SpanMaskPreprocessor {
    context: PreprocessContext,
}

impl SpanMaskPreprocessor {
    /// Create the policy
    pub fn new(context: PreprocessContext) -> Self {
        Self { context }
    }

    /// Choose which sentences are masked.
    ///
    /// Each sentence is marked with the configured probability; when more
    /// than the slot count are marked, a random subset of the excess is
    /// unmarked.
    fn draw_mask(&self, count: usize, rng: &mut ChaCha8Rng) -> Result<Vec<bool>, Rejection> {
        let config = &self.context.config;
        let mut marked: Vec<bool> = (0..count)
            .map(|_| rng.gen::<f64>() <= config.mask_probability)
            .collect();

        let mut chosen: Vec<usize> = marked
            .iter()
            .enumerate()
            .filter_map(|(i, &m)| m.then_some(i))
            .collect();
        if chosen.is_empty() {
            return Err(Rejection::NoMaskedSentences);
        }

        if chosen.len() > config.max_masked_sentences {
            let overflow = chosen.len() - config.max_masked_sentences;
            chosen.shuffle(rng);
            for &i in &chosen[..overflow] {
                marked[i] = false;
            }
        }
        Ok(marked)
    }
}

impl Preprocessor for SpanMaskPreprocessor {
    fn kind(&self) -> DatasetKind {
        DatasetKind::TextSpan
    }

    fn prepare(
        &self,
        sample: &GroupedSample,
        rng: &mut ChaCha8Rng,
    ) -> Result<PreparedSample, Rejection> {
        let config = &self.context.config;
        let raw = utf8_field(sample, "txt")?;

        let sentences: Vec<String> = split_sentences(&normalize_whitespace(raw))
            .into_iter()
            .filter(|s| !is_punctuation_only(s))
            .collect();
        if sentences.is_empty() {
            return Err(Rejection::NoSentences);
        }

        let marked = self.draw_mask(sentences.len(), rng)?;

        let slots = (config.max_masked_sentences, config.span_max_tokens);
        let mut span_ids = Array2::<u32>::zeros(slots);
        let mut span_mask = span_ids.clone();
        let span_tokenizer = self.context.span_tokenizer();
        let chosen = sentences.iter().zip(&marked).filter(|(_, m)| **m);
        for (row, (sentence, _)) in chosen.enumerate() {
            let encoded = tokenize(
                span_tokenizer,
                sentence.trim(),
                config.span_max_tokens,
                Padding::MaxLength,
            )?;
            for (col, (&id, &m)) in encoded.ids.iter().zip(&encoded.mask).enumerate() {
                span_ids[[row, col]] = id;
                span_mask[[row, col]] = m;
            }
        }

        let marker = chunk_image_marker();
        let segments: Vec<String> = sentences
            .iter()
            .zip(&marked)
            .map(|(s, &m)| if m { format!("{}{}", marker, s) } else { s.clone() })
            .collect();
        let document = assemble_marked_text(&segments, self.context.text_tokenizer.eos_token());
        let text = tokenize(
            self.context.text_tokenizer.as_ref(),
            &document,
            config.document_max_tokens,
            Padding::MaxLength,
        )?;

        Ok(PreparedSample {
            key: sample.key.clone(),
            tensors: SampleTensors::TextSpan {
                text,
                span_ids,
                span_mask,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::testing::{context, sample};
    use crate::preprocess::PreprocessConfig;
    use rand::SeedableRng;

    fn masked_rows(span_mask: &Array2<u32>) -> usize {
        span_mask.rows().into_iter().filter(|r| r.sum() > 0).count()
    }

    #[test]
    fn test_three_sentences() {
        let preprocessor = SpanMaskPreprocessor::new(context());
        let input = sample("doc", &[("txt", b"One fish. Two fish! Red fish?".to_vec())]);

        let mut accepted = 0;
        for seed in 0..32 {
            match preprocessor.prepare(&input, &mut ChaCha8Rng::seed_from_u64(seed)) {
                Ok(prepared) => {
                    let SampleTensors::TextSpan {
                        text,
                        span_ids,
                        span_mask,
                    } = prepared.tensors
                    else {
                        panic!("wrong variant");
                    };
                    assert_eq!(span_ids.shape(), &[10, 24]);
                    assert_eq!(span_mask.shape(), &[10, 24]);
                    assert!((1..=3).contains(&masked_rows(&span_mask)));
                    assert_eq!(text.len(), 256);
                    accepted += 1;
                }
                Err(e) => assert_eq!(e, Rejection::NoMaskedSentences),
            }
        }
        assert!(accepted > 0);
    }

    #[test]
    fn test_cap_at_ten() {
        let config = PreprocessConfig {
            mask_probability: 1.0,
            ..Default::default()
        };
        let preprocessor = SpanMaskPreprocessor::new(context().with_config(config));
        let text: String = (0..14).map(|i| format!("Sentence number {}. ", i)).collect();
        let input = sample("doc", &[("txt", text.into_bytes())]);

        let prepared = preprocessor
            .prepare(&input, &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        let SampleTensors::TextSpan { span_mask, .. } = prepared.tensors else {
            panic!("wrong variant");
        };
        assert_eq!(masked_rows(&span_mask), 10);
    }

    #[test]
    fn test_document_markers() {
        let config = PreprocessConfig {
            mask_probability: 1.0,
            ..Default::default()
        };
        let ctx = context().with_config(config);
        let tokenizer = ctx.text_tokenizer.clone();
        let preprocessor = SpanMaskPreprocessor::new(ctx);
        let input = sample("doc", &[("txt", b"Alpha beta. Gamma delta.".to_vec())]);

        let prepared = preprocessor
            .prepare(&input, &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap();
        let SampleTensors::TextSpan { text, .. } = prepared.tensors else {
            panic!("wrong variant");
        };
        let expected = tokenizer
            .encode("<image>Alpha beta.<|endofchunk|><image>Gamma delta.<|endofchunk|></s>")
            .unwrap();
        assert_eq!(&text.ids[..expected.len()], expected.as_slice());
    }

    #[test]
    fn test_punctuation_only_rejected() {
        let preprocessor = SpanMaskPreprocessor::new(context());
        let input = sample("doc", &[("txt", b" ... !!! ".to_vec())]);
        let err = preprocessor
            .prepare(&input, &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap_err();
        assert_eq!(err, Rejection::NoSentences);
    }
}
