//! Batch assembly
//!
//! Groups exactly `batch_size` prepared samples and stacks their tensors
//! along a new leading axis. A trailing group smaller than `batch_size` is
//! dropped, so every emitted batch has the same leading dimension.

use ndarray::{stack, Array2, Array3, Array4, Array5, Axis};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::preprocess::{Encoded, PreparedSample, SampleTensors};

/// Stacked tensors of one batch
#[derive(Debug, Clone, PartialEq)]
pub enum BatchTensors {
    /// `images [B, C, H, W]`, text `[B, L]` padded to the longest caption
    Paired {
        images: Array4<f32>,
        input_ids: Array2<u32>,
        attention_mask: Array2<u32>,
    },
    /// text `[B, L]`, spans `[B, slots, span_len]`
    TextSpan {
        input_ids: Array2<u32>,
        attention_mask: Array2<u32>,
        span_ids: Array3<u32>,
        span_mask: Array3<u32>,
    },
    /// `images [B, slots, C, H, W]`, text `[B, L]`
    Interleaved {
        images: Array5<f32>,
        input_ids: Array2<u32>,
        attention_mask: Array2<u32>,
    },
}

/// Exactly `batch_size` samples, stacked
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Sample keys in batch order
    pub keys: Vec<String>,
    /// Model inputs
    pub tensors: BatchTensors,
}

impl Batch {
    /// Stack `samples`; text is right-padded with `pad_id` to the longest row
    pub fn from_samples(samples: Vec<PreparedSample>, pad_id: u32) -> Result<Self> {
        let Some(first) = samples.first() else {
            return Err(PipelineError::Internal {
                message: "cannot build an empty batch".into(),
            });
        };
        let keys = samples.iter().map(|s| s.key.clone()).collect();

        let tensors = match &first.tensors {
            SampleTensors::Paired { .. } => {
                let mut images = Vec::with_capacity(samples.len());
                let mut texts = Vec::with_capacity(samples.len());
                for sample in &samples {
                    match &sample.tensors {
                        SampleTensors::Paired { image, text } => {
                            images.push(image.view());
                            texts.push(text);
                        }
                        _ => return Err(mixed_kinds()),
                    }
                }
                let (input_ids, attention_mask) = stack_text(&texts, pad_id);
                BatchTensors::Paired {
                    images: stack(Axis(0), &images).map_err(shape_error)?,
                    input_ids,
                    attention_mask,
                }
            }
            SampleTensors::TextSpan { .. } => {
                let mut texts = Vec::with_capacity(samples.len());
                let mut spans = Vec::with_capacity(samples.len());
                let mut masks = Vec::with_capacity(samples.len());
                for sample in &samples {
                    match &sample.tensors {
                        SampleTensors::TextSpan {
                            text,
                            span_ids,
                            span_mask,
                        } => {
                            texts.push(text);
                            spans.push(span_ids.view());
                            masks.push(span_mask.view());
                        }
                        _ => return Err(mixed_kinds()),
                    }
                }
                let (input_ids, attention_mask) = stack_text(&texts, pad_id);
                BatchTensors::TextSpan {
                    input_ids,
                    attention_mask,
                    span_ids: stack(Axis(0), &spans).map_err(shape_error)?,
                    span_mask: stack(Axis(0), &masks).map_err(shape_error)?,
                }
            }
            SampleTensors::Interleaved { .. } => {
                let mut images = Vec::with_capacity(samples.len());
                let mut texts = Vec::with_capacity(samples.len());
                for sample in &samples {
                    match &sample.tensors {
                        SampleTensors::Interleaved { images: slots, text } => {
                            images.push(slots.view());
                            texts.push(text);
                        }
                        _ => return Err(mixed_kinds()),
                    }
                }
                let (input_ids, attention_mask) = stack_text(&texts, pad_id);
                BatchTensors::Interleaved {
                    images: stack(Axis(0), &images).map_err(shape_error)?,
                    input_ids,
                    attention_mask,
                }
            }
        };

        Ok(Self { keys, tensors })
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Token ids `[B, L]`
    pub fn input_ids(&self) -> &Array2<u32> {
        match &self.tensors {
            BatchTensors::Paired { input_ids, .. }
            | BatchTensors::TextSpan { input_ids, .. }
            | BatchTensors::Interleaved { input_ids, .. } => input_ids,
        }
    }
}

fn stack_text(texts: &[&Encoded], pad_id: u32) -> (Array2<u32>, Array2<u32>) {
    let longest = texts.iter().map(|t| t.len()).max().unwrap_or(0);
    let shape = (texts.len(), longest);
    let ids = Array2::from_shape_fn(shape, |(i, j)| texts[i].ids.get(j).copied().unwrap_or(pad_id));
    let mask = Array2::from_shape_fn(shape, |(i, j)| texts[i].mask.get(j).copied().unwrap_or(0));
    (ids, mask)
}

fn mixed_kinds() -> PipelineError {
    PipelineError::Internal {
        message: "batch mixes samples of different kinds".into(),
    }
}

fn shape_error(e: ndarray::ShapeError) -> PipelineError {
    PipelineError::Internal {
        message: format!("sample tensors differ in shape: {}", e),
    }
}

/// Iterator adapter grouping prepared samples into batches
pub struct BatchAssembler<I> {
    samples: I,
    batch_size: usize,
    pad_id: u32,
}

impl<I> BatchAssembler<I>
where
    I: Iterator<Item = PreparedSample>,
{
    /// Group `samples` into batches of `batch_size`
    pub fn new(samples: I, batch_size: usize, pad_id: u32) -> Self {
        Self {
            samples,
            batch_size: batch_size.max(1),
            pad_id,
        }
    }
}

impl<I> Iterator for BatchAssembler<I>
where
    I: Iterator<Item = PreparedSample>,
{
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        loop {
            let group: Vec<PreparedSample> = self.samples.by_ref().take(self.batch_size).collect();
            if group.len() < self.batch_size {
                if !group.is_empty() {
                    debug!("Dropping partial batch of {} samples", group.len());
                }
                return None;
            }

            match Batch::from_samples(group, self.pad_id) {
                Ok(batch) => return Some(batch),
                Err(e) => warn!("Skipping batch that could not be stacked: {}", e),
            }
        }
    }
}
