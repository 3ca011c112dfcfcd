//! Async runtime management
//!
//! A single I/O runtime hosts every prefetch task of a pipeline.

pub mod executor;

pub use executor::{PipelineRuntime, RuntimeConfig};
