//! Dataset kinds and size metadata
//!
//! Sizes come from an optional sidecar next to the shards: `sizes.json`
//! (shard basename -> sample count) or `__len__` (a single integer).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use super::grouper::SampleSchema;
use super::pattern::is_remote;
use super::shard::Shard;
use crate::error::{PipelineError, Result};

/// Sidecar mapping shard basenames to sample counts
pub const SIZES_FILENAME: &str = "sizes.json";

/// Sidecar holding the total sample count
pub const LEN_FILENAME: &str = "__len__";

/// Which preprocessing policy a dataset uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Image + caption pairs
    Paired,
    /// Plain text with masked sentence spans
    TextSpan,
    /// JSON documents interleaving text and images
    Interleaved,
}

impl DatasetKind {
    /// Fields a grouped sample must carry to be forwarded
    pub fn schema(&self) -> SampleSchema {
        match self {
            DatasetKind::Paired => SampleSchema::new()
                .require(&["txt"])
                .require(&["jpg", "png", "jpeg"]),
            DatasetKind::TextSpan => SampleSchema::new().require(&["txt"]),
            DatasetKind::Interleaved => SampleSchema::new().require(&["json"]),
        }
    }
}

impl FromStr for DatasetKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "paired" | "image_text" => Ok(DatasetKind::Paired),
            "text_span" | "textspan" | "pile" => Ok(DatasetKind::TextSpan),
            "interleaved" => Ok(DatasetKind::Interleaved),
            other => Err(PipelineError::UnsupportedDatasetKind { kind: other.into() }),
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetKind::Paired => "paired",
            DatasetKind::TextSpan => "text_span",
            DatasetKind::Interleaved => "interleaved",
        };
        f.write_str(name)
    }
}

/// Size information discovered for a shard set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSize {
    /// Total samples, if sidecar metadata was found
    pub total_samples: Option<u64>,
    /// Number of shards in the pattern
    pub num_shards: usize,
}

impl DatasetSize {
    /// Read sidecar metadata for `shards`, located next to `pattern`
    pub fn discover(pattern: &str, shards: &[Shard]) -> Result<Self> {
        let total_samples = match sidecar_dir(pattern) {
            Some(dir) => read_sidecar(&dir, shards)?,
            None => None,
        };
        Ok(Self {
            total_samples,
            num_shards: shards.len(),
        })
    }

    /// Pick the sample count for an epoch: an explicit hint wins over sidecar data
    pub fn resolve(&self, hint: Option<u64>, pattern: &str) -> Result<u64> {
        match hint.filter(|&n| n > 0).or(self.total_samples.filter(|&n| n > 0)) {
            Some(total) => Ok(total),
            None => Err(PipelineError::MissingSampleCount {
                pattern: pattern.to_string(),
            }),
        }
    }
}

fn sidecar_dir(pattern: &str) -> Option<PathBuf> {
    let first = pattern.split("::").next()?.trim();
    if is_remote(first) {
        return None;
    }
    let parent = Path::new(first).parent()?;
    if parent.as_os_str().is_empty() {
        Some(PathBuf::from("."))
    } else {
        Some(parent.to_path_buf())
    }
}

fn read_sidecar(dir: &Path, shards: &[Shard]) -> Result<Option<u64>> {
    let sizes_path = dir.join(SIZES_FILENAME);
    if sizes_path.is_file() {
        let sizes = read_sizes_json(&sizes_path)?;
        let total = shards
            .iter()
            .map(|shard| sizes.get(shard.basename()).copied().unwrap_or(0))
            .sum();
        info!("Dataset size {} from {}", total, sizes_path.display());
        return Ok(Some(total));
    }

    let len_path = dir.join(LEN_FILENAME);
    if len_path.is_file() {
        let raw = std::fs::read_to_string(&len_path).map_err(|e| invalid(&len_path, e))?;
        let total = raw.trim().parse::<u64>().map_err(|e| invalid(&len_path, e))?;
        info!("Dataset size {} from {}", total, len_path.display());
        return Ok(Some(total));
    }

    debug!("No size metadata in {}", dir.display());
    Ok(None)
}

fn read_sizes_json(path: &Path) -> Result<HashMap<String, u64>> {
    let raw = std::fs::read_to_string(path).map_err(|e| invalid(path, e))?;
    let values: HashMap<String, serde_json::Value> =
        serde_json::from_str(&raw).map_err(|e| invalid(path, e))?;

    values
        .into_iter()
        .map(|(name, value)| {
            let count = match &value {
                serde_json::Value::Number(n) => n.as_u64(),
                serde_json::Value::String(s) => s.trim().parse().ok(),
                _ => None,
            };
            count
                .map(|c| (name.clone(), c))
                .ok_or_else(|| invalid(path, format!("bad count for {}: {}", name, value)))
        })
        .collect()
}

fn invalid(path: &Path, reason: impl fmt::Display) -> PipelineError {
    PipelineError::InvalidSizeMetadata {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards_in(dir: &Path, names: &[&str]) -> Vec<Shard> {
        names
            .iter()
            .map(|n| Shard::new(dir.join(n).display().to_string()))
            .collect()
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!("image_text".parse::<DatasetKind>().unwrap(), DatasetKind::Paired);
        assert_eq!("pile".parse::<DatasetKind>().unwrap(), DatasetKind::TextSpan);
        assert_eq!(
            "Interleaved".parse::<DatasetKind>().unwrap(),
            DatasetKind::Interleaved
        );
        assert!("video".parse::<DatasetKind>().unwrap_err().is_configuration());
    }

    #[test]
    fn test_sizes_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SIZES_FILENAME),
            r#"{"a.tar": 10, "b.tar": "5", "c.tar": 100}"#,
        )
        .unwrap();
        let pattern = format!("{}/{{a,b,d}}.tar", dir.path().display());
        let shards = shards_in(dir.path(), &["a.tar", "b.tar", "d.tar"]);

        let size = DatasetSize::discover(&pattern, &shards).unwrap();
        assert_eq!(size.total_samples, Some(15));
        assert_eq!(size.num_shards, 3);
    }

    #[test]
    fn test_len_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LEN_FILENAME), "1234\n").unwrap();
        let pattern = format!("{}/x-{{0..1}}.tar", dir.path().display());
        let shards = shards_in(dir.path(), &["x-0.tar", "x-1.tar"]);

        let size = DatasetSize::discover(&pattern, &shards).unwrap();
        assert_eq!(size.total_samples, Some(1234));
    }

    #[test]
    fn test_hint_required_without_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/x.tar", dir.path().display());
        let size = DatasetSize::discover(&pattern, &shards_in(dir.path(), &["x.tar"])).unwrap();

        assert!(size.resolve(None, &pattern).unwrap_err().is_configuration());
        assert_eq!(size.resolve(Some(42), &pattern).unwrap(), 42);
    }

    #[test]
    fn test_malformed_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LEN_FILENAME), "lots").unwrap();
        let pattern = format!("{}/x.tar", dir.path().display());
        let err = DatasetSize::discover(&pattern, &shards_in(dir.path(), &["x.tar"])).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSizeMetadata { .. }));
    }
}
