//! Coalesce consecutive archive records into multi-part samples
//!
//! Archives are prefix-sorted, so a sample is complete as soon as a record
//! with a different key arrives. A repeated extension under the same key also
//! closes the sample: it means two unrelated samples share a key, which
//! happens where one shard ends and the next begins.

use bytes::Bytes;
use std::collections::BTreeMap;
use tracing::debug;

use super::archive::RawRecord;
use super::shard::Shard;
use crate::metrics::standard;

/// All parts of one logical training example
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedSample {
    /// Shared key prefix of the parts
    pub key: String,
    /// Shard the first part came from
    pub shard: Shard,
    /// Extension -> payload
    pub fields: BTreeMap<String, Bytes>,
}

impl GroupedSample {
    fn new(key: String, shard: Shard) -> Self {
        Self {
            key,
            shard,
            fields: BTreeMap::new(),
        }
    }

    /// Payload for an extension
    pub fn get(&self, extension: &str) -> Option<&Bytes> {
        self.fields.get(extension)
    }

    /// First present payload among `extensions`
    pub fn first_of(&self, extensions: &[&str]) -> Option<(&str, &Bytes)> {
        extensions
            .iter()
            .find_map(|ext| self.fields.get_key_value(*ext))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// `shard/key`, unique enough for logs and bookkeeping
    pub fn id(&self) -> String {
        format!("{}#{}", self.shard.basename(), self.key)
    }
}

/// Required fields of a sample
///
/// Each requirement is a set of alternative extensions, at least one of which
/// must be present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleSchema {
    requirements: Vec<Vec<String>>,
}

impl SampleSchema {
    /// Schema accepting any non-empty sample
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a requirement satisfied by any one of `alternatives`
    pub fn require(mut self, alternatives: &[&str]) -> Self {
        self.requirements
            .push(alternatives.iter().map(|s| s.to_ascii_lowercase()).collect());
        self
    }

    /// Whether `sample` can be forwarded downstream
    pub fn accepts(&self, sample: &GroupedSample) -> bool {
        !sample.fields.is_empty()
            && self
                .requirements
                .iter()
                .all(|alts| alts.iter().any(|ext| sample.fields.contains_key(ext)))
    }
}

/// Iterator adapter turning records into grouped samples
pub struct SampleGrouper<I> {
    records: I,
    schema: SampleSchema,
    current: Option<GroupedSample>,
    finished: bool,
}

impl<I> SampleGrouper<I>
where
    I: Iterator<Item = RawRecord>,
{
    /// Group `records`, forwarding only samples accepted by `schema`
    pub fn new(records: I, schema: SampleSchema) -> Self {
        Self {
            records,
            schema,
            current: None,
            finished: false,
        }
    }

    /// Close the accumulator, returning it if it is valid
    fn flush(&mut self) -> Option<GroupedSample> {
        let sample = self.current.take()?;
        if self.schema.accepts(&sample) {
            standard::SAMPLES_GROUPED.inc();
            Some(sample)
        } else {
            standard::SAMPLES_INCOMPLETE.inc();
            debug!(
                "Dropping incomplete sample {} (fields: {:?})",
                sample.id(),
                sample.fields.keys().collect::<Vec<_>>()
            );
            None
        }
    }
}

impl<I> Iterator for SampleGrouper<I>
where
    I: Iterator<Item = RawRecord>,
{
    type Item = GroupedSample;

    fn next(&mut self) -> Option<GroupedSample> {
        if self.finished {
            return None;
        }

        while let Some(record) = self.records.next() {
            let extension = record.extension.to_ascii_lowercase();
            let starts_new = match &self.current {
                None => true,
                Some(current) => {
                    current.key != record.key || current.fields.contains_key(&extension)
                }
            };

            let mut emitted = None;
            if starts_new {
                emitted = self.flush();
                self.current = Some(GroupedSample::new(record.key, record.shard));
            }
            if let Some(current) = self.current.as_mut() {
                current.fields.insert(extension, record.payload);
            }
            if emitted.is_some() {
                return emitted;
            }
        }

        self.finished = true;
        self.flush()
    }
}
