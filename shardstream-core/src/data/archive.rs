//! Archive expansion
//!
//! Turns fetched shard bytes into `(key, extension, payload)` records.
//! Compression is detected from magic bytes (gzip, zstd). Each shard is read
//! entry by entry on the compute runtime and handed over through a small
//! bounded channel, so only a few payloads of a shard are held at once.
//! Failures never escape: a broken shard is logged and yields whatever was
//! read before the failure.

use bytes::Bytes;
use std::io::{Cursor, Read};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::prefetcher::FetchedShard;
use super::shard::Shard;
use crate::error::{PipelineError, Result};
use crate::metrics::standard;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Records decoded ahead of the consumer, per shard
const RECORD_QUEUE_DEPTH: usize = 8;

/// Upper bound on the buffer reserved from an entry's declared size
const MAX_PREALLOCATION: u64 = 1 << 20;

/// One file inside a shard
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Entry name without its final extension
    pub key: String,
    /// Final extension, without the dot
    pub extension: String,
    /// File contents
    pub payload: Bytes,
    /// Shard the record came from
    pub shard: Shard,
}

/// Split an entry name into key and final extension.
///
/// Returns `None` for names whose last component has no extension.
pub fn split_entry_name(name: &str) -> Option<(&str, &str)> {
    let base_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let dot = name[base_start..].rfind('.')? + base_start;
    if dot == base_start {
        return None;
    }
    Some((&name[..dot], &name[dot + 1..]))
}

fn is_meta_entry(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.len() > 4 && base.starts_with("__") && base.ends_with("__")
}

fn decompressed_reader(data: Bytes) -> std::io::Result<Box<dyn Read + Send>> {
    if data.starts_with(&GZIP_MAGIC) {
        return Ok(Box::new(flate2::read::GzDecoder::new(Cursor::new(data))));
    }
    if data.starts_with(&ZSTD_MAGIC) {
        return Ok(Box::new(zstd::stream::read::Decoder::new(Cursor::new(data))?));
    }
    Ok(Box::new(Cursor::new(data)))
}

/// Decode the entries of one shard in order, handing each record to `emit`.
///
/// Decoding stops early, without error, once `emit` returns `false`. An
/// error means the shard was cut short; records emitted before it stand.
pub fn read_entries<F>(shard: &Shard, data: Bytes, mut emit: F) -> Result<()>
where
    F: FnMut(RawRecord) -> bool,
{
    let archive_error = |message: String| PipelineError::Archive {
        shard: shard.url.clone(),
        message,
    };

    let reader = decompressed_reader(data).map_err(|e| archive_error(e.to_string()))?;
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| archive_error(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| archive_error(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        if is_meta_entry(&name) {
            continue;
        }
        let Some((key, extension)) = split_entry_name(&name) else {
            debug!("Skipping entry without extension: {} in {}", name, shard);
            continue;
        };
        let (key, extension) = (key.to_string(), extension.to_string());

        let declared = entry.size();
        let mut payload = Vec::with_capacity(declared.min(MAX_PREALLOCATION) as usize);
        if let Err(e) = entry.read_to_end(&mut payload) {
            warn!("Skipping unreadable entry {} in {}: {}", name, shard, e);
            standard::RECORD_ERRORS.inc();
            continue;
        }
        if payload.len() as u64 != declared {
            return Err(archive_error(format!(
                "entry {} truncated at {} of {} bytes",
                name,
                payload.len(),
                declared
            )));
        }

        let record = RawRecord {
            key,
            extension,
            payload: Bytes::from(payload),
            shard: shard.clone(),
        };
        if !emit(record) {
            debug!("Stopped reading {}: consumer gone", shard);
            return Ok(());
        }
    }

    Ok(())
}

/// Records of one shard, decoded in the background as they are consumed
///
/// Iterating blocks the calling thread; it must not be driven from inside an
/// async context. Dropping it stops the reader after its current entry.
pub struct ShardRecords {
    receiver: mpsc::Receiver<Result<RawRecord>>,
    read: u64,
    error: Option<PipelineError>,
}

impl ShardRecords {
    /// Start decoding `data` on `handle`'s blocking pool
    pub fn spawn(handle: &Handle, shard: Shard, data: Bytes) -> Self {
        let (sender, receiver) = mpsc::channel(RECORD_QUEUE_DEPTH);
        handle.spawn_blocking(move || {
            let outcome =
                read_entries(&shard, data, |record| sender.blocking_send(Ok(record)).is_ok());
            if let Err(e) = outcome {
                // Nobody left to tell when the consumer is gone
                let _ = sender.blocking_send(Err(e));
            }
        });

        Self {
            receiver,
            read: 0,
            error: None,
        }
    }

    /// Records handed out so far
    pub fn read(&self) -> u64 {
        self.read
    }

    /// Why the shard ended early, once iteration has finished
    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }
}

impl Iterator for ShardRecords {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        match self.receiver.blocking_recv()? {
            Ok(record) => {
                self.read += 1;
                Some(record)
            }
            Err(e) => {
                self.error = Some(e);
                None
            }
        }
    }
}

struct OpenShard {
    shard: Shard,
    size: usize,
    checksum: u32,
    records: ShardRecords,
}

impl OpenShard {
    fn finish(self) {
        if let Some(e) = self.records.error() {
            warn!(
                "Handling archive error ({}). Kept {} records from {} ({} bytes, crc32c {:08x})",
                e,
                self.records.read(),
                self.shard,
                self.size,
                self.checksum
            );
            standard::SHARD_ERRORS.inc();
        } else {
            debug!("Read {} records from {}", self.records.read(), self.shard);
        }
    }
}

/// Iterator expanding fetched shards into records, one shard at a time
pub struct ArchiveStream<I> {
    shards: I,
    handle: Handle,
    current: Option<OpenShard>,
}

impl<I> ArchiveStream<I>
where
    I: Iterator<Item = FetchedShard>,
{
    /// Expand the fetched shards in order, decoding on `handle`
    pub fn new(shards: I, handle: Handle) -> Self {
        Self {
            shards,
            handle,
            current: None,
        }
    }

    fn open(&mut self, fetched: FetchedShard) {
        let FetchedShard { shard, data } = fetched;
        let data = match data {
            Ok(data) => data,
            Err(e) => {
                warn!("Handling shard error ({}). Ignoring shard {}", e, shard);
                standard::SHARD_ERRORS.inc();
                return;
            }
        };

        standard::SHARDS_OPENED.inc();
        let size = data.len();
        let checksum = crc32c::crc32c(&data);
        let records = ShardRecords::spawn(&self.handle, shard.clone(), data);
        self.current = Some(OpenShard {
            shard,
            size,
            checksum,
            records,
        });
    }
}

impl<I> Iterator for ArchiveStream<I>
where
    I: Iterator<Item = FetchedShard>,
{
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        loop {
            if let Some(open) = self.current.as_mut() {
                if let Some(record) = open.records.next() {
                    standard::RECORDS_READ.inc();
                    return Some(record);
                }
            }
            if let Some(open) = self.current.take() {
                open.finish();
            }

            let fetched = self.shards.next()?;
            self.open(fetched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{PipelineRuntime, RuntimeConfig};
    use std::io::Write;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn collect(shard: &str, data: Vec<u8>) -> (Vec<RawRecord>, Option<PipelineError>) {
        let mut records = Vec::new();
        let outcome = read_entries(&Shard::new(shard), Bytes::from(data), |record| {
            records.push(record);
            true
        });
        (records, outcome.err())
    }

    fn runtime() -> PipelineRuntime {
        PipelineRuntime::new(&RuntimeConfig {
            io_threads: 1,
            compute_threads: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_split_entry_name() {
        assert_eq!(split_entry_name("a.jpg"), Some(("a", "jpg")));
        assert_eq!(split_entry_name("dir/a.b.txt"), Some(("dir/a.b", "txt")));
        assert_eq!(split_entry_name("dir.x/noext"), None);
        assert_eq!(split_entry_name(".hidden"), None);
    }

    #[test]
    fn test_read_plain_tar() {
        let tar = build_tar(&[("000.jpg", b"img"), ("000.txt", b"cap"), ("__len__", b"1")]);
        let (records, error) = collect("s.tar", tar);

        assert!(error.is_none());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, "000");
        assert_eq!(records[1].extension, "txt");
    }

    #[test]
    fn test_read_gzip_tar() {
        let tar = build_tar(&[("k.txt", b"hello")]);
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        encoder.write_all(&tar).unwrap();
        let gz = encoder.finish().unwrap();

        let (records, error) = collect("s.tar.gz", gz);
        assert!(error.is_none());
        assert_eq!(records[0].payload.as_ref(), b"hello");
    }

    #[test]
    fn test_read_zstd_tar() {
        let tar = build_tar(&[("k.txt", b"zstd body")]);
        let compressed = zstd::encode_all(Cursor::new(tar), 3).unwrap();

        let (records, error) = collect("s.tar.zst", compressed);
        assert!(error.is_none());
        assert_eq!(records[0].payload.as_ref(), b"zstd body");
    }

    #[test]
    fn test_truncated_tar_keeps_prefix() {
        let mut tar = build_tar(&[("a.txt", b"first"), ("b.txt", &[7u8; 2048])]);
        // cut inside the second header
        tar.truncate(512 + 512 + 100);

        let (records, error) = collect("bad.tar", tar);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, "a");
        assert!(matches!(error, Some(PipelineError::Archive { .. })));
    }

    #[test]
    fn test_oversized_entry_is_not_buffered() {
        let mut tar = build_tar(&[("a.txt", b"first")]);
        // drop the end-of-archive blocks, then claim a 4 GiB entry backed by 10 bytes
        tar.truncate(tar.len() - 1024);
        let mut header = tar::Header::new_gnu();
        header.set_path("b.txt").unwrap();
        header.set_size(1 << 32);
        header.set_mode(0o644);
        header.set_cksum();
        tar.extend_from_slice(header.as_bytes());
        tar.extend_from_slice(&[7u8; 10]);

        let runtime = runtime();
        let mut records =
            ShardRecords::spawn(&runtime.compute_handle(), Shard::new("big.tar"), Bytes::from(tar));

        assert_eq!(records.next().unwrap().key, "a");
        assert!(records.next().is_none());
        assert_eq!(records.read(), 1);
        assert!(matches!(records.error(), Some(PipelineError::Archive { .. })));
    }

    #[test]
    fn test_records_arrive_before_shard_is_decoded() {
        let payload = vec![3u8; 64 * 1024];
        let names: Vec<String> = (0..256).map(|i| format!("{:04}.bin", i)).collect();
        let entries: Vec<(&str, &[u8])> = names
            .iter()
            .map(|n| (n.as_str(), payload.as_slice()))
            .collect();
        let tar = build_tar(&entries);

        let runtime = runtime();
        let handle = runtime.compute_handle();
        let mut records = ShardRecords::spawn(&handle, Shard::new("wide.tar"), Bytes::from(tar));

        let first: Vec<RawRecord> = records.by_ref().take(2).collect();
        assert_eq!(first[0].key, "0000");
        assert_eq!(first[1].key, "0001");
        assert_eq!(records.read(), 2);
        // dropping mid-shard stops the reader, so the runtime can shut down
        drop(records);
        drop(runtime);
    }

    #[test]
    fn test_stream_skips_failed_shards() {
        let good = build_tar(&[("a.txt", b"x")]);
        let fetched = vec![
            FetchedShard {
                shard: Shard::new("missing.tar"),
                data: Err(PipelineError::ShardNotFound {
                    shard: "missing.tar".into(),
                }),
            },
            FetchedShard {
                shard: Shard::new("garbage.tar"),
                data: Ok(Bytes::from_static(b"definitely not a tar archive")),
            },
            FetchedShard {
                shard: Shard::new("good.tar"),
                data: Ok(Bytes::from(good)),
            },
        ];

        let runtime = runtime();
        let records: Vec<_> =
            ArchiveStream::new(fetched.into_iter(), runtime.compute_handle()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].shard, Shard::new("good.tar"));
    }
}
