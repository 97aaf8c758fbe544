//! State machine snapshot stream
//!
//! A snapshot is a logical dump of every table in the state machine
//! database, taken from a single read transaction:
//!
//! ```text
//! MAGIC | Table(name) | Entry(k, v)* | Table(name) | ... | End
//! ```
//!
//! Records are bincode-encoded. The stream may be zstd-compressed; readers
//! sniff the zstd frame magic so both forms restore transparently. Writes can
//! be throttled to protect the disk the live database sits on.

use crate::config::SnapshotCompression;
use crate::error::{MetastoreError, Result};
use crate::fsm::AppliedIndex;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use redb::{ReadTransaction, ReadableTable, TableDefinition, TableHandle, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::num::NonZeroU32;
use tracing::debug;

const SNAPSHOT_MAGIC: &[u8; 4] = b"MSS1";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Rate limiter granularity: one cell per KiB written
const CELL_SIZE: usize = 1024;

#[derive(Debug, Serialize)]
enum RecordRef<'a> {
    Table(&'a str),
    Entry(&'a [u8], &'a [u8]),
    End,
}

/// Owned form of a snapshot record; shares the wire layout of `RecordRef`
#[derive(Debug, Deserialize)]
enum SnapshotRecord {
    Table(String),
    Entry(Vec<u8>, Vec<u8>),
    End,
}

fn snapshot_error(operation: &str, details: impl std::fmt::Display) -> MetastoreError {
    MetastoreError::Snapshot {
        operation: operation.to_string(),
        details: details.to_string(),
    }
}

/// Point-in-time view of the state machine, ready to be persisted.
///
/// Dropping the handle without calling [`FsmSnapshot::persist`] releases the
/// underlying read transaction.
pub struct FsmSnapshot {
    tx: ReadTransaction,
    applied: AppliedIndex,
    compression: SnapshotCompression,
    rate_limit_mb: u32,
}

impl std::fmt::Debug for FsmSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmSnapshot")
            .field("applied", &self.applied)
            .field("compression", &self.compression)
            .finish()
    }
}

impl FsmSnapshot {
    pub(crate) fn new(
        tx: ReadTransaction,
        applied: AppliedIndex,
        compression: SnapshotCompression,
        rate_limit_mb: u32,
    ) -> Self {
        Self {
            tx,
            applied,
            compression,
            rate_limit_mb,
        }
    }

    /// Applied index the snapshot reflects
    pub fn applied(&self) -> AppliedIndex {
        self.applied
    }

    /// Stream the whole database into `sink`
    pub fn persist<W: Write>(self, sink: W) -> Result<()> {
        let throttled = Throttled::new(sink, self.rate_limit_mb);
        let entries = match self.compression {
            SnapshotCompression::None => {
                let mut writer = BufWriter::new(throttled);
                let entries = write_records(&self.tx, &mut writer)?;
                writer
                    .flush()
                    .map_err(|e| snapshot_error("persist", e))?;
                entries
            }
            SnapshotCompression::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(throttled, 0)
                    .map_err(|e| snapshot_error("persist", e))?;
                let entries = write_records(&self.tx, &mut encoder)?;
                encoder
                    .finish()
                    .and_then(|mut inner| inner.flush())
                    .map_err(|e| snapshot_error("persist", e))?;
                entries
            }
        };
        debug!(
            index = self.applied.index,
            term = self.applied.term,
            entries,
            "Persisted state machine snapshot"
        );
        Ok(())
    }

    /// Discard the snapshot without persisting it
    pub fn release(self) {}
}

fn write_records<W: Write>(tx: &ReadTransaction, w: &mut W) -> Result<u64> {
    let mut entries = 0u64;
    w.write_all(SNAPSHOT_MAGIC)
        .map_err(|e| snapshot_error("persist", e))?;

    let tables = tx
        .list_tables()
        .map_err(|e| MetastoreError::storage_error("list tables", e))?;
    for handle in tables {
        let name = handle.name().to_string();
        let table = tx
            .open_table(TableDefinition::<&[u8], &[u8]>::new(&name))
            .map_err(|e| MetastoreError::storage_error("open table for snapshot", e))?;
        encode_record(w, &RecordRef::Table(&name))?;

        for item in table
            .iter()
            .map_err(|e| MetastoreError::storage_error("iterate table", e))?
        {
            let (k, v) = item.map_err(|e| MetastoreError::storage_error("read table entry", e))?;
            encode_record(w, &RecordRef::Entry(k.value(), v.value()))?;
            entries += 1;
        }
    }

    encode_record(w, &RecordRef::End)?;
    Ok(entries)
}

fn encode_record<W: Write>(w: &mut W, record: &RecordRef<'_>) -> Result<()> {
    bincode::serialize_into(w, record).map_err(|e| snapshot_error("persist", e))
}

/// Load a snapshot stream into `tx`, returning the number of entries copied
pub(crate) fn load_records<R: Read>(source: R, tx: &WriteTransaction) -> Result<u64> {
    let mut reader = BufReader::new(source);
    let compressed = {
        let head = reader
            .fill_buf()
            .map_err(|e| snapshot_error("restore", e))?;
        head.starts_with(&ZSTD_MAGIC)
    };
    if compressed {
        let decoder = zstd::stream::read::Decoder::with_buffer(reader)
            .map_err(|e| snapshot_error("restore", e))?;
        copy_records(decoder, tx)
    } else {
        copy_records(reader, tx)
    }
}

fn copy_records<R: Read>(mut reader: R, tx: &WriteTransaction) -> Result<u64> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| snapshot_error("restore", e))?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(snapshot_error("restore", "unrecognized snapshot format"));
    }

    let mut entries = 0u64;
    let mut table: Option<redb::Table<'_, &[u8], &[u8]>> = None;
    loop {
        let record: SnapshotRecord =
            bincode::deserialize_from(&mut reader).map_err(|e| snapshot_error("restore", e))?;
        match record {
            SnapshotRecord::Table(name) => {
                // Close the previous table before opening the next one
                drop(table.take());
                table = Some(
                    tx.open_table(TableDefinition::<&[u8], &[u8]>::new(&name))
                        .map_err(|e| MetastoreError::storage_error("create table on restore", e))?,
                );
            }
            SnapshotRecord::Entry(k, v) => {
                let target = table
                    .as_mut()
                    .ok_or_else(|| snapshot_error("restore", "entry precedes table header"))?;
                target
                    .insert(&k[..], &v[..])
                    .map_err(|e| MetastoreError::storage_error("insert on restore", e))?;
                entries += 1;
            }
            SnapshotRecord::End => return Ok(entries),
        }
    }
}

/// Writer that paces output through a token bucket
struct Throttled<W> {
    inner: W,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl<W: Write> Throttled<W> {
    fn new(inner: W, mb_per_sec: u32) -> Self {
        let limiter = mb_per_sec
            .checked_mul(1024)
            .and_then(NonZeroU32::new)
            .map(|kib_per_sec| RateLimiter::direct(Quota::per_second(kib_per_sec)));
        Self { inner, limiter }
    }
}

impl<W: Write> Write for Throttled<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Some(limiter) = &self.limiter else {
            return self.inner.write(buf);
        };
        while let Err(not_until) = limiter.check() {
            std::thread::sleep(not_until.wait_time_from(DefaultClock::default().now()));
        }
        let n = buf.len().min(CELL_SIZE);
        self.inner.write(&buf[..n])
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
