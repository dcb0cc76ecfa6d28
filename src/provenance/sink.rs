//! Durable backends for provenance records
//!
//! A sink accepts one JSON document per commit and returns a handle the
//! next record can point at. Chain construction lives in
//! [`ProvenanceLog`](super::ProvenanceLog); sinks only store.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use dashmap::DashMap;
use serde_json::{Map, Value};

use super::record::{ProvenanceRecord, RecordHandle};
use crate::{Error, Result};

/// Storage capability for provenance documents.
pub trait RecordSink: Send + Sync {
    /// Store a document.
    ///
    /// The returned handle must identify a record that is already durable
    /// as far as this sink can tell.
    ///
    /// # Errors
    ///
    /// [`Error::StorageError`] or IO errors.
    fn commit(&self, document: Map<String, Value>) -> Result<RecordHandle>;
}

/// In-memory sink using a lock-free concurrent hashmap.
///
/// Data is lost on process restart. Documents keep their commit order.
///
/// # Example
///
/// ```rust
/// use oal_relax::provenance::{MemorySink, RecordSink};
///
/// let sink = MemorySink::new();
/// let handle = sink.commit(serde_json::Map::new())?;
/// assert!(sink.get(&handle).is_some());
/// # Ok::<(), oal_relax::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct MemorySink {
    documents: DashMap<RecordHandle, (u64, Map<String, Value>)>,
    next: AtomicU64,
}

impl MemorySink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether nothing was committed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Stored document for `handle`.
    #[must_use]
    pub fn get(&self, handle: &RecordHandle) -> Option<Map<String, Value>> {
        self.documents.get(handle).map(|entry| entry.value().1.clone())
    }

    /// All documents in commit order.
    #[must_use]
    pub fn documents(&self) -> Vec<(RecordHandle, Map<String, Value>)> {
        let mut all: Vec<_> = self
            .documents
            .iter()
            .map(|entry| (entry.value().0, entry.key().clone(), entry.value().1.clone()))
            .collect();
        all.sort_by_key(|(order, _, _)| *order);
        all.into_iter().map(|(_, h, d)| (h, d)).collect()
    }

    /// All documents parsed as records, in commit order.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if a stored document is not a provenance record.
    pub fn records(&self) -> Result<Vec<(RecordHandle, ProvenanceRecord)>> {
        self.documents()
            .into_iter()
            .map(|(h, d)| Ok((h, serde_json::from_value(Value::Object(d))?)))
            .collect()
    }
}

impl RecordSink for MemorySink {
    fn commit(&self, document: Map<String, Value>) -> Result<RecordHandle> {
        let handle = RecordHandle::random();
        let order = self.next.fetch_add(1, Ordering::SeqCst);
        self.documents.insert(handle.clone(), (order, document));
        Ok(handle)
    }
}

/// Append-only JSON-lines file; one document per line with its handle under `_id`.
///
/// Every commit is flushed before the handle is returned.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open (or create) `path` for appending.
    ///
    /// # Errors
    ///
    /// IO errors from opening the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// File being written.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back from a JSON-lines file.
    ///
    /// # Errors
    ///
    /// IO errors; [`Error::StorageError`] for lines without an `_id`;
    /// [`Error::Json`] for malformed lines.
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<(RecordHandle, ProvenanceRecord)>> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut document: Map<String, Value> = serde_json::from_str(&line)?;
            let handle = match document.remove("_id") {
                Some(Value::String(id)) => RecordHandle::new(id),
                _ => {
                    return Err(Error::StorageError(format!(
                        "line {} has no string '_id'",
                        n + 1
                    )))
                }
            };
            records.push((handle, serde_json::from_value(Value::Object(document))?));
        }
        Ok(records)
    }
}

impl RecordSink for JsonLinesSink {
    fn commit(&self, mut document: Map<String, Value>) -> Result<RecordHandle> {
        let handle = RecordHandle::random();
        document.insert("_id".to_string(), Value::String(handle.to_string()));
        let line = serde_json::to_string(&document)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::StorageError("provenance file writer poisoned".to_string()))?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(handle)
    }
}
