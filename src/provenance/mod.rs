//! Provenance chain for active-learning runs
//!
//! Every completed loop step produces one [`ProvenanceRecord`]. Records of a
//! run form a singly-linked, append-only chain through their `previous`
//! handle. Chain construction ([`ProvenanceLog`]) is kept apart from
//! durability ([`RecordSink`]) so the invariant can be checked against an
//! in-memory sink.
//!
//! ## Chain invariant
//!
//! - exactly one record per run has `first == true` and `previous == None`
//! - every other record's `previous` names a record of the same run
//!
//! [`verify_chain`] checks both over a set of committed records.

mod record;
mod sink;

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub use record::{AtomDocument, AtomsDocument, ProvenanceRecord, RecordHandle, ResultsDocument};
pub use sink::{JsonLinesSink, MemorySink, RecordSink};

use crate::evaluator::EvaluationResult;
use crate::structure::Structure;
use crate::{Error, Result};

/// One caller-provided value awaiting storage.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Already JSON
    Json(Value),
    /// Mapping whose values are converted recursively
    Nested(ExtraFields),
    /// String form of a value that could not be serialized
    Text(String),
}

/// Additional top-level fields for a provenance record.
///
/// Values that serialize are stored as JSON; anything else (live handles,
/// types whose `Serialize` impl fails) is stored as its `Debug` string, so
/// an append never fails on field types.
///
/// ```rust
/// use oal_relax::provenance::ExtraFields;
///
/// let extras = ExtraFields::new()
///     .insert("step", &3)
///     .insert_nested("driver", ExtraFields::new().insert("fmax", &0.05))
///     .insert_opaque("handle", &std::time::Duration::from_secs(1));
/// let map = extras.stringify();
/// assert_eq!(map["driver"]["fmax"], 0.05);
/// assert_eq!(map["handle"], "1s");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraFields {
    fields: BTreeMap<String, FieldValue>,
}

impl ExtraFields {
    /// No fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, falling back to its `Debug` form if it does not serialize.
    #[must_use]
    pub fn insert<T: Serialize + Debug + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        let field = serde_json::to_value(value)
            .map_or_else(|_| FieldValue::Text(format!("{value:?}")), FieldValue::Json);
        self.fields.insert(key.into(), field);
        self
    }

    /// Add a nested mapping.
    #[must_use]
    pub fn insert_nested(mut self, key: impl Into<String>, nested: Self) -> Self {
        self.fields.insert(key.into(), FieldValue::Nested(nested));
        self
    }

    /// Add a value that has no JSON form.
    #[must_use]
    pub fn insert_opaque<T: Debug + ?Sized>(mut self, key: impl Into<String>, value: &T) -> Self {
        self.fields
            .insert(key.into(), FieldValue::Text(format!("{value:?}")));
        self
    }

    /// Merge another set of fields; `other` wins on key collisions.
    #[must_use]
    pub fn merged(mut self, other: Self) -> Self {
        self.fields.extend(other.fields);
        self
    }

    /// Number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Convert to a JSON object.
    #[must_use]
    pub fn stringify(self) -> Map<String, Value> {
        self.fields
            .into_iter()
            .map(|(key, field)| {
                let value = match field {
                    FieldValue::Json(v) => v,
                    FieldValue::Nested(nested) => Value::Object(nested.stringify()),
                    FieldValue::Text(s) => Value::String(s),
                };
                (key, value)
            })
            .collect()
    }
}

impl From<Map<String, Value>> for ExtraFields {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            fields: map
                .into_iter()
                .map(|(k, v)| (k, FieldValue::Json(v)))
                .collect(),
        }
    }
}

#[derive(Debug)]
struct ChainState {
    tail: Option<RecordHandle>,
    sequence: u64,
}

/// Append-only provenance chain for one run.
///
/// The chain lock is held across the sink commit: a record's `previous`
/// pointer is only assigned once the preceding commit has returned its
/// handle.
pub struct ProvenanceLog {
    sink: Arc<dyn RecordSink>,
    run_id: String,
    params: Value,
    chain: Mutex<ChainState>,
}

impl ProvenanceLog {
    /// Start a new chain with a fresh UUID v4 run id.
    #[must_use]
    pub fn new(sink: Arc<dyn RecordSink>, params: Value) -> Self {
        Self::with_run_id(sink, uuid::Uuid::new_v4().to_string(), params)
    }

    /// Start a new chain with a caller-chosen run id.
    #[must_use]
    pub fn with_run_id(sink: Arc<dyn RecordSink>, run_id: impl Into<String>, params: Value) -> Self {
        Self {
            sink,
            run_id: run_id.into(),
            params,
            chain: Mutex::new(ChainState {
                tail: None,
                sequence: 0,
            }),
        }
    }

    /// Continue an existing chain after its last committed record.
    ///
    /// # Errors
    ///
    /// [`Error::ChainCorruption`] if `tail` belongs to a different run.
    pub fn resume(
        sink: Arc<dyn RecordSink>,
        run_id: impl Into<String>,
        params: Value,
        tail_handle: RecordHandle,
        tail: &ProvenanceRecord,
    ) -> Result<Self> {
        let run_id = run_id.into();
        if tail.run_id != run_id {
            return Err(Error::ChainCorruption(format!(
                "cannot resume run {run_id} from record {tail_handle} of run {}",
                tail.run_id
            )));
        }
        Ok(Self {
            sink,
            run_id,
            params,
            chain: Mutex::new(ChainState {
                tail: Some(tail_handle),
                sequence: tail.sequence + 1,
            }),
        })
    }

    /// Run identifier stamped on every record.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Run parameters stamped on every record.
    #[must_use]
    pub const fn params(&self) -> &Value {
        &self.params
    }

    /// Handle of the last committed record.
    #[must_use]
    pub fn tail(&self) -> Option<RecordHandle> {
        self.chain.lock().ok().and_then(|state| state.tail.clone())
    }

    /// Append one record.
    ///
    /// Extra fields may not replace the record's own keys; colliding keys
    /// are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Sink failures, or [`Error::StorageError`] if a previous append
    /// panicked while holding the chain lock. Nothing is linked on failure.
    pub fn append(
        &self,
        structure: &Structure,
        result: &EvaluationResult,
        extra: ExtraFields,
    ) -> Result<RecordHandle> {
        let mut extra = extra.stringify();
        extra.retain(|key, _| {
            let reserved = record::RESERVED_KEYS.contains(&key.as_str());
            if reserved {
                warn!(key = %key, "dropping extra field that shadows a provenance key");
            }
            !reserved
        });

        let mut state = self
            .chain
            .lock()
            .map_err(|_| Error::StorageError("provenance chain lock poisoned".to_string()))?;

        let record = ProvenanceRecord {
            run_id: self.run_id.clone(),
            sequence: state.sequence,
            previous: state.tail.clone(),
            first: state.tail.is_none(),
            material: structure.chemical_formula(),
            atoms: AtomsDocument::from(structure),
            results: ResultsDocument::new(structure, result),
            params: self.params.clone(),
            user: std::env::var("USER").ok(),
            ctime: Utc::now(),
            extra,
        };
        let document = match serde_json::to_value(&record)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::StorageError(format!(
                    "provenance record serialized to {other}"
                )))
            }
        };

        let handle = self.sink.commit(document)?;
        debug!(
            run_id = %self.run_id,
            sequence = state.sequence,
            handle = %handle,
            provenance = ?result.provenance,
            "provenance record committed"
        );
        state.tail = Some(handle.clone());
        state.sequence += 1;
        Ok(handle)
    }
}

impl std::fmt::Debug for ProvenanceLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvenanceLog")
            .field("run_id", &self.run_id)
            .field("tail", &self.tail())
            .finish_non_exhaustive()
    }
}

/// Counts from a successful [`verify_chain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSummary {
    /// Distinct run ids
    pub runs: usize,
    /// Records checked
    pub records: usize,
}

/// Check the chain invariant over committed records.
///
/// # Errors
///
/// [`Error::ChainCorruption`] on a dangling or cross-run `previous` pointer,
/// an inconsistent `first` flag, a run without exactly one first record, or
/// a pointer cycle.
pub fn verify_chain(records: &[(RecordHandle, ProvenanceRecord)]) -> Result<ChainSummary> {
    let by_handle: HashMap<&RecordHandle, &ProvenanceRecord> =
        records.iter().map(|(h, r)| (h, r)).collect();
    let mut firsts: HashMap<&str, usize> = HashMap::new();

    for (handle, record) in records {
        match &record.previous {
            None => {
                if !record.first {
                    return Err(Error::ChainCorruption(format!(
                        "record {handle} has no previous record but is not marked first"
                    )));
                }
                *firsts.entry(record.run_id.as_str()).or_default() += 1;
            }
            Some(previous) => {
                if record.first {
                    return Err(Error::ChainCorruption(format!(
                        "record {handle} is marked first but points at {previous}"
                    )));
                }
                let target = by_handle.get(previous).ok_or_else(|| {
                    Error::ChainCorruption(format!(
                        "record {handle} points at unknown record {previous}"
                    ))
                })?;
                if target.run_id != record.run_id {
                    return Err(Error::ChainCorruption(format!(
                        "record {handle} of run {} points at record {previous} of run {}",
                        record.run_id, target.run_id
                    )));
                }
                firsts.entry(record.run_id.as_str()).or_default();
            }
        }
    }

    if let Some((run, count)) = firsts.iter().find(|(_, count)| **count != 1) {
        return Err(Error::ChainCorruption(format!(
            "run {run} has {count} first records, expected exactly one"
        )));
    }

    // Every walk must reach the run's first record within `records.len()` hops.
    for (handle, record) in records {
        let mut current = record;
        let mut hops = 0;
        while let Some(previous) = &current.previous {
            hops += 1;
            if hops > records.len() {
                return Err(Error::ChainCorruption(format!(
                    "cycle in previous pointers reachable from record {handle}"
                )));
            }
            current = by_handle[previous];
        }
    }

    Ok(ChainSummary {
        runs: firsts.len(),
        records: records.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Evaluation;
    use crate::structure::Atom;

    fn dimer() -> Structure {
        Structure::new(vec![
            Atom::new("Ar", [0.0; 3]),
            Atom::new("Ar", [1.2, 0.0, 0.0]),
        ])
    }

    fn result() -> EvaluationResult {
        EvaluationResult::oracle(Evaluation::new(-1.0, vec![[0.1, 0.0, 0.0], [-0.1, 0.0, 0.0]]))
    }

    #[test]
    fn test_first_record_has_no_previous() {
        let sink = Arc::new(MemorySink::new());
        let log = ProvenanceLog::new(sink.clone(), Value::Null);
        let h1 = log.append(&dimer(), &result(), ExtraFields::new()).unwrap();
        let h2 = log.append(&dimer(), &result(), ExtraFields::new()).unwrap();

        let records = sink.records().unwrap();
        assert!(records[0].1.first);
        assert!(records[0].1.previous.is_none());
        assert!(!records[1].1.first);
        assert_eq!(records[1].1.previous.as_ref(), Some(&h1));
        assert_eq!(records[1].1.sequence, 1);
        assert_eq!(log.tail(), Some(h2));
        assert_eq!(records[0].1.material, "Ar2");
    }

    #[test]
    fn test_extra_fields_cannot_shadow_chain_keys() {
        let sink = Arc::new(MemorySink::new());
        let log = ProvenanceLog::with_run_id(sink.clone(), "run-a", Value::Null);
        let extras = ExtraFields::new()
            .insert("run_id", "run-b")
            .insert("step", &7);
        let handle = log.append(&dimer(), &result(), extras).unwrap();
        let doc = sink.get(&handle).unwrap();
        assert_eq!(doc["run_id"], "run-a");
        assert_eq!(doc["step"], 7);
    }

    #[test]
    fn test_resume_rejects_foreign_tail() {
        let sink = Arc::new(MemorySink::new());
        let log = ProvenanceLog::with_run_id(sink.clone(), "run-a", Value::Null);
        let handle = log.append(&dimer(), &result(), ExtraFields::new()).unwrap();
        let (_, tail) = sink.records().unwrap().remove(0);

        let err =
            ProvenanceLog::resume(sink.clone(), "run-b", Value::Null, handle.clone(), &tail)
                .unwrap_err();
        assert!(matches!(err, Error::ChainCorruption(_)));

        let resumed = ProvenanceLog::resume(sink.clone(), "run-a", Value::Null, handle, &tail).unwrap();
        resumed.append(&dimer(), &result(), ExtraFields::new()).unwrap();
        let summary = verify_chain(&sink.records().unwrap()).unwrap();
        assert_eq!(summary, ChainSummary { runs: 1, records: 2 });
    }

    #[test]
    fn test_verify_detects_cross_run_pointer() {
        let sink = Arc::new(MemorySink::new());
        let a = ProvenanceLog::with_run_id(sink.clone(), "a", Value::Null);
        let b = ProvenanceLog::with_run_id(sink.clone(), "b", Value::Null);
        a.append(&dimer(), &result(), ExtraFields::new()).unwrap();
        b.append(&dimer(), &result(), ExtraFields::new()).unwrap();
        let mut records = sink.records().unwrap();
        assert!(verify_chain(&records).is_ok());

        let a_handle = records[0].0.clone();
        records[1].1.previous = Some(a_handle);
        records[1].1.first = false;
        assert!(matches!(verify_chain(&records), Err(Error::ChainCorruption(_))));
    }

    #[test]
    fn test_verify_detects_dangling_pointer() {
        let sink = Arc::new(MemorySink::new());
        let log = ProvenanceLog::new(sink.clone(), Value::Null);
        log.append(&dimer(), &result(), ExtraFields::new()).unwrap();
        log.append(&dimer(), &result(), ExtraFields::new()).unwrap();
        let mut records = sink.records().unwrap();
        records.remove(0);
        assert!(verify_chain(&records).is_err());
    }

    #[test]
    fn test_stringify_falls_back_to_debug() {
        #[derive(Debug)]
        struct Live;
        let map = ExtraFields::new().insert_opaque("driver", &Live).stringify();
        assert_eq!(map["driver"], "Live");
    }

    #[test]
    fn test_unserializable_map_key_is_stringified() {
        // tuple keys have no JSON form
        let mut odd = std::collections::HashMap::new();
        odd.insert((1, 2), "x");
        let map = ExtraFields::new().insert("odd", &odd).stringify();
        assert!(map["odd"].is_string());
    }
}
