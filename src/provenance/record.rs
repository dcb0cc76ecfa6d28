//! Provenance Record - one evaluation of one run

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::evaluator::{EvaluationResult, Forces, Provenance};
use crate::structure::{Cell, Structure, Vec3};

/// Opaque identifier returned by a sink for a committed record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordHandle(String);

impl RecordHandle {
    /// Wrap a sink-specific identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random (UUID v4) handle.
    #[must_use]
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-atom snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomDocument {
    /// Chemical symbol
    pub symbol: String,
    /// Cartesian position
    pub position: Vec3,
    /// Tag
    pub tag: i32,
    /// Index in the structure
    pub index: usize,
    /// Charge
    pub charge: f64,
    /// Momentum
    pub momentum: Vec3,
    /// Magnetic moment
    pub magmom: f64,
}

/// Serializable snapshot of a [`Structure`], with redundant fields for
/// searching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomsDocument {
    /// Atoms in order
    pub atoms: Vec<AtomDocument>,
    /// Cell matrix
    pub cell: Cell,
    /// Periodic boundary flags
    pub pbc: [bool; 3],
    /// Fixed atom indices
    pub constraints: BTreeSet<usize>,
    /// Atom count
    pub natoms: usize,
    /// Distinct symbols, sorted
    pub chemical_symbols: Vec<String>,
    /// Count per symbol
    pub symbol_counts: BTreeMap<String, usize>,
    /// Cell volume, when the cell is non-degenerate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl From<&Structure> for AtomsDocument {
    fn from(structure: &Structure) -> Self {
        let atoms = structure
            .atoms()
            .iter()
            .enumerate()
            .map(|(index, atom)| AtomDocument {
                symbol: atom.symbol.clone(),
                position: atom.position,
                tag: atom.tag,
                index,
                charge: atom.charge,
                momentum: atom.momentum,
                magmom: atom.magmom,
            })
            .collect();
        let symbol_counts = structure.species_counts();
        let volume = structure.volume();
        Self {
            atoms,
            cell: *structure.cell(),
            pbc: structure.pbc(),
            constraints: structure.fixed().clone(),
            natoms: structure.len(),
            chemical_symbols: symbol_counts.keys().cloned().collect(),
            symbol_counts,
            volume: (volume > 0.0).then_some(volume),
        }
    }
}

/// Serializable evaluation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsDocument {
    /// Energy
    pub energy: f64,
    /// Forces
    pub forces: Forces,
    /// Largest force norm over movable atoms
    pub fmax: f64,
    /// ML or ORACLE
    pub provenance: Provenance,
    /// Energy uncertainty, if predicted. Non-finite values are written as
    /// `"inf"`, `"-inf"` or `"nan"`.
    #[serde(default, with = "uncertainty_serde")]
    pub energy_uncertainty: Option<f64>,
    /// Force uncertainty, if predicted
    #[serde(default, with = "uncertainty_serde")]
    pub force_uncertainty: Option<f64>,
}

/// JSON has no infinity; keep a cold-start `+inf` distinct from "absent".
mod uncertainty_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            None => serializer.serialize_none(),
            Some(v) if v.is_finite() => serializer.serialize_some(v),
            Some(v) if v.is_nan() => serializer.serialize_some("nan"),
            Some(v) if v.is_sign_positive() => serializer.serialize_some("inf"),
            Some(_) => serializer.serialize_some("-inf"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Repr>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Repr::Number(v)) => Ok(Some(v)),
            Some(Repr::Text(t)) => match t.as_str() {
                "inf" => Ok(Some(f64::INFINITY)),
                "-inf" => Ok(Some(f64::NEG_INFINITY)),
                "nan" => Ok(Some(f64::NAN)),
                other => Err(de::Error::custom(format!(
                    "unknown uncertainty sentinel: {other}"
                ))),
            },
        }
    }
}

impl ResultsDocument {
    /// Snapshot a result for `structure`.
    #[must_use]
    pub fn new(structure: &Structure, result: &EvaluationResult) -> Self {
        Self {
            energy: result.energy,
            forces: result.forces.clone(),
            fmax: structure.fmax(&result.forces),
            provenance: result.provenance,
            energy_uncertainty: result.energy_uncertainty,
            force_uncertainty: result.force_uncertainty,
        }
    }
}

/// One link of the provenance chain.
///
/// Immutable once committed. `previous` is `None` exactly for the record
/// with `first == true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    /// Run identifier, constant for the whole run
    pub run_id: String,
    /// Position in the run, starting at 0
    pub sequence: u64,
    /// Handle of the preceding record of the same run
    pub previous: Option<RecordHandle>,
    /// Whether this is the first record of the run
    pub first: bool,
    /// Chemical formula label
    pub material: String,
    /// Structure snapshot
    pub atoms: AtomsDocument,
    /// Evaluation snapshot
    pub results: ResultsDocument,
    /// Run parameters (learner config, calculators)
    pub params: Value,
    /// `$USER` at write time
    pub user: Option<String>,
    /// Wall-clock creation time
    pub ctime: DateTime<Utc>,
    /// Caller-provided fields
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Top-level keys owned by the chain; extra fields may not replace them.
pub(crate) const RESERVED_KEYS: &[&str] = &[
    "run_id", "sequence", "previous", "first", "material", "atoms", "results", "params", "user",
    "ctime", "_id",
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Evaluation;
    use crate::structure::Atom;

    fn slab() -> Structure {
        Structure::new(vec![
            Atom::new("Cu", [0.0; 3]),
            Atom::new("Cu", [2.5, 0.0, 0.0]),
            Atom::new("O", [1.25, 1.0, 1.5]).with_tag(1),
        ])
        .with_cell([[5.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 10.0]])
        .with_fixed([0, 1])
        .unwrap()
    }

    #[test]
    fn test_atoms_document_redundant_fields() {
        let doc = AtomsDocument::from(&slab());
        assert_eq!(doc.natoms, 3);
        assert_eq!(doc.chemical_symbols, vec!["Cu", "O"]);
        assert_eq!(doc.symbol_counts["Cu"], 2);
        assert_eq!(doc.volume, Some(250.0));
        assert_eq!(doc.atoms[2].tag, 1);
        assert_eq!(doc.atoms[2].index, 2);
    }

    #[test]
    fn test_degenerate_cell_has_no_volume() {
        let doc = AtomsDocument::from(&Structure::new(vec![Atom::new("H", [0.0; 3])]));
        assert!(doc.volume.is_none());
    }

    #[test]
    fn test_results_fmax_respects_constraints() {
        let result = EvaluationResult::oracle(Evaluation::new(
            -1.0,
            vec![[9.0, 0.0, 0.0], [9.0, 0.0, 0.0], [0.0, 0.3, 0.4]],
        ));
        let doc = ResultsDocument::new(&slab(), &result);
        assert!((doc.fmax - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cold_start_uncertainty_is_not_null() {
        let s = Structure::new(vec![Atom::new("Cu", [0.0; 3])]);
        let cold = EvaluationResult::oracle(Evaluation::new(-1.0, vec![[0.0; 3]]))
            .with_uncertainties(f64::INFINITY, 0.25);
        let doc = ResultsDocument::new(&s, &cold);

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["energy_uncertainty"], "inf");
        assert_eq!(json["force_uncertainty"], 0.25);

        let back: ResultsDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back.energy_uncertainty, Some(f64::INFINITY));
        assert_eq!(back.force_uncertainty, Some(0.25));

        let plain = ResultsDocument::new(
            &s,
            &EvaluationResult::oracle(Evaluation::new(-1.0, vec![[0.0; 3]])),
        );
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json["energy_uncertainty"].is_null());
        let back: ResultsDocument = serde_json::from_value(json).unwrap();
        assert_eq!(back.energy_uncertainty, None);
    }

    #[test]
    fn test_unknown_uncertainty_sentinel_rejected() {
        let json = serde_json::json!({
            "energy": 0.0, "forces": [[0.0, 0.0, 0.0]], "fmax": 0.0,
            "provenance": "ORACLE", "energy_uncertainty": "huge", "force_uncertainty": null
        });
        assert!(serde_json::from_value::<ResultsDocument>(json).is_err());
    }

    #[test]
    fn test_handle_serializes_as_plain_string() {
        let h = RecordHandle::new("abc");
        assert_eq!(serde_json::to_string(&h).unwrap(), "\"abc\"");
    }
}
