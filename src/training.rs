//! Oracle-labelled training corpus shared by every ensemble member.

use serde::{Deserialize, Serialize};

use crate::evaluator::{EvaluationResult, Provenance};
use crate::structure::Structure;
use crate::{Error, Result};

/// One labelled structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingEntry {
    /// The structure the oracle saw
    pub structure: Structure,
    /// The oracle label (always [`Provenance::Oracle`])
    pub result: EvaluationResult,
}

/// Append-only sequence of oracle-labelled structures.
///
/// Entries added through [`TrainingSet::seed`] before the run starts are
/// counted separately so budget accounting can ignore them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingSet {
    entries: Vec<TrainingEntry>,
    seeded: usize,
}

impl TrainingSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add pre-labelled data (not counted as appended during the run).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the set already holds run data or a
    /// result is not oracle-tagged.
    pub fn seed(&mut self, entries: impl IntoIterator<Item = TrainingEntry>) -> Result<()> {
        if self.appended() > 0 {
            return Err(Error::InvalidInput(
                "cannot seed a training set after run data was appended".to_string(),
            ));
        }
        for entry in entries {
            Self::check(&entry)?;
            self.entries.push(entry);
            self.seeded += 1;
        }
        Ok(())
    }

    /// Append an oracle-labelled structure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the result is not oracle-tagged.
    pub fn push(&mut self, structure: Structure, result: EvaluationResult) -> Result<()> {
        let entry = TrainingEntry { structure, result };
        Self::check(&entry)?;
        self.entries.push(entry);
        Ok(())
    }

    fn check(entry: &TrainingEntry) -> Result<()> {
        if entry.result.provenance != Provenance::Oracle {
            return Err(Error::InvalidInput(
                "training set only accepts ORACLE-labelled results".to_string(),
            ));
        }
        entry
            .result
            .evaluation()
            .check_against(&entry.structure, "training label")
    }

    /// Total entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries added by [`TrainingSet::seed`].
    ///
    /// Never more than [`TrainingSet::len`], even for a hand-edited
    /// serialized set.
    #[must_use]
    pub fn seeded(&self) -> usize {
        self.seeded.min(self.entries.len())
    }

    /// Entries appended during the run.
    #[must_use]
    pub fn appended(&self) -> usize {
        self.entries.len().saturating_sub(self.seeded)
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, TrainingEntry> {
        self.entries.iter()
    }

    /// Most recent entry.
    #[must_use]
    pub fn last(&self) -> Option<&TrainingEntry> {
        self.entries.last()
    }
}

impl<'a> IntoIterator for &'a TrainingSet {
    type Item = &'a TrainingEntry;
    type IntoIter = std::slice::Iter<'a, TrainingEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
