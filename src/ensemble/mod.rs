//! Ensemble potential
//!
//! K independently initialised (possibly heterogeneous) surrogate members
//! combined into one prediction plus a disagreement-based uncertainty.
//!
//! ## Execution model
//!
//! ```text
//! predict:  member_0 ─┐
//!           member_1 ─┼─ barrier ─> mean / std
//!           member_k ─┘
//!
//! retrain:  fit (read-only, parallel) ─ barrier ─> validate ─> load (all at once)
//! ```
//!
//! Per-member work runs on a dedicated rayon pool. Nothing is exposed until
//! every member has finished, so callers never see a partial ensemble.

mod member;
mod pairwise;
pub mod stats;

pub use member::{
    MemberKind, MemberLoader, MemberRegistry, MemberSpec, ParameterBlock, Parameters,
    SurrogateMember,
};
pub use pairwise::{PairwiseCheckpoint, PairwiseLoader, PairwiseMember};

use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use tracing::{debug, warn};

use crate::evaluator::{CalculatorDescriptor, Evaluation};
use crate::structure::{Structure, Vec3};
use crate::training::TrainingSet;
use crate::{Error, Result};

/// Ensemble prediction with uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsemblePrediction {
    /// Mean member energy
    pub energy: f64,
    /// Elementwise mean member forces
    pub forces: Vec<Vec3>,
    /// Population std of member energies (`+inf` with fewer than two members)
    pub energy_uncertainty: f64,
    /// Mean over atoms and components of the force std (`+inf` with fewer than two members)
    pub force_uncertainty: f64,
}

impl EnsemblePrediction {
    /// Energy and forces without uncertainties.
    #[must_use]
    pub fn evaluation(&self) -> Evaluation {
        Evaluation::new(self.energy, self.forces.clone())
    }
}

/// Outcome of one retrain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetrainReport {
    /// Members whose parameters were replaced
    pub updated: usize,
    /// Members whose update was discarded
    pub diverged: Vec<usize>,
}

impl RetrainReport {
    /// Whether at least one member kept stale weights.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !self.diverged.is_empty()
    }
}

/// K-member ensemble with a bounded worker pool.
pub struct EnsemblePotential {
    members: Vec<Box<dyn SurrogateMember>>,
    pool: ThreadPool,
    evaluations: u64,
    retrain_cycles: u64,
    degraded_cycles: u64,
}

impl EnsemblePotential {
    /// Build from loaded members.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for an empty member list, zero workers, or
    /// a pool that cannot be created.
    pub fn new(members: Vec<Box<dyn SurrogateMember>>, workers: usize) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::Configuration(
                "ensemble needs at least one member".to_string(),
            ));
        }
        if workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ensemble-worker-{i}"))
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build worker pool: {e}")))?;
        Ok(Self {
            members,
            pool,
            evaluations: 0,
            retrain_cycles: 0,
            degraded_cycles: 0,
        })
    }

    /// Load every spec through `registry`.
    ///
    /// # Errors
    ///
    /// Loader errors, plus everything [`EnsemblePotential::new`] rejects.
    pub fn from_specs(specs: &[MemberSpec], registry: &MemberRegistry, workers: usize) -> Result<Self> {
        let members = specs
            .iter()
            .map(|spec| registry.load(spec))
            .collect::<Result<Vec<_>>>()?;
        Self::new(members, workers)
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false; an ensemble has at least one member.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in order.
    #[must_use]
    pub fn members(&self) -> &[Box<dyn SurrogateMember>] {
        &self.members
    }

    /// Predictions served since construction.
    #[must_use]
    pub const fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Retrain cycles run since construction.
    #[must_use]
    pub const fn retrain_cycles(&self) -> u64 {
        self.retrain_cycles
    }

    /// Retrain cycles where at least one member kept stale weights.
    #[must_use]
    pub const fn degraded_cycles(&self) -> u64 {
        self.degraded_cycles
    }

    /// Provenance description (member kinds in order).
    #[must_use]
    pub fn descriptor(&self) -> CalculatorDescriptor {
        let kinds: Vec<&str> = self.members.iter().map(|m| m.kind().as_str()).collect();
        CalculatorDescriptor::new("EnsemblePotential").with_params(serde_json::json!({
            "ensemble_size": self.members.len(),
            "members": kinds,
        }))
    }

    /// Predict energy, forces and uncertainties.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if any member rejects the structure or
    /// returns the wrong number of force vectors; other member errors are
    /// propagated as-is. No partial result is returned.
    pub fn predict(&mut self, structure: &Structure) -> Result<EnsemblePrediction> {
        let members = &self.members;
        let outputs: Vec<Result<Evaluation>> = self
            .pool
            .install(|| members.par_iter().map(|m| m.predict(structure)).collect());

        let mut evaluations = Vec::with_capacity(outputs.len());
        for (i, output) in outputs.into_iter().enumerate() {
            let evaluation = output.map_err(|e| match e {
                Error::ShapeMismatch { expected, actual, .. } => Error::ShapeMismatch {
                    context: format!("member {i}"),
                    expected,
                    actual,
                },
                other => other,
            })?;
            if evaluation.forces.len() != structure.len() {
                return Err(Error::shape_mismatch(
                    format!("member {i}"),
                    format!("{} force vectors", structure.len()),
                    evaluation.forces.len(),
                ));
            }
            evaluations.push(evaluation);
        }

        let agg = stats::aggregate(&evaluations)?;
        self.evaluations += 1;
        debug!(
            evaluation = self.evaluations,
            energy = agg.energy,
            energy_uncertainty = agg.energy_std,
            force_uncertainty = agg.force_std,
            "ensemble prediction"
        );
        Ok(EnsemblePrediction {
            energy: agg.energy,
            forces: agg.forces,
            energy_uncertainty: agg.energy_std,
            force_uncertainty: agg.force_std,
        })
    }

    /// Retrain every member on `training_set`.
    ///
    /// Updates that diverge (or touch frozen parameters) are discarded and
    /// the member keeps its previous weights; the cycle is then reported as
    /// degraded. Any other error aborts the cycle with every member on its
    /// previous weights: a failed load restores the members loaded before it.
    ///
    /// # Errors
    ///
    /// Non-divergence member errors, e.g. [`Error::ShapeMismatch`] for a
    /// training structure a member cannot represent.
    pub fn retrain(&mut self, training_set: &TrainingSet) -> Result<RetrainReport> {
        let members = &self.members;
        let fits: Vec<Result<Parameters>> = self
            .pool
            .install(|| members.par_iter().map(|m| m.fit(training_set)).collect());

        let mut staged = Vec::with_capacity(fits.len());
        let mut report = RetrainReport::default();
        for (i, fit) in fits.into_iter().enumerate() {
            match fit.map_err(|e| e.for_member(i)) {
                Ok(update) => match self.members[i].parameters().incompatibility(&update) {
                    None => staged.push((i, update)),
                    Some(reason) => {
                        warn!(member = i, %reason, "discarding retrain update");
                        report.diverged.push(i);
                    }
                },
                Err(e @ Error::RetrainDivergence { .. }) => {
                    warn!(error = %e, "retrain diverged, keeping previous weights");
                    report.diverged.push(i);
                }
                Err(e) => return Err(e),
            }
        }

        let mut applied: Vec<(usize, Parameters)> = Vec::with_capacity(staged.len());
        for (i, update) in staged {
            let previous = self.members[i].parameters().clone();
            if let Err(e) = self.members[i].load_parameters(update) {
                warn!(member = i, error = %e, "retrain load failed, rolling back cycle");
                for (j, old) in applied.into_iter().rev() {
                    if let Err(restore) = self.members[j].load_parameters(old) {
                        warn!(member = j, error = %restore, "rollback failed");
                    }
                }
                return Err(e);
            }
            applied.push((i, previous));
            report.updated += 1;
        }

        self.retrain_cycles += 1;
        if report.is_degraded() {
            self.degraded_cycles += 1;
        }
        debug!(
            cycle = self.retrain_cycles,
            entries = training_set.len(),
            updated = report.updated,
            diverged = report.diverged.len(),
            "ensemble retrained"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for EnsemblePotential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnsemblePotential")
            .field("members", &self.members)
            .field("workers", &self.pool.current_num_threads())
            .field("evaluations", &self.evaluations)
            .field("retrain_cycles", &self.retrain_cycles)
            .finish()
    }
}
