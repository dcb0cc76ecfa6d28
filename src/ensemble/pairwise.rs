//! Built-in trainable member
//!
//! A Lennard-Jones pair term with frozen σ/cutoff plus trainable ε and
//! per-species atomic reference energies:
//!
//! ```text
//! E = ε · E_LJ(σ) + Σ_atoms e_species
//! F = ε · F_LJ(σ)
//! ```
//!
//! Because E and F are linear in the trainable parameters, full-batch
//! gradient descent on the weighted squared error is enough to fine-tune it
//! against oracle labels. A learning rate that is too large diverges, which
//! surfaces as [`Error::RetrainDivergence`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::member::{
    MemberKind, MemberLoader, MemberSpec, ParameterBlock, Parameters, SurrogateMember,
};
use crate::config::TrainingConfig;
use crate::evaluator::Evaluation;
use crate::lennard_jones::pair_terms;
use crate::structure::Structure;
use crate::training::TrainingSet;
use crate::{Error, Result};

const PAIR: usize = 0;
const EPSILON: usize = 1;
const ATOMIC: usize = 2;

/// On-disk checkpoint of a [`PairwiseMember`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseCheckpoint {
    /// Initial ε (eV)
    pub epsilon: f64,
    /// σ (Å), frozen
    pub sigma: f64,
    /// Cutoff (Å), frozen; defaults to 3σ
    #[serde(default)]
    pub cutoff: Option<f64>,
    /// Reference energy per species (eV); defines the species the member accepts
    pub atomic_energies: BTreeMap<String, f64>,
    /// Required atom count, if the member was trained for one system
    #[serde(default)]
    pub expected_atoms: Option<usize>,
    /// Per-member training override
    #[serde(default)]
    pub training: Option<TrainingConfig>,
}

/// Lennard-Jones surrogate with a trainable head.
#[derive(Debug, Clone)]
pub struct PairwiseMember {
    species: Vec<String>,
    expected_atoms: Option<usize>,
    training: TrainingConfig,
    parameters: Parameters,
}

/// Precomputed, parameter-independent features of one training entry.
struct Sample {
    e1: f64,
    f1: Vec<f64>,
    counts: Vec<f64>,
    energy: f64,
    forces: Vec<f64>,
}

impl PairwiseMember {
    /// Build from a checkpoint.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for non-positive σ/cutoff or an empty species table.
    pub fn from_checkpoint(checkpoint: PairwiseCheckpoint, training: TrainingConfig) -> Result<Self> {
        let cutoff = checkpoint.cutoff.unwrap_or(3.0 * checkpoint.sigma);
        if !(checkpoint.sigma > 0.0 && cutoff > 0.0) {
            return Err(Error::Configuration(
                "pairwise member needs positive sigma and cutoff".to_string(),
            ));
        }
        if checkpoint.atomic_energies.is_empty() {
            return Err(Error::Configuration(
                "pairwise member needs at least one species in 'atomic_energies'".to_string(),
            ));
        }
        let species: Vec<String> = checkpoint.atomic_energies.keys().cloned().collect();
        let offsets: Vec<f64> = checkpoint.atomic_energies.values().copied().collect();
        let parameters = Parameters::new(vec![
            ParameterBlock::frozen("pair", vec![checkpoint.sigma, cutoff]),
            ParameterBlock::trainable("epsilon", vec![checkpoint.epsilon]),
            ParameterBlock::trainable("atomic_energies", offsets),
        ]);
        Ok(Self {
            species,
            expected_atoms: checkpoint.expected_atoms,
            training: checkpoint.training.unwrap_or(training),
            parameters,
        })
    }

    fn sigma(&self) -> f64 {
        self.parameters.blocks()[PAIR].values[0]
    }

    fn cutoff(&self) -> f64 {
        self.parameters.blocks()[PAIR].values[1]
    }

    fn epsilon(&self) -> f64 {
        self.parameters.blocks()[EPSILON].values[0]
    }

    fn offsets(&self) -> &[f64] {
        &self.parameters.blocks()[ATOMIC].values
    }

    /// Per-species atom counts in parameter order.
    fn counts(&self, structure: &Structure) -> Result<Vec<f64>> {
        let mut counts = vec![0.0; self.species.len()];
        for symbol in structure.symbols() {
            let index = self
                .species
                .binary_search_by(|s| s.as_str().cmp(symbol))
                .map_err(|_| {
                    Error::shape_mismatch(
                        "pairwise member species table",
                        format!("one of {:?}", self.species),
                        symbol,
                    )
                })?;
            counts[index] += 1.0;
        }
        Ok(counts)
    }

    fn check_layout(&self, structure: &Structure) -> Result<()> {
        match self.expected_atoms {
            Some(n) if n != structure.len() => Err(Error::shape_mismatch(
                "pairwise member",
                format!("{n} atoms"),
                format!("{} atoms", structure.len()),
            )),
            _ => Ok(()),
        }
    }

    fn sample(&self, structure: &Structure, label: &Evaluation) -> Result<Sample> {
        self.check_layout(structure)?;
        let terms = pair_terms(structure, self.sigma(), self.cutoff())?;
        Ok(Sample {
            e1: terms.energy,
            f1: terms.forces.iter().flatten().copied().collect(),
            counts: self.counts(structure)?,
            energy: label.energy,
            forces: label.forces.iter().flatten().copied().collect(),
        })
    }

    // The ensemble fills in the real index.
    fn diverged(reason: impl Into<String>) -> Error {
        Error::RetrainDivergence {
            member: 0,
            reason: reason.into(),
        }
    }
}

impl SurrogateMember for PairwiseMember {
    fn kind(&self) -> MemberKind {
        MemberKind::Pairwise
    }

    fn predict(&self, structure: &Structure) -> Result<Evaluation> {
        self.check_layout(structure)?;
        let counts = self.counts(structure)?;
        let terms = pair_terms(structure, self.sigma(), self.cutoff())?;
        let eps = self.epsilon();
        let reference: f64 = counts.iter().zip(self.offsets()).map(|(n, e)| n * e).sum();
        let forces = terms.forces.into_iter().map(|f| f.map(|c| c * eps)).collect();
        Ok(Evaluation::new(eps.mul_add(terms.energy, reference), forces))
    }

    fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    #[allow(clippy::cast_precision_loss)]
    fn fit(&self, training_set: &TrainingSet) -> Result<Parameters> {
        if training_set.is_empty() {
            return Ok(self.parameters.clone());
        }
        let samples = training_set
            .iter()
            .map(|entry| self.sample(&entry.structure, &entry.result.evaluation()))
            .collect::<Result<Vec<_>>>()?;

        let cfg = &self.training;
        let n_samples = samples.len() as f64;
        let mut eps = self.epsilon();
        let mut offsets = self.offsets().to_vec();

        for epoch in 0..cfg.epochs {
            let mut grad_eps = 0.0;
            let mut grad_offsets = vec![0.0; offsets.len()];
            for s in &samples {
                let reference: f64 = s.counts.iter().zip(&offsets).map(|(n, e)| n * e).sum();
                let residual = eps.mul_add(s.e1, reference) - s.energy;
                grad_eps += 2.0 * cfg.energy_coefficient * residual * s.e1;
                for (g, n) in grad_offsets.iter_mut().zip(&s.counts) {
                    *g += 2.0 * cfg.energy_coefficient * residual * n;
                }
                if !s.f1.is_empty() {
                    let force_term: f64 = s
                        .f1
                        .iter()
                        .zip(&s.forces)
                        .map(|(f1, f)| eps.mul_add(*f1, -f) * f1)
                        .sum();
                    grad_eps += 2.0 * cfg.force_coefficient * force_term / s.f1.len() as f64;
                }
            }
            eps -= cfg.learning_rate * grad_eps / n_samples;
            for (e, g) in offsets.iter_mut().zip(&grad_offsets) {
                *e -= cfg.learning_rate * g / n_samples;
            }
            if !eps.is_finite() || offsets.iter().any(|e| !e.is_finite()) {
                return Err(Self::diverged(format!(
                    "parameters became non-finite at epoch {epoch} (learning_rate = {})",
                    cfg.learning_rate
                )));
            }
        }

        let mut blocks = self.parameters.blocks().to_vec();
        blocks[EPSILON].values = vec![eps];
        blocks[ATOMIC].values = offsets;
        Ok(Parameters::new(blocks))
    }

    fn load_parameters(&mut self, parameters: Parameters) -> Result<()> {
        if let Some(reason) = self.parameters.incompatibility(&parameters) {
            return Err(Error::InvalidInput(format!(
                "cannot load pairwise parameters: {reason}"
            )));
        }
        self.parameters = parameters;
        Ok(())
    }
}

/// Loader for [`MemberKind::Pairwise`].
#[derive(Debug, Clone, Default)]
pub struct PairwiseLoader {
    training: TrainingConfig,
}

impl PairwiseLoader {
    /// Loader applying `training` to members without their own override.
    #[must_use]
    pub const fn new(training: TrainingConfig) -> Self {
        Self { training }
    }
}

impl MemberLoader for PairwiseLoader {
    fn load(&self, spec: &MemberSpec) -> Result<Box<dyn SurrogateMember>> {
        let checkpoint: PairwiseCheckpoint = serde_json::from_value(spec.checkpoint_document()?)?;
        Ok(Box::new(PairwiseMember::from_checkpoint(
            checkpoint,
            self.training.clone(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{EvaluationResult, Evaluator};
    use crate::lennard_jones::LennardJones;
    use crate::structure::Atom;

    fn checkpoint(epsilon: f64) -> PairwiseCheckpoint {
        PairwiseCheckpoint {
            epsilon,
            sigma: 1.0,
            cutoff: None,
            atomic_energies: BTreeMap::from([("Ar".to_string(), 0.0)]),
            expected_atoms: None,
            training: None,
        }
    }

    fn trimer(r: f64) -> Structure {
        Structure::new(vec![
            Atom::new("Ar", [0.0; 3]),
            Atom::new("Ar", [r, 0.0, 0.0]),
            Atom::new("Ar", [0.0, r * 1.1, 0.0]),
        ])
    }

    fn labelled(truth: &LennardJones, rs: &[f64]) -> TrainingSet {
        let mut set = TrainingSet::new();
        for r in rs {
            let s = trimer(*r);
            let label = EvaluationResult::oracle(truth.evaluate(&s).unwrap());
            set.push(s, label).unwrap();
        }
        set
    }

    #[test]
    fn test_predict_matches_lennard_jones_without_offsets() {
        let member = PairwiseMember::from_checkpoint(checkpoint(0.7), TrainingConfig::default()).unwrap();
        let s = trimer(1.2);
        let expected = LennardJones::new(0.7, 1.0).evaluate(&s).unwrap();
        let got = member.predict(&s).unwrap();
        assert!((got.energy - expected.energy).abs() < 1e-12);
    }

    #[test]
    fn test_fit_moves_epsilon_towards_truth() {
        let truth = LennardJones::new(1.0, 1.0);
        let set = labelled(&truth, &[1.05, 1.12, 1.3, 1.5]);
        let training = TrainingConfig {
            epochs: 400,
            learning_rate: 0.01,
            ..TrainingConfig::default()
        };
        let mut member = PairwiseMember::from_checkpoint(checkpoint(0.5), training).unwrap();
        let update = member.fit(&set).unwrap();
        assert!(member.parameters().incompatibility(&update).is_none());
        member.load_parameters(update).unwrap();
        assert!((member.epsilon() - 1.0).abs() < 0.05, "epsilon = {}", member.epsilon());
        // frozen block untouched
        assert_eq!(member.sigma(), 1.0);
    }

    #[test]
    fn test_fit_with_huge_learning_rate_diverges() {
        let truth = LennardJones::new(1.0, 1.0);
        let set = labelled(&truth, &[0.95, 1.0]);
        let training = TrainingConfig {
            epochs: 200,
            learning_rate: 1.0e6,
            ..TrainingConfig::default()
        };
        let member = PairwiseMember::from_checkpoint(checkpoint(0.5), training).unwrap();
        assert!(matches!(
            member.fit(&set),
            Err(Error::RetrainDivergence { .. })
        ));
    }

    #[test]
    fn test_unknown_species_is_shape_mismatch() {
        let member = PairwiseMember::from_checkpoint(checkpoint(1.0), TrainingConfig::default()).unwrap();
        let s = Structure::new(vec![Atom::new("Xe", [0.0; 3])]);
        assert!(matches!(
            member.predict(&s),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_expected_atoms_enforced() {
        let mut cp = checkpoint(1.0);
        cp.expected_atoms = Some(2);
        let member = PairwiseMember::from_checkpoint(cp, TrainingConfig::default()).unwrap();
        assert!(matches!(
            member.predict(&trimer(1.2)),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_loader_reads_inline_checkpoint() {
        let spec = MemberSpec::inline(
            MemberKind::Pairwise,
            serde_json::json!({
                "epsilon": 0.9,
                "sigma": 1.0,
                "atomic_energies": { "Ar": -0.1 }
            }),
        );
        let member = PairwiseLoader::default().load(&spec).unwrap();
        assert_eq!(member.kind(), MemberKind::Pairwise);
        assert_eq!(member.parameters().trainable_count(), 2);
    }
}
