//! Energy/force evaluators
//!
//! Oracles, reference potentials and delta compositions all implement
//! [`Evaluator`]. The loop never depends on a concrete calculator.

use serde::{Deserialize, Serialize};

use crate::structure::{Structure, Vec3};
use crate::{Error, Result};

/// Per-atom force vectors, in atom order.
pub type Forces = Vec<Vec3>;

/// Raw output of one evaluator call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// Total energy (eV)
    pub energy: f64,
    /// Per-atom forces (eV/Å)
    pub forces: Forces,
}

impl Evaluation {
    /// Create an evaluation.
    #[must_use]
    pub const fn new(energy: f64, forces: Forces) -> Self {
        Self { energy, forces }
    }

    /// Check that forces cover every atom and all values are finite.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] on a wrong force count,
    /// [`Error::InvalidInput`] on non-finite values.
    pub fn check_against(&self, structure: &Structure, context: &str) -> Result<()> {
        if self.forces.len() != structure.len() {
            return Err(Error::shape_mismatch(
                context,
                format!("{} force vectors", structure.len()),
                self.forces.len(),
            ));
        }
        if !self.energy.is_finite() || self.forces.iter().flatten().any(|f| !f.is_finite()) {
            return Err(Error::InvalidInput(format!(
                "{context} returned non-finite energy or forces"
            )));
        }
        Ok(())
    }
}

/// Which branch produced an [`EvaluationResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// Accepted ensemble prediction
    #[serde(rename = "ML")]
    Ml,
    /// Ground-truth oracle evaluation
    #[serde(rename = "ORACLE")]
    Oracle,
}

/// Result of one loop step, as returned to the relaxation driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// Total energy (eV)
    pub energy: f64,
    /// Per-atom forces (eV/Å)
    pub forces: Forces,
    /// Branch that produced the values
    pub provenance: Provenance,
    /// Ensemble energy spread, when a prediction was made
    pub energy_uncertainty: Option<f64>,
    /// Ensemble force spread, when a prediction was made
    pub force_uncertainty: Option<f64>,
}

impl EvaluationResult {
    /// Oracle-tagged result without uncertainties.
    #[must_use]
    pub fn oracle(evaluation: Evaluation) -> Self {
        Self {
            energy: evaluation.energy,
            forces: evaluation.forces,
            provenance: Provenance::Oracle,
            energy_uncertainty: None,
            force_uncertainty: None,
        }
    }

    /// ML-tagged result carrying the ensemble's uncertainties.
    #[must_use]
    pub fn ml(evaluation: Evaluation, energy_uncertainty: f64, force_uncertainty: f64) -> Self {
        Self {
            energy: evaluation.energy,
            forces: evaluation.forces,
            provenance: Provenance::Ml,
            energy_uncertainty: Some(energy_uncertainty),
            force_uncertainty: Some(force_uncertainty),
        }
    }

    /// Attach uncertainties (e.g. the stale prediction on an oracle step).
    #[must_use]
    pub const fn with_uncertainties(mut self, energy: f64, force: f64) -> Self {
        self.energy_uncertainty = Some(energy);
        self.force_uncertainty = Some(force);
        self
    }

    /// Energy and forces without the tag.
    #[must_use]
    pub fn evaluation(&self) -> Evaluation {
        Evaluation::new(self.energy, self.forces.clone())
    }
}

/// Serializable description of a calculator, stored with every
/// provenance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculatorDescriptor {
    /// Calculator name
    pub name: String,
    /// Calculator parameters
    #[serde(default)]
    pub params: serde_json::Value,
}

impl CalculatorDescriptor {
    /// Descriptor with no parameters.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Null,
        }
    }

    /// Attach parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Anything that maps a structure to energy and forces.
///
/// Implementations must be safe to call from several threads; calls are
/// synchronous and may be expensive.
pub trait Evaluator: Send + Sync {
    /// Evaluate energy and forces.
    ///
    /// # Errors
    ///
    /// Implementation specific; oracles should report
    /// [`Error::OracleFailure`] when the calculation did not converge.
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation>;

    /// Description recorded in provenance documents.
    fn descriptor(&self) -> CalculatorDescriptor {
        CalculatorDescriptor::new(std::any::type_name::<Self>())
    }
}

impl<T: Evaluator + ?Sized> Evaluator for std::sync::Arc<T> {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        (**self).evaluate(structure)
    }

    fn descriptor(&self) -> CalculatorDescriptor {
        (**self).descriptor()
    }
}
