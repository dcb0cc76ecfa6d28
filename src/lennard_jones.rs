//! Lennard-Jones reference potential
//!
//! Open-boundary pair potential (periodic images are ignored). Cheap enough
//! to act as the base model of a delta composition, or as a stand-in oracle
//! in demos and tests.
//!
//! ```text
//! V(r) = 4 ε [ (σ/r)^12 - (σ/r)^6 ],   r < cutoff
//! ```

use serde::{Deserialize, Serialize};

use crate::evaluator::{CalculatorDescriptor, Evaluation, Evaluator, Forces};
use crate::structure::Structure;
use crate::{Error, Result};

/// Energy and forces of the unit-ε pair sum (scale by ε to get physical values).
#[derive(Debug, Clone, PartialEq)]
pub struct PairTerms {
    /// Σ 4[(σ/r)^12 - (σ/r)^6]
    pub energy: f64,
    /// Matching forces
    pub forces: Forces,
}

/// Compute the unit-ε Lennard-Jones pair sum.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if two atoms coincide within the cutoff.
pub fn pair_terms(structure: &Structure, sigma: f64, cutoff: f64) -> Result<PairTerms> {
    let positions: Vec<_> = structure.positions().collect();
    let mut energy = 0.0;
    let mut forces = vec![[0.0; 3]; positions.len()];
    let cutoff_sq = cutoff * cutoff;

    for i in 0..positions.len() {
        for j in (i + 1)..positions.len() {
            let d = [
                positions[i][0] - positions[j][0],
                positions[i][1] - positions[j][1],
                positions[i][2] - positions[j][2],
            ];
            let r_sq = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
            if r_sq >= cutoff_sq {
                continue;
            }
            if r_sq == 0.0 {
                return Err(Error::InvalidInput(format!(
                    "atoms {i} and {j} overlap"
                )));
            }
            let s6 = (sigma * sigma / r_sq).powi(3);
            let s12 = s6 * s6;
            energy += 4.0 * (s12 - s6);
            // -dV/dr / r
            let scale = 24.0 * (2.0 * s12 - s6) / r_sq;
            for k in 0..3 {
                forces[i][k] += scale * d[k];
                forces[j][k] -= scale * d[k];
            }
        }
    }

    Ok(PairTerms { energy, forces })
}

/// Lennard-Jones evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LennardJones {
    /// Well depth ε (eV)
    pub epsilon: f64,
    /// Zero-crossing distance σ (Å)
    pub sigma: f64,
    /// Interaction cutoff (Å)
    pub cutoff: f64,
}

impl LennardJones {
    /// Create a potential with a cutoff of 3σ.
    #[must_use]
    pub fn new(epsilon: f64, sigma: f64) -> Self {
        Self {
            epsilon,
            sigma,
            cutoff: 3.0 * sigma,
        }
    }

    /// Override the cutoff.
    #[must_use]
    pub const fn with_cutoff(mut self, cutoff: f64) -> Self {
        self.cutoff = cutoff;
        self
    }
}

impl Evaluator for LennardJones {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        let terms = pair_terms(structure, self.sigma, self.cutoff)?;
        let forces = terms
            .forces
            .into_iter()
            .map(|f| f.map(|c| c * self.epsilon))
            .collect();
        Ok(Evaluation::new(terms.energy * self.epsilon, forces))
    }

    fn descriptor(&self) -> CalculatorDescriptor {
        CalculatorDescriptor::new("LennardJones").with_params(serde_json::json!({
            "epsilon": self.epsilon,
            "sigma": self.sigma,
            "cutoff": self.cutoff,
        }))
    }
}
