//! Ensemble aggregation statistics
//!
//! Mean and population standard deviation across members, for energies and
//! elementwise for forces.

use crate::evaluator::{Evaluation, Forces};
use crate::{Error, Result};

/// Arithmetic mean. `NaN` for an empty slice.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (divides by `n`, not `n - 1`).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn population_std(values: &[f64]) -> f64 {
    let m = mean(values);
    let var = values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Aggregated ensemble output.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Mean energy
    pub energy: f64,
    /// Elementwise mean forces
    pub forces: Forces,
    /// Std of member energies
    pub energy_std: f64,
    /// Average over atoms and components of the elementwise force std
    pub force_std: f64,
}

/// Aggregate member evaluations.
///
/// Fewer than two members cannot express disagreement, so both spreads are
/// reported as `+inf`. Non-finite spreads are also mapped to `+inf`.
///
/// # Errors
///
/// [`Error::InvalidInput`] for an empty slice; [`Error::ShapeMismatch`] when
/// members disagree on the atom count.
#[allow(clippy::cast_precision_loss)]
pub fn aggregate(evaluations: &[Evaluation]) -> Result<Aggregate> {
    let first = evaluations
        .first()
        .ok_or_else(|| Error::InvalidInput("cannot aggregate zero members".to_string()))?;
    let n_atoms = first.forces.len();
    if let Some((i, bad)) = evaluations
        .iter()
        .enumerate()
        .find(|(_, e)| e.forces.len() != n_atoms)
    {
        return Err(Error::shape_mismatch(
            format!("member {i}"),
            format!("{n_atoms} force vectors"),
            bad.forces.len(),
        ));
    }

    let energies: Vec<f64> = evaluations.iter().map(|e| e.energy).collect();
    let energy = mean(&energies);

    let mut forces = vec![[0.0; 3]; n_atoms];
    let mut std_sum = 0.0;
    let mut column = Vec::with_capacity(evaluations.len());
    for (atom, out) in forces.iter_mut().enumerate() {
        for k in 0..3 {
            column.clear();
            column.extend(evaluations.iter().map(|e| e.forces[atom][k]));
            out[k] = mean(&column);
            std_sum += population_std(&column);
        }
    }

    if evaluations.len() < 2 {
        return Ok(Aggregate {
            energy,
            forces,
            energy_std: f64::INFINITY,
            force_std: f64::INFINITY,
        });
    }

    let energy_std = finite_or_inf(population_std(&energies));
    let force_std = if n_atoms == 0 {
        0.0
    } else {
        finite_or_inf(std_sum / (3 * n_atoms) as f64)
    };

    Ok(Aggregate {
        energy,
        forces,
        energy_std,
        force_std,
    })
}

fn finite_or_inf(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        f64::INFINITY
    }
}
