//! Steepest-descent relaxation driver

use crate::evaluator::EvaluationResult;
use crate::learner::RelaxationDriver;
use crate::structure::{norm, Structure, Vec3};
use crate::{Error, Result};

/// Moves movable atoms along the forces.
///
/// The displacement is `step_size * F`, scaled down as a whole when any
/// atom would move farther than `maxstep`. Converged when the largest
/// force on a movable atom is below `fmax`.
#[derive(Debug, Clone)]
pub struct SteepestDescent {
    structure: Structure,
    fmax: f64,
    maxstep: f64,
    step_size: f64,
    iterations: usize,
}

impl SteepestDescent {
    /// Driver starting at `structure` with `fmax = 0.05`, `maxstep = 0.2`
    /// and `step_size = 0.1`.
    #[must_use]
    pub const fn new(structure: Structure) -> Self {
        Self {
            structure,
            fmax: 0.05,
            maxstep: 0.2,
            step_size: 0.1,
            iterations: 0,
        }
    }

    /// Force convergence criterion (eV/Å).
    #[must_use]
    pub const fn with_fmax(mut self, fmax: f64) -> Self {
        self.fmax = fmax;
        self
    }

    /// Largest per-atom displacement per step (Å).
    #[must_use]
    pub const fn with_maxstep(mut self, maxstep: f64) -> Self {
        self.maxstep = maxstep;
        self
    }

    /// Displacement per unit force (Å²/eV).
    #[must_use]
    pub const fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    /// Steps taken.
    #[must_use]
    pub const fn iterations(&self) -> usize {
        self.iterations
    }

    /// Convergence criterion.
    #[must_use]
    pub const fn fmax(&self) -> f64 {
        self.fmax
    }

    /// Release the current structure.
    #[must_use]
    pub fn into_structure(self) -> Structure {
        self.structure
    }
}

impl RelaxationDriver for SteepestDescent {
    fn current(&self) -> &Structure {
        &self.structure
    }

    fn is_converged(&self, result: &EvaluationResult) -> bool {
        self.structure.fmax(&result.forces) < self.fmax
    }

    fn advance(&mut self, result: &EvaluationResult) -> Result<()> {
        if result.forces.len() != self.structure.len() {
            return Err(Error::shape_mismatch(
                "steepest descent",
                format!("{} force vectors", self.structure.len()),
                result.forces.len(),
            ));
        }
        let steps: Vec<Vec3> = result
            .forces
            .iter()
            .enumerate()
            .map(|(i, f)| {
                if self.structure.is_fixed(i) {
                    [0.0; 3]
                } else {
                    f.map(|c| c * self.step_size)
                }
            })
            .collect();
        let longest = steps.iter().copied().map(norm).fold(0.0, f64::max);
        let scale = if longest > self.maxstep {
            self.maxstep / longest
        } else {
            1.0
        };

        let positions: Vec<Vec3> = self
            .structure
            .positions()
            .zip(&steps)
            .map(|(p, d)| [p[0] + scale * d[0], p[1] + scale * d[1], p[2] + scale * d[2]])
            .collect();
        self.structure = self.structure.with_positions(&positions)?;
        self.iterations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Evaluation;
    use crate::structure::Atom;

    fn result(forces: Vec<Vec3>) -> EvaluationResult {
        EvaluationResult::oracle(Evaluation::new(0.0, forces))
    }

    #[test]
    fn test_fixed_atoms_do_not_move() {
        let s = Structure::new(vec![Atom::new("Cu", [0.0; 3]), Atom::new("O", [0.0, 0.0, 2.0])])
            .with_fixed([0])
            .unwrap();
        let mut driver = SteepestDescent::new(s);
        driver
            .advance(&result(vec![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]))
            .unwrap();
        let positions: Vec<Vec3> = driver.current().positions().collect();
        assert_eq!(positions[0], [0.0; 3]);
        assert!((positions[1][2] - 2.1).abs() < 1e-12);
        assert_eq!(driver.iterations(), 1);
    }

    #[test]
    fn test_displacement_capped_at_maxstep() {
        let s = Structure::new(vec![Atom::new("H", [0.0; 3]), Atom::new("H", [1.0, 0.0, 0.0])]);
        let mut driver = SteepestDescent::new(s).with_maxstep(0.1);
        driver
            .advance(&result(vec![[-10.0, 0.0, 0.0], [5.0, 0.0, 0.0]]))
            .unwrap();
        let positions: Vec<Vec3> = driver.current().positions().collect();
        // longest step is 1.0, scaled to 0.1; the other keeps its ratio
        assert!((positions[0][0] + 0.1).abs() < 1e-12);
        assert!((positions[1][0] - 1.05).abs() < 1e-12);
    }

    #[test]
    fn test_convergence_ignores_fixed_atoms() {
        let s = Structure::new(vec![Atom::new("Cu", [0.0; 3]), Atom::new("O", [0.0, 0.0, 2.0])])
            .with_fixed([0])
            .unwrap();
        let driver = SteepestDescent::new(s).with_fmax(0.05);
        assert!(driver.is_converged(&result(vec![[3.0, 0.0, 0.0], [0.0, 0.0, 0.01]])));
        assert!(!driver.is_converged(&result(vec![[0.0; 3], [0.0, 0.0, 0.06]])));
    }

    #[test]
    fn test_wrong_force_count() {
        let mut driver = SteepestDescent::new(Structure::new(vec![Atom::new("H", [0.0; 3])]));
        assert!(driver.advance(&result(vec![])).is_err());
    }
}
