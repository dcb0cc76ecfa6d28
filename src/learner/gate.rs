//! Uncertainty gate
//!
//! Decides per step whether the ensemble prediction is trusted. A prediction
//! falls back to the oracle when either spread strictly exceeds its
//! threshold, or when a spread is not a number.

use serde::{Deserialize, Serialize};

use crate::config::{LoopConfig, Thresholds};
use crate::ensemble::EnsemblePrediction;
use crate::structure::Structure;

/// Gate outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Use the ensemble prediction
    AcceptMl,
    /// Ask the oracle
    FallbackOracle,
}

/// Decision together with the thresholds it was taken against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    /// The decision
    pub decision: GateDecision,
    /// Energy threshold after relative scaling
    pub energy_threshold: f64,
    /// Force threshold after relative scaling
    pub force_threshold: f64,
    /// Ensemble energy spread
    pub energy_uncertainty: f64,
    /// Ensemble force spread
    pub force_uncertainty: f64,
}

/// Absolute or relative threshold policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UncertaintyGate {
    thresholds: Thresholds,
    relative: bool,
}

impl UncertaintyGate {
    /// Gate with explicit thresholds.
    #[must_use]
    pub const fn new(thresholds: Thresholds, relative: bool) -> Self {
        Self {
            thresholds,
            relative,
        }
    }

    /// Gate described by a loop configuration.
    #[must_use]
    pub const fn from_config(config: &LoopConfig) -> Self {
        Self::new(config.uncertainty_threshold, config.relative_threshold)
    }

    /// Configured thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Whether thresholds scale with the predicted force.
    #[must_use]
    pub const fn is_relative(&self) -> bool {
        self.relative
    }

    /// Thresholds in effect for one prediction.
    ///
    /// In relative mode both cutoffs are multiplied by the largest norm of
    /// the mean predicted force over movable atoms.
    #[must_use]
    pub fn effective_thresholds(
        &self,
        structure: &Structure,
        prediction: &EnsemblePrediction,
    ) -> Thresholds {
        if self.relative {
            self.thresholds.scaled(structure.fmax(&prediction.forces))
        } else {
            self.thresholds
        }
    }

    /// Decide for one prediction.
    #[must_use]
    pub fn decide(&self, structure: &Structure, prediction: &EnsemblePrediction) -> GateReport {
        let t = self.effective_thresholds(structure, prediction);
        let eu = prediction.energy_uncertainty;
        let fu = prediction.force_uncertainty;
        // negated form so NaN falls back
        let trusted = eu <= t.energy && fu <= t.force;
        GateReport {
            decision: if trusted {
                GateDecision::AcceptMl
            } else {
                GateDecision::FallbackOracle
            },
            energy_threshold: t.energy,
            force_threshold: t.force,
            energy_uncertainty: eu,
            force_uncertainty: fu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::Atom;

    fn structure() -> Structure {
        Structure::new(vec![Atom::new("Pt", [0.0; 3]), Atom::new("O", [0.0, 0.0, 2.0])])
    }

    fn prediction(eu: f64, fu: f64, force: f64) -> EnsemblePrediction {
        EnsemblePrediction {
            energy: -10.0,
            forces: vec![[0.0, 0.0, force], [0.0, 0.0, -force]],
            energy_uncertainty: eu,
            force_uncertainty: fu,
        }
    }

    #[test]
    fn test_three_member_scenario_thresholds() {
        let p = prediction(0.163_299_316, 0.0, 0.0);
        let strict = UncertaintyGate::new(Thresholds::uniform(0.1), false);
        let loose = UncertaintyGate::new(Thresholds::uniform(0.2), false);
        assert_eq!(strict.decide(&structure(), &p).decision, GateDecision::FallbackOracle);
        assert_eq!(loose.decide(&structure(), &p).decision, GateDecision::AcceptMl);
    }

    #[test]
    fn test_equal_to_threshold_is_accepted() {
        let gate = UncertaintyGate::new(Thresholds::uniform(0.1), false);
        let report = gate.decide(&structure(), &prediction(0.1, 0.1, 0.0));
        assert_eq!(report.decision, GateDecision::AcceptMl);
    }

    #[test]
    fn test_force_spread_alone_triggers_fallback() {
        let gate = UncertaintyGate::new(Thresholds { energy: 1.0, force: 0.01 }, false);
        let report = gate.decide(&structure(), &prediction(0.0, 0.02, 0.0));
        assert_eq!(report.decision, GateDecision::FallbackOracle);
    }

    #[test]
    fn test_relative_mode_scales_by_fmax() {
        let gate = UncertaintyGate::new(Thresholds::uniform(0.1), true);
        // fmax = 2.0, so effective cutoff is 0.2
        let report = gate.decide(&structure(), &prediction(0.15, 0.15, 2.0));
        assert!((report.energy_threshold - 0.2).abs() < 1e-12);
        assert_eq!(report.decision, GateDecision::AcceptMl);
    }

    #[test]
    fn test_nan_and_infinite_spreads_fall_back() {
        let gate = UncertaintyGate::new(Thresholds::uniform(1e9), false);
        let nan = gate.decide(&structure(), &prediction(f64::NAN, 0.0, 0.0));
        let inf = gate.decide(&structure(), &prediction(0.0, f64::INFINITY, 0.0));
        assert_eq!(nan.decision, GateDecision::FallbackOracle);
        assert_eq!(inf.decision, GateDecision::FallbackOracle);
    }
}
