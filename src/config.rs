//! Run-level configuration
//!
//! Loaded from JSON or assembled with [`LoopConfig::builder`]. Every check
//! happens in [`LoopConfig::validate`], before the loop is constructed.
//!
//! ```rust
//! use oal_relax::config::{DeltaMode, LoopConfig};
//!
//! let config = LoopConfig::from_json_str(r#"{
//!     "uncertainty_threshold": 0.05,
//!     "relative_threshold": true,
//!     "max_oracle_calls": 20,
//!     "retrain_every_n_oracle_calls": 2,
//!     "delta_mode": "sub",
//!     "members": [
//!         { "kind": "pairwise", "inline": { "epsilon": 1.0, "sigma": 1.0, "atomic_energies": { "Ar": 0.0 } } }
//!     ]
//! }"#)?;
//! assert_eq!(config.delta_mode, DeltaMode::Sub);
//! assert_eq!(config.uncertainty_threshold.force, 0.05);
//! # Ok::<(), oal_relax::Error>(())
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::delta::DeltaOp;
use crate::ensemble::MemberSpec;
use crate::{Error, Result};

/// Energy and force uncertainty cutoffs.
///
/// Deserializes from a single number (same cutoff for both) or from
/// `{ "energy": .., "force": .. }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "ThresholdSetting")]
pub struct Thresholds {
    /// Energy std cutoff (eV)
    pub energy: f64,
    /// Force std cutoff (eV/Å)
    pub force: f64,
}

impl Thresholds {
    /// Same cutoff for energy and force.
    #[must_use]
    pub const fn uniform(value: f64) -> Self {
        Self {
            energy: value,
            force: value,
        }
    }

    /// Multiply both cutoffs.
    #[must_use]
    pub fn scaled(self, factor: f64) -> Self {
        Self {
            energy: self.energy * factor,
            force: self.force * factor,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::uniform(0.1)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ThresholdSetting {
    Uniform(f64),
    Split { energy: f64, force: f64 },
}

impl From<ThresholdSetting> for Thresholds {
    fn from(setting: ThresholdSetting) -> Self {
        match setting {
            ThresholdSetting::Uniform(v) => Self::uniform(v),
            ThresholdSetting::Split { energy, force } => Self { energy, force },
        }
    }
}

/// How oracle labels relate to the base evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaMode {
    /// Learn the oracle directly
    #[default]
    None,
    /// Learn `oracle + base`
    Add,
    /// Learn `oracle - base`
    Sub,
}

impl DeltaMode {
    /// Delta operator, if any.
    #[must_use]
    pub const fn op(self) -> Option<DeltaOp> {
        match self {
            Self::None => None,
            Self::Add => Some(DeltaOp::Add),
            Self::Sub => Some(DeltaOp::Sub),
        }
    }
}

/// Gradient-descent settings for trainable members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Full-batch epochs per retrain
    pub epochs: usize,
    /// Step size
    pub learning_rate: f64,
    /// Weight of the energy error
    pub energy_coefficient: f64,
    /// Weight of the force error
    pub force_coefficient: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            learning_rate: 0.01,
            energy_coefficient: 1.0,
            force_coefficient: 1.0,
        }
    }
}

/// Active-learning run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Uncertainty cutoffs
    pub uncertainty_threshold: Thresholds,
    /// Scale cutoffs by the largest predicted per-atom force
    pub relative_threshold: bool,
    /// Oracle-call budget
    pub max_oracle_calls: usize,
    /// Retrain after this many oracle labels
    pub retrain_every_n_oracle_calls: usize,
    /// Ensemble members
    pub members: Vec<MemberSpec>,
    /// Worker threads for per-member work
    pub workers: usize,
    /// Delta labelling mode
    pub delta_mode: DeltaMode,
    /// Confirm ML convergence with one oracle call
    pub verify_on_convergence: bool,
    /// Consult the oracle whenever ML fmax drops below this force (eV/Å),
    /// before the driver itself converges. Meant to be at or above the
    /// driver's own fmax.
    pub verify_threshold: Option<f64>,
    /// Relaxation step limit
    pub max_steps: Option<usize>,
    /// Settings for trainable members
    pub training: TrainingConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            uncertainty_threshold: Thresholds::default(),
            relative_threshold: false,
            max_oracle_calls: 50,
            retrain_every_n_oracle_calls: 1,
            members: Vec::new(),
            workers: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            delta_mode: DeltaMode::None,
            verify_on_convergence: true,
            verify_threshold: None,
            max_steps: None,
            training: TrainingConfig::default(),
        }
    }
}

impl LoopConfig {
    /// Start a builder from defaults.
    #[must_use]
    pub fn builder() -> LoopConfigBuilder {
        LoopConfigBuilder::default()
    }

    /// Parse and validate JSON.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for malformed or invalid settings.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("invalid loop config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// IO errors, plus everything [`LoopConfig::from_json_str`] rejects.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check settings that cannot be satisfied.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        self.validate_settings()?;
        if self.members.is_empty() {
            return Err(Error::Configuration(
                "members must list at least one ensemble member".to_string(),
            ));
        }
        Ok(())
    }

    /// Everything [`LoopConfig::validate`] checks except the member list,
    /// for runs given a prebuilt ensemble.
    pub(crate) fn validate_settings(&self) -> Result<()> {
        let t = self.uncertainty_threshold;
        if !(t.energy.is_finite() && t.energy >= 0.0 && t.force.is_finite() && t.force >= 0.0) {
            return Err(Error::Configuration(format!(
                "uncertainty_threshold must be finite and non-negative (energy = {}, force = {})",
                t.energy, t.force
            )));
        }
        if self.retrain_every_n_oracle_calls == 0 {
            return Err(Error::Configuration(
                "retrain_every_n_oracle_calls must be at least 1".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Configuration("workers must be at least 1".to_string()));
        }
        if let Some(v) = self.verify_threshold {
            if !(v.is_finite() && v > 0.0) {
                return Err(Error::Configuration(format!(
                    "verify_threshold must be a positive force, got {v}"
                )));
            }
        }
        if self.max_steps == Some(0) {
            return Err(Error::Configuration("max_steps must be at least 1".to_string()));
        }
        let tr = &self.training;
        if !(tr.learning_rate.is_finite() && tr.learning_rate > 0.0) {
            return Err(Error::Configuration(
                "training.learning_rate must be positive".to_string(),
            ));
        }
        if tr.energy_coefficient < 0.0 || tr.force_coefficient < 0.0 {
            return Err(Error::Configuration(
                "training coefficients must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`LoopConfig`].
#[derive(Debug, Default)]
pub struct LoopConfigBuilder {
    config: LoopConfig,
}

impl LoopConfigBuilder {
    /// Same cutoff for energy and force.
    #[must_use]
    pub const fn uncertainty_threshold(mut self, value: f64) -> Self {
        self.config.uncertainty_threshold = Thresholds::uniform(value);
        self
    }

    /// Separate cutoffs.
    #[must_use]
    pub const fn thresholds(mut self, thresholds: Thresholds) -> Self {
        self.config.uncertainty_threshold = thresholds;
        self
    }

    /// Relative threshold mode.
    #[must_use]
    pub const fn relative_threshold(mut self, relative: bool) -> Self {
        self.config.relative_threshold = relative;
        self
    }

    /// Oracle-call budget.
    #[must_use]
    pub const fn max_oracle_calls(mut self, calls: usize) -> Self {
        self.config.max_oracle_calls = calls;
        self
    }

    /// Retrain cadence.
    #[must_use]
    pub const fn retrain_every(mut self, n: usize) -> Self {
        self.config.retrain_every_n_oracle_calls = n;
        self
    }

    /// Add a member.
    #[must_use]
    pub fn member(mut self, spec: MemberSpec) -> Self {
        self.config.members.push(spec);
        self
    }

    /// Worker pool size.
    #[must_use]
    pub const fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Delta labelling mode.
    #[must_use]
    pub const fn delta_mode(mut self, mode: DeltaMode) -> Self {
        self.config.delta_mode = mode;
        self
    }

    /// Oracle confirmation of ML convergence.
    #[must_use]
    pub const fn verify_on_convergence(mut self, verify: bool) -> Self {
        self.config.verify_on_convergence = verify;
        self
    }

    /// Early-verification force threshold.
    #[must_use]
    pub const fn verify_threshold(mut self, fmax: f64) -> Self {
        self.config.verify_threshold = Some(fmax);
        self
    }

    /// Step limit.
    #[must_use]
    pub const fn max_steps(mut self, steps: usize) -> Self {
        self.config.max_steps = Some(steps);
        self
    }

    /// Member training settings.
    #[must_use]
    pub fn training(mut self, training: TrainingConfig) -> Self {
        self.config.training = training;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Everything [`LoopConfig::validate`] rejects.
    pub fn build(self) -> Result<LoopConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::MemberKind;

    fn member() -> MemberSpec {
        MemberSpec::inline(MemberKind::Pairwise, serde_json::json!({}))
    }

    #[test]
    fn test_split_thresholds_from_json() {
        let config = LoopConfig::from_json_str(
            r#"{ "uncertainty_threshold": { "energy": 0.2, "force": 0.05 },
                 "members": [ { "kind": "pairwise", "inline": {} } ] }"#,
        )
        .unwrap();
        assert_eq!(config.uncertainty_threshold.energy, 0.2);
        assert_eq!(config.uncertainty_threshold.force, 0.05);
        assert!(config.verify_on_convergence);
    }

    #[test]
    fn test_negative_budget_rejected() {
        let err = LoopConfig::from_json_str(
            r#"{ "max_oracle_calls": -1, "members": [ { "kind": "pairwise", "inline": {} } ] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unknown_member_kind_rejected() {
        let err = LoopConfig::from_json_str(r#"{ "members": [ { "kind": "mace", "inline": {} } ] }"#)
            .unwrap_err();
        assert!(err.to_string().contains("mace"));
    }

    #[test]
    fn test_zero_cadence_rejected() {
        assert!(LoopConfig::builder()
            .member(member())
            .retrain_every(0)
            .build()
            .is_err());
    }

    #[test]
    fn test_negative_threshold_rejected() {
        assert!(LoopConfig::builder()
            .member(member())
            .uncertainty_threshold(-0.1)
            .build()
            .is_err());
    }

    #[test]
    fn test_verify_threshold_must_be_positive() {
        for bad in [0.0, -0.05, f64::NAN, f64::INFINITY] {
            let err = LoopConfig::builder()
                .member(member())
                .verify_threshold(bad)
                .build()
                .unwrap_err();
            assert!(err.to_string().contains("verify_threshold"));
        }
        let config = LoopConfig::from_json_str(
            r#"{ "verify_threshold": 0.05, "members": [ { "kind": "pairwise", "inline": {} } ] }"#,
        )
        .unwrap();
        assert_eq!(config.verify_threshold, Some(0.05));
        assert_eq!(LoopConfig::default().verify_threshold, None);
    }

    #[test]
    fn test_missing_members_rejected() {
        assert!(LoopConfig::builder().build().is_err());
    }

    #[test]
    fn test_round_trip_through_json() {
        let config = LoopConfig::builder()
            .member(member())
            .delta_mode(DeltaMode::Add)
            .max_steps(10)
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(LoopConfig::from_json_str(&json).unwrap(), config);
    }
}
