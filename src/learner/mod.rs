//! Uncertainty-gated active-learning loop
//!
//! One control thread drives the state machine below. Each step asks the
//! ensemble for a prediction, lets the [`UncertaintyGate`] decide whether to
//! trust it, and otherwise pays one oracle call from the [`Budget`] and
//! grows the [`TrainingSet`].
//!
//! ```text
//!                    ┌──────────────> ACCEPT_ML ──────────────┐
//! AWAITING ─> EVALUATING                                      ├─> record ─> AWAITING
//!                    └─> FALLBACK_ORACLE ─> (RETRAINING) ─────┘
//!                              │
//!                              └─ budget exhausted ─> TERMINATED
//! ```
//!
//! Retraining is deferred: an oracle step that hits the retrain cadence
//! leaves the loop in [`LoopState::Retraining`], and the retrain runs at the
//! start of the next prediction (or on [`ActiveLearningLoop::flush_retrain`]).
//! The oracle result of the current step is available before that.

mod budget;
mod driver;
mod gate;

pub use budget::Budget;
pub use driver::{CancelHandle, RelaxationDriver};
pub use gate::{GateDecision, GateReport, UncertaintyGate};

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::LoopConfig;
use crate::delta::DeltaCalculator;
use crate::ensemble::{EnsemblePotential, EnsemblePrediction, MemberRegistry, RetrainReport};
use crate::evaluator::{CalculatorDescriptor, Evaluation, EvaluationResult, Evaluator, Provenance};
use crate::provenance::{
    ExtraFields, MemorySink, ProvenanceLog, ProvenanceRecord, RecordHandle, RecordSink,
};
use crate::structure::Structure;
use crate::training::{TrainingEntry, TrainingSet};
use crate::{Error, Result};

/// Why a run stopped. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The oracle was needed but no calls were left
    BudgetExhausted,
    /// The driver reported convergence (verified if configured)
    Converged,
    /// `max_steps` reached
    StepLimit,
    /// Cancelled through a [`CancelHandle`]
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BudgetExhausted => "budget_exhausted",
            Self::Converged => "converged",
            Self::StepLimit => "step_limit",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Loop state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Ready for the next structure
    AwaitingStructure,
    /// Ensemble prediction in progress
    Evaluating,
    /// Gate trusted the prediction
    AcceptMl,
    /// Oracle call in progress
    FallbackOracle,
    /// Retrain pending or running
    Retraining,
    /// Run over
    Terminated(TerminationReason),
}

impl LoopState {
    /// Whether the run is over.
    #[must_use]
    pub const fn is_terminated(self) -> bool {
        matches!(self, Self::Terminated(_))
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The step produced energy and forces
    Evaluated(EvaluationResult),
    /// The run is over; nothing was evaluated
    Terminated(TerminationReason),
}

impl StepOutcome {
    /// The evaluation, if any.
    #[must_use]
    pub const fn result(&self) -> Option<&EvaluationResult> {
        match self {
            Self::Evaluated(result) => Some(result),
            Self::Terminated(_) => None,
        }
    }

    /// The termination reason, if the run is over.
    #[must_use]
    pub const fn termination(&self) -> Option<TerminationReason> {
        match self {
            Self::Evaluated(_) => None,
            Self::Terminated(reason) => Some(*reason),
        }
    }
}

/// Totals for a finished [`ActiveLearningLoop::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Run identifier of the provenance chain
    pub run_id: String,
    /// Why the run stopped
    pub reason: TerminationReason,
    /// Completed (logged) steps, verification included
    pub steps: usize,
    /// Oracle calls charged
    pub oracle_calls: usize,
    /// Steps answered by the ensemble
    pub ml_accepts: usize,
    /// Retrain cycles run
    pub retrain_cycles: u64,
    /// Last reported result
    pub final_result: Option<EvaluationResult>,
}

/// Oracle wrapper that reports every failure, including unusable output,
/// as [`Error::OracleFailure`].
struct OracleCall(Arc<dyn Evaluator>);

impl Evaluator for OracleCall {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        let evaluation = self.0.evaluate(structure).map_err(|e| match e {
            Error::OracleFailure(_) => e,
            other => Error::OracleFailure(other.to_string()),
        })?;
        evaluation
            .check_against(structure, "oracle")
            .map_err(|e| Error::OracleFailure(e.to_string()))?;
        Ok(evaluation)
    }

    fn descriptor(&self) -> CalculatorDescriptor {
        self.0.descriptor()
    }
}

/// Turns oracle output into training labels and predictions back into
/// oracle-scale values.
enum Labeller {
    Direct(OracleCall),
    Delta(DeltaCalculator),
}

impl Labeller {
    /// `(oracle value, training label)`
    fn label(&self, structure: &Structure) -> Result<(Evaluation, Evaluation)> {
        match self {
            Self::Direct(oracle) => {
                let evaluation = oracle.evaluate(structure)?;
                Ok((evaluation.clone(), evaluation))
            }
            Self::Delta(calc) => {
                let parts = calc.evaluate_parts(structure)?;
                Ok((parts.lhs, parts.combined))
            }
        }
    }

    /// Label for an oracle value obtained outside the run (seed data).
    fn relabel(&self, structure: &Structure, absolute: Evaluation) -> Result<Evaluation> {
        match self {
            Self::Direct(_) => Ok(absolute),
            Self::Delta(calc) => {
                let base = Self::base_evaluation(calc, structure)?;
                calc.op().combine(&absolute, &base)
            }
        }
    }

    /// Oracle-scale value for a prediction on the label scale.
    fn absolute(&self, structure: &Structure, predicted: Evaluation) -> Result<Evaluation> {
        match self {
            Self::Direct(_) => Ok(predicted),
            Self::Delta(calc) => {
                let base = Self::base_evaluation(calc, structure)?;
                calc.op().inverse().combine(&predicted, &base)
            }
        }
    }

    fn base_evaluation(calc: &DeltaCalculator, structure: &Structure) -> Result<Evaluation> {
        let base = calc.rhs().evaluate(structure)?;
        base.check_against(structure, "base evaluator")?;
        Ok(base)
    }

    fn oracle_descriptor(&self) -> CalculatorDescriptor {
        match self {
            Self::Direct(oracle) => oracle.descriptor(),
            Self::Delta(calc) => calc.lhs().descriptor(),
        }
    }

    fn base_descriptor(&self) -> Option<CalculatorDescriptor> {
        match self {
            Self::Direct(_) => None,
            Self::Delta(calc) => Some(calc.rhs().descriptor()),
        }
    }
}

/// Builder for [`ActiveLearningLoop`].
pub struct LoopBuilder {
    config: LoopConfig,
    oracle: Option<Arc<dyn Evaluator>>,
    base: Option<Arc<dyn Evaluator>>,
    ensemble: Option<EnsemblePotential>,
    registry: Option<MemberRegistry>,
    sink: Option<Arc<dyn RecordSink>>,
    run_id: Option<String>,
    resume: Option<(RecordHandle, ProvenanceRecord)>,
    seed: Vec<TrainingEntry>,
    code_revision: Option<String>,
}

impl LoopBuilder {
    /// Ground-truth evaluator (required).
    #[must_use]
    pub fn oracle(mut self, oracle: Arc<dyn Evaluator>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Reference evaluator for delta labelling.
    #[must_use]
    pub fn base(mut self, base: Arc<dyn Evaluator>) -> Self {
        self.base = Some(base);
        self
    }

    /// Use an already constructed ensemble instead of `config.members`.
    #[must_use]
    pub fn ensemble(mut self, ensemble: EnsemblePotential) -> Self {
        self.ensemble = Some(ensemble);
        self
    }

    /// Registry used to load `config.members` (defaults to the built-in one).
    #[must_use]
    pub fn registry(mut self, registry: MemberRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Provenance sink (defaults to a [`MemorySink`]).
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Fixed run identifier (defaults to a UUID v4).
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Continue an existing provenance chain after `tail`.
    #[must_use]
    pub fn resume(mut self, tail_handle: RecordHandle, tail: ProvenanceRecord) -> Self {
        self.resume = Some((tail_handle, tail));
        self
    }

    /// Oracle-labelled data available before the run. Labels are given on
    /// the oracle's absolute scale and do not consume budget.
    #[must_use]
    pub fn seed(mut self, entries: impl IntoIterator<Item = TrainingEntry>) -> Self {
        self.seed.extend(entries);
        self
    }

    /// Code revision stamped into the provenance parameters.
    #[must_use]
    pub fn code_revision(mut self, revision: impl Into<String>) -> Self {
        self.code_revision = Some(revision.into());
        self
    }

    /// Validate everything and construct the loop.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for invalid settings, a missing oracle, or a
    /// delta mode without a base evaluator (and vice versa); member loading
    /// errors; [`Error::ChainCorruption`] for a resume tail of another run.
    pub fn build(self) -> Result<ActiveLearningLoop> {
        if self.ensemble.is_some() {
            self.config.validate_settings()?;
        } else {
            self.config.validate()?;
        }

        let oracle = self
            .oracle
            .ok_or_else(|| Error::Configuration("an oracle evaluator is required".to_string()))?;
        let labeller = match (self.config.delta_mode.op(), self.base) {
            (None, None) => Labeller::Direct(OracleCall(oracle)),
            (Some(op), Some(base)) => {
                Labeller::Delta(DeltaCalculator::new(Arc::new(OracleCall(oracle)), base, op))
            }
            (Some(op), None) => {
                return Err(Error::Configuration(format!(
                    "delta_mode = {op} requires a base evaluator"
                )))
            }
            (None, Some(_)) => {
                return Err(Error::Configuration(
                    "a base evaluator was supplied but delta_mode is none".to_string(),
                ))
            }
        };

        let ensemble = match self.ensemble {
            Some(ensemble) => ensemble,
            None => {
                let registry = self.registry.unwrap_or_else(|| {
                    MemberRegistry::with_builtin_training(self.config.training.clone())
                });
                EnsemblePotential::from_specs(&self.config.members, &registry, self.config.workers)?
            }
        };

        let mut training = TrainingSet::new();
        let seeds = self
            .seed
            .into_iter()
            .map(|entry| {
                if entry.result.provenance != Provenance::Oracle {
                    return Err(Error::InvalidInput(
                        "seed data must be ORACLE-labelled".to_string(),
                    ));
                }
                let label = labeller.relabel(&entry.structure, entry.result.evaluation())?;
                Ok(TrainingEntry {
                    structure: entry.structure,
                    result: EvaluationResult::oracle(label),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        training.seed(seeds)?;

        let params = json!({
            "learner": &self.config,
            "ml_potential": ensemble.descriptor(),
            "parent_calc": labeller.oracle_descriptor(),
            "base_calc": labeller.base_descriptor(),
            "code_revision": self.code_revision,
        });
        let sink = self.sink.unwrap_or_else(|| Arc::new(MemorySink::new()));
        let log = match (self.resume, self.run_id) {
            (Some((handle, tail)), run_id) => {
                let run_id = run_id.unwrap_or_else(|| tail.run_id.clone());
                ProvenanceLog::resume(sink, run_id, params, handle, &tail)?
            }
            (None, Some(run_id)) => ProvenanceLog::with_run_id(sink, run_id, params),
            (None, None) => ProvenanceLog::new(sink, params),
        };

        info!(
            run_id = %log.run_id(),
            members = ensemble.len(),
            max_oracle_calls = self.config.max_oracle_calls,
            delta_mode = ?self.config.delta_mode,
            seeded = training.seeded(),
            "active-learning loop ready"
        );

        Ok(ActiveLearningLoop {
            gate: UncertaintyGate::from_config(&self.config),
            budget: Budget::new(self.config.max_oracle_calls),
            retrain_due: !training.is_empty(),
            config: self.config,
            ensemble,
            labeller,
            training,
            log,
            state: LoopState::AwaitingStructure,
            layout: None,
            pending_labels: 0,
            steps: 0,
            ml_accepts: 0,
            cancel: CancelHandle::new(),
        })
    }
}

/// The active-learning loop for one run.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use oal_relax::config::LoopConfig;
/// use oal_relax::ensemble::{MemberKind, MemberSpec};
/// use oal_relax::learner::{ActiveLearningLoop, StepOutcome, TerminationReason};
/// use oal_relax::lennard_jones::LennardJones;
/// use oal_relax::structure::{Atom, Structure};
///
/// let member = MemberSpec::inline(
///     MemberKind::Pairwise,
///     serde_json::json!({ "epsilon": 0.8, "sigma": 1.0, "atomic_energies": { "Ar": 0.0 } }),
/// );
/// let config = LoopConfig::builder().member(member).max_oracle_calls(0).build()?;
/// let mut al = ActiveLearningLoop::builder(config)
///     .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
///     .build()?;
///
/// let dimer = Structure::new(vec![Atom::new("Ar", [0.0; 3]), Atom::new("Ar", [1.2, 0.0, 0.0])]);
/// // a single member is never trusted and there is no budget
/// let outcome = al.step(&dimer)?;
/// assert_eq!(outcome, StepOutcome::Terminated(TerminationReason::BudgetExhausted));
/// # Ok::<(), oal_relax::Error>(())
/// ```
pub struct ActiveLearningLoop {
    config: LoopConfig,
    ensemble: EnsemblePotential,
    labeller: Labeller,
    gate: UncertaintyGate,
    budget: Budget,
    training: TrainingSet,
    log: ProvenanceLog,
    state: LoopState,
    layout: Option<Structure>,
    pending_labels: usize,
    retrain_due: bool,
    steps: usize,
    ml_accepts: usize,
    cancel: CancelHandle,
}

impl ActiveLearningLoop {
    /// Start building a loop for `config`.
    #[must_use]
    pub fn builder(config: LoopConfig) -> LoopBuilder {
        LoopBuilder {
            config,
            oracle: None,
            base: None,
            ensemble: None,
            registry: None,
            sink: None,
            run_id: None,
            resume: None,
            seed: Vec::new(),
            code_revision: None,
        }
    }

    /// Evaluate one candidate structure.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for a structure whose layout differs from
    /// the first one seen or that a member rejects; [`Error::OracleFailure`]
    /// when the oracle fails (nothing is charged or appended); retrain and
    /// sink errors.
    pub fn step(&mut self, structure: &Structure) -> Result<StepOutcome> {
        self.step_with(structure, ExtraFields::new())
    }

    /// [`step`](Self::step) with extra fields for the provenance record.
    ///
    /// # Errors
    ///
    /// See [`step`](Self::step).
    pub fn step_with(&mut self, structure: &Structure, extras: ExtraFields) -> Result<StepOutcome> {
        if let Some(reason) = self.pre_step_termination(true) {
            return Ok(StepOutcome::Terminated(reason));
        }
        self.check_layout(structure)?;
        self.flush_retrain()?;

        self.enter(LoopState::Evaluating);
        let prediction = match self.ensemble.predict(structure) {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        let report = self.gate.decide(structure, &prediction);
        info!(
            step = self.steps,
            decision = ?report.decision,
            energy_uncertainty = report.energy_uncertainty,
            force_uncertainty = report.force_uncertainty,
            energy_threshold = report.energy_threshold,
            force_threshold = report.force_threshold,
            "gate decision"
        );

        match report.decision {
            GateDecision::AcceptMl => self.accept_ml(structure, &prediction, &report, extras),
            GateDecision::FallbackOracle => self.fallback_oracle(structure, Some(&report), extras, false),
        }
    }

    /// Force one oracle evaluation regardless of the gate, e.g. to confirm
    /// convergence reached on ML forces.
    ///
    /// # Errors
    ///
    /// As for [`step`](Self::step).
    pub fn verify(&mut self, structure: &Structure) -> Result<StepOutcome> {
        if let Some(reason) = self.pre_step_termination(false) {
            return Ok(StepOutcome::Terminated(reason));
        }
        self.check_layout(structure)?;
        self.fallback_oracle(structure, None, ExtraFields::new(), true)
    }

    /// Drive a relaxation until it converges, the budget runs out, the step
    /// limit is hit or the run is cancelled.
    ///
    /// With `verify_on_convergence`, convergence on ML forces is confirmed by
    /// one oracle call; if the oracle disagrees, its result is handed to the
    /// driver and the run continues. With `verify_threshold`, the same oracle
    /// check happens on every ML step whose fmax is already below it.
    ///
    /// # Errors
    ///
    /// Step errors and driver errors; the run can be resumed by calling
    /// `run` again.
    pub fn run<D: RelaxationDriver + ?Sized>(&mut self, driver: &mut D) -> Result<RunSummary> {
        let mut last = None;
        loop {
            let structure = driver.current().clone();
            let mut result = match self.step(&structure)? {
                StepOutcome::Evaluated(result) => result,
                StepOutcome::Terminated(reason) => return Ok(self.summary(reason, last)),
            };

            let converged = driver.is_converged(&result);
            let consult = result.provenance == Provenance::Ml
                && if converged {
                    self.config.verify_on_convergence
                } else {
                    self.in_verify_band(&structure, &result)
                };
            if consult {
                if converged {
                    info!(step = self.steps, "converged on ML forces, verifying with the oracle");
                } else {
                    info!(step = self.steps, "ML fmax below verify_threshold, consulting the oracle");
                }
                match self.verify(&structure)? {
                    StepOutcome::Terminated(reason) => return Ok(self.summary(reason, Some(result))),
                    StepOutcome::Evaluated(confirmed) => {
                        if driver.is_converged(&confirmed) {
                            let reason = self.terminate(TerminationReason::Converged);
                            return Ok(self.summary(reason, Some(confirmed)));
                        }
                        if converged {
                            info!(step = self.steps, "oracle rejected convergence, continuing");
                        }
                        result = confirmed;
                    }
                }
            } else if converged {
                let reason = self.terminate(TerminationReason::Converged);
                return Ok(self.summary(reason, Some(result)));
            }

            driver.advance(&result)?;
            last = Some(result);
        }
    }

    /// Run a pending retrain now.
    ///
    /// Returns `None` when no retrain was due.
    ///
    /// # Errors
    ///
    /// Non-divergence retrain errors; the retrain stays pending.
    pub fn flush_retrain(&mut self) -> Result<Option<RetrainReport>> {
        if !self.retrain_due {
            return Ok(None);
        }
        self.enter(LoopState::Retraining);
        let report = match self.ensemble.retrain(&self.training) {
            Ok(report) => report,
            Err(e) => return self.fail(e),
        };
        self.retrain_due = false;
        self.pending_labels = 0;
        self.enter(LoopState::AwaitingStructure);

        if report.is_degraded() {
            warn!(
                diverged = ?report.diverged,
                updated = report.updated,
                "degraded retrain cycle, diverged members keep previous weights"
            );
        } else {
            info!(
                updated = report.updated,
                entries = self.training.len(),
                "ensemble retrained"
            );
        }
        Ok(Some(report))
    }

    /// Stop the run; later steps return [`StepOutcome::Terminated`].
    pub fn cancel(&mut self) {
        self.terminate(TerminationReason::Cancelled);
    }

    /// Handle that cancels the run from elsewhere, taking effect before the
    /// next step.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> LoopState {
        self.state
    }

    /// Oracle budget.
    #[must_use]
    pub const fn budget(&self) -> &Budget {
        &self.budget
    }

    /// Training data (labels on the learned scale).
    #[must_use]
    pub const fn training_set(&self) -> &TrainingSet {
        &self.training
    }

    /// The ensemble.
    #[must_use]
    pub const fn ensemble(&self) -> &EnsemblePotential {
        &self.ensemble
    }

    /// Configuration the loop was built with.
    #[must_use]
    pub const fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Provenance chain.
    #[must_use]
    pub const fn provenance(&self) -> &ProvenanceLog {
        &self.log
    }

    /// Run identifier.
    #[must_use]
    pub fn run_id(&self) -> &str {
        self.log.run_id()
    }

    /// Completed steps.
    #[must_use]
    pub const fn steps(&self) -> usize {
        self.steps
    }

    /// Steps answered by the ensemble.
    #[must_use]
    pub const fn ml_accepts(&self) -> usize {
        self.ml_accepts
    }

    /// Whether a retrain is queued.
    #[must_use]
    pub const fn retrain_pending(&self) -> bool {
        self.retrain_due
    }

    fn accept_ml(
        &mut self,
        structure: &Structure,
        prediction: &EnsemblePrediction,
        report: &GateReport,
        extras: ExtraFields,
    ) -> Result<StepOutcome> {
        self.enter(LoopState::AcceptMl);
        let absolute = match self.labeller.absolute(structure, prediction.evaluation()) {
            Ok(evaluation) => evaluation,
            Err(e) => return self.fail(e),
        };
        let result = EvaluationResult::ml(
            absolute,
            prediction.energy_uncertainty,
            prediction.force_uncertainty,
        );
        self.commit(structure, &result, Some(report), false, extras)?;
        self.ml_accepts += 1;
        Ok(StepOutcome::Evaluated(result))
    }

    fn fallback_oracle(
        &mut self,
        structure: &Structure,
        report: Option<&GateReport>,
        extras: ExtraFields,
        verification: bool,
    ) -> Result<StepOutcome> {
        self.enter(LoopState::FallbackOracle);
        if self.budget.is_exhausted() {
            info!(
                consumed = self.budget.consumed(),
                limit = self.budget.limit(),
                "oracle budget exhausted"
            );
            let reason = self.terminate(TerminationReason::BudgetExhausted);
            return Ok(StepOutcome::Terminated(reason));
        }

        debug!(step = self.steps, verification, "invoking oracle");
        let (absolute, label) = match self.labeller.label(structure) {
            Ok(values) => values,
            Err(e) => {
                warn!(step = self.steps, error = %e, "oracle evaluation failed");
                return self.fail(e);
            }
        };
        if let Err(e) = self
            .training
            .push(structure.clone(), EvaluationResult::oracle(label))
        {
            return self.fail(e);
        }
        let charged = self.budget.charge();
        debug_assert!(charged, "budget is checked before the oracle call");
        self.pending_labels += 1;
        if self.pending_labels >= self.config.retrain_every_n_oracle_calls {
            self.retrain_due = true;
        }

        let mut result = EvaluationResult::oracle(absolute);
        if let Some(r) = report {
            result = result.with_uncertainties(r.energy_uncertainty, r.force_uncertainty);
        }
        self.commit(structure, &result, report, verification, extras)?;
        if self.retrain_due {
            self.enter(LoopState::Retraining);
        }
        Ok(StepOutcome::Evaluated(result))
    }

    fn commit(
        &mut self,
        structure: &Structure,
        result: &EvaluationResult,
        report: Option<&GateReport>,
        verification: bool,
        extras: ExtraFields,
    ) -> Result<()> {
        let mut fields = ExtraFields::new()
            .insert("step", &self.steps)
            .insert("oracle_calls", &self.budget.consumed())
            .insert("training_set_size", &self.training.len());
        if let Some(report) = report {
            fields = fields.insert("gate", report);
        }
        if verification {
            fields = fields.insert("verification", &true);
        }
        if let Err(e) = self.log.append(structure, result, extras.merged(fields)) {
            return self.fail(e);
        }
        self.steps += 1;
        self.enter(LoopState::AwaitingStructure);
        Ok(())
    }

    fn in_verify_band(&self, structure: &Structure, result: &EvaluationResult) -> bool {
        self.config
            .verify_threshold
            .is_some_and(|limit| structure.fmax(&result.forces) < limit)
    }

    fn pre_step_termination(&mut self, enforce_step_limit: bool) -> Option<TerminationReason> {
        if let LoopState::Terminated(reason) = self.state {
            return Some(reason);
        }
        if self.cancel.is_cancelled() {
            return Some(self.terminate(TerminationReason::Cancelled));
        }
        if enforce_step_limit && self.config.max_steps.is_some_and(|max| self.steps >= max) {
            return Some(self.terminate(TerminationReason::StepLimit));
        }
        None
    }

    fn check_layout(&mut self, structure: &Structure) -> Result<()> {
        match &self.layout {
            Some(pinned) if !pinned.same_layout(structure) => Err(Error::shape_mismatch(
                "run layout",
                format!("{} atoms ({})", pinned.len(), pinned.chemical_formula()),
                format!("{} atoms ({})", structure.len(), structure.chemical_formula()),
            )),
            Some(_) => Ok(()),
            None => {
                self.layout = Some(structure.clone());
                Ok(())
            }
        }
    }

    fn terminate(&mut self, reason: TerminationReason) -> TerminationReason {
        if let LoopState::Terminated(previous) = self.state {
            return previous;
        }
        self.state = LoopState::Terminated(reason);
        info!(
            run_id = %self.log.run_id(),
            %reason,
            steps = self.steps,
            oracle_calls = self.budget.consumed(),
            "run terminated"
        );
        reason
    }

    fn enter(&mut self, state: LoopState) {
        if !self.state.is_terminated() {
            self.state = state;
        }
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        let next = if self.retrain_due {
            LoopState::Retraining
        } else {
            LoopState::AwaitingStructure
        };
        self.enter(next);
        Err(error)
    }

    fn summary(&self, reason: TerminationReason, final_result: Option<EvaluationResult>) -> RunSummary {
        RunSummary {
            run_id: self.log.run_id().to_string(),
            reason,
            steps: self.steps,
            oracle_calls: self.budget.consumed(),
            ml_accepts: self.ml_accepts,
            retrain_cycles: self.ensemble.retrain_cycles(),
            final_result,
        }
    }
}

impl fmt::Debug for ActiveLearningLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveLearningLoop")
            .field("run_id", &self.log.run_id())
            .field("state", &self.state)
            .field("steps", &self.steps)
            .field("budget", &self.budget)
            .field("training_set", &self.training.len())
            .field("ensemble", &self.ensemble)
            .finish_non_exhaustive()
    }
}
