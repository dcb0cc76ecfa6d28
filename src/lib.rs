//! # oal-relax: Uncertainty-Gated Active Learning for Structure Relaxation
//!
//! **Version**: 0.1.0
//!
//! oal-relax drives an atomistic relaxation with a cheap surrogate ensemble
//! and calls the expensive oracle only when the ensemble disagrees with
//! itself. Every oracle label is fed back into the ensemble, and every
//! evaluation is recorded in an append-only provenance chain.
//!
//! ## Design Principles
//!
//! - **Oracle value wins**: a step that falls back to the oracle reports the
//!   oracle's result, never the stale prediction
//! - **Budget as backpressure**: an exhausted oracle budget ends the run
//!   cleanly instead of failing it
//! - **No partial ensembles**: predictions and retrains are barriers over
//!   all members; diverging updates are discarded whole
//! - **Chain before durability**: provenance linking is independent of the
//!   sink that stores the records
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use oal_relax::config::LoopConfig;
//! use oal_relax::ensemble::{MemberKind, MemberSpec};
//! use oal_relax::learner::ActiveLearningLoop;
//! use oal_relax::lennard_jones::LennardJones;
//! use oal_relax::relax::SteepestDescent;
//! use oal_relax::structure::{Atom, Structure};
//!
//! let member = |eps: f64| MemberSpec::inline(
//!     MemberKind::Pairwise,
//!     serde_json::json!({ "epsilon": eps, "sigma": 1.0, "atomic_energies": { "Ar": 0.0 } }),
//! );
//! let config = LoopConfig::builder()
//!     .member(member(0.9))
//!     .member(member(1.1))
//!     .uncertainty_threshold(0.05)
//!     .max_oracle_calls(10)
//!     .max_steps(50)
//!     .build()?;
//!
//! let mut al = ActiveLearningLoop::builder(config)
//!     .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
//!     .build()?;
//!
//! let dimer = Structure::new(vec![Atom::new("Ar", [0.0; 3]), Atom::new("Ar", [1.3, 0.0, 0.0])]);
//! let summary = al.run(&mut SteepestDescent::new(dimer).with_maxstep(0.05))?;
//! assert!(summary.oracle_calls <= 10);
//! # Ok::<(), oal_relax::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod delta;
pub mod ensemble;
pub mod error;
pub mod evaluator;
pub mod learner;
pub mod lennard_jones;
pub mod provenance;
pub mod relax;
pub mod structure;
pub mod training;

pub use config::{DeltaMode, LoopConfig, Thresholds};
pub use error::{Error, Result};
pub use evaluator::{Evaluation, EvaluationResult, Evaluator, Provenance};
pub use learner::{ActiveLearningLoop, StepOutcome, TerminationReason};
pub use structure::{Atom, Structure};
