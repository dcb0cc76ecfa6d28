//! Delta-Learning Relaxation Demo
//!
//! The ensemble learns only the correction between an expensive oracle and
//! a cheap reference potential (`oracle - base`). Accepted ML steps report
//! the recomposed absolute value `prediction + base`.
//!
//! The oracle itself is a composition: a Lennard-Jones core plus a weak
//! long-range pair term, assembled with a `CompositionPlan`.
//!
//! Run with: cargo run --example delta_relaxation

use std::sync::Arc;

use oal_relax::config::{DeltaMode, LoopConfig, TrainingConfig};
use oal_relax::delta::{CompositionPlan, DeltaOp};
use oal_relax::ensemble::{MemberKind, MemberSpec};
use oal_relax::evaluator::Evaluator;
use oal_relax::learner::ActiveLearningLoop;
use oal_relax::lennard_jones::LennardJones;
use oal_relax::provenance::{verify_chain, MemorySink};
use oal_relax::relax::SteepestDescent;
use oal_relax::structure::{Atom, Structure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn correction_member(epsilon: f64) -> MemberSpec {
    MemberSpec::inline(
        MemberKind::Pairwise,
        serde_json::json!({ "epsilon": epsilon, "sigma": 1.0, "atomic_energies": { "Ar": 0.0 } }),
    )
}

/// Small planar trimer near equilibrium
fn trimer(rng: &mut StdRng) -> Structure {
    let r = 1.12;
    let corners = [[0.0, 0.0, 0.0], [r, 0.0, 0.0], [r / 2.0, r * 0.866, 0.0]];
    Structure::new(
        corners
            .iter()
            .map(|c| Atom::new("Ar", [0, 1, 2].map(|k| c[k] + rng.gen_range(-0.1..0.1))))
            .collect(),
    )
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== oal-relax: Delta-Learning Relaxation ===\n");

    let plan = CompositionPlan::new()
        .leaf("core", Arc::new(LennardJones::new(1.0, 1.0)))
        .leaf("tail", Arc::new(LennardJones::new(0.05, 1.4)))
        .delta("oracle", "core", "tail", DeltaOp::Add);
    let oracle = plan.build("oracle")?;
    let base = Arc::new(LennardJones::new(0.9, 1.0));
    println!("1. Oracle: {}", serde_json::to_string(&oracle.descriptor())?);
    println!("   Base:   LennardJones(epsilon = 0.9, sigma = 1.0)");

    let config = LoopConfig::builder()
        .member(correction_member(0.05))
        .member(correction_member(0.1))
        .member(correction_member(0.15))
        .delta_mode(DeltaMode::Sub)
        .uncertainty_threshold(0.02)
        .max_oracle_calls(15)
        .max_steps(200)
        .training(TrainingConfig {
            epochs: 200,
            ..TrainingConfig::default()
        })
        .build()?;

    let sink = Arc::new(MemorySink::new());
    let mut al = ActiveLearningLoop::builder(config)
        .oracle(oracle)
        .base(base)
        .sink(sink.clone())
        .build()?;

    let mut rng = StdRng::seed_from_u64(7);
    let mut driver = SteepestDescent::new(trimer(&mut rng)).with_maxstep(0.05);
    let summary = al.run(&mut driver)?;

    println!("\n=== Summary ===");
    println!("  Stopped: {}", summary.reason);
    println!(
        "  Steps: {} ({} oracle, {} ML)",
        summary.steps, summary.oracle_calls, summary.ml_accepts
    );
    println!("  Labels learned (oracle - base): {}", al.training_set().len());
    if let Some(result) = &summary.final_result {
        println!("  Final absolute energy: {:.6} eV", result.energy);
    }

    let chain = verify_chain(&sink.records()?)?;
    println!("\n2. Provenance chain OK: {} records", chain.records);
    Ok(())
}
