//! Active-Learning Relaxation Demo
//!
//! Relaxes a perturbed argon cluster with a three-member pairwise ensemble,
//! falling back to the Lennard-Jones oracle whenever the members disagree.
//! Every step is written to a JSON-lines provenance file, which is read back
//! and verified at the end.
//!
//! Run with: cargo run --example relaxation_demo
//! More detail: RUST_LOG=oal_relax=debug cargo run --example relaxation_demo

use std::sync::Arc;

use anyhow::Context;
use oal_relax::config::LoopConfig;
use oal_relax::ensemble::{MemberKind, MemberSpec};
use oal_relax::learner::ActiveLearningLoop;
use oal_relax::lennard_jones::LennardJones;
use oal_relax::provenance::{verify_chain, JsonLinesSink};
use oal_relax::relax::SteepestDescent;
use oal_relax::structure::{Atom, Structure};
use oal_relax::Provenance;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn member(epsilon: f64, sigma: f64) -> MemberSpec {
    MemberSpec::inline(
        MemberKind::Pairwise,
        serde_json::json!({ "epsilon": epsilon, "sigma": sigma, "atomic_energies": { "Ar": 0.0 } }),
    )
}

/// Regular tetrahedron at the LJ pair minimum, randomly displaced
fn perturbed_tetrahedron(rng: &mut StdRng) -> Structure {
    let a = 2f64.powf(1.0 / 6.0) / 2f64.sqrt();
    let corners = [[0.0, 0.0, 0.0], [a, a, 0.0], [a, 0.0, a], [0.0, a, a]];
    let atoms = corners
        .iter()
        .map(|c| {
            let p = [0, 1, 2].map(|k| c[k] + rng.gen_range(-0.08..0.08));
            Atom::new("Ar", p)
        })
        .collect();
    Structure::new(atoms)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== oal-relax: Uncertainty-Gated Relaxation ===\n");

    let mut rng = StdRng::seed_from_u64(2024);
    let start = perturbed_tetrahedron(&mut rng);
    println!("1. Start structure: {} ({} atoms)", start.chemical_formula(), start.len());

    let config = LoopConfig::builder()
        .member(member(0.85, 0.98))
        .member(member(1.0, 1.0))
        .member(member(1.15, 1.02))
        .uncertainty_threshold(0.05)
        .max_oracle_calls(25)
        .max_steps(300)
        .build()?;
    println!(
        "2. Ensemble of {} members, threshold {} eV, budget {} oracle calls",
        config.members.len(),
        config.uncertainty_threshold.energy,
        config.max_oracle_calls
    );

    let path = std::env::temp_dir().join("oal_relax_demo.jsonl");
    std::fs::remove_file(&path).ok();
    let sink = Arc::new(JsonLinesSink::open(&path)?);

    let mut al = ActiveLearningLoop::builder(config)
        .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
        .sink(sink)
        .code_revision(env!("CARGO_PKG_VERSION"))
        .build()?;
    println!("3. Run id: {}\n", al.run_id());

    let mut driver = SteepestDescent::new(start).with_maxstep(0.05);
    let summary = al.run(&mut driver)?;

    println!("=== Summary ===");
    println!("  Stopped: {}", summary.reason);
    println!("  Steps logged: {}", summary.steps);
    println!("  Oracle calls: {}", summary.oracle_calls);
    println!("  ML accepts: {}", summary.ml_accepts);
    println!("  Retrain cycles: {}", summary.retrain_cycles);
    if let Some(result) = &summary.final_result {
        let tag = match result.provenance {
            Provenance::Ml => "ML",
            Provenance::Oracle => "ORACLE",
        };
        println!("  Final energy: {:.6} eV ({tag})", result.energy);
    }
    println!("  Driver iterations: {}", driver.iterations());

    let records = JsonLinesSink::read_records(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let chain = verify_chain(&records)?;
    println!(
        "\n4. Provenance: {} records in {} run(s) at {}",
        chain.records,
        chain.runs,
        path.display()
    );

    Ok(())
}
