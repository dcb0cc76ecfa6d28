//! End-to-end relaxation runs
//!
//! Full loop runs against the Lennard-Jones oracle:
//! 1. Relax a dimer to the pair minimum
//! 2. Cancel and resume runs
//! 3. Continue a provenance chain across two loop instances

use std::sync::Arc;

use oal_relax::config::LoopConfig;
use oal_relax::ensemble::{MemberKind, MemberSpec};
use oal_relax::learner::{ActiveLearningLoop, LoopState};
use oal_relax::lennard_jones::LennardJones;
use oal_relax::provenance::{verify_chain, JsonLinesSink, MemorySink};
use oal_relax::relax::SteepestDescent;
use oal_relax::structure::{Atom, Structure};
use oal_relax::{Error, Provenance, TerminationReason};

fn member(epsilon: f64) -> MemberSpec {
    MemberSpec::inline(
        MemberKind::Pairwise,
        serde_json::json!({ "epsilon": epsilon, "sigma": 1.0, "atomic_energies": { "Ar": 0.0 } }),
    )
}

fn dimer(r: f64) -> Structure {
    Structure::new(vec![Atom::new("Ar", [0.0; 3]), Atom::new("Ar", [r, 0.0, 0.0])])
}

fn config(threshold: f64, budget: usize) -> LoopConfig {
    LoopConfig::builder()
        .member(member(0.9))
        .member(member(1.1))
        .uncertainty_threshold(threshold)
        .max_oracle_calls(budget)
        .max_steps(400)
        .workers(2)
        .build()
        .unwrap()
}

#[test]
fn test_dimer_relaxes_to_pair_minimum() {
    let sink = Arc::new(MemorySink::new());
    let mut al = ActiveLearningLoop::builder(config(0.05, 100))
        .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
        .sink(sink.clone())
        .build()
        .unwrap();

    let mut driver = SteepestDescent::new(dimer(1.3)).with_step_size(0.005);
    let summary = al.run(&mut driver).unwrap();

    assert_eq!(summary.reason, TerminationReason::Converged);
    assert_eq!(al.state(), LoopState::Terminated(TerminationReason::Converged));
    let result = summary.final_result.unwrap();
    assert_eq!(result.provenance, Provenance::Oracle);

    let relaxed = driver.into_structure();
    let r = relaxed.atoms()[1].position[0] - relaxed.atoms()[0].position[0];
    assert!((r - 2f64.powf(1.0 / 6.0)).abs() < 0.01, "r = {r}");

    assert_eq!(sink.len(), summary.steps);
    assert_eq!(verify_chain(&sink.records().unwrap()).unwrap().runs, 1);
}

#[test]
fn test_cancel_before_run() {
    let mut al = ActiveLearningLoop::builder(config(0.05, 10))
        .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
        .build()
        .unwrap();
    al.cancel_handle().cancel();

    let summary = al.run(&mut SteepestDescent::new(dimer(1.3))).unwrap();
    assert_eq!(summary.reason, TerminationReason::Cancelled);
    assert_eq!(summary.steps, 0);
    assert_eq!(al.budget().consumed(), 0);
}

#[test]
fn test_layout_change_is_rejected_without_a_record() {
    let sink = Arc::new(MemorySink::new());
    let mut al = ActiveLearningLoop::builder(config(0.0, 10))
        .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
        .sink(sink.clone())
        .build()
        .unwrap();

    al.step(&dimer(1.2)).unwrap();
    let trimer = Structure::new(vec![
        Atom::new("Ar", [0.0; 3]),
        Atom::new("Ar", [1.2, 0.0, 0.0]),
        Atom::new("Ar", [0.6, 1.0, 0.0]),
    ]);
    assert!(matches!(al.step(&trimer), Err(Error::ShapeMismatch { .. })));
    assert_eq!(sink.len(), 1);
    assert_eq!(al.budget().consumed(), 1);
}

#[test]
fn test_chain_continues_across_loop_instances() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");

    let first = {
        let sink = Arc::new(JsonLinesSink::open(&path).unwrap());
        let mut al = ActiveLearningLoop::builder(config(0.0, 2))
            .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
            .sink(sink)
            .run_id("restartable")
            .build()
            .unwrap();
        al.run(&mut SteepestDescent::new(dimer(1.3)).with_step_size(0.005))
            .unwrap()
    };
    assert_eq!(first.reason, TerminationReason::BudgetExhausted);
    assert_eq!(first.steps, 2);

    let (tail_handle, tail) = JsonLinesSink::read_records(&path).unwrap().pop().unwrap();
    let sink = Arc::new(JsonLinesSink::open(&path).unwrap());
    let mut al = ActiveLearningLoop::builder(config(0.0, 2))
        .oracle(Arc::new(LennardJones::new(1.0, 1.0)))
        .sink(sink)
        .resume(tail_handle.clone(), tail)
        .build()
        .unwrap();
    assert_eq!(al.run_id(), "restartable");
    let second = al
        .run(&mut SteepestDescent::new(dimer(1.28)).with_step_size(0.005))
        .unwrap();
    assert_eq!(second.steps, 2);

    let records = JsonLinesSink::read_records(&path).unwrap();
    assert_eq!(records.len(), 4);
    assert_eq!(records[2].1.previous.as_ref(), Some(&tail_handle));
    let sequences: Vec<u64> = records.iter().map(|(_, r)| r.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3]);

    let chain = verify_chain(&records).unwrap();
    assert_eq!(chain.runs, 1);
    assert_eq!(chain.records, 4);
}
