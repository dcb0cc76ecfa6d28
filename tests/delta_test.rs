//! Delta composition tests against Lennard-Jones references

use std::sync::Arc;

use oal_relax::delta::{CompositionPlan, DeltaCalculator, DeltaOp};
use oal_relax::evaluator::{Evaluation, Evaluator};
use oal_relax::lennard_jones::LennardJones;
use oal_relax::structure::{Atom, Structure};
use oal_relax::{Error, Result};

fn cluster() -> Structure {
    Structure::new(vec![
        Atom::new("Ar", [0.0, 0.0, 0.0]),
        Atom::new("Ar", [1.1, 0.0, 0.0]),
        Atom::new("Ar", [0.55, 0.95, 0.0]),
        Atom::new("Ar", [0.55, 0.3, 0.9]),
    ])
}

fn assert_close(a: &Evaluation, b: &Evaluation) {
    assert!((a.energy - b.energy).abs() < 1e-12, "{} vs {}", a.energy, b.energy);
    for (fa, fb) in a.forces.iter().zip(&b.forces) {
        for k in 0..3 {
            assert!((fa[k] - fb[k]).abs() < 1e-12);
        }
    }
}

struct Truncated;

impl Evaluator for Truncated {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        Ok(Evaluation::new(0.0, vec![[0.0; 3]; structure.len() - 1]))
    }
}

struct Unconverged;

impl Evaluator for Unconverged {
    fn evaluate(&self, _structure: &Structure) -> Result<Evaluation> {
        Err(Error::OracleFailure("SCF cycle limit".to_string()))
    }
}

#[test]
fn test_sub_of_scaled_potentials_matches_difference() {
    let oracle = LennardJones::new(1.0, 1.0);
    let base = LennardJones::new(0.6, 1.0);
    let delta = DeltaCalculator::new(Arc::new(oracle), Arc::new(base), DeltaOp::Sub);

    let got = delta.evaluate(&cluster()).unwrap();
    let expected = LennardJones::new(0.4, 1.0).evaluate(&cluster()).unwrap();
    assert_close(&got, &expected);
}

#[test]
fn test_parts_recompose_exactly() {
    let oracle = LennardJones::new(1.0, 1.0);
    let base = LennardJones::new(0.3, 1.1);
    let delta = DeltaCalculator::new(Arc::new(oracle), Arc::new(base), DeltaOp::Sub);

    let parts = delta.evaluate_parts(&cluster()).unwrap();
    let back = DeltaOp::Add.combine(&parts.combined, &parts.rhs).unwrap();
    assert_close(&back, &parts.lhs);
    assert_eq!(parts.lhs, oracle.evaluate(&cluster()).unwrap());
}

#[test]
fn test_nested_plan_evaluates_outer_over_inner() {
    let plan = CompositionPlan::new()
        .leaf("dft", Arc::new(LennardJones::new(1.0, 1.0)))
        .leaf("tb", Arc::new(LennardJones::new(0.5, 1.0)))
        .leaf("pair", Arc::new(LennardJones::new(0.2, 1.0)))
        .delta("dft-tb", "dft", "tb", DeltaOp::Sub)
        .delta("dft-tb-pair", "dft-tb", "pair", DeltaOp::Sub);

    let got = plan.build("dft-tb-pair").unwrap().evaluate(&cluster()).unwrap();
    let expected = LennardJones::new(0.3, 1.0).evaluate(&cluster()).unwrap();
    assert_close(&got, &expected);
}

#[test]
fn test_shared_subtree_builds_once() {
    let plan = CompositionPlan::new()
        .leaf("lj", Arc::new(LennardJones::new(1.0, 1.0)))
        .delta("double", "lj", "lj", DeltaOp::Add)
        .delta("quad", "double", "double", DeltaOp::Add);

    let got = plan.build("quad").unwrap().evaluate(&cluster()).unwrap();
    let expected = LennardJones::new(4.0, 1.0).evaluate(&cluster()).unwrap();
    assert_close(&got, &expected);
}

#[test]
fn test_two_node_cycle_names_path() {
    let plan = CompositionPlan::new()
        .leaf("base", Arc::new(LennardJones::new(1.0, 1.0)))
        .delta("a", "b", "base", DeltaOp::Sub)
        .delta("b", "a", "base", DeltaOp::Add);

    match plan.build("a") {
        Err(Error::Configuration(msg)) => assert!(msg.contains("a -> b -> a"), "{msg}"),
        Err(other) => panic!("expected Configuration, got {other:?}"),
        Ok(_) => panic!("cycle accepted"),
    }
}

#[test]
fn test_unknown_root_rejected() {
    let plan = CompositionPlan::new().leaf("lj", Arc::new(LennardJones::new(1.0, 1.0)));
    assert!(matches!(plan.build("missing"), Err(Error::Configuration(_))));
}

#[test]
fn test_operand_shape_mismatch() {
    let delta = DeltaCalculator::new(
        Arc::new(LennardJones::new(1.0, 1.0)),
        Arc::new(Truncated),
        DeltaOp::Sub,
    );
    assert!(matches!(
        delta.evaluate(&cluster()),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn test_operand_failure_propagates() {
    let delta = DeltaCalculator::new(
        Arc::new(Unconverged),
        Arc::new(LennardJones::new(1.0, 1.0)),
        DeltaOp::Sub,
    );
    assert!(matches!(
        delta.evaluate(&cluster()),
        Err(Error::OracleFailure(_))
    ));
}

#[test]
fn test_descriptor_nests_operands() {
    let delta = DeltaCalculator::new(
        Arc::new(LennardJones::new(1.0, 1.0)),
        Arc::new(LennardJones::new(0.5, 1.0)),
        DeltaOp::Sub,
    );
    let descriptor = delta.descriptor();
    assert_eq!(descriptor.name, "DeltaCalculator");
    assert_eq!(descriptor.params["op"], "sub");
    assert_eq!(descriptor.params["lhs"]["name"], "LennardJones");
    assert_eq!(descriptor.params["rhs"]["params"]["epsilon"], 0.5);
}
