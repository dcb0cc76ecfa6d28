//! Delta (correction) calculators
//!
//! A [`DeltaCalculator`] combines two evaluators by signed addition so a
//! surrogate can learn the difference between an expensive oracle and a
//! cheap reference. Chains of corrections are described with a
//! [`CompositionPlan`], which refuses cyclic references at build time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::evaluator::{CalculatorDescriptor, Evaluation, Evaluator};
use crate::structure::Structure;
use crate::{Error, Result};

/// Signed combination applied elementwise to energies and forces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
}

impl DeltaOp {
    /// Apply to two scalars.
    #[must_use]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
        }
    }

    /// The operation that undoes `self` with the same right operand.
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::Add => Self::Sub,
            Self::Sub => Self::Add,
        }
    }

    /// Combine two evaluations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShapeMismatch`] if the force arrays differ in length.
    pub fn combine(self, a: &Evaluation, b: &Evaluation) -> Result<Evaluation> {
        if a.forces.len() != b.forces.len() {
            return Err(Error::shape_mismatch(
                "delta combination",
                format!("{} force vectors", a.forces.len()),
                b.forces.len(),
            ));
        }
        let forces = a
            .forces
            .iter()
            .zip(&b.forces)
            .map(|(fa, fb)| [0, 1, 2].map(|k| self.apply(fa[k], fb[k])))
            .collect();
        Ok(Evaluation::new(self.apply(a.energy, b.energy), forces))
    }
}

impl fmt::Display for DeltaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Sub => "sub",
        })
    }
}

impl FromStr for DeltaOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(Self::Add),
            "sub" => Ok(Self::Sub),
            other => Err(Error::Configuration(format!(
                "unknown delta operation '{other}' (expected 'add' or 'sub')"
            ))),
        }
    }
}

/// Both operands of a delta evaluation plus their combination.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaParts {
    /// Left operand (usually the oracle)
    pub lhs: Evaluation,
    /// Right operand (usually the reference)
    pub rhs: Evaluation,
    /// `op(lhs, rhs)`
    pub combined: Evaluation,
}

/// Evaluator computing `op(lhs, rhs)`.
///
/// Both operands are evaluated on every call; caching belongs to the
/// operands themselves.
pub struct DeltaCalculator {
    lhs: Arc<dyn Evaluator>,
    rhs: Arc<dyn Evaluator>,
    op: DeltaOp,
}

impl DeltaCalculator {
    /// Compose two evaluators.
    #[must_use]
    pub fn new(lhs: Arc<dyn Evaluator>, rhs: Arc<dyn Evaluator>, op: DeltaOp) -> Self {
        Self { lhs, rhs, op }
    }

    /// The combination operator.
    #[must_use]
    pub const fn op(&self) -> DeltaOp {
        self.op
    }

    /// Left operand.
    #[must_use]
    pub fn lhs(&self) -> &Arc<dyn Evaluator> {
        &self.lhs
    }

    /// Right operand.
    #[must_use]
    pub fn rhs(&self) -> &Arc<dyn Evaluator> {
        &self.rhs
    }

    /// Evaluate and keep both operands.
    ///
    /// # Errors
    ///
    /// Propagates operand failures; [`Error::ShapeMismatch`] if the operands
    /// disagree on the atom count.
    pub fn evaluate_parts(&self, structure: &Structure) -> Result<DeltaParts> {
        let lhs = self.lhs.evaluate(structure)?;
        let rhs = self.rhs.evaluate(structure)?;
        let combined = self.op.combine(&lhs, &rhs)?;
        Ok(DeltaParts { lhs, rhs, combined })
    }
}

impl fmt::Debug for DeltaCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaCalculator")
            .field("lhs", &self.lhs.descriptor().name)
            .field("rhs", &self.rhs.descriptor().name)
            .field("op", &self.op)
            .finish()
    }
}

impl Evaluator for DeltaCalculator {
    fn evaluate(&self, structure: &Structure) -> Result<Evaluation> {
        self.evaluate_parts(structure).map(|parts| parts.combined)
    }

    fn descriptor(&self) -> CalculatorDescriptor {
        CalculatorDescriptor::new("DeltaCalculator").with_params(serde_json::json!({
            "op": self.op,
            "lhs": self.lhs.descriptor(),
            "rhs": self.rhs.descriptor(),
        }))
    }
}

enum PlanNode {
    Leaf(Arc<dyn Evaluator>),
    Delta { lhs: String, rhs: String, op: DeltaOp },
}

/// Named graph of evaluators and delta nodes.
///
/// ```rust
/// use std::sync::Arc;
/// use oal_relax::delta::{CompositionPlan, DeltaOp};
/// use oal_relax::lennard_jones::LennardJones;
///
/// let plan = CompositionPlan::new()
///     .leaf("dft", Arc::new(LennardJones::new(1.0, 1.0)))
///     .leaf("base", Arc::new(LennardJones::new(0.8, 1.0)))
///     .delta("correction", "dft", "base", DeltaOp::Sub);
/// assert!(plan.build("correction").is_ok());
///
/// let cyclic = CompositionPlan::new()
///     .leaf("base", Arc::new(LennardJones::new(0.8, 1.0)))
///     .delta("a", "b", "base", DeltaOp::Add)
///     .delta("b", "a", "base", DeltaOp::Sub);
/// assert!(cyclic.build("a").is_err());
/// ```
#[derive(Default)]
pub struct CompositionPlan {
    nodes: BTreeMap<String, PlanNode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl CompositionPlan {
    /// Empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a concrete evaluator under `name`.
    #[must_use]
    pub fn leaf(mut self, name: impl Into<String>, evaluator: Arc<dyn Evaluator>) -> Self {
        self.nodes.insert(name.into(), PlanNode::Leaf(evaluator));
        self
    }

    /// Register `name = op(lhs, rhs)` where operands are other node names.
    #[must_use]
    pub fn delta(
        mut self,
        name: impl Into<String>,
        lhs: impl Into<String>,
        rhs: impl Into<String>,
        op: DeltaOp,
    ) -> Self {
        self.nodes.insert(
            name.into(),
            PlanNode::Delta {
                lhs: lhs.into(),
                rhs: rhs.into(),
                op,
            },
        );
        self
    }

    /// Resolve `root` into an evaluator.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if `root` or an operand is unknown, or if the
    /// graph reachable from `root` contains a cycle.
    pub fn build(&self, root: &str) -> Result<Arc<dyn Evaluator>> {
        let mut marks = HashMap::new();
        let mut built = HashMap::new();
        let mut path = Vec::new();
        self.resolve(root, &mut marks, &mut built, &mut path)
    }

    fn resolve(
        &self,
        name: &str,
        marks: &mut HashMap<String, Mark>,
        built: &mut HashMap<String, Arc<dyn Evaluator>>,
        path: &mut Vec<String>,
    ) -> Result<Arc<dyn Evaluator>> {
        match marks.get(name) {
            Some(Mark::Done) => {
                if let Some(evaluator) = built.get(name) {
                    return Ok(Arc::clone(evaluator));
                }
            }
            Some(Mark::Visiting) => {
                path.push(name.to_string());
                return Err(Error::Configuration(format!(
                    "cyclic delta composition: {}",
                    path.join(" -> ")
                )));
            }
            None => {}
        }

        let node = self.nodes.get(name).ok_or_else(|| {
            Error::Configuration(format!("delta composition references unknown calculator '{name}'"))
        })?;

        marks.insert(name.to_string(), Mark::Visiting);
        path.push(name.to_string());
        let evaluator: Arc<dyn Evaluator> = match node {
            PlanNode::Leaf(evaluator) => Arc::clone(evaluator),
            PlanNode::Delta { lhs, rhs, op } => {
                let lhs = self.resolve(lhs, marks, built, path)?;
                let rhs = self.resolve(rhs, marks, built, path)?;
                Arc::new(DeltaCalculator::new(lhs, rhs, *op))
            }
        };
        path.pop();
        marks.insert(name.to_string(), Mark::Done);
        built.insert(name.to_string(), Arc::clone(&evaluator));
        Ok(evaluator)
    }
}
