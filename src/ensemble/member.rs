//! Ensemble member capability, parameter partitions and the member registry

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::evaluator::Evaluation;
use crate::structure::Structure;
use crate::training::TrainingSet;
use crate::{Error, Result};

/// A named block of model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBlock {
    /// Block name (e.g. "epsilon", "out_blocks.3")
    pub name: String,
    /// Flattened values
    pub values: Vec<f64>,
    /// Whether retraining may change this block
    pub trainable: bool,
}

impl ParameterBlock {
    /// Trainable block.
    #[must_use]
    pub fn trainable(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            trainable: true,
        }
    }

    /// Frozen block.
    #[must_use]
    pub fn frozen(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            trainable: false,
        }
    }
}

/// Ordered parameter blocks with a trainable/frozen partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    blocks: Vec<ParameterBlock>,
}

impl Parameters {
    /// Build from blocks.
    #[must_use]
    pub const fn new(blocks: Vec<ParameterBlock>) -> Self {
        Self { blocks }
    }

    /// All blocks in order.
    #[must_use]
    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }

    /// Look up a block by name.
    #[must_use]
    pub fn block(&self, name: &str) -> Option<&ParameterBlock> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Number of trainable scalars.
    #[must_use]
    pub fn trainable_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| b.trainable)
            .map(|b| b.values.len())
            .sum()
    }

    /// Whether every value is finite.
    #[must_use]
    pub fn all_finite(&self) -> bool {
        self.blocks
            .iter()
            .flat_map(|b| b.values.iter())
            .all(|v| v.is_finite())
    }

    /// Check that `update` keeps the same layout and leaves frozen blocks
    /// untouched. Returns the reason on failure.
    #[must_use]
    pub fn incompatibility(&self, update: &Self) -> Option<String> {
        if self.blocks.len() != update.blocks.len() {
            return Some(format!(
                "update has {} blocks, model has {}",
                update.blocks.len(),
                self.blocks.len()
            ));
        }
        for (old, new) in self.blocks.iter().zip(&update.blocks) {
            if old.name != new.name
                || old.trainable != new.trainable
                || old.values.len() != new.values.len()
            {
                return Some(format!("block '{}' changed layout", old.name));
            }
            if !old.trainable && old.values != new.values {
                return Some(format!("frozen block '{}' was modified", old.name));
            }
        }
        if !update.all_finite() {
            return Some("non-finite parameters".to_string());
        }
        None
    }
}

/// Architecture tag of a member, resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemberKind {
    /// Built-in Lennard-Jones member with trainable ε and atomic energies
    Pairwise,
    /// GemNet graph network
    Gemnet,
    /// SpinConv graph network
    Spinconv,
    /// DimeNet++ graph network
    Dimenetpp,
    /// FLARE sparse Gaussian process
    Flare,
}

impl MemberKind {
    /// Canonical lowercase tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pairwise => "pairwise",
            Self::Gemnet => "gemnet",
            Self::Spinconv => "spinconv",
            Self::Dimenetpp => "dimenetpp",
            Self::Flare => "flare",
        }
    }
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pairwise" => Ok(Self::Pairwise),
            "gemnet" => Ok(Self::Gemnet),
            "spinconv" => Ok(Self::Spinconv),
            "dimenetpp" => Ok(Self::Dimenetpp),
            "flare" => Ok(Self::Flare),
            other => Err(Error::Configuration(format!(
                "unknown ensemble member kind '{other}'"
            ))),
        }
    }
}

impl TryFrom<String> for MemberKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MemberKind> for String {
    fn from(kind: MemberKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Where to load one member from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberSpec {
    /// Architecture tag
    pub kind: MemberKind,
    /// Checkpoint file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<PathBuf>,
    /// Checkpoint contents given inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<serde_json::Value>,
}

impl MemberSpec {
    /// Spec pointing at a checkpoint file.
    #[must_use]
    pub fn from_checkpoint(kind: MemberKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            checkpoint: Some(path.into()),
            inline: None,
        }
    }

    /// Spec carrying the checkpoint inline.
    #[must_use]
    pub const fn inline(kind: MemberKind, checkpoint: serde_json::Value) -> Self {
        Self {
            kind,
            checkpoint: None,
            inline: Some(checkpoint),
        }
    }

    /// Read the checkpoint document, preferring the inline copy.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if neither source is set; IO/JSON errors
    /// from reading the file.
    pub fn checkpoint_document(&self) -> Result<serde_json::Value> {
        if let Some(inline) = &self.inline {
            return Ok(inline.clone());
        }
        let path = self.checkpoint.as_ref().ok_or_else(|| {
            Error::Configuration(format!(
                "member '{}' needs either 'checkpoint' or 'inline'",
                self.kind
            ))
        })?;
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// A trainable surrogate.
///
/// `predict` and `fit` take `&self` so the ensemble can run them on a
/// worker pool; parameters only change through `load_parameters`, which
/// the ensemble calls after every member has finished fitting.
pub trait SurrogateMember: Send + Sync + fmt::Debug {
    /// Architecture tag.
    fn kind(&self) -> MemberKind;

    /// Predict energy and forces.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if the structure does not fit the member.
    fn predict(&self, structure: &Structure) -> Result<Evaluation>;

    /// Current parameters.
    fn parameters(&self) -> &Parameters;

    /// Compute updated parameters for `training_set` without applying them.
    ///
    /// # Errors
    ///
    /// [`Error::RetrainDivergence`] when optimisation blows up.
    fn fit(&self, training_set: &TrainingSet) -> Result<Parameters>;

    /// Replace parameters with a validated update.
    ///
    /// # Errors
    ///
    /// Implementation specific layout errors.
    fn load_parameters(&mut self, parameters: Parameters) -> Result<()>;
}

/// Builds members of one architecture from a [`MemberSpec`].
pub trait MemberLoader: Send + Sync {
    /// Load a member.
    ///
    /// # Errors
    ///
    /// Checkpoint read/parse failures.
    fn load(&self, spec: &MemberSpec) -> Result<Box<dyn SurrogateMember>>;
}

/// Closed mapping from [`MemberKind`] to loader.
#[derive(Clone, Default)]
pub struct MemberRegistry {
    loaders: HashMap<MemberKind, Arc<dyn MemberLoader>>,
}

impl MemberRegistry {
    /// Registry without loaders.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in [`MemberKind::Pairwise`] loader using
    /// default training settings.
    #[must_use]
    pub fn with_builtin() -> Self {
        Self::with_builtin_training(TrainingConfig::default())
    }

    /// Registry with the built-in loader using `training` for members whose
    /// checkpoint does not override it.
    #[must_use]
    pub fn with_builtin_training(training: TrainingConfig) -> Self {
        Self::new().register(
            MemberKind::Pairwise,
            Arc::new(super::pairwise::PairwiseLoader::new(training)),
        )
    }

    /// Add or replace a loader.
    #[must_use]
    pub fn register(mut self, kind: MemberKind, loader: Arc<dyn MemberLoader>) -> Self {
        self.loaders.insert(kind, loader);
        self
    }

    /// Whether `kind` can be loaded.
    #[must_use]
    pub fn supports(&self, kind: MemberKind) -> bool {
        self.loaders.contains_key(&kind)
    }

    /// Load one member.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] if no loader is registered for the kind.
    pub fn load(&self, spec: &MemberSpec) -> Result<Box<dyn SurrogateMember>> {
        let loader = self.loaders.get(&spec.kind).ok_or_else(|| {
            Error::Configuration(format!(
                "no loader registered for member kind '{}'",
                spec.kind
            ))
        })?;
        loader.load(spec)
    }
}

impl fmt::Debug for MemberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.loaders.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("MemberRegistry").field("kinds", &kinds).finish()
    }
}
