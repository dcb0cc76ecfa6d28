//! Relaxation driver seam and run cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::evaluator::EvaluationResult;
use crate::structure::Structure;
use crate::Result;

/// External geometry driver consumed by [`ActiveLearningLoop::run`](super::ActiveLearningLoop::run).
///
/// The loop asks for the current structure, hands back one result per
/// step, and lets the driver decide convergence and the next geometry.
pub trait RelaxationDriver {
    /// Structure to evaluate next.
    fn current(&self) -> &Structure;

    /// Whether `result` satisfies the driver's convergence criterion.
    fn is_converged(&self, result: &EvaluationResult) -> bool;

    /// Move to the next geometry using `result`.
    ///
    /// # Errors
    ///
    /// Driver-specific; e.g. forces that do not match the structure.
    fn advance(&mut self, result: &EvaluationResult) -> Result<()>;
}

/// Cloneable cancellation flag, checked between steps.
///
/// Cancelling never interrupts an evaluation in flight; the step that is
/// running completes (and is logged) and the next one terminates.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Fresh, not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let handle = CancelHandle::new();
        let other = handle.clone();
        assert!(!other.is_cancelled());
        handle.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let handle = CancelHandle::new();
        let remote = handle.clone();
        std::thread::spawn(move || remote.cancel()).join().unwrap();
        assert!(handle.is_cancelled());
    }
}
