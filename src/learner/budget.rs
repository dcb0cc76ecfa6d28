//! Oracle-call budget

use serde::{Deserialize, Serialize};

/// Oracle calls consumed versus the configured maximum.
///
/// Only successful oracle evaluations are charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    consumed: usize,
    limit: usize,
}

impl Budget {
    /// Fresh budget of `limit` calls.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self { consumed: 0, limit }
    }

    /// Calls charged so far.
    #[must_use]
    pub const fn consumed(&self) -> usize {
        self.consumed
    }

    /// Configured maximum.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Calls left.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.consumed)
    }

    /// Whether another oracle call is allowed.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.consumed >= self.limit
    }

    /// Charge one call. Returns `false` (and charges nothing) when exhausted.
    pub fn charge(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.consumed += 1;
        true
    }
}
