//! Actions that must run on every exit path of a backup run.
//!
//! Actions are pushed as the run progresses and executed in reverse order by
//! [`CleanupStack::unwind`]. A failing action is logged and reported but
//! never prevents the remaining ones from running.

use tracing::{debug, warn};

use crate::error::{Result, VmrepError};

type Action<C> = Box<dyn FnOnce(&mut C) -> Result<()>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub action: String,
    pub error: String,
}

/// Stack of deferred actions operating on a context `C`, usually the runner.
pub struct CleanupStack<C> {
    actions: Vec<(String, Action<C>)>,
}

impl<C> Default for CleanupStack<C> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
        }
    }
}

impl<C> CleanupStack<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut C) -> Result<()> + 'static,
    ) {
        self.actions.push((name.into(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, most recently pushed first.
    pub fn unwind(self, ctx: &mut C) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        for (name, action) in self.actions.into_iter().rev() {
            debug!(action = %name, "running cleanup action");
            if let Err(e) = action(ctx) {
                warn!(action = %name, error = %e, "cleanup action failed");
                failures.push(CleanupFailure {
                    action: name,
                    error: e.to_string(),
                });
            }
        }
        failures
    }
}

/// Value of a best-effort step, or `None` once its failure has been logged
/// as [`VmrepError::TransientInfra`].
pub fn best_effort<T>(action: impl std::fmt::Display, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            let e = VmrepError::transient(action, e);
            warn!(error = %e, "best-effort step failed");
            None
        }
    }
}
