//! Process state machine (spec.md §4.4.1).
//!
//! Tagged state, not inheritance (spec.md §9): a small enum plus an
//! explicit transition table, guarded by a single mutex so every observer
//! sees a consistent current state.

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl Default for ProcessState {
    fn default() -> Self {
        ProcessState::Stopped
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal process state transition from {from:?} to {to:?}")]
pub struct IllegalTransition {
    pub from: ProcessState,
    pub to: ProcessState,
}

fn is_legal(from: ProcessState, to: ProcessState) -> bool {
    use ProcessState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Starting, Ready)
            | (Starting, Failed)
            | (Ready, Stopping)
            | (Ready, Failed)
            | (Stopping, Stopped)
            // Not named explicitly in the transition list but required by
            // "next request retries cold-start" after a health-timeout or
            // spawn failure (spec.md §7).
            | (Failed, Starting)
    )
}

/// Mutex-guarded state cell enforcing the legal-transition table.
pub struct ProcessStateMachine {
    state: Mutex<ProcessState>,
}

impl ProcessStateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::Stopped),
        }
    }

    pub fn current(&self) -> ProcessState {
        *self.state.lock()
    }

    /// Attempt the transition, returning the prior state on success. The
    /// whole check-and-set happens under one lock acquisition so no other
    /// transition can interleave (spec.md §4.4.1 invariant).
    pub fn transition(&self, to: ProcessState) -> Result<ProcessState, IllegalTransition> {
        let mut guard = self.state.lock();
        let from = *guard;
        if !is_legal(from, to) {
            return Err(IllegalTransition { from, to });
        }
        *guard = to;
        Ok(from)
    }
}

impl Default for ProcessStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
