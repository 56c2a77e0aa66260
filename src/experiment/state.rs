//! Run state machine and the user-interruption token.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle state of an acquisition run.
///
/// # State Machine
///
/// ```text
/// Idle ──> Initializing ──> OuterStep ⇄ InnerSweep ──> Finalizing
///                                                          │
///                                    Completed ◄───────────┼──► Interrupted
///                                                          │
///                                                        Failed
/// ```
///
/// Interruption and failure both pass through `Finalizing`: the persistence
/// handle is closed and detached bindings are restored on every exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// No run active.
    Idle,
    /// Driving instruments to their configured starting state.
    Initializing,
    /// Positioned at an outer step point.
    OuterStep,
    /// Sweeping the inner loop.
    InnerSweep,
    /// Closing the run record and restoring bindings.
    Finalizing,
    /// Run finished normally.
    Completed,
    /// Run stopped by the user; not an error.
    Interrupted,
    /// Run aborted by an instrument or storage failure.
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Idle => write!(f, "Idle"),
            RunState::Initializing => write!(f, "Initializing"),
            RunState::OuterStep => write!(f, "OuterStep"),
            RunState::InnerSweep => write!(f, "InnerSweep"),
            RunState::Finalizing => write!(f, "Finalizing"),
            RunState::Completed => write!(f, "Completed"),
            RunState::Interrupted => write!(f, "Interrupted"),
            RunState::Failed => write!(f, "Failed"),
        }
    }
}

impl RunState {
    /// Whether a new run may start from this state.
    pub fn can_begin(&self) -> bool {
        matches!(
            self,
            RunState::Idle | RunState::Completed | RunState::Interrupted | RunState::Failed
        )
    }

    /// Whether the run has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Interrupted | RunState::Failed
        )
    }

    /// Whether instruments are being actively driven.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RunState::Initializing | RunState::OuterStep | RunState::InnerSweep
        )
    }
}

/// Cooperative stop signal for a run.
///
/// The single cancellation mechanism: the acquisition loop checks the token
/// at the top of each loop body and, once stopped, proceeds straight to
/// finalization. Setting the token is sticky for the run it interrupts.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the current run to stop.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Re-arm the token before a new run.
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(RunState::Idle.can_begin());
        assert!(RunState::Interrupted.can_begin());
        assert!(!RunState::InnerSweep.can_begin());

        assert!(RunState::Completed.is_terminal());
        assert!(!RunState::Finalizing.is_terminal());

        assert!(RunState::OuterStep.is_active());
        assert!(!RunState::Idle.is_active());
    }

    #[test]
    fn test_stop_token_is_shared() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());

        token.stop();
        assert!(clone.is_stopped());

        token.reset();
        assert!(!clone.is_stopped());
    }
}
