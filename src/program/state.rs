//! Scheduler lifecycle and progress reporting.

use std::time::Duration;

/// Scheduler lifecycle.
///
/// ```text
/// Idle ──start──> Running ──stop──> Cancelling ──task exits──> Idle
///                    │                                          ▲
///                    └──────────── last loop done ──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerState {
    /// No program running; manual control.
    #[default]
    Idle,
    /// Executing items.
    Running,
    /// Stop requested, waiting for the current item to notice.
    Cancelling,
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "Idle"),
            SchedulerState::Running => write!(f, "Running"),
            SchedulerState::Cancelling => write!(f, "Cancelling"),
        }
    }
}

impl SchedulerState {
    /// Running or cancelling.
    pub fn is_active(&self) -> bool {
        !matches!(self, SchedulerState::Idle)
    }

    /// Only a running program can skip.
    pub fn can_skip(&self) -> bool {
        matches!(self, SchedulerState::Running)
    }
}

/// Snapshot of where a running program is.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgramProgress {
    /// Scheduler state when the snapshot was taken.
    pub state: SchedulerState,
    /// Zero-based loop counter.
    pub current_loop: u32,
    /// Configured loop count, 0 for infinite.
    pub total_loops: u32,
    /// Zero-based index of the executing item.
    pub current_item: usize,
    /// Time left in the current item.
    pub item_remaining: Duration,
    /// Remaining time of this pass (current item onwards).
    pub total_remaining: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_predicates() {
        assert!(!SchedulerState::Idle.is_active());
        assert!(SchedulerState::Running.is_active());
        assert!(SchedulerState::Cancelling.is_active());
        assert!(SchedulerState::Running.can_skip());
        assert!(!SchedulerState::Cancelling.can_skip());
        assert_eq!(SchedulerState::Cancelling.to_string(), "Cancelling");
    }
}
