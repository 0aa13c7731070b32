//! Task lifecycle state and kind

/// Scheduling state of a task
///
/// ```text
///            wake           pick
///   Blocked ──────► Ready ────────► Running
///      ▲                              │
///      └────────── suspend() ─────────┤
///                                     │ return / exit / kill
///   Dormant ◄── rest() (FSM only)     ▼
///                                 Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued on its group's ready queue
    Ready = 0,
    /// Currently executing (holds its group)
    Running = 1,
    /// Suspended until one registered event fires
    Blocked = 2,
    /// FSM resting until explicitly woken or run
    Dormant = 3,
    /// Executing outside any group (migrated to native)
    Native = 4,
    /// Exited or killed
    Finished = 5,
}

impl TaskState {
    /// Check if the task can still be scheduled
    #[inline]
    pub fn is_alive(self) -> bool {
        self != TaskState::Finished
    }

    /// Check if a wake would move the task onto a ready queue
    #[inline]
    pub fn is_waiting(self) -> bool {
        matches!(self, TaskState::Blocked | TaskState::Dormant)
    }
}

/// What kind of task this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Has its own stack and can suspend mid-function
    Thread,
    /// Stackless; re-invoked from the top of its step on every wake
    Fsm,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(TaskState::Blocked.is_waiting());
        assert!(TaskState::Dormant.is_waiting());
        assert!(!TaskState::Running.is_waiting());
        assert!(TaskState::Native.is_alive());
        assert!(!TaskState::Finished.is_alive());
    }
}
