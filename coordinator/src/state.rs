//! Coordinator and command lifecycle states.

use serde::Serialize;
use std::fmt;

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CoordinatorState {
    /// Constructed, background tasks not running yet.
    Starting,
    /// Accepting operations.
    Running,
    /// Refusing new operations.
    ShuttingDown,
    /// Stopped.
    Stopped,
}

impl CoordinatorState {
    /// Whether new operations are accepted.
    pub fn accepts_operations(&self) -> bool {
        matches!(self, CoordinatorState::Starting | CoordinatorState::Running)
    }
}

/// Lifecycle phase of a membership change command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPhase {
    /// Inputs captured, no I/O yet.
    Constructed,
    /// Validation passed, remote state untouched.
    Prepared,
    /// Every execute step completed.
    Executed,
    /// Prepare or execute failed.
    Failed,
    /// Compensation attempted after a failure.
    RolledBack,
    /// Owned sessions released.
    Finished,
}

impl CommandPhase {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, CommandPhase::Finished)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[CommandPhase] {
        match self {
            CommandPhase::Constructed => &[
                CommandPhase::Prepared,
                CommandPhase::Failed,
                CommandPhase::RolledBack,
                CommandPhase::Finished,
            ],
            CommandPhase::Prepared => &[
                CommandPhase::Executed,
                CommandPhase::Failed,
                CommandPhase::RolledBack,
                CommandPhase::Finished,
            ],
            CommandPhase::Executed => &[CommandPhase::Finished],
            CommandPhase::Failed => &[CommandPhase::RolledBack, CommandPhase::Finished],
            CommandPhase::RolledBack => &[CommandPhase::Finished],
            CommandPhase::Finished => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: CommandPhase) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandPhase::Constructed => "Constructed",
            CommandPhase::Prepared => "Prepared",
            CommandPhase::Executed => "Executed",
            CommandPhase::Failed => "Failed",
            CommandPhase::RolledBack => "RolledBack",
            CommandPhase::Finished => "Finished",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(CommandPhase::Constructed.can_transition_to(CommandPhase::Prepared));
        assert!(CommandPhase::Prepared.can_transition_to(CommandPhase::Executed));
        assert!(CommandPhase::Executed.can_transition_to(CommandPhase::Finished));
        assert!(CommandPhase::Failed.can_transition_to(CommandPhase::RolledBack));
    }

    #[test]
    fn test_invalid_transitions() {
        // Execute requires a prepared command
        assert!(!CommandPhase::Constructed.can_transition_to(CommandPhase::Executed));
        assert!(!CommandPhase::Finished.can_transition_to(CommandPhase::Finished));
        assert!(!CommandPhase::Executed.can_transition_to(CommandPhase::RolledBack));
    }

    #[test]
    fn test_coordinator_accepts_operations() {
        assert!(CoordinatorState::Running.accepts_operations());
        assert!(!CoordinatorState::ShuttingDown.accepts_operations());
    }

    #[test]
    fn test_final_states() {
        assert!(CommandPhase::Finished.is_final());
        assert!(!CommandPhase::RolledBack.is_final());
    }
}
