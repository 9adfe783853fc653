//! Per-email processing state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::{ActionResult, ActionStatus};

/// State of one email within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailState {
    /// Accepted, not yet classified.
    Pending,
    /// Decision computed.
    Decided,
    /// Workflow actions running.
    Executing,
    /// Every action succeeded or was skipped.
    Completed,
    /// At least one action failed. Still counts as processed.
    PartiallyFailed,
    /// The email could not be processed at all.
    Failed,
}

impl EmailState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: EmailState) -> bool {
        use EmailState::*;

        matches!(
            (self, target),
            (Pending, Decided) | (Pending, Failed) |
            (Decided, Executing) | (Decided, Failed) |
            (Executing, Completed) | (Executing, PartiallyFailed) | (Executing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed | Self::Failed)
    }

    /// Terminal states that count toward `processed` in a batch summary.
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::Completed | Self::PartiallyFailed)
    }

    /// Outcome state for a finished set of action results.
    pub fn from_actions(actions: &[ActionResult]) -> Self {
        if actions.iter().any(|a| a.status == ActionStatus::Failed) {
            Self::PartiallyFailed
        } else {
            Self::Completed
        }
    }
}

impl std::fmt::Display for EmailState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Decided => "decided",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EmailState,
    pub to: EmailState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Tracks one email through the state machine.
#[derive(Debug, Clone, Serialize)]
pub struct EmailProgress {
    pub email_id: String,
    pub state: EmailState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl EmailProgress {
    pub fn new(email_id: impl Into<String>) -> Self {
        Self {
            email_id: email_id.into(),
            state: EmailState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: EmailState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;
        if new_state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut progress = EmailProgress::new("e1");
        progress.transition_to(EmailState::Decided, None).unwrap();
        progress.transition_to(EmailState::Executing, None).unwrap();
        progress
            .transition_to(EmailState::PartiallyFailed, Some("send failed".into()))
            .unwrap();
        assert_eq!(progress.transitions.len(), 3);
        assert!(progress.finished_at.is_some());
        assert!(progress.state.is_processed());
    }

    #[test]
    fn cannot_skip_decision() {
        let mut progress = EmailProgress::new("e1");
        assert!(progress.transition_to(EmailState::Executing, None).is_err());
        assert!(progress.transition_to(EmailState::Completed, None).is_err());
        assert_eq!(progress.state, EmailState::Pending);
    }

    #[test]
    fn terminal_states_are_final() {
        for state in [EmailState::Completed, EmailState::PartiallyFailed, EmailState::Failed] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(EmailState::Executing));
        }
        assert!(!EmailState::Failed.is_processed());
    }

    #[test]
    fn outcome_from_actions() {
        let ok = vec![
            ActionResult::succeeded("task_created", "task_1"),
            ActionResult::skipped("attachment_saved", "disabled"),
        ];
        assert_eq!(EmailState::from_actions(&ok), EmailState::Completed);

        let mixed = vec![
            ActionResult::succeeded("task_created", "task_1"),
            ActionResult::failed("attachment_saved", "disk full"),
        ];
        assert_eq!(EmailState::from_actions(&mixed), EmailState::PartiallyFailed);
        assert_eq!(EmailState::from_actions(&[]), EmailState::Completed);
    }
}
