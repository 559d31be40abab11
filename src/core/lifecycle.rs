//! Entity lifecycle tracking
//!
//! ```text
//! Draft ──apply──▶ Applied ◀──enable/disable──▶ Disabled
//!   │                 │                            │
//!   └─────────────────┴──────────delete────────────┴──▶ Deleted (terminal)
//! ```
//!
//! Toggles move directly between `Applied` and `Disabled`; nothing returns
//! to `Draft`.

use crate::core::error::{Error, Result};
use crate::core::model::EntityRef;
use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Draft,
    Applied,
    Disabled,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Transition {
    /// Create or update of an enabled record
    Apply,
    Enable,
    Disable,
    Delete,
}

impl LifecycleState {
    /// Next state, or a `Lifecycle` error naming the entity
    pub fn next(self, transition: Transition, entity: &EntityRef) -> Result<LifecycleState> {
        use LifecycleState::{Applied, Deleted, Disabled, Draft};
        use Transition::{Apply, Delete, Disable, Enable};

        match (self, transition) {
            (Deleted, _) => Err(Error::Lifecycle(format!(
                "{entity} is deleted; cannot {transition}"
            ))),
            (Draft | Applied | Disabled, Delete) => Ok(Deleted),
            (Draft | Applied, Apply) | (Draft | Disabled | Applied, Enable) => Ok(Applied),
            (Draft | Applied | Disabled, Disable) => Ok(Disabled),
            // updating a disabled record leaves it disabled
            (Disabled, Apply) => Ok(Disabled),
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Deleted)
    }
}

/// Per-entity enforcement status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub state: LifecycleState,
    /// Some directive failed, or the entity failed to compile
    pub degraded: bool,
    pub active_directives: usize,
    pub last_error: Option<String>,
}

impl EntityStatus {
    /// Applies `transition`, leaving the status untouched on error
    pub fn advance(&mut self, transition: Transition, entity: &EntityRef) -> Result<()> {
        self.state = self.state.next(transition, entity)?;
        Ok(())
    }

    pub fn mark_degraded(&mut self, error: impl Into<String>) {
        self.degraded = true;
        self.last_error = Some(error.into());
    }

    pub fn clear_errors(&mut self) {
        self.degraded = false;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const E: EntityRef = EntityRef::Rule(1);

    #[test]
    fn test_draft_to_applied_to_disabled_and_back() {
        let s = LifecycleState::Draft;
        let s = s.next(Transition::Apply, &E).unwrap();
        assert_eq!(s, LifecycleState::Applied);
        let s = s.next(Transition::Disable, &E).unwrap();
        assert_eq!(s, LifecycleState::Disabled);
        let s = s.next(Transition::Enable, &E).unwrap();
        assert_eq!(s, LifecycleState::Applied);
    }

    #[test]
    fn test_update_of_disabled_stays_disabled() {
        let s = LifecycleState::Disabled.next(Transition::Apply, &E).unwrap();
        assert_eq!(s, LifecycleState::Disabled);
    }

    #[test]
    fn test_deleted_is_terminal() {
        let s = LifecycleState::Applied.next(Transition::Delete, &E).unwrap();
        assert!(s.is_terminal());
        for t in [Transition::Apply, Transition::Enable, Transition::Disable, Transition::Delete] {
            let err = s.next(t, &E).unwrap_err();
            assert!(matches!(err, Error::Lifecycle(_)));
            assert!(err.to_string().contains("rule:1"));
        }
    }

    #[test]
    fn test_status_advance_keeps_state_on_error() {
        let mut status = EntityStatus {
            state: LifecycleState::Deleted,
            ..EntityStatus::default()
        };
        assert!(status.advance(Transition::Enable, &E).is_err());
        assert_eq!(status.state, LifecycleState::Deleted);
    }

    #[test]
    fn test_never_returns_to_draft() {
        for state in [LifecycleState::Draft, LifecycleState::Applied, LifecycleState::Disabled] {
            for t in [Transition::Apply, Transition::Enable, Transition::Disable, Transition::Delete] {
                assert_ne!(state.next(t, &E).unwrap(), LifecycleState::Draft);
            }
        }
    }
}
