//! Aggregate lifecycle: `Initial -> Active -> Closed`.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Lifecycle status of an aggregate as seen by projections.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    #[default]
    Initial,
    Active,
    Closed,
}

/// The effect an event type has on an aggregate's lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// `Initial -> Active`, storing the event payload.
    Activate,
    /// `Active -> Active`, replacing the stored payload.
    Update,
    /// `Active -> Closed`.
    Close,
}

impl AggregateStatus {
    /// Compute the status after `transition`, or reject it.
    pub fn apply(self, transition: Transition) -> DomainResult<AggregateStatus> {
        match (self, transition) {
            (AggregateStatus::Initial, Transition::Activate) => Ok(AggregateStatus::Active),
            (AggregateStatus::Active, Transition::Update) => Ok(AggregateStatus::Active),
            (AggregateStatus::Active, Transition::Close) => Ok(AggregateStatus::Closed),
            (status, transition) => Err(DomainError::invalid_transition(format!(
                "{transition:?} is not allowed from {status:?}"
            ))),
        }
    }

    pub fn is_terminal(self) -> bool {
        self == AggregateStatus::Closed
    }
}

impl Transition {
    /// Whether applying this transition stores the event payload.
    pub fn carries_data(self) -> bool {
        matches!(self, Transition::Activate | Transition::Update)
    }
}

impl core::str::FromStr for Transition {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "activate" => Ok(Transition::Activate),
            "update" => Ok(Transition::Update),
            "close" => Ok(Transition::Close),
            other => Err(DomainError::unknown("transition", other)),
        }
    }
}
