//! Queue states and the transition table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Status of a job in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    Queued,
    Starting,
    Started,
    Success,
    Failure,
    Aborted,
    Error,
    Timeout,
    Conflict,
    Dependency,
    Rebased,
    Cancelled,
}

impl QueueState {
    pub const ALL: [QueueState; 12] = [
        QueueState::Queued,
        QueueState::Starting,
        QueueState::Started,
        QueueState::Success,
        QueueState::Failure,
        QueueState::Aborted,
        QueueState::Error,
        QueueState::Timeout,
        QueueState::Conflict,
        QueueState::Dependency,
        QueueState::Rebased,
        QueueState::Cancelled,
    ];

    /// States reachable in one step from `self`.
    pub fn successors(&self) -> &'static [QueueState] {
        use QueueState::*;
        match self {
            Queued => &[Starting, Cancelled],
            Starting => &[
                Rebased, Conflict, Aborted, Started, Error, Timeout, Failure, Dependency,
            ],
            Started => &[Aborted, Failure, Success, Error, Timeout],
            _ => &[],
        }
    }

    pub fn can_transition_to(&self, next: QueueState) -> bool {
        self.successors().contains(&next)
    }

    /// Terminal states have no outgoing edges and free the job's queue slot.
    pub fn is_terminal(&self) -> bool {
        self.successors().is_empty()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Queued => "QUEUED",
            QueueState::Starting => "STARTING",
            QueueState::Started => "STARTED",
            QueueState::Success => "SUCCESS",
            QueueState::Failure => "FAILURE",
            QueueState::Aborted => "ABORTED",
            QueueState::Error => "ERROR",
            QueueState::Timeout => "TIMEOUT",
            QueueState::Conflict => "CONFLICT",
            QueueState::Dependency => "DEPENDENCY",
            QueueState::Rebased => "REBASED",
            QueueState::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::Parse(format!("unknown queue state: {s:?}")))
    }
}
