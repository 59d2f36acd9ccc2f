use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::participant::ParticipantRef;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    InsufficientParticipants,
    InfeasibleConstraints,
    Unsolvable,
    SearchExhausted,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientParticipants => "INSUFFICIENT_PARTICIPANTS",
            Self::InfeasibleConstraints => "INFEASIBLE_CONSTRAINTS",
            Self::Unsolvable => "UNSOLVABLE",
            Self::SearchExhausted => "SEARCH_EXHAUSTED",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An expected, typed reason why no assignment was produced.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct PairingFailure {
    pub kind: FailureKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking: Vec<ParticipantRef>,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PairingError {
    #[error(transparent)]
    Rejected(#[from] PairingFailure),
    #[error("invalid pairing config: {0}")]
    Config(String),
    /// The search produced a mapping that breaks its own postconditions.
    #[error("internal consistency fault: {0}")]
    InvariantViolation(String),
}

impl PairingError {
    #[must_use]
    pub fn failure(&self) -> Option<&PairingFailure> {
        match self {
            Self::Rejected(failure) => Some(failure),
            Self::Config(_) | Self::InvariantViolation(_) => None,
        }
    }

    #[must_use]
    pub fn kind(&self) -> Option<FailureKind> {
        self.failure().map(|failure| failure.kind)
    }
}
