use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Display name used when an external record carries no usable name.
pub const UNKNOWN_PARTICIPANT_NAME: &str = "Unknown";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ParticipantId(pub String);

impl ParticipantId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A participant record exactly as fetched from outside the engine.
///
/// Nothing here is trusted: `conflicts` may be any JSON value and the
/// identifier may be blank or repeated. [`sanitize_participants`] turns a
/// slice of these into the clean [`Participant`] model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawParticipant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub conflicts: Value,
}

impl RawParticipant {
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, conflicts: &[&str]) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
            conflicts: Value::Array(
                conflicts.iter().map(|conflict| Value::String((*conflict).to_string())).collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub conflicts: Vec<ParticipantId>,
}

impl Participant {
    #[must_use]
    pub fn reference(&self) -> ParticipantRef {
        ParticipantRef { id: self.id.clone(), name: self.name.clone() }
    }
}

/// Names a participant in diagnostics and failures.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct ParticipantRef {
    pub id: ParticipantId,
    pub name: String,
}

impl Display for ParticipantRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Non-fatal notice raised while normalising input or reconciling conflicts.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    AsymmetricConflict { declared_by: ParticipantId, target: ParticipantId },
    UnknownConflictReference { participant: ParticipantId, referenced: ParticipantId },
    DuplicateParticipant { id: ParticipantId },
    MissingParticipantId { position: usize },
}

impl Warning {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AsymmetricConflict { .. } => "asymmetric_conflict",
            Self::UnknownConflictReference { .. } => "unknown_conflict_reference",
            Self::DuplicateParticipant { .. } => "duplicate_participant",
            Self::MissingParticipantId { .. } => "missing_participant_id",
        }
    }
}

impl Display for Warning {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AsymmetricConflict { declared_by, target } => write!(
                f,
                "Asymmetric conflict auto-reconciled: {declared_by} declared a conflict with \
                 {target}, but {target} did not declare one with {declared_by}"
            ),
            Self::UnknownConflictReference { participant, referenced } => write!(
                f,
                "{participant} declared a conflict with unknown participant {referenced}; \
                 the reference was ignored"
            ),
            Self::DuplicateParticipant { id } => {
                write!(f, "Duplicate participant record for {id} was ignored")
            }
            Self::MissingParticipantId { position } => {
                write!(f, "Participant record at position {position} has no id and was ignored")
            }
        }
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SanitizedRoster {
    pub participants: Vec<Participant>,
    pub warnings: Vec<Warning>,
}

/// Normalise untrusted participant records. Total: never fails.
///
/// Records without an id and repeated ids are dropped with a warning; the
/// first record for an id wins. Conflict lists are cleaned by
/// [`sanitize_conflicts`].
#[must_use]
pub fn sanitize_participants(records: &[RawParticipant]) -> SanitizedRoster {
    let mut seen = BTreeSet::new();
    let mut roster = SanitizedRoster::default();

    for (position, record) in records.iter().enumerate() {
        if record.id.trim().is_empty() {
            tracing::debug!(position, "dropping participant record without an id");
            roster.warnings.push(Warning::MissingParticipantId { position });
            continue;
        }

        let id = ParticipantId::new(record.id.as_str());
        if !seen.insert(id.clone()) {
            tracing::debug!(participant = %id, "dropping duplicate participant record");
            roster.warnings.push(Warning::DuplicateParticipant { id });
            continue;
        }

        let name = record
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_PARTICIPANT_NAME)
            .to_string();
        let conflicts = sanitize_conflicts(&id, &record.conflicts);
        roster.participants.push(Participant { id, name, conflicts });
    }

    roster
}

/// Reduce a raw `conflicts` value to a clean, ordered, duplicate-free id list.
///
/// Non-list values become an empty list. String entries are trimmed, then
/// non-string, blank and self-referencing entries are dropped.
#[must_use]
pub fn sanitize_conflicts(owner: &ParticipantId, raw: &Value) -> Vec<ParticipantId> {
    let Value::Array(entries) = raw else {
        if !raw.is_null() {
            tracing::debug!(participant = %owner, "conflicts field is not a list; treating as empty");
        }
        return Vec::new();
    };

    let mut seen = BTreeSet::new();
    let mut conflicts = Vec::new();
    for entry in entries {
        let Some(value) = entry.as_str() else {
            tracing::debug!(participant = %owner, "dropping non-string conflict entry");
            continue;
        };
        let value = value.trim();
        if value.is_empty() || value == owner.as_str() {
            continue;
        }
        if seen.insert(value) {
            conflicts.push(ParticipantId::new(value));
        }
    }
    conflicts
}
