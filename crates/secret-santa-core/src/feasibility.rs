use std::collections::BTreeSet;

use crate::error::{FailureKind, PairingFailure};
use crate::graph::ConflictGraph;
use crate::participant::{Participant, ParticipantId, ParticipantRef};

/// Smallest group the exchange accepts.
pub const MIN_PARTICIPANTS: usize = 3;

/// Conflicts of `participant` restricted to ids in `known`.
///
/// Unknown ids are never receivers, so they cannot take a giftee slot away.
pub(crate) fn known_conflict_count(
    participant: &Participant,
    graph: &ConflictGraph,
    known: &BTreeSet<&ParticipantId>,
) -> usize {
    graph.conflicts(&participant.id).map_or(0, |targets| {
        targets.iter().filter(|target| known.contains(target)).count()
    })
}

/// Number of receivers `participant` could be assigned if nothing else were
/// taken: everyone except self and conflicted participants.
#[must_use]
pub fn available_receivers(
    participant: &Participant,
    participants: &[Participant],
    graph: &ConflictGraph,
) -> usize {
    let known = participants.iter().map(|p| &p.id).collect::<BTreeSet<_>>();
    participants.len().saturating_sub(1).saturating_sub(known_conflict_count(participant, graph, &known))
}

/// Reject inputs that cannot possibly be paired, without searching.
///
/// Passing is necessary but not sufficient: a roster can clear this check
/// and still have no valid assignment.
///
/// # Errors
/// Returns [`FailureKind::InsufficientParticipants`] below
/// [`MIN_PARTICIPANTS`], or [`FailureKind::InfeasibleConstraints`] naming every
/// participant left with no eligible giftee.
pub fn validate_feasibility(
    participants: &[Participant],
    graph: &ConflictGraph,
) -> Result<(), PairingFailure> {
    if participants.len() < MIN_PARTICIPANTS {
        return Err(PairingFailure {
            kind: FailureKind::InsufficientParticipants,
            detail: format!(
                "Insufficient participants for pairing. Need at least {MIN_PARTICIPANTS}, found {}",
                participants.len()
            ),
            blocking: Vec::new(),
        });
    }

    let known = participants.iter().map(|p| &p.id).collect::<BTreeSet<_>>();
    let pool = participants.len() - 1;
    let blocking: Vec<ParticipantRef> = participants
        .iter()
        .filter(|participant| known_conflict_count(participant, graph, &known) >= pool)
        .map(Participant::reference)
        .collect();

    if blocking.is_empty() {
        return Ok(());
    }

    let named = blocking
        .iter()
        .map(|participant| format!("{participant} is conflicted with all other participants"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(PairingFailure {
        kind: FailureKind::InfeasibleConstraints,
        detail: format!("Pairing is impossible: {named}"),
        blocking,
    })
}
