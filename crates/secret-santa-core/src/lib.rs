//! Constrained gift-exchange pairing.
//!
//! Takes raw participant records and produces a giver to receiver
//! [`Assignment`] that is a derangement avoiding every declared conflict, or
//! a typed [`PairingFailure`] explaining why none could be produced. The
//! crate performs no I/O.
//!
//! The pipeline runs in one direction:
//! [`sanitize_participants`] -> [`build_conflict_graph`] ->
//! [`validate_feasibility`] -> [`search_assignment`].

mod config;
mod error;
mod feasibility;
mod graph;
mod participant;
mod search;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub use config::{PairingConfig, DEFAULT_DIAGNOSTIC_SAMPLE_SIZE};
pub use error::{FailureKind, PairingError, PairingFailure};
pub use feasibility::{available_receivers, validate_feasibility, MIN_PARTICIPANTS};
pub use graph::{build_conflict_graph, ConflictGraph, GraphBuild};
pub use participant::{
    sanitize_conflicts, sanitize_participants, Participant, ParticipantId, ParticipantRef,
    RawParticipant, SanitizedRoster, Warning, UNKNOWN_PARTICIPANT_NAME,
};
pub use search::{
    search_assignment, Assignment, SearchLimits, SearchOutcome, SearchReport, SearchStats,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PairingOutcome {
    pub assignment: Assignment,
    pub warnings: Vec<Warning>,
    pub stats: SearchStats,
}

impl PairingOutcome {
    #[must_use]
    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }
}

/// Compute an assignment using a freshly entropy-seeded random source.
///
/// # Errors
/// See [`compute_assignment_with_rng`].
pub fn compute_assignment(
    participants: &[RawParticipant],
    config: &PairingConfig,
) -> Result<PairingOutcome, PairingError> {
    let mut rng = StdRng::from_entropy();
    compute_assignment_with_rng(participants, config, &mut rng)
}

/// Compute an assignment drawing every random choice from `rng`.
///
/// # Errors
/// Returns [`PairingError::Rejected`] for too few participants, a participant
/// with no eligible giftee, a proven-unsolvable conflict graph, or a search
/// that hit its placement cap. Returns [`PairingError::Config`] for an
/// invalid config and [`PairingError::InvariantViolation`] if the search
/// result breaks the assignment invariants.
pub fn compute_assignment_with_rng<R: Rng + ?Sized>(
    participants: &[RawParticipant],
    config: &PairingConfig,
    rng: &mut R,
) -> Result<PairingOutcome, PairingError> {
    config.validate()?;

    let roster = sanitize_participants(participants);
    let build = build_conflict_graph(&roster.participants);
    if let Err(failure) = validate_feasibility(&roster.participants, &build.graph) {
        tracing::warn!(kind = %failure.kind, blocking = failure.blocking.len(), "pairing rejected before search");
        return Err(failure.into());
    }

    let report = search_assignment(&roster.participants, &build.graph, config.search, rng);
    let assignment = match report.outcome {
        SearchOutcome::Complete(assignment) => assignment,
        SearchOutcome::Unsolvable => {
            let failure = search::unsolvable_failure(
                &roster.participants,
                &build.graph,
                config.diagnostic_sample_size,
            );
            tracing::warn!(placements = report.stats.placements, "conflict graph proven unsolvable");
            return Err(failure.into());
        }
        SearchOutcome::Halted => {
            let failure = search::halted_failure(
                &roster.participants,
                &build.graph,
                report.stats,
                config.diagnostic_sample_size,
            );
            tracing::warn!(placements = report.stats.placements, "assignment search hit placement cap");
            return Err(failure.into());
        }
    };

    assignment
        .verify(&roster.participants, &build.graph)
        .map_err(PairingError::InvariantViolation)?;

    let mut warnings = roster.warnings;
    warnings.extend(build.notices);
    tracing::info!(
        participants = assignment.len(),
        warnings = warnings.len(),
        placements = report.stats.placements,
        backtracks = report.stats.backtracks,
        "pairing computed"
    );

    Ok(PairingOutcome { assignment, warnings, stats: report.stats })
}
