use std::collections::{BTreeMap, BTreeSet};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, PairingFailure};
use crate::feasibility::known_conflict_count;
use crate::graph::ConflictGraph;
use crate::participant::{Participant, ParticipantId, ParticipantRef};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SearchLimits {
    /// Stop after this many tentative placements. `None` runs to completion.
    pub max_placements: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SearchStats {
    pub placements: u64,
    pub backtracks: u64,
}

/// Giver to receiver mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct Assignment(BTreeMap<ParticipantId, ParticipantId>);

impl Assignment {
    #[must_use]
    pub fn receiver_for(&self, giver: &ParticipantId) -> Option<&ParticipantId> {
        self.0.get(giver)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParticipantId, &ParticipantId)> {
        self.0.iter()
    }

    /// Check the completed-assignment invariants against `participants`.
    ///
    /// # Errors
    /// Returns a description of the first violated invariant.
    pub fn verify(&self, participants: &[Participant], graph: &ConflictGraph) -> Result<(), String> {
        let ids = participants.iter().map(|p| &p.id).collect::<BTreeSet<_>>();
        if self.0.len() != ids.len() || self.0.keys().any(|giver| !ids.contains(giver)) {
            return Err(format!(
                "assignment covers {} givers but {} participants were supplied",
                self.0.len(),
                ids.len()
            ));
        }

        let mut receivers = BTreeSet::new();
        for (giver, receiver) in &self.0 {
            if giver == receiver {
                return Err(format!("self-assignment detected for {giver}"));
            }
            if !ids.contains(receiver) {
                return Err(format!("{giver} was assigned unknown receiver {receiver}"));
            }
            if !receivers.insert(receiver) {
                return Err(format!("receiver {receiver} was assigned more than once"));
            }
            if graph.conflicts_with(giver, receiver) {
                return Err(format!("{giver} was assigned conflicted receiver {receiver}"));
            }
        }
        Ok(())
    }
}

impl FromIterator<(ParticipantId, ParticipantId)> for Assignment {
    fn from_iter<T: IntoIterator<Item = (ParticipantId, ParticipantId)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SearchOutcome {
    Complete(Assignment),
    /// Every branch was explored; no assignment exists.
    Unsolvable,
    /// The placement cap was reached first.
    Halted,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SearchReport {
    pub outcome: SearchOutcome,
    pub stats: SearchStats,
}

enum Step {
    Complete,
    DeadEnd,
    Halted,
}

/// Mutable state of one search, owned by a single call.
struct SearchState {
    order: Vec<usize>,
    allowed: Vec<Vec<bool>>,
    receiver_of: Vec<Option<usize>>,
    used: Vec<bool>,
    limits: SearchLimits,
    stats: SearchStats,
}

impl SearchState {
    fn new<R: Rng + ?Sized>(
        participants: &[Participant],
        graph: &ConflictGraph,
        limits: SearchLimits,
        rng: &mut R,
    ) -> Self {
        let count = participants.len();
        let allowed = participants
            .iter()
            .enumerate()
            .map(|(giver_index, giver)| {
                participants
                    .iter()
                    .enumerate()
                    .map(|(receiver_index, receiver)| {
                        giver_index != receiver_index
                            && !graph.conflicts_with(&giver.id, &receiver.id)
                    })
                    .collect()
            })
            .collect();

        let mut order = (0..count).collect::<Vec<_>>();
        order.shuffle(rng);

        Self {
            order,
            allowed,
            receiver_of: vec![None; count],
            used: vec![false; count],
            limits,
            stats: SearchStats::default(),
        }
    }

    fn cap_reached(&self) -> bool {
        self.limits.max_placements.is_some_and(|max| self.stats.placements >= max)
    }

    fn place(&mut self, giver: usize, receiver: usize) {
        self.receiver_of[giver] = Some(receiver);
        self.used[receiver] = true;
        self.stats.placements += 1;
    }

    fn undo(&mut self, giver: usize, receiver: usize) {
        self.receiver_of[giver] = None;
        self.used[receiver] = false;
        self.stats.backtracks += 1;
    }

    fn extend<R: Rng + ?Sized>(&mut self, position: usize, rng: &mut R) -> Step {
        let Some(&giver) = self.order.get(position) else {
            return Step::Complete;
        };

        let mut candidates =
            (0..self.used.len()).filter(|&receiver| !self.used[receiver]).collect::<Vec<_>>();
        candidates.shuffle(rng);

        for receiver in candidates {
            if !self.allowed[giver][receiver] {
                continue;
            }
            if self.cap_reached() {
                return Step::Halted;
            }

            self.place(giver, receiver);
            match self.extend(position + 1, rng) {
                Step::Complete => return Step::Complete,
                Step::Halted => return Step::Halted,
                Step::DeadEnd => self.undo(giver, receiver),
            }
        }

        Step::DeadEnd
    }

    fn into_assignment(self, participants: &[Participant]) -> Assignment {
        self.receiver_of
            .iter()
            .enumerate()
            .filter_map(|(giver, receiver)| {
                receiver.map(|receiver| {
                    (participants[giver].id.clone(), participants[receiver].id.clone())
                })
            })
            .collect()
    }
}

/// Randomised exhaustive backtracking over giver to receiver choices.
///
/// Giver order is shuffled once; the remaining receivers are reshuffled at
/// every decision point. The first complete assignment found is returned.
pub fn search_assignment<R: Rng + ?Sized>(
    participants: &[Participant],
    graph: &ConflictGraph,
    limits: SearchLimits,
    rng: &mut R,
) -> SearchReport {
    let mut state = SearchState::new(participants, graph, limits, rng);
    let step = state.extend(0, rng);
    let stats = state.stats;

    let outcome = match step {
        Step::Complete => SearchOutcome::Complete(state.into_assignment(participants)),
        Step::DeadEnd => SearchOutcome::Unsolvable,
        Step::Halted => SearchOutcome::Halted,
    };
    tracing::debug!(
        placements = stats.placements,
        backtracks = stats.backtracks,
        "assignment search finished"
    );
    SearchReport { outcome, stats }
}

/// Participants with the most conflicts, highest first, for failure reports.
fn conflict_hotspots(
    participants: &[Participant],
    graph: &ConflictGraph,
    sample_size: usize,
) -> Vec<(ParticipantRef, usize)> {
    let known = participants.iter().map(|p| &p.id).collect::<BTreeSet<_>>();
    let mut counts = participants
        .iter()
        .map(|participant| (participant.reference(), known_conflict_count(participant, graph, &known)))
        .filter(|(_, count)| *count > 0)
        .collect::<Vec<_>>();
    counts.sort_by(|lhs, rhs| rhs.1.cmp(&lhs.1).then_with(|| lhs.0.id.cmp(&rhs.0.id)));
    counts.truncate(sample_size);
    counts
}

fn hotspot_summary(hotspots: &[(ParticipantRef, usize)]) -> String {
    if hotspots.is_empty() {
        return "no participant declared any conflict".to_string();
    }
    hotspots
        .iter()
        .map(|(participant, count)| format!("{participant}: {count} conflicts"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn unsolvable_failure(
    participants: &[Participant],
    graph: &ConflictGraph,
    sample_size: usize,
) -> PairingFailure {
    let hotspots = conflict_hotspots(participants, graph, sample_size);
    PairingFailure {
        kind: FailureKind::Unsolvable,
        detail: format!(
            "Unable to generate valid pairings for {} participants: the conflict constraints are \
             too tight. Conflict counts: {}",
            participants.len(),
            hotspot_summary(&hotspots)
        ),
        blocking: hotspots.into_iter().map(|(participant, _)| participant).collect(),
    }
}

pub(crate) fn halted_failure(
    participants: &[Participant],
    graph: &ConflictGraph,
    stats: SearchStats,
    sample_size: usize,
) -> PairingFailure {
    let hotspots = conflict_hotspots(participants, graph, sample_size);
    PairingFailure {
        kind: FailureKind::SearchExhausted,
        detail: format!(
            "Search stopped after {} placements without finding valid pairings for {} \
             participants; raise or remove the placement cap. Conflict counts: {}",
            stats.placements,
            participants.len(),
            hotspot_summary(&hotspots)
        ),
        blocking: hotspots.into_iter().map(|(participant, _)| participant).collect(),
    }
}
