use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::participant::{Participant, ParticipantId, Warning};

/// Symmetric forbidden-pair relation over participant identifiers.
///
/// Every loaded participant has an entry, possibly empty. Identifiers that
/// were only ever referenced (never loaded) also get an entry so the relation
/// stays symmetric.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct ConflictGraph {
    edges: BTreeMap<ParticipantId, BTreeSet<ParticipantId>>,
}

impl ConflictGraph {
    #[must_use]
    pub fn conflicts(&self, id: &ParticipantId) -> Option<&BTreeSet<ParticipantId>> {
        self.edges.get(id)
    }

    #[must_use]
    pub fn conflicts_with(&self, lhs: &ParticipantId, rhs: &ParticipantId) -> bool {
        self.edges.get(lhs).is_some_and(|targets| targets.contains(rhs))
    }

    #[must_use]
    pub fn degree(&self, id: &ParticipantId) -> usize {
        self.edges.get(id).map_or(0, BTreeSet::len)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.edges.keys()
    }

    #[must_use]
    pub fn is_symmetric(&self) -> bool {
        self.edges
            .iter()
            .all(|(lhs, targets)| targets.iter().all(|rhs| self.conflicts_with(rhs, lhs)))
    }

    fn ensure(&mut self, id: &ParticipantId) {
        self.edges.entry(id.clone()).or_default();
    }

    fn insert_edge(&mut self, lhs: &ParticipantId, rhs: &ParticipantId) {
        self.edges.entry(lhs.clone()).or_default().insert(rhs.clone());
        self.edges.entry(rhs.clone()).or_default().insert(lhs.clone());
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct GraphBuild {
    pub graph: ConflictGraph,
    pub notices: Vec<Warning>,
}

fn canonical_pair<'a>(
    lhs: &'a ParticipantId,
    rhs: &'a ParticipantId,
) -> (&'a ParticipantId, &'a ParticipantId) {
    if lhs <= rhs {
        (lhs, rhs)
    } else {
        (rhs, lhs)
    }
}

/// Union every declared conflict into a symmetric graph.
///
/// A one-sided declaration becomes a mutual constraint and is reported once
/// per unordered pair as [`Warning::AsymmetricConflict`]. Declarations naming
/// an id outside `participants` are kept in the graph and reported as
/// [`Warning::UnknownConflictReference`].
#[must_use]
pub fn build_conflict_graph(participants: &[Participant]) -> GraphBuild {
    let known: BTreeSet<&ParticipantId> = participants.iter().map(|p| &p.id).collect();
    let declared: BTreeSet<(&ParticipantId, &ParticipantId)> = participants
        .iter()
        .flat_map(|p| p.conflicts.iter().map(move |target| (&p.id, target)))
        .collect();

    let mut build = GraphBuild::default();
    for participant in participants {
        build.graph.ensure(&participant.id);
    }

    let mut reported = BTreeSet::new();
    for participant in participants {
        for target in &participant.conflicts {
            build.graph.insert_edge(&participant.id, target);

            if !known.contains(target) {
                build.notices.push(Warning::UnknownConflictReference {
                    participant: participant.id.clone(),
                    referenced: target.clone(),
                });
                continue;
            }

            if declared.contains(&(target, &participant.id)) {
                continue;
            }
            if reported.insert(canonical_pair(&participant.id, target)) {
                build.notices.push(Warning::AsymmetricConflict {
                    declared_by: participant.id.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    if !build.notices.is_empty() {
        tracing::debug!(notices = build.notices.len(), "conflict graph reconciled with notices");
    }
    build
}
