/// Causally-ordered changes and the per-artifact append-only change log.
use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::{ArtifactId, ChangeId, CollabError, Result, UserId};

/// A single edit to an artifact. Immutable once appended to a log; a change
/// is never edited, only superseded by a later change that references it as
/// a parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Unique change ID, assigned by the submitting client
    pub id: ChangeId,

    /// Artifact this change applies to
    pub artifact_id: ArtifactId,

    /// User who authored this change
    pub author: UserId,

    /// Author-submitted creation time (client clock)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Change-kind tag, e.g. "edit" or one of the merge tags
    pub kind: String,

    /// Opaque payload; the engine never interprets gesture content
    pub payload: Vec<u8>,

    /// Parent change ids. Empty only for the first change to an artifact;
    /// more than one element only for a manual merge change.
    pub parents: Vec<ChangeId>,
}

impl Change {
    pub fn new(
        artifact_id: ArtifactId,
        author: UserId,
        kind: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            artifact_id,
            author,
            timestamp: chrono::Utc::now(),
            kind: kind.into(),
            payload,
            parents: Vec::new(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<ChangeId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_id(mut self, id: ChangeId) -> Self {
        self.id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// First change to an artifact has no parents
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Outcome of appending a change to a log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The change was new and is now part of the log
    Appended,

    /// An identical change was already present; the log is unchanged.
    /// Supports at-least-once redelivery from the transport.
    AlreadyPresent,
}

/// Append-only causal history of one artifact: a DAG keyed by parent-change
/// references. The frontier (changes with no children) is maintained
/// incrementally but must always equal the frontier recomputed from the
/// change set alone.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    changes: HashMap<ChangeId, Change>,
    order: Vec<ChangeId>,
    frontier: HashSet<ChangeId>,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change. Rejects a duplicate id whose content differs and any
    /// change referencing a parent absent from this log. Accepted changes
    /// are never removed.
    pub fn append(&mut self, change: Change) -> Result<AppendOutcome> {
        if let Some(existing) = self.changes.get(&change.id) {
            if *existing == change {
                return Ok(AppendOutcome::AlreadyPresent);
            }
            return Err(CollabError::DuplicateChangeId(change.id));
        }

        for parent in &change.parents {
            if !self.changes.contains_key(parent) {
                return Err(CollabError::UnknownParent(*parent));
            }
        }

        // A parent that was a frontier member stops being one; a parent that
        // already had a child is untouched, so the frontier grows. That is
        // exactly the divergence case.
        for parent in &change.parents {
            self.frontier.remove(parent);
        }
        self.frontier.insert(change.id);

        self.order.push(change.id);
        self.changes.insert(change.id, change);

        debug_assert_eq!(self.frontier, self.recompute_frontier());

        Ok(AppendOutcome::Appended)
    }

    pub fn get(&self, id: &ChangeId) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn contains(&self, id: &ChangeId) -> bool {
        self.changes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes in append order
    pub fn iter_in_order(&self) -> impl Iterator<Item = &Change> {
        self.order.iter().filter_map(|id| self.changes.get(id))
    }

    /// Set of change ids with no child. Empty only while the log is empty;
    /// one member means the artifact is clean, more means it is conflicted.
    pub fn frontier(&self) -> &HashSet<ChangeId> {
        &self.frontier
    }

    /// Derive the frontier purely from the change set:
    /// { c.id : no c' in the log has c.id among its parents }
    pub fn recompute_frontier(&self) -> HashSet<ChangeId> {
        let mut with_children = HashSet::new();
        for change in self.changes.values() {
            for parent in &change.parents {
                with_children.insert(*parent);
            }
        }
        self.changes
            .keys()
            .filter(|id| !with_children.contains(*id))
            .copied()
            .collect()
    }

    /// Frontier ordered by (author timestamp, change id) — the deterministic
    /// order concurrent changes are shown to a resolver in.
    pub fn ordered_frontier(&self) -> Vec<ChangeId> {
        let mut ids: Vec<ChangeId> = self.frontier.iter().copied().collect();
        ids.sort_by_key(|id| {
            let change = &self.changes[id];
            (change.timestamp, change.id)
        });
        ids
    }

    /// Lazily walk every ancestor of `id` (parents, their parents, and so
    /// on to the root). Recomputed per call; finite and bounded by log size.
    pub fn ancestors(&self, id: ChangeId) -> Ancestors<'_> {
        let mut queue = VecDeque::new();
        let mut seen = HashSet::new();
        if let Some(change) = self.changes.get(&id) {
            for parent in &change.parents {
                if seen.insert(*parent) {
                    queue.push_back(*parent);
                }
            }
        }
        Ancestors {
            log: self,
            queue,
            seen,
        }
    }

    /// True when `a` appears in the ancestry of `b`. A change is not its
    /// own ancestor.
    pub fn is_ancestor(&self, a: ChangeId, b: ChangeId) -> bool {
        self.ancestors(b).any(|id| id == a)
    }
}

/// Iterator over the ancestry of a change, breadth-first through the
/// parent DAG, each ancestor yielded once.
pub struct Ancestors<'a> {
    log: &'a ChangeLog,
    queue: VecDeque<ChangeId>,
    seen: HashSet<ChangeId>,
}

impl Iterator for Ancestors<'_> {
    type Item = ChangeId;

    fn next(&mut self) -> Option<ChangeId> {
        let next = self.queue.pop_front()?;
        if let Some(change) = self.log.get(&next) {
            for parent in &change.parents {
                if self.seen.insert(*parent) {
                    self.queue.push_back(*parent);
                }
            }
        }
        Some(next)
    }
}
