/// Divergence detection and conflict resolution over a change log frontier.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{
    ArtifactId, Change, ChangeId, ChangeLog, CollabError, ConflictId, Result, Role, UserId,
};

/// Kind tag of a last-writer-wins resolution change
pub const MERGE_LWW: &str = "merge:lww";
/// Kind tag of a role-preference resolution change
pub const MERGE_ROLE: &str = "merge:role";
/// Kind tag of a manual merge change (true merge node, all frontier parents)
pub const MERGE_MANUAL: &str = "merge:manual";
/// Kind tag of a rejection resolution change
pub const MERGE_REJECT: &str = "merge:reject";
/// Resolution tag recorded on a conflict superseded by a wider one
pub const RESOLVED_SUPERSEDED: &str = "superseded";

/// A detected divergence: two or more frontier changes with a common
/// ancestor. Superseded rather than mutated if the frontier grows again
/// before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,

    pub artifact_id: ArtifactId,

    /// Frontier at detection time, ordered by (author timestamp, change id)
    pub frontier: Vec<ChangeId>,

    pub detected_at: chrono::DateTime<chrono::Utc>,

    pub resolved: bool,

    /// Resolution-kind tag once resolved (a merge tag, or "superseded")
    pub resolution: Option<String>,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        !self.resolved
    }

    pub fn involves(&self, change_id: &ChangeId) -> bool {
        self.frontier.contains(change_id)
    }

    pub(crate) fn mark_resolved(&mut self, kind: impl Into<String>) {
        self.resolved = true;
        self.resolution = Some(kind.into());
    }
}

/// Stateless frontier scan. Re-run after every append; the engine never
/// trusts a cached "is conflicted" flag independent of the frontier.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Pure function over a change log snapshot: `None` while the frontier
    /// has at most one member, otherwise a conflict covering the frontier.
    pub fn detect(log: &ChangeLog) -> Option<Conflict> {
        if log.frontier().len() <= 1 {
            return None;
        }

        let frontier = log.ordered_frontier();
        let artifact_id = log
            .get(&frontier[0])
            .map(|change| change.artifact_id.clone())?;

        Some(Conflict {
            id: ConflictId::new(),
            artifact_id,
            frontier,
            detected_at: chrono::Utc::now(),
            resolved: false,
            resolution: None,
        })
    }
}

/// How a detected conflict is resolved. A closed set, matched exhaustively;
/// `ManualMerge` is the documented extension point for domain-aware merges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionPolicy {
    /// Keep the frontier change with the latest author timestamp
    LastWriterWins,

    /// Keep the frontier change from the most privileged author, preferring
    /// authors at or above the given role
    PreferRole(Role),

    /// Caller supplies the merged payload; the resolution change records
    /// every frontier change as a parent
    ManualMerge(Vec<u8>),

    /// Keep exactly one frontier change and discard the rest
    Reject { keep: ChangeId },
}

impl ResolutionPolicy {
    pub fn kind_tag(&self) -> &'static str {
        match self {
            ResolutionPolicy::LastWriterWins => MERGE_LWW,
            ResolutionPolicy::PreferRole(_) => MERGE_ROLE,
            ResolutionPolicy::ManualMerge(_) => MERGE_MANUAL,
            ResolutionPolicy::Reject { .. } => MERGE_REJECT,
        }
    }

    /// Minimum role required to apply this policy. Rejecting discards
    /// another author's accepted work, which is the admin-only force path.
    pub fn required_role(&self) -> Role {
        match self {
            ResolutionPolicy::Reject { .. } => Role::Admin,
            _ => Role::Editor,
        }
    }
}

/// Applies a resolution policy to a detected conflict, producing the single
/// change that supersedes the divergent branches.
pub struct ConflictResolver;

impl ConflictResolver {
    /// Build the resolution change for `conflict` under `policy`. Fails with
    /// `StaleConflict` when the log frontier no longer matches the conflict;
    /// the caller must re-detect. Never mutates the log itself.
    pub fn resolve(
        conflict: &Conflict,
        policy: &ResolutionPolicy,
        log: &ChangeLog,
        roles: &HashMap<UserId, Role>,
        resolved_by: UserId,
    ) -> Result<Change> {
        let recorded: HashSet<ChangeId> = conflict.frontier.iter().copied().collect();
        if recorded != *log.frontier() {
            return Err(CollabError::StaleConflict(conflict.id));
        }

        let (parents, payload) = match policy {
            ResolutionPolicy::LastWriterWins => {
                let winner = Self::last_writer(conflict, log)?;
                (vec![winner.id], winner.payload.clone())
            }

            ResolutionPolicy::PreferRole(preferred) => {
                let winner = Self::highest_role_author(conflict, log, roles, *preferred)?;
                (vec![winner.id], winner.payload.clone())
            }

            ResolutionPolicy::ManualMerge(payload) => {
                // True merge node: every frontier change becomes a parent
                (conflict.frontier.clone(), payload.clone())
            }

            ResolutionPolicy::Reject { keep } => {
                if !conflict.involves(keep) {
                    return Err(CollabError::UnknownParent(*keep));
                }
                let kept = log
                    .get(keep)
                    .ok_or(CollabError::UnknownParent(*keep))?;
                (vec![kept.id], kept.payload.clone())
            }
        };

        Ok(
            Change::new(
                conflict.artifact_id.clone(),
                resolved_by,
                policy.kind_tag(),
                payload,
            )
            .with_parents(parents),
        )
    }

    /// Frontier changes a resolution discards: everything not an ancestor
    /// of (or equal to) the resolution change's parents.
    pub fn losing_changes(conflict: &Conflict, resolution: &Change) -> Vec<ChangeId> {
        conflict
            .frontier
            .iter()
            .filter(|id| !resolution.parents.contains(id))
            .copied()
            .collect()
    }

    fn last_writer<'a>(conflict: &Conflict, log: &'a ChangeLog) -> Result<&'a Change> {
        // The recorded frontier is ordered by (timestamp, id) ascending, so
        // the last entry is the winner
        let id = conflict
            .frontier
            .last()
            .ok_or(CollabError::StaleConflict(conflict.id))?;
        log.get(id).ok_or(CollabError::UnknownParent(*id))
    }

    fn highest_role_author<'a>(
        conflict: &Conflict,
        log: &'a ChangeLog,
        roles: &HashMap<UserId, Role>,
        preferred: Role,
    ) -> Result<&'a Change> {
        let mut best: Option<(&Change, Role)> = None;
        for id in &conflict.frontier {
            let change = log.get(id).ok_or(CollabError::UnknownParent(*id))?;
            let role = roles.get(&change.author).copied().unwrap_or(Role::Viewer);
            // Rank by (meets preference, role); frontier order already breaks
            // the remaining ties by (timestamp, id)
            let better = match best {
                None => true,
                Some((_, best_role)) => {
                    (role >= preferred, role) >= (best_role >= preferred, best_role)
                }
            };
            if better {
                best = Some((change, role));
            }
        }
        best.map(|(change, _)| change)
            .ok_or(CollabError::StaleConflict(conflict.id))
    }
}
