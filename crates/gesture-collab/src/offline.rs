/// Offline support: queue changes locally while disconnected, persist the
/// queue, and replay it against the authoritative session on reconnect.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::{
    Change, CollabError, ConflictId, Result, SessionId, SessionManager, SubmitOutcome, UserId,
};

/// Ordered queue of changes made while disconnected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueue {
    pub session_id: SessionId,

    pub user_id: UserId,

    /// Changes not yet replayed, in original local order
    pub pending_changes: Vec<Change>,

    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl OfflineQueue {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self {
            session_id,
            user_id,
            pending_changes: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn enqueue(&mut self, change: Change) {
        self.pending_changes.push(change);
    }

    /// Take all pending changes, preserving order
    pub fn drain_pending(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.pending_changes)
    }

    pub fn is_empty(&self) -> bool {
        self.pending_changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending_changes.len()
    }
}

/// Offline queue with persistent storage, one queue file per session
pub struct OfflineQueueManager {
    storage_dir: PathBuf,
    current_queue: Option<OfflineQueue>,
}

impl OfflineQueueManager {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            current_queue: None,
        }
    }

    pub fn start_queue(&mut self, session_id: SessionId, user_id: UserId) {
        self.current_queue = Some(OfflineQueue::new(session_id, user_id));
    }

    pub fn enqueue(&mut self, change: Change) -> Result<()> {
        match &mut self.current_queue {
            Some(queue) => {
                queue.enqueue(change);
                Ok(())
            }
            None => Err(CollabError::StorageError(
                "no active offline queue".to_string(),
            )),
        }
    }

    pub fn drain_pending(&mut self) -> Vec<Change> {
        self.current_queue
            .as_mut()
            .map(OfflineQueue::drain_pending)
            .unwrap_or_default()
    }

    pub fn has_pending(&self) -> bool {
        self.current_queue
            .as_ref()
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.current_queue.as_ref().map(OfflineQueue::len).unwrap_or(0)
    }

    pub fn clear_queue(&mut self) {
        self.current_queue = None;
    }

    fn queue_path(&self, session_id: SessionId) -> PathBuf {
        self.storage_dir
            .join(format!("offline_queue_{}.json", session_id.0))
    }

    /// Save the current queue to disk as JSON
    pub async fn save_queue(&self) -> Result<()> {
        let Some(queue) = &self.current_queue else {
            return Ok(());
        };
        if queue.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;

        let json = serde_json::to_string_pretty(queue)
            .map_err(|e| CollabError::SerializationError(e.to_string()))?;
        fs::write(self.queue_path(queue.session_id), json)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;

        debug!(
            "saved offline queue for session {} ({} changes)",
            queue.session_id,
            queue.len()
        );
        Ok(())
    }

    /// Load a saved queue from disk, if one exists
    pub async fn load_queue(&mut self, session_id: SessionId) -> Result<()> {
        let path = self.queue_path(session_id);
        if !path.exists() {
            return Ok(());
        }

        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        let queue: OfflineQueue = serde_json::from_str(&json)
            .map_err(|e| CollabError::SerializationError(e.to_string()))?;
        self.current_queue = Some(queue);
        Ok(())
    }

    pub async fn delete_saved_queue(&self, session_id: SessionId) -> Result<()> {
        let path = self.queue_path(session_id);
        if path.exists() {
            fs::remove_file(&path)
                .await
                .map_err(|e| CollabError::StorageError(e.to_string()))?;
        }
        Ok(())
    }
}

/// Result of replaying an offline queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Changes now present in the remote log (including identical
    /// duplicates the remote had already seen)
    pub applied: usize,

    /// Conflicts raised during replay; later entries may supersede earlier
    /// ones when several queued changes widen the same frontier
    pub conflicts: Vec<ConflictId>,
}

/// Replays locally queued changes through the normal submission path, so
/// every divergence surfaces as an ordinary conflict for the standard
/// resolver. There is no bespoke offline-merge logic and no rebasing.
pub struct OfflineReconciler;

impl OfflineReconciler {
    pub fn reconcile(
        manager: &mut SessionManager,
        session_id: &SessionId,
        queue: Vec<Change>,
    ) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            applied: 0,
            conflicts: Vec::new(),
        };

        for change in queue {
            let change_id = change.id;
            match manager.submit_change(session_id, change) {
                Ok(SubmitOutcome::Applied { conflict }) => {
                    report.applied += 1;
                    if let Some(conflict_id) = conflict {
                        report.conflicts.push(conflict_id);
                    }
                }
                Ok(SubmitOutcome::AlreadyApplied) => {
                    // The remote saw this change before we went offline
                    report.applied += 1;
                }
                Err(CollabError::UnknownParent(parent)) => {
                    // The declared parent never existed remotely. Guessing a
                    // new parent would hide the divergence, so fail fast.
                    warn!(
                        "reconciliation stopped at change {change_id}: parent {parent} \
                         never existed remotely"
                    );
                    return Err(CollabError::UnknownParent(parent));
                }
                Err(other) => return Err(other),
            }
        }

        debug!(
            "reconciled {} offline changes, {} conflicts raised",
            report.applied,
            report.conflicts.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArtifactId, ChangeId, Role};

    fn edit(author: UserId, parents: Vec<ChangeId>) -> Change {
        Change::new(ArtifactId::from("gesture1"), author, "edit", b"g".to_vec())
            .with_parents(parents)
    }

    #[test]
    fn queue_preserves_order() {
        let mut queue = OfflineQueue::new(SessionId::new(), UserId::new());
        assert!(queue.is_empty());

        let author = UserId::new();
        let c1 = edit(author, vec![]);
        let c2 = edit(author, vec![c1.id]);
        queue.enqueue(c1.clone());
        queue.enqueue(c2.clone());
        assert_eq!(queue.len(), 2);

        let drained = queue.drain_pending();
        assert_eq!(drained[0].id, c1.id);
        assert_eq!(drained[1].id, c2.id);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn queue_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = SessionId::new();
        let user_id = UserId::new();

        let mut manager = OfflineQueueManager::new(dir.path());
        manager.start_queue(session_id, user_id);
        let author = UserId::new();
        let c1 = edit(author, vec![]);
        let c2 = edit(author, vec![c1.id]);
        manager.enqueue(c1.clone()).unwrap();
        manager.enqueue(c2.clone()).unwrap();
        manager.save_queue().await.unwrap();

        let mut restored = OfflineQueueManager::new(dir.path());
        restored.load_queue(session_id).await.unwrap();
        assert_eq!(restored.pending_count(), 2);

        let drained = restored.drain_pending();
        assert_eq!(drained, vec![c1, c2]);

        restored.delete_saved_queue(session_id).await.unwrap();
        let mut empty = OfflineQueueManager::new(dir.path());
        empty.load_queue(session_id).await.unwrap();
        assert!(!empty.has_pending());
    }

    #[test]
    fn enqueue_without_active_queue_fails() {
        let mut manager = OfflineQueueManager::new("/tmp/unused");
        let result = manager.enqueue(edit(UserId::new(), vec![]));
        assert!(matches!(result, Err(CollabError::StorageError(_))));
    }

    #[test]
    fn replay_surfaces_divergence_as_conflict() {
        let mut manager = SessionManager::new();
        let session = manager.create_session("s", [ArtifactId::from("gesture1")]);
        let online = UserId::new();
        let offline = UserId::new();
        manager
            .join_session(&session, online, "A", Role::Editor)
            .unwrap();
        manager
            .join_session(&session, offline, "B", Role::Editor)
            .unwrap();

        // Shared history before B went offline
        let base = edit(online, vec![]);
        manager.submit_change(&session, base.clone()).unwrap();

        // While B is away, A advances the artifact
        manager
            .submit_change(&session, edit(online, vec![base.id]))
            .unwrap();

        // B queued an edit against the base it had seen
        let queued = vec![edit(offline, vec![base.id])];
        let report = OfflineReconciler::reconcile(&mut manager, &session, queued).unwrap();

        assert_eq!(report.applied, 1);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(manager.session(&session).unwrap().open_conflicts().count(), 1);
    }

    #[test]
    fn replay_of_already_seen_changes_is_idempotent() {
        let mut manager = SessionManager::new();
        let session = manager.create_session("s", [ArtifactId::from("gesture1")]);
        let user = UserId::new();
        manager
            .join_session(&session, user, "A", Role::Editor)
            .unwrap();

        let c1 = edit(user, vec![]);
        let c2 = edit(user, vec![c1.id]);
        manager.submit_change(&session, c1.clone()).unwrap();
        manager.submit_change(&session, c2.clone()).unwrap();

        // The whole queue had in fact already reached the coordinator
        let report =
            OfflineReconciler::reconcile(&mut manager, &session, vec![c1, c2]).unwrap();
        assert_eq!(report.applied, 2);
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn unresolvable_parent_fails_fast() {
        let mut manager = SessionManager::new();
        let session = manager.create_session("s", [ArtifactId::from("gesture1")]);
        let user = UserId::new();
        manager
            .join_session(&session, user, "A", Role::Editor)
            .unwrap();

        let good = edit(user, vec![]);
        let phantom_parent = ChangeId::new();
        let bad = edit(user, vec![phantom_parent]);
        let after = edit(user, vec![good.id]);

        let result = OfflineReconciler::reconcile(
            &mut manager,
            &session,
            vec![good.clone(), bad, after],
        );
        assert_eq!(result, Err(CollabError::UnknownParent(phantom_parent)));

        // The valid prefix stays applied; nothing was guessed for the rest
        let log = manager
            .session(&session)
            .unwrap()
            .log(&ArtifactId::from("gesture1"))
            .unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.contains(&good.id));
    }
}
