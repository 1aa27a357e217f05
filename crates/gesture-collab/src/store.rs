/// Persisted-state layout for the persistence collaborator: one append-only
/// record file per artifact plus a session snapshot. Loading never trusts a
/// persisted frontier; the change log is replayed and conflicts re-detected.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{
    ArtifactId, Change, ChangeId, ChangeLog, CollabError, Conflict, ConflictDetector,
    PresenceState, Result, Role, Session, SessionId, UserId,
};

/// One record in an artifact's append-only log file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub change_id: ChangeId,
    pub parent_ids: Vec<ChangeId>,
    pub author_id: UserId,
    pub timestamp_utc_millis: i64,
    pub kind_tag: String,
    pub payload: Vec<u8>,
}

impl ChangeRecord {
    pub fn from_change(change: &Change) -> Self {
        Self {
            change_id: change.id,
            parent_ids: change.parents.clone(),
            author_id: change.author,
            timestamp_utc_millis: change.timestamp.timestamp_millis(),
            kind_tag: change.kind.clone(),
            payload: change.payload.clone(),
        }
    }

    /// Rehydrate a change; the artifact id comes from the file, not the
    /// record, since the log file is per artifact
    pub fn into_change(self, artifact_id: ArtifactId) -> Result<Change> {
        let timestamp = chrono::DateTime::from_timestamp_millis(self.timestamp_utc_millis)
            .ok_or_else(|| {
                CollabError::SerializationError(format!(
                    "timestamp out of range: {}",
                    self.timestamp_utc_millis
                ))
            })?;
        Ok(Change {
            id: self.change_id,
            artifact_id,
            author: self.author_id,
            timestamp,
            kind: self.kind_tag,
            payload: self.payload,
            parents: self.parent_ids,
        })
    }
}

/// Append-only storage for artifact change logs. Each record is framed as a
/// u32-LE length followed by the bincode-encoded `ChangeRecord`.
pub struct ArtifactLogStore {
    dir: PathBuf,
}

impl ArtifactLogStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn log_path(&self, artifact_id: &ArtifactId) -> PathBuf {
        // Artifact names are caller-controlled; keep the filename safe
        let safe: String = artifact_id
            .0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("artifact_{safe}.log"))
    }

    /// Append one change to its artifact's log file
    pub async fn append_change(&self, change: &Change) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;

        let record = ChangeRecord::from_change(change);
        let frame = bincode::serialize(&record)
            .map_err(|e| CollabError::SerializationError(e.to_string()))?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&change.artifact_id))
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        file.write_all(&(frame.len() as u32).to_le_bytes())
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        file.write_all(&frame)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        Ok(())
    }

    /// Rebuild an artifact's log by replaying the stored records through
    /// `ChangeLog::append`, then re-detect its conflict state. A record
    /// whose parent never appears is corruption: loading this artifact
    /// aborts, other artifacts stay loadable.
    pub async fn load_artifact_log(
        &self,
        artifact_id: &ArtifactId,
    ) -> Result<(ChangeLog, Option<Conflict>)> {
        let path = self.log_path(artifact_id);
        if !path.exists() {
            return Ok((ChangeLog::new(), None));
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;

        let mut log = ChangeLog::new();
        let mut offset = 0usize;
        let mut replayed = 0usize;
        while offset < bytes.len() {
            if offset + 4 > bytes.len() {
                return Err(CollabError::StorageError(format!(
                    "truncated record header in {}",
                    path.display()
                )));
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;
            offset += 4;

            if offset + len > bytes.len() {
                return Err(CollabError::StorageError(format!(
                    "truncated record body in {}",
                    path.display()
                )));
            }
            let record: ChangeRecord = bincode::deserialize(&bytes[offset..offset + len])
                .map_err(|e| CollabError::SerializationError(e.to_string()))?;
            offset += len;

            log.append(record.into_change(artifact_id.clone())?)?;
            replayed += 1;
        }

        debug!("replayed {replayed} records for artifact {artifact_id}");
        let conflict = ConflictDetector::detect(&log);
        Ok((log, conflict))
    }
}

/// One row of the session snapshot file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub role: Role,
    pub state: PresenceState,
}

/// Membership tuples for a session, in stable user-id order
pub fn snapshot_session(session: &Session) -> Vec<SnapshotEntry> {
    let mut entries: Vec<SnapshotEntry> = session
        .users()
        .map(|user| SnapshotEntry {
            session_id: session.id,
            user_id: user.id,
            role: user.role,
            state: user.state,
        })
        .collect();
    entries.sort_by_key(|entry| entry.user_id);
    entries
}

/// JSON snapshot of session membership
pub struct SessionSnapshotStore {
    dir: PathBuf,
}

impl SessionSnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("session_snapshot.json")
    }

    pub async fn save(&self, entries: &[SnapshotEntry]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| CollabError::SerializationError(e.to_string()))?;
        fs::write(self.snapshot_path(), json)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Vec<SnapshotEntry>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| CollabError::StorageError(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| CollabError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ArtifactId {
        ArtifactId::from("gesture1")
    }

    fn diverged_changes() -> Vec<Change> {
        let base = chrono::Utc::now();
        let c1 = Change::new(artifact(), UserId::new(), "edit", b"base".to_vec())
            .with_timestamp(base);
        let c2 = Change::new(artifact(), UserId::new(), "edit", b"left".to_vec())
            .with_timestamp(base + chrono::Duration::seconds(1))
            .with_parents(vec![c1.id]);
        let c3 = Change::new(artifact(), UserId::new(), "edit", b"right".to_vec())
            .with_timestamp(base + chrono::Duration::seconds(2))
            .with_parents(vec![c1.id]);
        vec![c1, c2, c3]
    }

    #[test]
    fn record_preserves_change_fields() {
        let change = Change::new(artifact(), UserId::new(), "edit", b"payload".to_vec())
            .with_parents(vec![]);
        let record = ChangeRecord::from_change(&change);
        let restored = record.into_change(artifact()).unwrap();

        assert_eq!(restored.id, change.id);
        assert_eq!(restored.payload, change.payload);
        assert_eq!(restored.kind, change.kind);
        // Millisecond precision is the persisted granularity
        assert_eq!(
            restored.timestamp.timestamp_millis(),
            change.timestamp.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn log_round_trips_and_redetects_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactLogStore::new(dir.path());

        let changes = diverged_changes();
        let mut live = ChangeLog::new();
        for change in &changes {
            live.append(change.clone()).unwrap();
            store.append_change(change).await.unwrap();
        }

        let (loaded, conflict) = store.load_artifact_log(&artifact()).await.unwrap();
        assert_eq!(loaded.len(), live.len());
        assert_eq!(*loaded.frontier(), *live.frontier());

        // The divergence is re-detected from the replayed log
        let conflict = conflict.expect("two-branch log must load conflicted");
        assert_eq!(conflict.frontier, live.ordered_frontier());
    }

    #[tokio::test]
    async fn missing_log_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactLogStore::new(dir.path());
        let (log, conflict) = store.load_artifact_log(&artifact()).await.unwrap();
        assert!(log.is_empty());
        assert!(conflict.is_none());
    }

    #[tokio::test]
    async fn record_with_phantom_parent_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactLogStore::new(dir.path());

        let phantom = ChangeId::new();
        let orphan = Change::new(artifact(), UserId::new(), "edit", vec![])
            .with_parents(vec![phantom]);
        store.append_change(&orphan).await.unwrap();

        let result = store.load_artifact_log(&artifact()).await;
        assert_eq!(result.unwrap_err(), CollabError::UnknownParent(phantom));
    }

    #[tokio::test]
    async fn truncated_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactLogStore::new(dir.path());

        let change = Change::new(artifact(), UserId::new(), "edit", b"payload".to_vec());
        store.append_change(&change).await.unwrap();

        // Chop the tail off the record body
        let path = dir.path().join("artifact_gesture1.log");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let result = store.load_artifact_log(&artifact()).await;
        assert!(matches!(result, Err(CollabError::StorageError(_))));
    }

    #[tokio::test]
    async fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionSnapshotStore::new(dir.path());

        let session_id = SessionId::new();
        let entries = vec![
            SnapshotEntry {
                session_id,
                user_id: UserId::new(),
                role: Role::Admin,
                state: PresenceState::Online,
            },
            SnapshotEntry {
                session_id,
                user_id: UserId::new(),
                role: Role::Viewer,
                state: PresenceState::Offline,
            },
        ];
        store.save(&entries).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, entries);
    }
}
