/// Roles and presence state for session participants.
use serde::{Deserialize, Serialize};

use crate::{ArtifactId, UserId};

/// Seconds without activity before a user counts as idle
const IDLE_AFTER_SECS: i64 = 60;

/// Privilege level within a session, ordered: only Editor and above may
/// submit changes, only Admin may force-resolve.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Role {
    Viewer,
    Editor,
    Admin,
}

impl Role {
    pub fn can_edit(&self) -> bool {
        *self >= Role::Editor
    }
}

/// Where a participant currently is in the session lifecycle. Presence is
/// broadcast state only; losing an update never corrupts the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceState {
    Offline,
    Online,
    Editing,
    /// A change this user authored is part of an open conflict
    Conflicted,
}

/// A session participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub role: Role,
    pub state: PresenceState,
    pub last_active: chrono::DateTime<chrono::Utc>,
    /// Artifact the user is currently editing, if any
    pub editing: Option<ArtifactId>,
}

impl User {
    pub fn new(id: UserId, name: impl Into<String>, role: Role) -> Self {
        Self {
            id,
            name: name.into(),
            role,
            state: PresenceState::Online,
            last_active: chrono::Utc::now(),
            editing: None,
        }
    }

    /// Update the last-activity timestamp
    pub fn touch(&mut self) {
        self.last_active = chrono::Utc::now();
    }

    pub fn is_idle(&self) -> bool {
        let elapsed = chrono::Utc::now() - self.last_active;
        elapsed.num_seconds() > IDLE_AFTER_SECS
    }

    pub(crate) fn begin_editing(&mut self, artifact_id: ArtifactId) {
        // A conflicted user stays conflicted until their conflict resolves
        if self.state != PresenceState::Conflicted {
            self.state = PresenceState::Editing;
        }
        self.editing = Some(artifact_id);
        self.touch();
    }

    pub(crate) fn mark_conflicted(&mut self) {
        if self.state != PresenceState::Offline {
            self.state = PresenceState::Conflicted;
        }
    }

    pub(crate) fn back_online(&mut self) {
        if self.state != PresenceState::Offline {
            self.state = PresenceState::Online;
        }
    }

    pub(crate) fn go_offline(&mut self) {
        self.state = PresenceState::Offline;
        self.editing = None;
    }

    pub(crate) fn come_online(&mut self) {
        self.state = PresenceState::Online;
        self.touch();
    }
}
