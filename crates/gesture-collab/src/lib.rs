/// Collaborative editing engine for shared gesture-definition artifacts.
/// Tracks every edit as a causally-ordered change, detects divergence and
/// resolves conflicts through a fixed set of policies.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod change;
pub use change::*;

mod conflict;
pub use conflict::*;

mod presence;
pub use presence::*;

mod session;
pub use session::*;

mod offline;
pub use offline::*;

mod protocol;
pub use protocol::*;

mod store;
pub use store::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error("duplicate change id with different content: {0}")]
    DuplicateChangeId(ChangeId),

    #[error("unknown parent change: {0}")]
    UnknownParent(ChangeId),

    #[error("conflict {0} is stale: the frontier moved since detection")]
    StaleConflict(ConflictId),

    #[error("session has ended: {0}")]
    SessionEnded(SessionId),

    #[error("role {actual:?} is insufficient, {required:?} or above required")]
    InsufficientRole { required: Role, actual: Role },

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("artifact not in session scope: {0}")]
    UnknownArtifact(ArtifactId),

    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    #[error("unknown conflict: {0}")]
    UnknownConflict(ConflictId),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;

/// User identifier in a collaborative session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Change identifier, assigned by the submitting client. The derived
/// ordering (uuid byte order, i.e. lexicographic over the canonical hex
/// form) is the deterministic tie-break used when ordering concurrent
/// changes for a resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeId(pub uuid::Uuid);

impl ChangeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Conflict record identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Named artifact under collaborative editing (a gesture definition).
/// Artifacts are externally named, so the id is a string rather than a uuid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ArtifactId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}
