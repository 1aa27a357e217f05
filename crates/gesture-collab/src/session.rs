/// Session ownership: membership, change routing, conflict bookkeeping and
/// observer notification. All mutations to one artifact's log are serialized
/// through the owning manager; there is no shared state between artifacts.
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    ArtifactId, Change, ChangeId, ChangeLog, CollabError, Conflict, ConflictDetector,
    ConflictId, ConflictResolver, PresenceState, ResolutionPolicy, Result, Role, SessionId,
    User, UserId, RESOLVED_SUPERSEDED,
};

use crate::change::AppendOutcome;

/// Engine tunables. Constructed by the caller; there is no global state.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// How many detect-then-resolve rounds `resolve_latest` attempts before
    /// surfacing `StaleConflict` for manual intervention
    pub max_resolve_retries: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            max_resolve_retries: 3,
        }
    }
}

/// Rendering/notification collaborators subscribe through this trait.
/// Callbacks are invoked after engine state has settled, in subscription
/// order; a slow or failing observer cannot corrupt the change log.
pub trait SessionObserver {
    fn on_change_appended(&mut self, _change: &Change) {}
    fn on_conflict_opened(&mut self, _conflict: &Conflict) {}
    fn on_conflict_resolved(&mut self, _conflict: &Conflict, _resolution: &Change) {}
    fn on_user_state_changed(&mut self, _user: &User) {}
}

enum Event {
    ChangeAppended(Change),
    ConflictOpened(Conflict),
    ConflictResolved(Conflict, Change),
    UserStateChanged(User),
}

/// Result of submitting a change to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The change is now part of the artifact's log; carries the conflict
    /// opened by this append, if any
    Applied { conflict: Option<ConflictId> },

    /// Identical change already present (at-least-once redelivery);
    /// nothing changed
    AlreadyApplied,
}

/// Summary exposed to rendering collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub user_count: usize,
    pub change_count: usize,
    pub open_conflicts: usize,
    pub active: bool,
}

/// One collaborative editing session over a set of named artifacts
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    artifacts: HashSet<ArtifactId>,
    logs: HashMap<ArtifactId, ChangeLog>,
    users: HashMap<UserId, User>,
    /// Session-wide change ids, ordered by arrival
    arrival: Vec<ChangeId>,
    /// Conflict history in detection order, open and resolved
    conflicts: Vec<Conflict>,
    active: bool,
}

impl Session {
    fn new(id: SessionId, name: String, artifacts: HashSet<ArtifactId>) -> Self {
        Self {
            id,
            name,
            created_at: chrono::Utc::now(),
            artifacts,
            logs: HashMap::new(),
            users: HashMap::new(),
            arrival: Vec::new(),
            conflicts: Vec::new(),
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn user(&self, user_id: &UserId) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn artifact_ids(&self) -> &HashSet<ArtifactId> {
        &self.artifacts
    }

    pub fn log(&self, artifact_id: &ArtifactId) -> Option<&ChangeLog> {
        self.logs.get(artifact_id)
    }

    /// Session-wide changes in arrival order
    pub fn changes_in_arrival_order(&self) -> impl Iterator<Item = &ChangeId> {
        self.arrival.iter()
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn open_conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.is_open())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            name: self.name.clone(),
            user_count: self.users.len(),
            change_count: self.arrival.len(),
            open_conflicts: self.open_conflicts().count(),
            active: self.active,
        }
    }

    fn open_conflict_for(&self, artifact_id: &ArtifactId) -> Option<&Conflict> {
        self.conflicts
            .iter()
            .find(|c| c.is_open() && c.artifact_id == *artifact_id)
    }

    fn conflict_mut(&mut self, conflict_id: &ConflictId) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|c| c.id == *conflict_id)
    }

    fn roles(&self) -> HashMap<UserId, Role> {
        self.users.iter().map(|(id, user)| (*id, user.role)).collect()
    }

    /// Authors of frontier changes in any open conflict
    fn conflicted_authors(&self) -> HashSet<UserId> {
        let mut authors = HashSet::new();
        for conflict in self.conflicts.iter().filter(|c| c.is_open()) {
            if let Some(log) = self.logs.get(&conflict.artifact_id) {
                for id in &conflict.frontier {
                    if let Some(change) = log.get(id) {
                        authors.insert(change.author);
                    }
                }
            }
        }
        authors
    }
}

/// The engine. Explicitly constructed and passed; owns every session and
/// serializes all mutations, so different sessions and artifacts never share
/// mutable state behind the caller's back.
pub struct SessionManager {
    config: CollabConfig,
    sessions: HashMap<SessionId, Session>,
    observers: Vec<Box<dyn SessionObserver>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_config(CollabConfig::default())
    }

    pub fn with_config(config: CollabConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            observers: Vec::new(),
        }
    }

    /// Register an observer. Delivery is deterministic: events in the order
    /// they occurred, observers in subscription order.
    pub fn subscribe(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn create_session(
        &mut self,
        name: impl Into<String>,
        artifacts: impl IntoIterator<Item = ArtifactId>,
    ) -> SessionId {
        let id = SessionId::new();
        let name = name.into();
        info!("created session {id} ({name})");
        self.sessions
            .insert(id, Session::new(id, name, artifacts.into_iter().collect()));
        id
    }

    pub fn session(&self, session_id: &SessionId) -> Result<&Session> {
        self.sessions
            .get(session_id)
            .ok_or(CollabError::UnknownSession(*session_id))
    }

    pub fn session_info(&self, session_id: &SessionId) -> Result<SessionInfo> {
        self.session(session_id).map(Session::info)
    }

    /// Ordered frontier of an artifact's log
    pub fn frontier_of(
        &self,
        session_id: &SessionId,
        artifact_id: &ArtifactId,
    ) -> Result<Vec<ChangeId>> {
        let session = self.session(session_id)?;
        let log = session
            .log(artifact_id)
            .ok_or_else(|| CollabError::UnknownArtifact(artifact_id.clone()))?;
        Ok(log.ordered_frontier())
    }

    /// Join a session, or re-join after going offline. Rejected once the
    /// session has ended.
    pub fn join_session(
        &mut self,
        session_id: &SessionId,
        user_id: UserId,
        name: impl Into<String>,
        role: Role,
    ) -> Result<()> {
        let mut events = Vec::new();
        {
            let session = self
                .sessions
                .get_mut(session_id)
                .ok_or(CollabError::UnknownSession(*session_id))?;
            if !session.active {
                return Err(CollabError::SessionEnded(*session_id));
            }

            let user = session
                .users
                .entry(user_id)
                .or_insert_with(|| User::new(user_id, name, role));
            user.role = role;
            user.come_online();
            info!("user {user_id} joined session {session_id} as {role:?}");
            events.push(Event::UserStateChanged(user.clone()));
        }
        self.emit(events);
        Ok(())
    }

    /// Mark a user offline. Their authored changes stay in the logs.
    pub fn leave_session(&mut self, session_id: &SessionId, user_id: &UserId) -> Result<()> {
        let mut events = Vec::new();
        {
            let session = self
                .sessions
                .get_mut(session_id)
                .ok_or(CollabError::UnknownSession(*session_id))?;
            let user = session
                .users
                .get_mut(user_id)
                .ok_or(CollabError::UnknownUser(*user_id))?;
            user.go_offline();
            events.push(Event::UserStateChanged(user.clone()));
        }
        self.emit(events);
        Ok(())
    }

    /// Role changes take effect immediately but never invalidate changes
    /// that were accepted under the old role.
    pub fn set_role(&mut self, session_id: &SessionId, user_id: &UserId, role: Role) -> Result<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CollabError::UnknownSession(*session_id))?;
        let user = session
            .users
            .get_mut(user_id)
            .ok_or(CollabError::UnknownUser(*user_id))?;
        user.role = role;
        Ok(())
    }

    /// Entry point for the transport collaborator: at-least-once delivery
    /// with sender-assigned ids, duplicates idempotently ignored.
    pub fn receive_change(&mut self, session_id: &SessionId, change: Change) -> Result<SubmitOutcome> {
        self.submit_change(session_id, change)
    }

    /// Validate, append, and re-detect. Either completes or is rejected
    /// atomically; there is no partial-append state observable afterwards.
    pub fn submit_change(&mut self, session_id: &SessionId, change: Change) -> Result<SubmitOutcome> {
        let mut events = Vec::new();
        let outcome = {
            let session = self
                .sessions
                .get_mut(session_id)
                .ok_or(CollabError::UnknownSession(*session_id))?;
            if !session.active {
                return Err(CollabError::SessionEnded(*session_id));
            }

            let author = session
                .users
                .get(&change.author)
                .ok_or(CollabError::UnknownUser(change.author))?;
            if !author.role.can_edit() {
                return Err(CollabError::InsufficientRole {
                    required: Role::Editor,
                    actual: author.role,
                });
            }

            if !session.artifacts.contains(&change.artifact_id) {
                return Err(CollabError::UnknownArtifact(change.artifact_id.clone()));
            }

            let artifact_id = change.artifact_id.clone();
            let change_id = change.id;
            let author_id = change.author;

            let log = session.logs.entry(artifact_id.clone()).or_default();
            match log.append(change.clone())? {
                AppendOutcome::AlreadyPresent => {
                    debug!("change {change_id} redelivered to {artifact_id}, ignored");
                    return Ok(SubmitOutcome::AlreadyApplied);
                }
                AppendOutcome::Appended => {}
            }

            debug!("change {change_id} appended to {artifact_id} by {author_id}");
            session.arrival.push(change_id);
            events.push(Event::ChangeAppended(change));

            if let Some(user) = session.users.get_mut(&author_id) {
                let before = user.state;
                user.begin_editing(artifact_id.clone());
                if user.state != before {
                    events.push(Event::UserStateChanged(user.clone()));
                }
            }

            let detected = ConflictDetector::detect(&session.logs[&artifact_id]);
            let conflict_id =
                Self::reconcile_conflict_state(session, &artifact_id, detected, &mut events);
            SubmitOutcome::Applied {
                conflict: conflict_id,
            }
        };
        self.emit(events);
        Ok(outcome)
    }

    /// Apply a resolution policy to an open conflict. The resolution change
    /// is appended to the artifact's log, collapsing its frontier to exactly
    /// one member.
    pub fn resolve_conflict(
        &mut self,
        session_id: &SessionId,
        conflict_id: &ConflictId,
        policy: &ResolutionPolicy,
        resolved_by: UserId,
    ) -> Result<Change> {
        let mut events = Vec::new();
        let resolution = {
            let session = self
                .sessions
                .get_mut(session_id)
                .ok_or(CollabError::UnknownSession(*session_id))?;
            if !session.active {
                return Err(CollabError::SessionEnded(*session_id));
            }

            let resolver = session
                .users
                .get(&resolved_by)
                .ok_or(CollabError::UnknownUser(resolved_by))?;
            if resolver.role < policy.required_role() {
                return Err(CollabError::InsufficientRole {
                    required: policy.required_role(),
                    actual: resolver.role,
                });
            }

            let conflict = session
                .conflicts
                .iter()
                .find(|c| c.id == *conflict_id)
                .cloned()
                .ok_or(CollabError::UnknownConflict(*conflict_id))?;
            if !conflict.is_open() {
                return Err(CollabError::StaleConflict(*conflict_id));
            }

            let artifact_id = conflict.artifact_id.clone();
            let log = session
                .logs
                .get(&artifact_id)
                .ok_or_else(|| CollabError::UnknownArtifact(artifact_id.clone()))?;

            let roles = session.roles();
            let resolution =
                match ConflictResolver::resolve(&conflict, policy, log, &roles, resolved_by) {
                    Ok(resolution) => resolution,
                    Err(CollabError::StaleConflict(id)) => {
                        // The frontier moved since detection: supersede this
                        // record, open a fresh conflict over the new frontier,
                        // and have the caller re-detect.
                        if let Some(stored) = session.conflict_mut(conflict_id) {
                            stored.mark_resolved(RESOLVED_SUPERSEDED);
                        }
                        let detected = ConflictDetector::detect(&session.logs[&artifact_id]);
                        Self::reconcile_conflict_state(session, &artifact_id, detected, &mut events);
                        self.emit(events);
                        return Err(CollabError::StaleConflict(id));
                    }
                    Err(other) => return Err(other),
                };

            for loser in ConflictResolver::losing_changes(&conflict, &resolution) {
                if let Some(change) = log.get(&loser) {
                    warn!(
                        "change {loser} by {} discarded resolving conflict {conflict_id}",
                        change.author
                    );
                }
            }

            let log = session
                .logs
                .get_mut(&artifact_id)
                .ok_or_else(|| CollabError::UnknownArtifact(artifact_id.clone()))?;
            log.append(resolution.clone())?;
            debug_assert_eq!(log.frontier().len(), 1);
            session.arrival.push(resolution.id);
            events.push(Event::ChangeAppended(resolution.clone()));

            if let Some(stored) = session.conflict_mut(conflict_id) {
                stored.mark_resolved(policy.kind_tag());
                events.push(Event::ConflictResolved(stored.clone(), resolution.clone()));
            }
            info!(
                "conflict {conflict_id} on {artifact_id} resolved via {}",
                policy.kind_tag()
            );

            Self::release_resolved_users(session, &mut events);
            resolution
        };
        self.emit(events);
        Ok(resolution)
    }

    /// Detect-and-resolve the current conflict on an artifact, retrying
    /// around `StaleConflict` up to the configured bound. `Ok(None)` means
    /// the artifact is clean and there was nothing to resolve.
    pub fn resolve_latest(
        &mut self,
        session_id: &SessionId,
        artifact_id: &ArtifactId,
        policy: &ResolutionPolicy,
        resolved_by: UserId,
    ) -> Result<Option<Change>> {
        let mut last_stale = None;
        for _ in 0..self.config.max_resolve_retries {
            let conflict_id = {
                let session = self.session(session_id)?;
                match session.open_conflict_for(artifact_id) {
                    Some(conflict) => conflict.id,
                    None => return Ok(None),
                }
            };
            match self.resolve_conflict(session_id, &conflict_id, policy, resolved_by) {
                Ok(change) => return Ok(Some(change)),
                Err(CollabError::StaleConflict(id)) => {
                    last_stale = Some(CollabError::StaleConflict(id));
                }
                Err(other) => return Err(other),
            }
        }
        // Retry bound exhausted; surface for manual intervention
        Err(last_stale.unwrap_or(CollabError::UnknownSession(*session_id)))
    }

    /// End a session. Terminal: every later submission is rejected with
    /// `SessionEnded`. Logs and conflict history stay readable.
    pub fn end_session(&mut self, session_id: &SessionId) -> Result<()> {
        let mut events = Vec::new();
        {
            let session = self
                .sessions
                .get_mut(session_id)
                .ok_or(CollabError::UnknownSession(*session_id))?;
            session.active = false;
            info!("session {session_id} ended");
            for user in session.users.values_mut() {
                if user.state != PresenceState::Offline {
                    user.go_offline();
                    events.push(Event::UserStateChanged(user.clone()));
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    /// Close or (re)open the conflict record for an artifact so it always
    /// mirrors the frontier. Returns the id of a newly opened conflict.
    fn reconcile_conflict_state(
        session: &mut Session,
        artifact_id: &ArtifactId,
        detected: Option<Conflict>,
        events: &mut Vec<Event>,
    ) -> Option<ConflictId> {
        match detected {
            Some(conflict) => {
                // A wider conflict supersedes the previously open record
                if let Some(open_id) = session.open_conflict_for(artifact_id).map(|c| c.id) {
                    if let Some(stored) = session.conflict_mut(&open_id) {
                        stored.mark_resolved(RESOLVED_SUPERSEDED);
                    }
                }
                warn!(
                    "conflict {} opened on {artifact_id} over {} changes",
                    conflict.id,
                    conflict.frontier.len()
                );
                let conflict_id = conflict.id;
                session.conflicts.push(conflict.clone());
                events.push(Event::ConflictOpened(conflict.clone()));

                // Authors of the divergent changes become Conflicted
                if let Some(log) = session.logs.get(artifact_id) {
                    let authors: HashSet<UserId> = conflict
                        .frontier
                        .iter()
                        .filter_map(|id| log.get(id))
                        .map(|change| change.author)
                        .collect();
                    for author in authors {
                        if let Some(user) = session.users.get_mut(&author) {
                            let before = user.state;
                            user.mark_conflicted();
                            if user.state != before {
                                events.push(Event::UserStateChanged(user.clone()));
                            }
                        }
                    }
                }
                Some(conflict_id)
            }
            None => {
                // Frontier collapsed without going through resolve_conflict
                // (a client-built merge submitted as an ordinary change)
                if let Some(open_id) = session.open_conflict_for(artifact_id).map(|c| c.id) {
                    let latest_kind = session
                        .logs
                        .get(artifact_id)
                        .and_then(|log| log.frontier().iter().next().copied())
                        .and_then(|id| session.logs[artifact_id].get(&id).map(|c| c.kind.clone()))
                        .unwrap_or_else(|| "collapsed".to_string());
                    if let Some(stored) = session.conflict_mut(&open_id) {
                        stored.mark_resolved(latest_kind);
                    }
                    Self::release_resolved_users(session, events);
                }
                None
            }
        }
    }

    /// Return Conflicted users to Online once no open conflict involves a
    /// change they authored
    fn release_resolved_users(session: &mut Session, events: &mut Vec<Event>) {
        let still_conflicted = session.conflicted_authors();
        for user in session.users.values_mut() {
            if user.state == PresenceState::Conflicted && !still_conflicted.contains(&user.id) {
                user.back_online();
                events.push(Event::UserStateChanged(user.clone()));
            }
        }
    }

    fn emit(&mut self, events: Vec<Event>) {
        for event in &events {
            for observer in &mut self.observers {
                match event {
                    Event::ChangeAppended(change) => observer.on_change_appended(change),
                    Event::ConflictOpened(conflict) => observer.on_conflict_opened(conflict),
                    Event::ConflictResolved(conflict, resolution) => {
                        observer.on_conflict_resolved(conflict, resolution)
                    }
                    Event::UserStateChanged(user) => observer.on_user_state_changed(user),
                }
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
