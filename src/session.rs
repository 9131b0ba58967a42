//! In-memory tracking sessions.
//!
//! Every request is correlated to a [`Session`] through an opaque id the
//! client echoes back in a header, query parameter or cookie. The store owns
//! all session records; callers only ever receive clones.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Sessions idle for longer than this are evicted by [`SessionStore::sweep`].
pub const SESSION_IDLE_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the background sweeper runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

static CANDIDATE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F-]{8,36}$").expect("session id pattern is valid"));

/// Canonical session identifier: 36-character hyphenated lowercase hex.
///
/// Clients may send any candidate matching `^[0-9a-fA-F-]{8,36}$`; the id
/// they get back is always in canonical form, so echoing it once is enough
/// to keep the same session from then on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a random (UUID v4) identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Validates and canonicalizes a client-supplied id.
    ///
    /// Hyphens are dropped and the remaining hex digits are lowercased.
    /// Fewer than 32 digits are zero-extended on the right and more than 32
    /// are cut to the first 32, so a given candidate always maps to the same
    /// session.
    ///
    /// # Parameters
    ///
    /// * `candidate` - The id as received from the header, query string or cookie.
    ///
    /// # Returns
    ///
    /// The canonical id, or `None` when the candidate does not match the
    /// accepted pattern or carries fewer than 8 hex digits.
    ///
    /// # Examples
    ///
    /// ```
    /// use ifr_clearance::session::SessionId;
    ///
    /// let id = SessionId::parse("DEADBEEF").unwrap();
    /// assert_eq!(id.as_str(), "deadbeef-0000-0000-0000-000000000000");
    /// assert!(SessionId::parse("not-hex").is_none());
    /// ```
    pub fn parse(candidate: &str) -> Option<Self> {
        let candidate = candidate.trim();
        if !CANDIDATE_PATTERN.is_match(candidate) {
            return None;
        }

        let digits: String = candidate
            .chars()
            .filter(|c| *c != '-')
            .take(32)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if digits.len() < 8 {
            return None;
        }

        let padded = format!("{digits:0<32}");
        Uuid::try_parse(&padded)
            .ok()
            .map(|uuid| Self(uuid.hyphenated().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One visitor's tracking record.
///
/// Serialized in camelCase for the admin dashboard.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub page_views: u64,
    pub clearances_generated: u64,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

impl Session {
    fn new(id: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at: now,
            last_activity: now,
            page_views: 0,
            clearances_generated: 0,
            user_id: None,
            username: None,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }
}

/// Thread-safe map from [`SessionId`] to [`Session`].
///
/// Every operation takes one short `parking_lot` lock and returns a clone, so
/// it is safe to call from async handlers without holding anything across an
/// `.await`.
///
/// # Examples
///
/// ```
/// use ifr_clearance::session::SessionStore;
///
/// let store = SessionStore::new();
/// let session = store.resolve(Some("deadbeef"));
/// let again = store.resolve(Some(session.id.as_str()));
///
/// assert_eq!(session.id, again.id);
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `candidate`, creating it when needed.
    ///
    /// # Parameters
    ///
    /// * `candidate` - The client-supplied id, if any. Malformed candidates
    ///   are replaced by a freshly generated id.
    ///
    /// # Returns
    ///
    /// A snapshot of the session after its `last_activity` was refreshed.
    /// `last_activity` never moves backwards.
    pub fn resolve(&self, candidate: Option<&str>) -> Session {
        self.resolve_at(candidate, Utc::now())
    }

    /// [`resolve`](Self::resolve) with an explicit clock.
    pub fn resolve_at(&self, candidate: Option<&str>, now: DateTime<Utc>) -> Session {
        let id = candidate
            .and_then(SessionId::parse)
            .unwrap_or_else(SessionId::generate);
        self.update(&id, now, |_| {})
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.lock().get(id).cloned()
    }

    /// Counts a page view. The returned session has `page_views == 1` when
    /// this was its first view.
    pub fn record_page_view(&self, id: &SessionId, now: DateTime<Utc>) -> Session {
        self.update(id, now, |session| session.page_views += 1)
    }

    pub fn record_clearance(&self, id: &SessionId, now: DateTime<Utc>) -> Session {
        self.update(id, now, |session| session.clearances_generated += 1)
    }

    /// Links an authenticated account. The first link wins.
    pub fn link_user(&self, id: &SessionId, user_id: &str, username: &str) -> Session {
        self.update(id, Utc::now(), |session| {
            if session.user_id.is_none() {
                session.user_id = Some(user_id.to_string());
                session.username = Some(username.to_string());
            }
        })
    }

    fn update<F>(&self, id: &SessionId, now: DateTime<Utc>, apply: F) -> Session
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(id.clone()).or_insert_with(|| {
            debug!(session_id = %id, "Created session");
            Session::new(id.clone(), now)
        });
        session.touch(now);
        apply(session);
        session.clone()
    }

    /// Evicts sessions idle for longer than [`SESSION_IDLE_LIMIT`].
    ///
    /// # Returns
    ///
    /// The number of sessions removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| session.idle_for(now) <= SESSION_IDLE_LIMIT);
        before - sessions.len()
    }

    /// Sessions active within `window` of `now`, most recent first.
    pub fn active_within(&self, now: DateTime<Utc>, window: Duration) -> Vec<Session> {
        let mut active: Vec<Session> = self
            .sessions
            .lock()
            .values()
            .filter(|session| session.idle_for(now) <= window)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        active
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs [`SessionStore::sweep`] every `period` until the task is aborted.
pub fn spawn_sweeper(store: Arc<SessionStore>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = store.sweep();
            if evicted > 0 {
                info!(evicted, remaining = store.len(), "Swept idle sessions");
            }
        }
    })
}
