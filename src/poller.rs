//! Periodically refreshed caches for the controller roster and ATIS.
//!
//! A failed refresh never clears what was last fetched; it only flags the
//! snapshot as stale so clients can tell.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{config::Config, settings::SystemSettings};

/// Positions shown in the controller roster.
pub const ROSTER_POSITIONS: [&str; 2] = ["GND", "TWR"];

/// Why an upstream fetch produced no data.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Whether a snapshot reflects the latest fetch (`live`) or an older one
/// because the latest fetch failed (`stale`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Live,
    Stale,
}

/// The last good fetch of one upstream list.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use ifr_clearance::poller::{CachedSnapshot, Freshness};
///
/// let mut snapshot = CachedSnapshot::<u32>::default();
/// assert_eq!(snapshot.source, Freshness::Stale);
///
/// snapshot.replace(vec![1, 2], Utc::now());
/// snapshot.mark_stale();
/// assert_eq!(snapshot.data, vec![1, 2]);
/// assert_eq!(snapshot.source, Freshness::Stale);
/// ```
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSnapshot<T> {
    pub data: Vec<T>,
    pub last_updated: Option<DateTime<Utc>>,
    pub source: Freshness,
}

impl<T> Default for CachedSnapshot<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            last_updated: None,
            source: Freshness::Stale,
        }
    }
}

impl<T> CachedSnapshot<T> {
    /// Stores a successful fetch taken at `now` and marks it live.
    pub fn replace(&mut self, data: Vec<T>, now: DateTime<Utc>) {
        self.data = data;
        self.last_updated = Some(now);
        self.source = Freshness::Live;
    }

    /// Flags the snapshot as stale, keeping its data and timestamp.
    pub fn mark_stale(&mut self) {
        self.source = Freshness::Stale;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    #[serde(default)]
    pub airport: String,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub holder: Option<String>,
    #[serde(default)]
    pub claimable: bool,
    #[serde(default)]
    pub cid: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Controller {
    fn on_roster(&self) -> bool {
        self.position
            .as_deref()
            .is_some_and(|position| ROSTER_POSITIONS.contains(&position))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Atis {
    #[serde(default)]
    pub airport: String,
    #[serde(default)]
    pub letter: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Source of controller and ATIS data.
#[async_trait]
pub trait Upstream: fmt::Debug + Send + Sync {
    async fn controllers(&self) -> Result<Vec<Controller>, FetchError>;
    async fn atis(&self) -> Result<Vec<Atis>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    controllers_url: String,
    atis_url: String,
}

impl HttpUpstream {
    /// Builds a client with the configured request timeout.
    ///
    /// # Returns
    ///
    /// [`FetchError::Http`] if the TLS backend cannot be initialised.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()?;
        Ok(Self {
            client,
            controllers_url: config.controllers_url.clone(),
            atis_url: config.atis_url.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn controllers(&self) -> Result<Vec<Controller>, FetchError> {
        self.get_json(&self.controllers_url).await
    }

    async fn atis(&self) -> Result<Vec<Atis>, FetchError> {
        self.get_json(&self.atis_url).await
    }
}

/// Controller and ATIS snapshots plus the timers that refresh them.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use async_trait::async_trait;
/// use ifr_clearance::poller::{Atis, Controller, FetchError, Freshness, PollingCache, Upstream};
///
/// #[derive(Debug)]
/// struct Offline;
///
/// #[async_trait]
/// impl Upstream for Offline {
///     async fn controllers(&self) -> Result<Vec<Controller>, FetchError> {
///         Err(FetchError::Unavailable("offline".into()))
///     }
///     async fn atis(&self) -> Result<Vec<Atis>, FetchError> {
///         Ok(Vec::new())
///     }
/// }
///
/// # async fn example() {
/// let cache = PollingCache::new(Arc::new(Offline));
/// assert_eq!(cache.refresh_controllers().await, Freshness::Stale);
/// assert_eq!(cache.refresh_atis().await, Freshness::Live);
/// # }
/// ```
#[derive(Debug)]
pub struct PollingCache {
    upstream: Arc<dyn Upstream>,
    controllers: RwLock<CachedSnapshot<Controller>>,
    atis: RwLock<CachedSnapshot<Atis>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingCache {
    pub fn new(upstream: Arc<dyn Upstream>) -> Self {
        Self {
            upstream,
            controllers: RwLock::default(),
            atis: RwLock::default(),
            timers: Mutex::default(),
        }
    }

    /// Fetches the roster once, keeping only [`ROSTER_POSITIONS`].
    ///
    /// # Returns
    ///
    /// [`Freshness::Live`] when the fetch succeeded. On failure the previous
    /// roster is kept and [`Freshness::Stale`] is returned.
    pub async fn refresh_controllers(&self) -> Freshness {
        match self.upstream.controllers().await {
            Ok(controllers) => {
                let roster: Vec<Controller> =
                    controllers.into_iter().filter(Controller::on_roster).collect();
                debug!(count = roster.len(), "Refreshed controllers");
                self.controllers.write().replace(roster, Utc::now());
                Freshness::Live
            }
            Err(error) => {
                warn!(%error, "Failed to fetch controllers, serving cached data");
                self.controllers.write().mark_stale();
                Freshness::Stale
            }
        }
    }

    /// Fetches ATIS once. Same failure behaviour as
    /// [`refresh_controllers`](Self::refresh_controllers).
    pub async fn refresh_atis(&self) -> Freshness {
        match self.upstream.atis().await {
            Ok(atis) => {
                debug!(count = atis.len(), "Refreshed ATIS");
                self.atis.write().replace(atis, Utc::now());
                Freshness::Live
            }
            Err(error) => {
                warn!(%error, "Failed to fetch ATIS, serving cached data");
                self.atis.write().mark_stale();
                Freshness::Stale
            }
        }
    }

    pub fn controllers(&self) -> CachedSnapshot<Controller> {
        self.controllers.read().clone()
    }

    pub fn atis(&self) -> CachedSnapshot<Atis> {
        self.atis.read().clone()
    }

    /// Starts both poll timers, replacing any that are running. Each timer
    /// refreshes immediately and then once per interval.
    ///
    /// # Parameters
    ///
    /// * `system` - Supplies `controllerPollInterval` and `atisPollInterval`.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn restart(self: &Arc<Self>, system: &SystemSettings) {
        let controllers = {
            let cache = Arc::clone(self);
            spawn_timer(system.controller_poll_interval(), move || {
                let cache = Arc::clone(&cache);
                async move {
                    cache.refresh_controllers().await;
                }
            })
        };
        let atis = {
            let cache = Arc::clone(self);
            spawn_timer(system.atis_poll_interval(), move || {
                let cache = Arc::clone(&cache);
                async move {
                    cache.refresh_atis().await;
                }
            })
        };

        let previous = std::mem::replace(&mut *self.timers.lock(), vec![controllers, atis]);
        for timer in previous {
            timer.abort();
        }
        info!(
            controllers_ms = system.controller_poll_interval_ms,
            atis_ms = system.atis_poll_interval_ms,
            "Poll timers started"
        );
    }

    /// Aborts both timers. Snapshots are kept.
    pub fn stop(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }
}

fn spawn_timer<F, Fut>(period: Duration, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tick().await;
        }
    })
}
