//! Application wiring: shared state, background tasks and the router.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Query, Request, State},
    http::{
        header::{CONTENT_TYPE, COOKIE, SET_COOKIE, USER_AGENT},
        request::Parts,
        HeaderMap, HeaderName, HeaderValue, Method, Uri,
    },
    middleware::{self, Next},
    response::Response,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tower_sessions::{cookie::SameSite, Expiry, ExpiredDeletion, Session, SessionManagerLayer};
use tracing::{info, warn};

use crate::{
    analytics::{AnalyticsMirror, AnalyticsRecorder, RequestMeta},
    auth::{CurrentUser, DiscordOAuth},
    config::Config,
    datastore::Datastore,
    error::AppError,
    feed::{FeedClient, FlightPlanBuffer},
    logging::{LevelControl, LogBuffer},
    login_store::LoginStore,
    poller::{PollingCache, Upstream},
    routes,
    session::{spawn_sweeper, SessionId, SessionStore, SESSION_IDLE_LIMIT, SWEEP_INTERVAL},
    settings::{SettingsRepository, SettingsStore},
};

pub const SESSION_HEADER: HeaderName = HeaderName::from_static("x-session-id");
pub const SESSION_COOKIE: &str = "session_id";
pub const LOGIN_COOKIE: &str = "login_session";

/// Login sessions survive this long without a request.
pub const LOGIN_INACTIVITY_DAYS: i64 = 30;
pub const LOGIN_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub analytics: Arc<AnalyticsRecorder>,
    pub settings: Arc<SettingsStore>,
    pub flight_plans: Arc<FlightPlanBuffer>,
    pub feed: Arc<FeedClient>,
    pub cache: Arc<PollingCache>,
    pub datastore: Option<Datastore>,
    pub oauth: Option<Arc<DiscordOAuth>>,
    pub logs: Arc<LogBuffer>,
    pub log_level: LevelControl,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Builds every component. Settings and analytics counters are loaded
    /// from the datastore when one is given.
    pub async fn build(
        config: Config,
        datastore: Option<Datastore>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let repository = datastore
            .clone()
            .map(|store| Arc::new(store) as Arc<dyn SettingsRepository>);
        let settings = Arc::new(SettingsStore::load(repository).await);

        let sessions = Arc::new(SessionStore::new());
        let mirror = datastore
            .clone()
            .map(|store| Arc::new(store) as Arc<dyn AnalyticsMirror>);
        let analytics = Arc::new(AnalyticsRecorder::new(sessions.clone(), mirror));

        if let Some(store) = &datastore {
            match store.analytics_seed().await {
                Ok(seed) => {
                    info!(
                        days = seed.daily_visits.len(),
                        clearances = seed.clearances_generated,
                        "Seeded analytics from datastore"
                    );
                    analytics.seed(seed);
                }
                Err(error) => warn!(%error, "Failed to seed analytics, starting from zero"),
            }
        }

        let flight_plans = Arc::new(FlightPlanBuffer::new());
        let feed = Arc::new(FeedClient::new(
            config.feed_url.clone(),
            config.feed_reconnect_delay,
            flight_plans.clone(),
            analytics.clone(),
            settings.clone(),
        ));
        let oauth = config
            .discord
            .clone()
            .map(|discord| Arc::new(DiscordOAuth::new(discord)));

        Self {
            config: Arc::new(config),
            sessions,
            analytics,
            settings,
            flight_plans,
            feed,
            cache: Arc::new(PollingCache::new(upstream)),
            datastore,
            oauth,
            logs: Arc::new(LogBuffer::default()),
            log_level: LevelControl::default(),
            started_at: Utc::now(),
        }
    }

    /// Uses the capture buffer and filter handle installed with the global
    /// subscriber instead of the detached defaults.
    pub fn with_logging(mut self, logs: Arc<LogBuffer>, log_level: LevelControl) -> Self {
        self.logs = logs;
        self.log_level = log_level;
        self
    }

    pub fn require_datastore(&self) -> Result<&Datastore, AppError> {
        self.datastore
            .as_ref()
            .ok_or(AppError::NotConfigured("Datastore"))
    }

    /// Starts the session sweep, the poll timers, the feed connection and
    /// the login session purge. Poll timers are owned by the cache and are
    /// not part of the returned handles.
    pub fn start_background(&self, login_store: &LoginStore) -> Vec<JoinHandle<()>> {
        self.cache.restart(&self.settings.system());

        let store = login_store.clone();
        let purge = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOGIN_PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(error) = store.delete_expired().await {
                    warn!(%error, "Failed to purge expired login sessions");
                }
            }
        });

        vec![
            spawn_sweeper(self.sessions.clone(), SWEEP_INTERVAL),
            self.feed.spawn(),
            purge,
        ]
    }
}

/// The tracking session resolved for the current request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedSession(pub SessionId);

impl<S> FromRequestParts<S> for TrackedSession
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TrackedSession>()
            .cloned()
            .ok_or_else(|| AppError::Internal("tracking session missing".into()))
    }
}

/// Request metadata recorded with analytics events. Includes the logged-in
/// user when there is one.
#[derive(Clone, Debug, Default)]
pub struct ClientMeta(pub RequestMeta);

impl<S> FromRequestParts<S> for ClientMeta
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = match Session::from_request_parts(parts, state).await {
            Ok(session) => CurrentUser::from_session(&session).await.ok().flatten(),
            Err(_) => None,
        };

        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        Ok(Self(RequestMeta {
            ip_address: forwarded.or(peer),
            user_agent: parts
                .headers
                .get(USER_AGENT)
                .and_then(|value| value.to_str().ok())
                .map(String::from),
            user_id: user.as_ref().map(|user| user.id.clone()),
            username: user.map(|user| user.username),
        }))
    }
}

#[derive(Deserialize)]
struct SessionQuery {
    session: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Header first, then query string, then cookie.
pub fn session_candidate(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let from_header = headers
        .get(&SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    let from_query = || {
        Query::<SessionQuery>::try_from_uri(uri)
            .ok()
            .and_then(|Query(query)| query.session.or(query.session_id))
    };

    from_header
        .or_else(from_query)
        .or_else(|| cookie_value(headers, SESSION_COOKIE))
}

async fn track_session(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let candidate = session_candidate(request.headers(), request.uri());
    let session = state.sessions.resolve(candidate.as_deref());
    request
        .extensions_mut()
        .insert(TrackedSession(session.id.clone()));

    let mut response = next.run(request).await;

    let secure = if state.config.secure_cookies { "; Secure" } else { "" };
    let cookie = format!(
        "{SESSION_COOKIE}={}; Path=/; Max-Age={}; SameSite=Lax{secure}",
        session.id,
        SESSION_IDLE_LIMIT.as_secs()
    );
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(session.id.as_str()) {
        headers.insert(SESSION_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        headers.append(SET_COOKIE, value);
    }

    response
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origin = match HeaderValue::from_str(&config.frontend_url) {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(error) => {
            warn!(%error, url = %config.frontend_url, "FRONTEND_URL is not a valid origin");
            AllowOrigin::list([])
        }
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, SESSION_HEADER])
        .expose_headers([SESSION_HEADER])
        .max_age(Duration::from_secs(60 * 60))
}

pub fn router(state: AppState, login_store: LoginStore) -> Router {
    let login_sessions = SessionManagerLayer::new(login_store)
        .with_name(LOGIN_COOKIE)
        .with_secure(state.config.secure_cookies)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::days(
            LOGIN_INACTIVITY_DAYS,
        )));

    routes::routes()
        .layer(middleware::from_fn_with_state(state.clone(), track_session))
        .layer(login_sessions)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}
