//! HTTP handlers.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_sessions::Session;
use tracing::{info, warn};

use crate::{
    analytics::ClearanceFields,
    app::{AppState, ClientMeta, TrackedSession},
    auth::{AdminUser, CurrentUser, STATE_KEY, SUPER_ADMIN_ROLE, USER_KEY},
    clearance::{self, ClearanceRequest, RenderedClearance},
    datastore::{AdminTable, TablePage},
    entity::discord_user,
    error::AppError,
    logging::parse_level_filter,
    poller::Freshness,
    settings::SettingsPatch,
};

/// Flight plans served from the datastore while the live buffer is empty.
pub const FALLBACK_FLIGHT_PLANS: u64 = 20;

/// Sessions seen within this window count as currently active.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// The feed counts as receiving data while its newest plan is this recent.
pub const FEED_RECEIVING_WINDOW: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_TABLE_PAGE: u64 = 25;
pub const MAX_TABLE_PAGE: u64 = 100;
pub const DEFAULT_LOG_LIMIT: usize = 100;
/// Recent errors shown on the status page.
pub const STATUS_ERROR_LOGS: usize = 25;

/// Every route, as `(path, methods)`. Listed on the status page.
pub const API_ROUTES: &[(&str, &str)] = &[
    ("/api/health", "GET"),
    ("/api/status", "GET"),
    ("/api/full-status", "GET"),
    ("/api/controllers", "GET"),
    ("/api/atis", "GET"),
    ("/api/flight-plans", "GET"),
    ("/api/settings", "GET"),
    ("/api/page-visit", "POST"),
    ("/api/clearance", "POST"),
    ("/api/clearance-generated", "POST"),
    ("/api/leaderboard", "GET"),
    ("/api/user/clearances", "GET"),
    ("/api/admin/analytics", "GET"),
    ("/api/admin/analytics/reset", "POST"),
    ("/api/admin/settings", "GET,POST"),
    ("/api/admin/sessions", "GET"),
    ("/api/admin/current-users", "GET"),
    ("/api/admin/users", "GET,POST"),
    ("/api/admin/users/{id}", "DELETE"),
    ("/api/admin/tables/{name}", "GET"),
    ("/api/admin/logs", "GET"),
    ("/auth/discord", "GET"),
    ("/auth/discord/callback", "GET"),
    ("/api/auth/user", "GET"),
    ("/api/auth/logout", "POST"),
];

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/full-status", get(full_status))
        .route("/api/controllers", get(controllers))
        .route("/api/atis", get(atis))
        .route("/api/flight-plans", get(flight_plans))
        .route("/api/settings", get(public_settings))
        .route("/api/page-visit", post(page_visit))
        .route("/api/clearance", post(generate_clearance))
        .route("/api/clearance-generated", post(clearance_generated))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/user/clearances", get(user_clearances))
        .route("/api/admin/analytics", get(admin_analytics))
        .route("/api/admin/analytics/reset", post(reset_analytics))
        .route(
            "/api/admin/settings",
            get(admin_settings).post(update_settings),
        )
        .route("/api/admin/sessions", get(admin_sessions))
        .route("/api/admin/current-users", get(current_users))
        .route("/api/admin/users", get(list_admins).post(grant_admin))
        .route("/api/admin/users/{id}", delete(revoke_admin))
        .route("/api/admin/tables/{name}", get(admin_table))
        .route("/api/admin/logs", get(admin_logs))
        .route("/auth/discord", get(discord_login))
        .route("/auth/discord/callback", get(discord_callback))
        .route("/api/auth/user", get(auth_user))
        .route("/api/auth/logout", post(logout))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let datastore = match &state.datastore {
        Some(store) => match store.ping().await {
            Ok(()) => "connected",
            Err(error) => {
                warn!(%error, "Datastore health check failed");
                "unreachable"
            }
        },
        None => "disabled",
    };

    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
        "feedConnected": state.feed.is_connected(),
        "datastore": datastore,
    }))
}

async fn status(State(state): State<AppState>, TrackedSession(session_id): TrackedSession) -> Json<Value> {
    let controllers = state.cache.controllers();
    let atis = state.cache.atis();

    Json(json!({
        "sessionId": session_id,
        "activeSessions": state.sessions.len(),
        "flightPlans": {
            "cached": state.flight_plans.len(),
            "lastReceived": state.flight_plans.latest_received(),
            "feedConnected": state.feed.is_connected(),
        },
        "controllers": {
            "count": controllers.data.len(),
            "lastUpdated": controllers.last_updated,
            "source": controllers.source,
        },
        "atis": {
            "count": atis.data.len(),
            "lastUpdated": atis.last_updated,
            "source": atis.source,
        },
        "datastore": state.datastore.is_some(),
        "discordLogin": state.oauth.is_some(),
        "autoRefreshInterval": state.settings.system().auto_refresh_interval_ms,
    }))
}

fn upstream_endpoint(name: &str, source: Freshness, has_data: bool) -> Value {
    let (status, message) = match (source, has_data) {
        (Freshness::Live, _) => ("operational", "Online"),
        (Freshness::Stale, true) => ("degraded", "Serving cached data"),
        (Freshness::Stale, false) => ("outage", "Offline"),
    };
    json!({ "name": name, "status": status, "message": message })
}

/// Service overview for the public status page: upstream reachability as
/// seen by the caches and the feed, the route table, and recent errors.
async fn full_status(State(state): State<AppState>) -> Json<Value> {
    let controllers = state.cache.controllers();
    let atis = state.cache.atis();
    let receiving = state
        .flight_plans
        .latest_received()
        .and_then(|latest| (Utc::now() - latest).to_std().ok())
        .is_some_and(|age| age < FEED_RECEIVING_WINDOW);
    let (feed_status, feed_message) = match (state.feed.is_connected(), receiving) {
        (true, true) => ("operational", "Online (Receiving Data)"),
        (true, false) => ("operational", "Online"),
        (false, _) => ("outage", "Offline"),
    };

    let upstream = vec![
        upstream_endpoint("Controllers", controllers.source, !controllers.data.is_empty()),
        upstream_endpoint("ATIS", atis.source, !atis.data.is_empty()),
        json!({ "name": "WebSocket", "status": feed_status, "message": feed_message }),
    ];
    let data_status = if upstream.iter().all(|endpoint| endpoint["status"] == "operational") {
        "operational"
    } else if upstream.iter().all(|endpoint| endpoint["status"] == "outage") {
        "outage"
    } else {
        "degraded"
    };

    let errors = state.logs.recent(Some(tracing::Level::ERROR), STATUS_ERROR_LOGS);
    let error_status = if errors.is_empty() { "operational" } else { "degraded" };
    let routes: Vec<Value> = API_ROUTES
        .iter()
        .map(|(path, methods)| json!({ "path": path, "methods": methods, "status": "operational" }))
        .collect();

    Json(json!({
        "24data_connectivity": {
            "status": data_status,
            "endpoints": upstream,
        },
        "24ifr_api": {
            "status": "operational",
            "endpoints": routes,
        },
        "errors": {
            "status": error_status,
            "count": errors.len(),
            "logs": errors,
        },
    }))
}

async fn controllers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.controllers())
}

async fn atis(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.atis())
}

async fn flight_plans(State(state): State<AppState>) -> Response {
    let cached = state.flight_plans.snapshot();
    if !cached.is_empty() {
        return Json(cached).into_response();
    }

    let stored = match &state.datastore {
        Some(store) => store
            .recent_flight_plans(FALLBACK_FLIGHT_PLANS)
            .await
            .unwrap_or_else(|error| {
                warn!(%error, "Failed to load stored flight plans");
                Vec::new()
            }),
        None => Vec::new(),
    };
    Json(stored).into_response()
}

async fn public_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.settings.public())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PageVisitBody {
    path: Option<String>,
    page: Option<String>,
}

async fn page_visit(
    State(state): State<AppState>,
    TrackedSession(session_id): TrackedSession,
    ClientMeta(meta): ClientMeta,
    body: Bytes,
) -> Json<Value> {
    // The body is optional; anything unparseable counts as a visit to `/`.
    let body: PageVisitBody = serde_json::from_slice(&body).unwrap_or_default();
    let path = body.path.or(body.page).unwrap_or_else(|| "/".to_string());

    let recorded = state.analytics.record_visit(&session_id, &path, meta).await;

    Json(json!({
        "success": true,
        "sessionId": session_id,
        "firstView": recorded.first_view,
        "pageViews": recorded.session.page_views,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearanceResponse {
    #[serde(flatten)]
    rendered: RenderedClearance,
    saved: bool,
}

async fn generate_clearance(
    State(state): State<AppState>,
    TrackedSession(session_id): TrackedSession,
    ClientMeta(meta): ClientMeta,
    Json(request): Json<ClearanceRequest>,
) -> Result<Json<ClearanceResponse>, AppError> {
    let format = state.settings.clearance_format();
    let aviation = state.settings.aviation();
    let rendered = clearance::render(&request, &format, &aviation, &mut rand::thread_rng())?;

    let fields = ClearanceFields {
        callsign: request.callsign.clone(),
        destination: request.destination.clone(),
        route: Some(rendered.route_phrase.clone()),
        routing_type: Some(request.routing_type.as_str().to_string()),
        runway: Some(request.runway.trim().to_string()),
        initial_altitude: request.initial_altitude.and_then(|alt| i32::try_from(alt).ok()),
        station: Some(request.atc_station.trim().to_string()),
        atis_info: Some(request.atis.clone()),
        clearance_text: Some(rendered.clearance.clone()),
        user_id: meta.user_id.clone(),
        discord_username: meta.username.clone(),
    };
    let saved = state
        .analytics
        .record_clearance(&session_id, fields, meta)
        .await
        .is_written();

    Ok(Json(ClearanceResponse { rendered, saved }))
}

async fn clearance_generated(
    State(state): State<AppState>,
    TrackedSession(session_id): TrackedSession,
    ClientMeta(meta): ClientMeta,
    Json(fields): Json<ClearanceFields>,
) -> Json<Value> {
    let saved = state
        .analytics
        .record_clearance(&session_id, fields, meta)
        .await
        .is_written();

    Json(json!({ "success": true, "saved": saved }))
}

async fn leaderboard(State(state): State<AppState>) -> Result<Json<Vec<Value>>, AppError> {
    Ok(Json(state.require_datastore()?.leaderboard().await?))
}

async fn user_clearances(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Result<Json<Vec<Value>>, AppError> {
    Ok(Json(
        state.require_datastore()?.user_clearances(&user.id).await?,
    ))
}

async fn admin_analytics(State(state): State<AppState>, _admin: AdminUser) -> impl IntoResponse {
    Json(state.analytics.summary())
}

async fn reset_analytics(State(state): State<AppState>, admin: AdminUser) -> Json<Value> {
    let persisted = state.analytics.reset().await.is_written();
    info!(admin = %admin.user().username, persisted, "Analytics reset");
    Json(json!({
        "success": true,
        "persisted": persisted,
        "analytics": state.analytics.summary(),
    }))
}

async fn admin_settings(State(state): State<AppState>, admin: AdminUser) -> impl IntoResponse {
    Json(state.settings.admin(&admin))
}

async fn update_settings(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, AppError> {
    let patch = SettingsPatch::from_value(body)?;
    let cache = state.cache.clone();
    let log_level = state.log_level.clone();
    let updated = state
        .settings
        .update_with(patch, |settings| {
            cache.restart(&settings.system);
            if let Err(error) = log_level.apply(&settings.system.log_level) {
                warn!(%error, "Failed to apply log level");
            }
        })
        .await?;

    info!(admin = %admin.user().username, "Settings updated");
    Ok(Json(json!({ "success": true, "settings": updated })))
}

async fn admin_sessions(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    let now = Utc::now();
    let sessions = state.sessions.active_within(now, crate::session::SESSION_IDLE_LIMIT);
    let active = sessions
        .iter()
        .filter(|session| {
            (now - session.last_activity)
                .to_std()
                .is_ok_and(|idle| idle <= ACTIVE_WINDOW)
        })
        .count();

    Json(json!({
        "total": sessions.len(),
        "active": active,
        "sessions": sessions,
    }))
}

/// Sessions active within [`ACTIVE_WINDOW`], in the dashboard's field names.
async fn current_users(State(state): State<AppState>, _admin: AdminUser) -> Json<Value> {
    let active = state.sessions.active_within(Utc::now(), ACTIVE_WINDOW);
    let stored = match &state.datastore {
        Some(store) => store.stored_session_count().await.unwrap_or_else(|error| {
            warn!(%error, "Failed to count stored sessions");
            0
        }),
        None => 0,
    };

    let users: Vec<Value> = active
        .iter()
        .map(|session| {
            json!({
                "session_id": session.id,
                "user_id": session.user_id,
                "username": session.username,
                "page_views": session.page_views,
                "clearances_generated": session.clearances_generated,
                "created_at": session.created_at,
                "last_activity": session.last_activity,
                "source": "memory",
            })
        })
        .collect();

    Json(json!({
        "activeCount": users.len(),
        "memorySessionsCount": state.sessions.len(),
        "supabaseSessionsCount": stored,
        "users": users,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct TableQuery {
    limit: Option<u64>,
    page_size: Option<u64>,
    offset: Option<u64>,
}

async fn admin_table(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(name): Path<String>,
    Query(query): Query<TableQuery>,
) -> Result<Json<TablePage>, AppError> {
    let table: AdminTable = name
        .parse()
        .map_err(|_| AppError::NotFound(format!("Table {name}")))?;
    let limit = query
        .limit
        .or(query.page_size)
        .unwrap_or(DEFAULT_TABLE_PAGE)
        .clamp(1, MAX_TABLE_PAGE);
    let offset = query.offset.unwrap_or_default();

    Ok(Json(
        state
            .require_datastore()?
            .table_page(table, limit, offset)
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogQuery {
    level: Option<String>,
    limit: Option<usize>,
}

async fn admin_logs(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<LogQuery>,
) -> Json<Value> {
    let level = parse_level_filter(query.level.as_deref());
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(json!({ "logs": state.logs.recent(level, limit) }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminView {
    id: String,
    discord_id: String,
    username: String,
    avatar: Option<String>,
    roles: Vec<String>,
    last_login: chrono::DateTime<chrono::FixedOffset>,
}

impl From<discord_user::Model> for AdminView {
    fn from(model: discord_user::Model) -> Self {
        Self {
            roles: model.role_list(),
            id: model.id,
            discord_id: model.discord_id,
            username: model.username,
            avatar: model.avatar,
            last_login: model.last_login,
        }
    }
}

async fn list_admins(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Json<Value>, AppError> {
    let admins = state.require_datastore()?.admin_users().await?;
    let users: Vec<AdminView> = admins.into_iter().map(AdminView::from).collect();
    Ok(Json(json!({ "users": users })))
}

fn default_roles() -> Vec<String> {
    vec![DEFAULT_ADMIN_ROLE.to_string()]
}

/// Role granted when the request names none.
pub const DEFAULT_ADMIN_ROLE: &str = "admin";

#[derive(Debug, Deserialize)]
struct GrantAdmin {
    username: String,
    #[serde(default = "default_roles")]
    roles: Vec<String>,
}

async fn grant_admin(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(body): Json<GrantAdmin>,
) -> Result<Json<Value>, AppError> {
    let username = body.username.trim();
    if username.is_empty() {
        return Err(AppError::Validation("username is required".into()));
    }
    let mut roles: Vec<String> = body
        .roles
        .iter()
        .map(|role| role.trim().to_string())
        .filter(|role| !role.is_empty())
        .collect();
    if roles.is_empty() {
        roles = default_roles();
    }

    let granted = state
        .require_datastore()?
        .grant_admin(username, &roles)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {username}")))?;

    info!(admin = %admin.user().username, granted = %granted.username, "Admin granted");
    Ok(Json(json!({
        "success": true,
        "user": AdminView::from(granted),
    })))
}

async fn revoke_admin(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    if id == admin.user().id {
        return Err(AppError::Validation("You cannot remove your own admin access".into()));
    }

    let datastore = state.require_datastore()?;
    let target = datastore
        .find_user(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {id}")))?;
    if state.config.super_admin_discord_id.as_deref() == Some(target.discord_id.as_str()) {
        return Err(AppError::Forbidden);
    }

    datastore.revoke_admin(&id).await?;
    info!(admin = %admin.user().username, revoked = %target.username, "Admin revoked");
    Ok(Json(json!({ "success": true })))
}

async fn discord_login(State(state): State<AppState>, session: Session) -> Result<Redirect, AppError> {
    let oauth = state
        .oauth
        .as_ref()
        .ok_or(AppError::NotConfigured("Discord login"))?;

    let csrf: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    session.insert(STATE_KEY, &csrf).await?;

    Ok(Redirect::to(oauth.authorize_url(&csrf)?.as_str()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn discord_callback(
    State(state): State<AppState>,
    TrackedSession(session_id): TrackedSession,
    session: Session,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let frontend = state.config.frontend_url.clone();
    match complete_login(&state, &session, params).await {
        Ok(user) => {
            state.sessions.link_user(&session_id, &user.id, &user.username);
            info!(user = %user.username, admin = user.is_admin, "Discord login");
            Redirect::to(&format!("{frontend}/?auth=success"))
        }
        Err(error) => {
            warn!(%error, "Discord login failed");
            Redirect::to(&format!("{frontend}/?error=auth_failed"))
        }
    }
}

async fn complete_login(
    state: &AppState,
    session: &Session,
    params: CallbackParams,
) -> Result<CurrentUser, AppError> {
    if let Some(error) = params.error {
        return Err(AppError::Validation(format!("authorization denied: {error}")));
    }
    let oauth = state
        .oauth
        .as_ref()
        .ok_or(AppError::NotConfigured("Discord login"))?;

    let expected: Option<String> = session.remove(STATE_KEY).await?;
    match (expected, params.state) {
        (Some(expected), Some(actual)) if expected == actual => {}
        _ => return Err(AppError::Validation("OAuth state mismatch".into())),
    }
    let code = params
        .code
        .ok_or_else(|| AppError::Validation("missing authorization code".into()))?;

    let token = oauth.exchange_code(&code).await?;
    let profile = oauth.fetch_profile(&token).await?;
    let super_admin = state.config.super_admin_discord_id.as_deref();

    let user = match &state.datastore {
        Some(store) => {
            let mut model = store.upsert_discord_user(&profile, Utc::now()).await?;
            if super_admin == Some(profile.id.as_str()) && !model.is_admin {
                let mut roles = model.role_list();
                roles.push(SUPER_ADMIN_ROLE.to_string());
                model = store.set_admin(model, true, &roles).await?;
            }
            CurrentUser::from_model(&model)
        }
        None => CurrentUser::from_profile(&profile, super_admin),
    };

    session.cycle_id().await?;
    session.insert(USER_KEY, &user).await?;
    Ok(user)
}

async fn auth_user(session: Session) -> Result<Json<Value>, AppError> {
    let user = CurrentUser::from_session(&session).await?;
    Ok(Json(json!({
        "authenticated": user.is_some(),
        "user": user,
    })))
}

async fn logout(session: Session) -> Result<Json<Value>, AppError> {
    session.flush().await?;
    Ok(Json(json!({ "success": true })))
}
