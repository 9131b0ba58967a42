//! Router tests driven through `tower::ServiceExt::oneshot`.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use http_body_util::BodyExt;
use chrono::Utc;
use ifr_clearance::{
    app::{self, AppState, LOGIN_COOKIE},
    auth::{CurrentUser, DiscordProfile, USER_KEY},
    config::Config,
    datastore::Datastore,
    login_store::LoginStore,
    poller::{Atis, Controller, FetchError, Upstream},
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use tower_sessions::{
    session::{Id, Record},
    SessionStore as _,
};

#[derive(Debug)]
struct OfflineUpstream;

#[async_trait]
impl Upstream for OfflineUpstream {
    async fn controllers(&self) -> Result<Vec<Controller>, FetchError> {
        Err(FetchError::Unavailable("offline".into()))
    }

    async fn atis(&self) -> Result<Vec<Atis>, FetchError> {
        Err(FetchError::Unavailable("offline".into()))
    }
}

async fn app() -> (AppState, Router) {
    let config = Config {
        secure_cookies: false,
        ..Config::default()
    };
    let state = AppState::build(config, None, Arc::new(OfflineUpstream)).await;
    let router = app::router(state.clone(), LoginStore::new(None));
    (state, router)
}

/// An app with a logged-in admin. Returns the cookie that carries the login.
async fn admin_app(datastore: Option<Datastore>, admin: CurrentUser) -> (AppState, Router, String) {
    let config = Config {
        secure_cookies: false,
        ..Config::default()
    };
    let state = AppState::build(config, datastore, Arc::new(OfflineUpstream)).await;

    let logins = LoginStore::new(None);
    let mut record = Record {
        id: Id::default(),
        data: HashMap::from([(USER_KEY.to_string(), serde_json::to_value(&admin).unwrap())]),
        expiry_date: OffsetDateTime::now_utc() + time::Duration::days(1),
    };
    logins.create(&mut record).await.unwrap();

    let router = app::router(state.clone(), logins);
    (state, router, format!("{LOGIN_COOKIE}={}", record.id))
}

fn admin_user(id: &str) -> CurrentUser {
    CurrentUser {
        id: id.to_string(),
        discord_id: format!("discord-{id}"),
        username: "tower".to_string(),
        avatar: None,
        is_admin: true,
        roles: vec!["admin".to_string()],
    }
}

fn with_cookie(mut request: Request<Body>, cookie: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert(header::COOKIE, cookie.parse().unwrap());
    request
}

async fn sqlite() -> Datastore {
    let store = Datastore::connect("sqlite::memory:", 1).await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn session_header(response: &Response) -> String {
    response
        .headers()
        .get("x-session-id")
        .expect("session header")
        .to_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn every_response_carries_a_session() {
    let (_, router) = app().await;

    let response = router.clone().oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let id = session_header(&response);
    assert_eq!(id.len(), 36);
    let cookie = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find(|value| value.starts_with("session_id="))
        .expect("session cookie");
    assert!(cookie.contains(&id));

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["datastore"], "disabled");

    let missing = router.oneshot(get("/api/nope")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(session_header(&missing).len(), 36);
}

#[tokio::test]
async fn known_session_ids_are_echoed() {
    let (state, router) = app().await;
    let id = "3f2a9c1e-7b4d-4e8f-a1b2-c3d4e5f60718";

    let request = Request::builder()
        .uri("/api/status")
        .header("X-Session-ID", id.to_uppercase())
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(session_header(&response), id);

    let by_query = router
        .oneshot(get(&format!("/api/status?sessionId={id}")))
        .await
        .unwrap();
    assert_eq!(session_header(&by_query), id);
    assert_eq!(json_body(by_query).await["sessionId"], id);
    assert_eq!(state.sessions.len(), 1);
}

#[tokio::test]
async fn page_visits_report_first_view() {
    let (state, router) = app().await;
    let id = "deadbeef";

    let mut views = Vec::new();
    for _ in 0..2 {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/page-visit")
            .header("x-session-id", id)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "path": "/" }).to_string()))
            .unwrap();
        views.push(json_body(router.clone().oneshot(request).await.unwrap()).await);
    }

    assert_eq!(views[0]["firstView"], true);
    assert_eq!(views[1]["firstView"], false);
    assert_eq!(views[1]["pageViews"], 2);
    assert_eq!(views[1]["sessionId"], "deadbeef-0000-0000-0000-000000000000");

    let counters = state.analytics.counters();
    assert_eq!(counters.total_visits, 2);
    assert_eq!(counters.daily_visits.values().sum::<u64>(), 2);
}

#[tokio::test]
async fn public_settings_hide_system_group() {
    let (_, router) = app().await;

    let body = json_body(router.oneshot(get("/api/settings")).await.unwrap()).await;
    assert!(body.get("system").is_none());
    assert_eq!(body["clearanceFormat"]["phraseologyStyle"], "ICAO");
    assert_eq!(body["aviation"]["squawkRanges"]["max"], 7777);
}

#[tokio::test]
async fn admin_routes_require_login() {
    let (_, router) = app().await;

    for (method, uri) in [
        (Method::GET, "/api/admin/settings"),
        (Method::GET, "/api/admin/analytics"),
        (Method::POST, "/api/admin/analytics/reset"),
        (Method::GET, "/api/admin/sessions"),
    ] {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        assert_eq!(json_body(response).await["error"], "Authentication required");
    }

    let user = json_body(router.oneshot(get("/api/auth/user")).await.unwrap()).await;
    assert_eq!(user["authenticated"], false);
}

#[tokio::test]
async fn datastore_routes_report_unavailable() {
    let (_, router) = app().await;

    let response = router.clone().oneshot(get("/api/leaderboard")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let login = router.oneshot(get("/auth/discord")).await.unwrap();
    assert_eq!(login.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn generated_clearances_are_counted() {
    let (state, router) = app().await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/clearance-generated",
            json!({
                "callsign": "DAL45",
                "destination": "IPPH",
                "routing_type": "RDV",
                "initial_altitude": 3000,
                "clearance_text": "DAL45, cleared to IPPH"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let id = session_header(&response);
    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["saved"], false);

    assert_eq!(state.analytics.counters().clearances_generated, 1);
    let session = state
        .sessions
        .active_within(chrono::Utc::now(), std::time::Duration::from_secs(60))
        .into_iter()
        .find(|session| session.id.as_str() == id)
        .expect("tracked session");
    assert_eq!(session.clearances_generated, 1);
}

#[tokio::test]
async fn clearances_render_server_side() {
    let (state, router) = app().await;

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/clearance",
            json!({
                "callsign": "BAW9",
                "atcStation": "Rockford Ground",
                "atis": "D",
                "destination": "IPPH",
                "routingType": "SID",
                "sid": "CIV1K",
                "runway": "25R",
                "initialAltitude": 4000,
                "flightLevel": "FL330"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let text = body["clearance"].as_str().unwrap();
    assert!(text.starts_with("BAW9, Rockford Ground, good day."));
    assert!(text.contains("via the CIV1K departure, runway 25R"));
    assert!(text.contains("Flight Level 330"));
    let squawk: u16 = body["squawk"].as_str().unwrap().parse().unwrap();
    assert!(![7500, 7600, 7700].contains(&squawk));
    assert_eq!(state.analytics.counters().clearances_generated, 1);

    let invalid = router
        .oneshot(post_json("/api/clearance", json!({ "atcStation": "Ground" })))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.analytics.counters().clearances_generated, 1);
}

#[tokio::test]
async fn flight_plans_come_from_the_feed_buffer() {
    let (state, router) = app().await;

    let empty = json_body(router.clone().oneshot(get("/api/flight-plans")).await.unwrap()).await;
    assert_eq!(empty, json!([]));

    let message = json!({ "t": "FLIGHT_PLAN", "d": { "callsign": "UAL7", "aircraft": "B738" } });
    state.feed.handle_message(&message.to_string()).await;

    let plans = json_body(router.oneshot(get("/api/flight-plans")).await.unwrap()).await;
    assert_eq!(plans[0]["callsign"], "UAL7");
    assert_eq!(plans[0]["aircraft"], "B738");
    assert_eq!(plans[0]["source"], "Main");
}

#[tokio::test]
async fn controllers_start_stale_and_empty() {
    let (state, router) = app().await;
    state.cache.refresh_controllers().await;

    let body = json_body(router.oneshot(get("/api/controllers")).await.unwrap()).await;
    assert_eq!(body["source"], "stale");
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn dashboard_settings_form_saves() {
    let (state, router, cookie) = admin_app(None, admin_user("u-1")).await;

    let form = json!({
        "clearanceFormat": {
            "customTemplate": "{CALLSIGN}, {ATC_STATION}, cleared to {DESTINATION}",
            "includeAtis": true,
            "includeSquawk": true,
            "includeFlightLevel": true,
            "includeStartupApproval": false,
            "includeInitialClimb": true
        },
        "aviation": {
            "defaultAltitudes": [1000, 2000, 3000, 4000, 5000],
            "squawkRanges": { "min": 1000, "max": 7777, "exclude": [7500, 7600, 7700] },
            "enableRunwayValidation": false,
            "enableSIDValidation": false
        },
        "system": {
            "maxFlightPlansStored": 50,
            "autoRefreshInterval": 30000,
            "controllerPollInterval": 300000,
            "enableDetailedLogging": false,
            "enableFlightPlanFiltering": false,
            "atisPollInterval": 300000
        }
    });
    let response = router
        .clone()
        .oneshot(with_cookie(post_json("/api/admin/settings", form), &cookie))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["settings"]["system"]["maxFlightPlansStored"], 50);
    assert_eq!(body["settings"]["system"]["autoRefreshInterval"], 30000);
    assert_eq!(body["settings"]["clearanceFormat"]["includeStartupApproval"], false);
    assert_eq!(state.settings.system().max_flight_plans_stored, 50);

    let reread = router
        .oneshot(with_cookie(get("/api/admin/settings"), &cookie))
        .await
        .unwrap();
    assert_eq!(json_body(reread).await["system"]["atisPollInterval"], 300000);
}

#[tokio::test]
async fn admin_users_are_wrapped_and_default_to_admin_role() {
    let store = sqlite().await;
    let now = Utc::now();
    let requester = store
        .upsert_discord_user(&discord_profile("2001", "Tower"), now)
        .await
        .unwrap();
    store.set_admin(requester.clone(), true, &["admin".to_string()]).await.unwrap();
    let target = store
        .upsert_discord_user(&discord_profile("2002", "Approach"), now)
        .await
        .unwrap();

    let (_, router, cookie) = admin_app(Some(store), admin_user(&requester.id)).await;

    let granted = router
        .clone()
        .oneshot(with_cookie(
            post_json("/api/admin/users", json!({ "username": "approach" })),
            &cookie,
        ))
        .await
        .unwrap();
    assert_eq!(granted.status(), StatusCode::OK);
    let granted = json_body(granted).await;
    assert_eq!(granted["success"], true);
    assert_eq!(granted["user"]["roles"], json!(["admin"]));

    let listed = json_body(
        router
            .clone()
            .oneshot(with_cookie(get("/api/admin/users"), &cookie))
            .await
            .unwrap(),
    )
    .await;
    let users = listed["users"].as_array().expect("users array");
    assert_eq!(users.len(), 2);

    let revoke = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/admin/users/{}", target.id))
        .body(Body::empty())
        .unwrap();
    let revoked = router
        .clone()
        .oneshot(with_cookie(revoke, &cookie))
        .await
        .unwrap();
    assert_eq!(json_body(revoked).await["success"], true);

    let listed = json_body(
        router
            .oneshot(with_cookie(get("/api/admin/users"), &cookie))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(listed["users"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn admin_tables_are_allowlisted_and_paginated() {
    let store = sqlite().await;
    let requester = store
        .upsert_discord_user(&discord_profile("3001", "Ground"), Utc::now())
        .await
        .unwrap();
    store.set_admin(requester.clone(), true, &["admin".to_string()]).await.unwrap();
    let (_, router, cookie) = admin_app(Some(store), admin_user(&requester.id)).await;

    for path in ["/", "/about", "/admin"] {
        let _ = router
            .clone()
            .oneshot(post_json("/api/page-visit", json!({ "path": path })))
            .await
            .unwrap();
    }

    let page = json_body(
        router
            .clone()
            .oneshot(with_cookie(get("/api/admin/tables/page_visits?limit=2&offset=0"), &cookie))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(page["totalCount"], 3);
    assert_eq!(page["data"].as_array().map(Vec::len), Some(2));

    let rejected = router
        .oneshot(with_cookie(get("/api/admin/tables/login_sessions"), &cookie))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn current_users_and_logs_use_dashboard_shapes() {
    let (state, router, cookie) = admin_app(None, admin_user("u-1")).await;
    let _ = router
        .clone()
        .oneshot(post_json("/api/page-visit", json!({ "path": "/" })))
        .await
        .unwrap();
    state.logs.push(tracing::Level::ERROR, "feed", "socket closed".into());
    state.logs.push(tracing::Level::INFO, "feed", "connected".into());

    let users = json_body(
        router
            .clone()
            .oneshot(with_cookie(get("/api/admin/current-users"), &cookie))
            .await
            .unwrap(),
    )
    .await;
    assert!(users["activeCount"].as_u64().unwrap() >= 1);
    assert_eq!(users["supabaseSessionsCount"], 0);
    assert_eq!(users["users"][0]["source"], "memory");
    assert!(users["users"][0]["session_id"].is_string());

    let errors = json_body(
        router
            .clone()
            .oneshot(with_cookie(get("/api/admin/logs?level=error"), &cookie))
            .await
            .unwrap(),
    )
    .await;
    let logs = errors["logs"].as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["message"], "socket closed");

    let status = json_body(router.oneshot(get("/api/full-status")).await.unwrap()).await;
    assert_eq!(status["24data_connectivity"]["status"], "outage");
    assert_eq!(status["errors"]["count"], 1);
    assert!(status["24ifr_api"]["endpoints"]
        .as_array()
        .unwrap()
        .iter()
        .any(|route| route["path"] == "/api/admin/logs"));
}

fn discord_profile(id: &str, username: &str) -> DiscordProfile {
    DiscordProfile {
        id: id.to_string(),
        username: username.to_string(),
        email: None,
        avatar: None,
        discriminator: None,
    }
}
