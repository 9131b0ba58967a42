//! Visit, clearance and flight plan analytics.
//!
//! Counters live in process and are authoritative for the admin dashboard.
//! Every event is also mirrored to the datastore when one is configured, but
//! a mirror write can never fail the event: its result is reported as a
//! [`MirrorOutcome`] that callers discard.
//!
//! The per-day breakdown keeps the last [`DAILY_RETENTION_DAYS`] days that
//! saw a visit; `totalVisits` keeps counting past that window.

use std::{collections::BTreeMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    datastore::StoreError,
    feed::FlightPlan,
    session::{Session, SessionId, SessionStore},
};

/// Calendar days of per-day visit counts kept in memory.
pub const DAILY_RETENTION_DAYS: i64 = 30;

/// Durable sink for analytics events.
#[async_trait]
pub trait AnalyticsMirror: fmt::Debug + Send + Sync {
    async fn page_visit(&self, visit: &PageVisit) -> Result<(), StoreError>;
    async fn clearance(&self, record: &ClearanceRecord) -> Result<(), StoreError>;
    async fn flight_plan(&self, plan: &FlightPlan) -> Result<(), StoreError>;
    /// Upserts the session's aggregate row.
    async fn session(&self, session: &Session) -> Result<(), StoreError>;
    /// Records a counter reset so a restart does not resurrect older events.
    async fn reset(&self, at: DateTime<Utc>) -> Result<(), StoreError>;
}

/// Result of a best-effort mirror write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "discard deliberately with `let _ =`"]
pub enum MirrorOutcome {
    Written,
    /// No datastore configured.
    Skipped,
    /// The write failed and was logged.
    Failed,
}

impl MirrorOutcome {
    pub fn is_written(self) -> bool {
        self == MirrorOutcome::Written
    }

    fn and(self, next: MirrorOutcome) -> MirrorOutcome {
        match self {
            MirrorOutcome::Written => next,
            other => other,
        }
    }
}

async fn best_effort<F>(what: &'static str, write: F) -> MirrorOutcome
where
    F: Future<Output = Result<(), StoreError>>,
{
    match write.await {
        Ok(()) => MirrorOutcome::Written,
        Err(error) => {
            warn!(%error, what, "Mirror write failed, continuing");
            MirrorOutcome::Failed
        }
    }
}

/// Who made a request, as far as the server can tell.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PageVisit {
    pub session_id: SessionId,
    pub path: String,
    pub first_view: bool,
    pub meta: RequestMeta,
    pub visited_at: DateTime<Utc>,
}

/// Clearance details as reported by the client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearanceFields {
    pub callsign: Option<String>,
    pub destination: Option<String>,
    pub route: Option<String>,
    pub routing_type: Option<String>,
    pub runway: Option<String>,
    pub initial_altitude: Option<i32>,
    pub station: Option<String>,
    pub atis_info: Option<String>,
    pub clearance_text: Option<String>,
    pub user_id: Option<String>,
    pub discord_username: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClearanceRecord {
    pub session_id: SessionId,
    pub fields: ClearanceFields,
    pub meta: RequestMeta,
    pub generated_at: DateTime<Utc>,
}

/// Aggregates loaded from the datastore at startup, counting only events
/// after `last_reset`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AnalyticsSeed {
    pub daily_visits: BTreeMap<NaiveDate, u64>,
    pub clearances_generated: u64,
    pub flight_plans_received: u64,
    pub last_reset: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsCounters {
    pub total_visits: u64,
    pub daily_visits: BTreeMap<NaiveDate, u64>,
    pub clearances_generated: u64,
    pub flight_plans_received: u64,
    pub last_reset: DateTime<Utc>,
}

impl AnalyticsCounters {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            total_visits: 0,
            daily_visits: BTreeMap::new(),
            clearances_generated: 0,
            flight_plans_received: 0,
            last_reset: now,
        }
    }

    fn add_visit(&mut self, day: NaiveDate) {
        self.total_visits += 1;
        *self.daily_visits.entry(day).or_default() += 1;
        self.prune_daily();
    }

    /// Drops days older than the retention window, measured back from the
    /// newest recorded day.
    fn prune_daily(&mut self) {
        let Some(newest) = self.daily_visits.keys().next_back().copied() else {
            return;
        };
        let oldest_kept = newest - Duration::days(DAILY_RETENTION_DAYS - 1);
        self.daily_visits = self.daily_visits.split_off(&oldest_kept);
    }

    /// Visits over the `days` calendar days ending with `today`.
    pub fn visits_in_last(&self, today: NaiveDate, days: i64) -> u64 {
        let first = today - Duration::days(days - 1);
        self.daily_visits.range(first..=today).map(|(_, n)| n).sum()
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    #[serde(flatten)]
    pub counters: AnalyticsCounters,
    pub last7_days: u64,
    pub last30_days: u64,
    pub current_date: DateTime<Utc>,
}

/// Outcome of [`AnalyticsRecorder::record_visit`].
#[derive(Debug)]
pub struct VisitRecorded {
    pub session: Session,
    pub first_view: bool,
    pub mirror: MirrorOutcome,
}

#[derive(Debug)]
pub struct AnalyticsRecorder {
    counters: Mutex<AnalyticsCounters>,
    sessions: Arc<SessionStore>,
    mirror: Option<Arc<dyn AnalyticsMirror>>,
}

impl AnalyticsRecorder {
    pub fn new(sessions: Arc<SessionStore>, mirror: Option<Arc<dyn AnalyticsMirror>>) -> Self {
        Self {
            counters: Mutex::new(AnalyticsCounters::new(Utc::now())),
            sessions,
            mirror,
        }
    }

    /// Replaces the counters with aggregates loaded from the datastore.
    pub fn seed(&self, seed: AnalyticsSeed) {
        let mut counters = self.counters.lock();
        counters.total_visits = seed.daily_visits.values().sum();
        counters.daily_visits = seed.daily_visits;
        counters.prune_daily();
        counters.clearances_generated = seed.clearances_generated;
        counters.flight_plans_received = seed.flight_plans_received;
        if let Some(last_reset) = seed.last_reset {
            counters.last_reset = last_reset;
        }
    }

    pub async fn record_visit(
        &self,
        session_id: &SessionId,
        path: &str,
        meta: RequestMeta,
    ) -> VisitRecorded {
        self.record_visit_at(session_id, path, meta, Utc::now()).await
    }

    pub async fn record_visit_at(
        &self,
        session_id: &SessionId,
        path: &str,
        meta: RequestMeta,
        now: DateTime<Utc>,
    ) -> VisitRecorded {
        self.counters.lock().add_visit(now.date_naive());
        self.link_user(session_id, &meta);
        let session = self.sessions.record_page_view(session_id, now);
        let first_view = session.page_views == 1;

        let mirror = match &self.mirror {
            Some(mirror) => {
                let visit = PageVisit {
                    session_id: session_id.clone(),
                    path: path.to_string(),
                    first_view,
                    meta,
                    visited_at: now,
                };
                best_effort("page visit", mirror.page_visit(&visit))
                    .await
                    .and(best_effort("session aggregate", mirror.session(&session)).await)
            }
            None => MirrorOutcome::Skipped,
        };

        VisitRecorded {
            session,
            first_view,
            mirror,
        }
    }

    pub async fn record_clearance(
        &self,
        session_id: &SessionId,
        fields: ClearanceFields,
        meta: RequestMeta,
    ) -> MirrorOutcome {
        let now = Utc::now();
        self.counters.lock().clearances_generated += 1;
        self.link_user(session_id, &meta);
        let session = self.sessions.record_clearance(session_id, now);

        let Some(mirror) = &self.mirror else {
            return MirrorOutcome::Skipped;
        };

        let record = ClearanceRecord {
            session_id: session_id.clone(),
            fields,
            meta,
            generated_at: now,
        };
        best_effort("clearance", mirror.clearance(&record))
            .await
            .and(best_effort("session aggregate", mirror.session(&session)).await)
    }

    pub async fn record_flight_plan(&self, plan: &FlightPlan) -> MirrorOutcome {
        self.counters.lock().flight_plans_received += 1;

        match &self.mirror {
            Some(mirror) => best_effort("flight plan", mirror.flight_plan(plan)).await,
            None => MirrorOutcome::Skipped,
        }
    }

    /// Zeroes every counter and records the reset with the mirror. Only the
    /// admin reset endpoint calls this.
    pub async fn reset(&self) -> MirrorOutcome {
        self.reset_at(Utc::now()).await
    }

    pub async fn reset_at(&self, now: DateTime<Utc>) -> MirrorOutcome {
        *self.counters.lock() = AnalyticsCounters::new(now);
        debug!("Analytics counters reset");

        match &self.mirror {
            Some(mirror) => best_effort("analytics reset", mirror.reset(now)).await,
            None => MirrorOutcome::Skipped,
        }
    }

    pub fn counters(&self) -> AnalyticsCounters {
        self.counters.lock().clone()
    }

    pub fn summary(&self) -> AnalyticsSummary {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> AnalyticsSummary {
        let counters = self.counters();
        let today = now.date_naive();
        AnalyticsSummary {
            last7_days: counters.visits_in_last(today, 7),
            last30_days: counters.visits_in_last(today, 30),
            counters,
            current_date: now,
        }
    }

    fn link_user(&self, session_id: &SessionId, meta: &RequestMeta) {
        if let (Some(user_id), Some(username)) = (&meta.user_id, &meta.username) {
            self.sessions.link_user(session_id, user_id, username);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeZone;
    use sea_orm::DbErr;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Default)]
    struct FailingMirror {
        attempts: AtomicUsize,
    }

    impl FailingMirror {
        fn fail(&self) -> Result<(), StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Database(DbErr::Conn(sea_orm::RuntimeErr::Internal(
                "connection refused".into(),
            ))))
        }
    }

    #[async_trait]
    impl AnalyticsMirror for FailingMirror {
        async fn page_visit(&self, _: &PageVisit) -> Result<(), StoreError> {
            self.fail()
        }
        async fn clearance(&self, _: &ClearanceRecord) -> Result<(), StoreError> {
            self.fail()
        }
        async fn flight_plan(&self, _: &FlightPlan) -> Result<(), StoreError> {
            self.fail()
        }
        async fn session(&self, _: &Session) -> Result<(), StoreError> {
            self.fail()
        }
        async fn reset(&self, _: DateTime<Utc>) -> Result<(), StoreError> {
            self.fail()
        }
    }

    fn recorder(mirror: Option<Arc<dyn AnalyticsMirror>>) -> (AnalyticsRecorder, Arc<SessionStore>) {
        let sessions = Arc::new(SessionStore::new());
        (AnalyticsRecorder::new(sessions.clone(), mirror), sessions)
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn totals_match_daily_breakdown() {
        let (recorder, sessions) = recorder(None);
        let session = sessions.resolve(None);

        let days = [1, 1, 2, 5, 5, 5, 9];
        for d in days {
            let _ = recorder
                .record_visit_at(&session.id, "/", RequestMeta::default(), day(d))
                .await;
        }

        let counters = recorder.counters();
        assert_eq!(counters.total_visits, days.len() as u64);
        assert_eq!(counters.daily_visits.values().sum::<u64>(), days.len() as u64);
        assert_eq!(counters.daily_visits.len(), 4);
    }

    #[tokio::test]
    async fn first_view_is_reported_once_per_session() {
        let (recorder, sessions) = recorder(None);
        let session = sessions.resolve(None);

        let first = recorder
            .record_visit(&session.id, "/", RequestMeta::default())
            .await;
        let second = recorder
            .record_visit(&session.id, "/", RequestMeta::default())
            .await;

        assert!(first.first_view);
        assert!(!second.first_view);
        assert_eq!(second.session.page_views, 2);
        assert_eq!(first.mirror, MirrorOutcome::Skipped);
    }

    #[tokio::test]
    async fn failing_mirror_never_blocks_counters() {
        let mirror = Arc::new(FailingMirror::default());
        let (recorder, sessions) = recorder(Some(mirror.clone()));
        let session = sessions.resolve(None);

        let visit = recorder
            .record_visit(&session.id, "/", RequestMeta::default())
            .await;
        let clearance = recorder
            .record_clearance(&session.id, ClearanceFields::default(), RequestMeta::default())
            .await;

        assert_eq!(visit.mirror, MirrorOutcome::Failed);
        assert_eq!(clearance, MirrorOutcome::Failed);
        assert!(mirror.attempts.load(Ordering::SeqCst) >= 2);

        let counters = recorder.counters();
        assert_eq!(counters.total_visits, 1);
        assert_eq!(counters.clearances_generated, 1);
        assert_eq!(sessions.get(&session.id).unwrap().clearances_generated, 1);
    }

    #[tokio::test]
    async fn flight_plans_are_counted() {
        let (recorder, _) = recorder(None);
        let plan: FlightPlan = serde_json::from_value(json!({
            "callsign": "SWA123",
            "timestamp": "2025-03-01T12:00:00Z",
            "source": "Main",
        }))
        .unwrap();

        let _ = recorder.record_flight_plan(&plan).await;
        let _ = recorder.record_flight_plan(&plan).await;
        assert_eq!(recorder.counters().flight_plans_received, 2);
    }

    #[tokio::test]
    async fn visits_link_the_authenticated_user() {
        let (recorder, sessions) = recorder(None);
        let session = sessions.resolve(None);
        let meta = RequestMeta {
            user_id: Some("u-1".into()),
            username: Some("tower".into()),
            ..RequestMeta::default()
        };

        let recorded = recorder.record_visit(&session.id, "/", meta).await;
        assert_eq!(recorded.session.username.as_deref(), Some("tower"));
    }

    #[test]
    fn seed_keeps_totals_consistent() {
        let (recorder, _) = recorder(None);
        let mut daily = BTreeMap::new();
        daily.insert(day(1).date_naive(), 4);
        daily.insert(day(2).date_naive(), 6);

        recorder.seed(AnalyticsSeed {
            daily_visits: daily,
            clearances_generated: 3,
            flight_plans_received: 8,
            last_reset: Some(day(1)),
        });

        let counters = recorder.counters();
        assert_eq!(counters.total_visits, 10);
        assert_eq!(counters.clearances_generated, 3);
        assert_eq!(counters.last_reset, day(1));
    }

    #[tokio::test]
    async fn daily_breakdown_keeps_thirty_days() {
        let (recorder, sessions) = recorder(None);
        let session = sessions.resolve(None);
        let start = day(1);
        for offset in 0..45 {
            let _ = recorder
                .record_visit_at(
                    &session.id,
                    "/",
                    RequestMeta::default(),
                    start + Duration::days(offset),
                )
                .await;
        }

        let counters = recorder.counters();
        assert_eq!(counters.total_visits, 45);
        assert_eq!(counters.daily_visits.len(), DAILY_RETENTION_DAYS as usize);
        assert_eq!(
            counters.daily_visits.keys().next().copied(),
            Some((start + Duration::days(15)).date_naive())
        );

        let summary = recorder.summary_at(start + Duration::days(44));
        assert_eq!(summary.last30_days, 30);
        assert_eq!(summary.last7_days, 7);
    }

    #[test]
    fn seeding_prunes_old_days() {
        let (recorder, _) = recorder(None);
        let daily: BTreeMap<NaiveDate, u64> = (0..40)
            .map(|offset| ((day(1) + Duration::days(offset)).date_naive(), 2))
            .collect();

        recorder.seed(AnalyticsSeed {
            daily_visits: daily,
            ..AnalyticsSeed::default()
        });

        let counters = recorder.counters();
        assert_eq!(counters.total_visits, 80);
        assert_eq!(counters.daily_visits.len(), 30);
    }

    #[tokio::test]
    async fn reset_is_reported_to_the_mirror() {
        let mirror = Arc::new(FailingMirror::default());
        let (recorder, sessions) = recorder(Some(mirror.clone()));
        let session = sessions.resolve(None);
        let _ = recorder
            .record_visit_at(&session.id, "/", RequestMeta::default(), day(3))
            .await;
        let attempts = mirror.attempts.load(Ordering::SeqCst);

        let outcome = recorder.reset_at(day(4)).await;

        assert_eq!(outcome, MirrorOutcome::Failed);
        assert_eq!(mirror.attempts.load(Ordering::SeqCst), attempts + 1);
        let counters = recorder.counters();
        assert_eq!(counters.total_visits, 0);
        assert_eq!(counters.last_reset, day(4));
    }

    #[tokio::test]
    async fn summary_windows_and_reset() {
        let (recorder, sessions) = recorder(None);
        let session = sessions.resolve(None);
        for d in [1, 20, 25, 26] {
            let _ = recorder
                .record_visit_at(&session.id, "/", RequestMeta::default(), day(d))
                .await;
        }

        let summary = recorder.summary_at(day(26));
        assert_eq!(summary.last7_days, 3);
        assert_eq!(summary.last30_days, 4);

        assert_eq!(recorder.reset().await, MirrorOutcome::Skipped);
        let counters = recorder.counters();
        assert_eq!(counters.total_visits, 0);
        assert!(counters.daily_visits.is_empty());
    }
}
