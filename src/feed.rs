//! Streaming client for the upstream flight plan feed.
//!
//! The feed sends JSON envelopes of the form `{"t": <tag>, "d": <payload>}`.
//! Flight plans are stamped, kept newest-first in a bounded buffer and
//! reported to analytics. The connection is re-established after a fixed
//! delay whenever it drops, for as long as the process runs.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::ORIGIN, HeaderValue},
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::{analytics::AnalyticsRecorder, settings::SettingsStore};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("malformed feed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlightPlanSource {
    Main,
    Event,
}

impl fmt::Display for FlightPlanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlightPlanSource::Main => f.write_str("Main"),
            FlightPlanSource::Event => f.write_str("Event"),
        }
    }
}

/// A flight plan as filed upstream. Fields the server does not interpret
/// are carried along untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightPlanPayload {
    #[serde(default, deserialize_with = "string_or_number")]
    pub callsign: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub arriving: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub route: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub flightlevel: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlightPlan {
    #[serde(default, deserialize_with = "string_or_number")]
    pub callsign: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub arriving: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub route: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub flightlevel: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub source: FlightPlanSource,
}

impl FlightPlan {
    pub fn stamp(payload: FlightPlanPayload, source: FlightPlanSource, now: DateTime<Utc>) -> Self {
        let mut extra = payload.extra;
        extra.remove("timestamp");
        extra.remove("source");
        Self {
            callsign: payload.callsign,
            arriving: payload.arriving,
            route: payload.route,
            flightlevel: payload.flightlevel,
            extra,
            timestamp: now,
            source,
        }
    }

    /// Names both a callsign and a destination.
    pub fn is_complete(&self) -> bool {
        let present = |field: &Option<String>| {
            field
                .as_deref()
                .is_some_and(|value| !value.trim().is_empty())
        };
        present(&self.callsign) && present(&self.arriving)
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Deserialize)]
struct Envelope {
    t: String,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, PartialEq)]
pub enum FeedEvent {
    FlightPlan(FlightPlanSource, FlightPlanPayload),
    /// Weather reports are parsed but not consumed.
    Metar(Value),
    Other(String),
}

pub fn parse_message(text: &str) -> Result<FeedEvent, FeedError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(match envelope.t.as_str() {
        "FLIGHT_PLAN" => FeedEvent::FlightPlan(
            FlightPlanSource::Main,
            serde_json::from_value(envelope.d)?,
        ),
        "EVENT_FLIGHT_PLAN" => FeedEvent::FlightPlan(
            FlightPlanSource::Event,
            serde_json::from_value(envelope.d)?,
        ),
        "METAR" => FeedEvent::Metar(envelope.d),
        _ => FeedEvent::Other(envelope.t),
    })
}

/// Newest-first list of received flight plans.
#[derive(Debug, Default)]
pub struct FlightPlanBuffer {
    plans: Mutex<VecDeque<FlightPlan>>,
}

impl FlightPlanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `plan` at the front and drops anything past `capacity`.
    pub fn push(&self, plan: FlightPlan, capacity: usize) {
        let mut plans = self.plans.lock();
        plans.push_front(plan);
        plans.truncate(capacity.max(1));
    }

    pub fn snapshot(&self) -> Vec<FlightPlan> {
        self.plans.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest_received(&self) -> Option<DateTime<Utc>> {
        self.plans.lock().front().map(|plan| plan.timestamp)
    }
}

#[derive(Debug)]
pub struct FeedClient {
    url: String,
    reconnect_delay: Duration,
    buffer: Arc<FlightPlanBuffer>,
    analytics: Arc<AnalyticsRecorder>,
    settings: Arc<SettingsStore>,
    connected: AtomicBool,
}

impl FeedClient {
    pub fn new(
        url: impl Into<String>,
        reconnect_delay: Duration,
        buffer: Arc<FlightPlanBuffer>,
        analytics: Arc<AnalyticsRecorder>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            buffer,
            analytics,
            settings,
            connected: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Processes one inbound text frame. Returns the stored flight plan,
    /// if the frame carried one.
    ///
    /// Every plan is counted and mirrored. With `enableFlightPlanFiltering`
    /// on, incomplete plans stay out of the live buffer and `None` is
    /// returned for them.
    pub async fn handle_message(&self, text: &str) -> Option<FlightPlan> {
        let event = match parse_message(text) {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "Discarding feed message");
                return None;
            }
        };

        let FeedEvent::FlightPlan(source, payload) = event else {
            return None;
        };

        let system = self.settings.system();
        let plan = FlightPlan::stamp(payload, source, Utc::now());
        let _ = self.analytics.record_flight_plan(&plan).await;
        if system.enable_flight_plan_filtering && !plan.is_complete() {
            debug!(%source, "Filtered incomplete flight plan");
            return None;
        }
        self.buffer.push(plan.clone(), system.max_flight_plans_stored);

        if system.enable_detailed_logging {
            info!(
                callsign = plan.callsign.as_deref().unwrap_or("unknown"),
                %source,
                "Received flight plan"
            );
        }

        Some(plan)
    }

    /// Connects and reads until the stream ends or fails.
    async fn connect_and_read(&self) -> Result<(), FeedError> {
        let mut request = self.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(ORIGIN, HeaderValue::from_static(""));

        let (mut stream, _) = connect_async(request).await?;
        self.connected.store(true, Ordering::Release);
        info!(url = %self.url, "Flight plan feed connected");

        while let Some(message) = stream.next().await {
            match message? {
                Message::Text(text) => {
                    self.handle_message(&text).await;
                }
                Message::Close(frame) => {
                    debug!(?frame, "Flight plan feed sent close");
                    break;
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Runs the connection loop forever.
    pub async fn run(self: Arc<Self>) {
        loop {
            match self.connect_and_read().await {
                Ok(()) => warn!("Flight plan feed closed"),
                Err(error) => error!(%error, "Flight plan feed failed"),
            }
            self.connected.store(false, Ordering::Release);

            info!(
                delay_secs = self.reconnect_delay.as_secs(),
                "Reconnecting to flight plan feed"
            );
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }
}
