//! Log capture for the admin log viewer, and runtime control of the level
//! filter.
//!
//! The binary installs a [`reload`] layer around its [`EnvFilter`] and hands
//! the handle to [`LevelControl`], so saving `system.logLevel` takes effect
//! without a restart. [`CaptureLayer`] sits behind that filter and copies every
//! event it lets through into a bounded [`LogBuffer`].

use std::{
    collections::VecDeque,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, reload, EnvFilter, Layer, Registry};

/// Entries kept for the log viewer.
pub const LOG_CAPACITY: usize = 500;

/// Handle to the reloadable filter installed by the binary.
pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to swap log filter: {0}")]
    Reload(#[from] reload::Error),
}

#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip)]
    severity: Level,
}

/// Ring buffer of recent log events, oldest dropped first.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, level: Level, target: &str, message: String) {
        let entry = LogEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            level: level.as_str().to_ascii_lowercase(),
            target: target.to_string(),
            message,
            severity: level,
        };

        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Newest first, at most `limit` entries. With `min_level` set, only
    /// entries at least that severe are returned.
    pub fn recent(&self, min_level: Option<Level>, limit: usize) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .filter(|entry| min_level.map_or(true, |min| entry.severity <= min))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Parses a viewer filter. `all` (or nothing) means no filter; `warning` is
/// accepted for `warn`.
pub fn parse_level_filter(value: Option<&str>) -> Option<Level> {
    match value.map(str::trim) {
        None | Some("") | Some("all") => None,
        Some("warning") => Some(Level::WARN),
        Some(other) => Level::from_str(other).ok(),
    }
}

/// A [`Layer`] that copies events into a [`LogBuffer`].
#[derive(Debug, Clone)]
pub struct CaptureLayer {
    buffer: Arc<LogBuffer>,
}

impl CaptureLayer {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        format!("{} {}", self.message, self.fields.join(" "))
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        self.buffer
            .push(*metadata.level(), metadata.target(), visitor.finish());
    }
}

/// Swaps the live level filter.
///
/// Holds no handle when the process was started with `RUST_LOG`, or outside
/// the binary; [`apply`](Self::apply) then only validates.
#[derive(Clone, Default)]
pub struct LevelControl {
    handle: Option<FilterHandle>,
}

impl fmt::Debug for LevelControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelControl")
            .field("reloadable", &self.handle.is_some())
            .finish()
    }
}

impl LevelControl {
    pub fn new(handle: FilterHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn is_reloadable(&self) -> bool {
        self.handle.is_some()
    }

    /// Installs `level` as the new filter. Returns whether a filter was
    /// swapped.
    pub fn apply(&self, level: &str) -> Result<bool, LoggingError> {
        let filter = EnvFilter::try_new(level)?;
        match &self.handle {
            Some(handle) => {
                handle.reload(filter)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing::{debug, info, warn};
    use tracing_subscriber::prelude::*;

    use super::*;

    #[test]
    fn buffer_drops_oldest_and_filters_by_severity() {
        let buffer = LogBuffer::new(3);
        buffer.push(Level::INFO, "feed", "connected".into());
        buffer.push(Level::ERROR, "feed", "socket closed".into());
        buffer.push(Level::WARN, "poller", "stale atis".into());
        buffer.push(Level::DEBUG, "poller", "tick".into());

        assert_eq!(buffer.len(), 3);
        let all: Vec<_> = buffer
            .recent(None, 10)
            .into_iter()
            .map(|entry| entry.message)
            .collect();
        assert_eq!(all, vec!["tick", "stale atis", "socket closed"]);

        let warnings = buffer.recent(Some(Level::WARN), 10);
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].level, "warn");
        assert_eq!(warnings[1].level, "error");

        assert_eq!(buffer.recent(None, 1)[0].message, "tick");
    }

    #[test]
    fn viewer_filters_parse() {
        assert_eq!(parse_level_filter(None), None);
        assert_eq!(parse_level_filter(Some("all")), None);
        assert_eq!(parse_level_filter(Some("warning")), Some(Level::WARN));
        assert_eq!(parse_level_filter(Some("error")), Some(Level::ERROR));
        assert_eq!(parse_level_filter(Some("loud")), None);
    }

    #[test]
    fn applied_level_changes_what_is_captured() {
        let buffer = Arc::new(LogBuffer::default());
        let (filter, handle) = reload::Layer::new(EnvFilter::new("info"));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(CaptureLayer::new(buffer.clone()));
        let control = LevelControl::new(handle);

        tracing::subscriber::with_default(subscriber, || {
            debug!("hidden");
            info!(count = 3, "visible");

            assert!(control.apply("debug").unwrap());
            debug!("now visible");

            assert!(control.apply("warn").unwrap());
            info!("hidden again");
            warn!("still visible");
        });

        let messages: Vec<_> = buffer
            .recent(None, 10)
            .into_iter()
            .map(|entry| entry.message)
            .collect();
        assert_eq!(messages, vec!["still visible", "now visible", "visible count=3"]);
    }

    #[test]
    fn invalid_levels_are_rejected_without_a_handle() {
        let control = LevelControl::default();
        assert!(!control.is_reloadable());
        assert!(!control.apply("info").unwrap());
        assert!(matches!(control.apply("feed=loud"), Err(LoggingError::Filter(_))));
    }
}
