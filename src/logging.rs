use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::{ApiType, Mode, SampleFormat};

/// Environment variable consulted by [`init`]
pub const LOG_LEVEL_ENV: &str = "ORCHESTRA_LOG_LEVEL";

const MAX_EVENTS: usize = 256;

/// Initialize the `env_logger` backend of the `log` facade.
///
/// `level` overrides the `ORCHESTRA_LOG_LEVEL` environment variable. Calling
/// this twice is an error from `env_logger`, which tools simply report.
pub fn init(level: Option<&str>) -> Result<(), log::SetLoggerError> {
    let log_level = level
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_LEVEL_ENV).ok())
        .unwrap_or_else(|| "info".to_string());

    let mut builder = env_logger::Builder::new();
    builder.format(|buf, record| {
        use std::io::Write;
        writeln!(
            buf,
            "{} [{}] [{}:{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    builder.filter_level(parse_level_filter(&log_level));
    // Diagnostics go to stderr so stdout stays a clean sample pipe
    builder.target(env_logger::Target::Stderr);
    builder.try_init()?;

    debug!("orchestra logging initialized with level: {}", log_level);
    Ok(())
}

pub fn parse_level_filter(level: &str) -> log::LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Lifecycle event recorded by the control context
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: StreamEventType,
    pub details: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventType {
    BackendSelected,
    StreamOpened,
    StreamStarted,
    StreamStopped,
    StreamAborted,
    StreamClosed,
    Xrun,
    StreamError,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamEventType::BackendSelected => "BACKEND_SELECTED",
            StreamEventType::StreamOpened => "STREAM_OPENED",
            StreamEventType::StreamStarted => "STREAM_STARTED",
            StreamEventType::StreamStopped => "STREAM_STOPPED",
            StreamEventType::StreamAborted => "STREAM_ABORTED",
            StreamEventType::StreamClosed => "STREAM_CLOSED",
            StreamEventType::Xrun => "XRUN",
            StreamEventType::StreamError => "STREAM_ERROR",
        }
    }
}

/// Bounded history of stream lifecycle events, mirrored to the `log` facade.
///
/// Only the control context records here; the real-time path never touches
/// the mutex.
#[derive(Clone)]
pub struct StreamLogger {
    events: Arc<Mutex<VecDeque<StreamEvent>>>,
    max_events: usize,
}

impl StreamLogger {
    pub fn new() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }

    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(max_events.min(MAX_EVENTS)))),
            max_events: max_events.max(1),
        }
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<StreamEvent>> {
        // A panicking test thread must not disable logging for everyone else
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log_event(&self, event_type: StreamEventType, details: String) {
        match event_type {
            StreamEventType::BackendSelected
            | StreamEventType::StreamOpened
            | StreamEventType::StreamClosed => info!("[{}] {}", event_type.as_str(), details),
            StreamEventType::StreamStarted | StreamEventType::StreamStopped => {
                debug!("[{}] {}", event_type.as_str(), details)
            }
            StreamEventType::StreamAborted | StreamEventType::Xrun => {
                warn!("[{}] {}", event_type.as_str(), details)
            }
            StreamEventType::StreamError => error!("[{}] {}", event_type.as_str(), details),
        }

        let mut events = self.events();
        events.push_back(StreamEvent {
            timestamp: Utc::now(),
            event_type,
            details,
        });
        while events.len() > self.max_events {
            events.pop_front();
        }
    }

    pub fn log_backend_selected(&self, api: ApiType, device_count: usize) {
        self.log_event(
            StreamEventType::BackendSelected,
            format!("Selected backend '{}' with {} device(s)", api, device_count),
        );
    }

    pub fn log_stream_opened(
        &self,
        mode: Mode,
        format: SampleFormat,
        sample_rate: u32,
        buffer_frames: u32,
    ) {
        self.log_event(
            StreamEventType::StreamOpened,
            format!(
                "Opened {} stream: {} @ {} Hz, {} frames per quantum",
                mode, format, sample_rate, buffer_frames
            ),
        );
    }

    pub fn log_stream_started(&self) {
        self.log_event(StreamEventType::StreamStarted, "Stream started".to_string());
    }

    pub fn log_stream_stopped(&self, stream_time: f64) {
        self.log_event(
            StreamEventType::StreamStopped,
            format!("Stream stopped at {:.3}s", stream_time),
        );
    }

    pub fn log_stream_aborted(&self, stream_time: f64) {
        self.log_event(
            StreamEventType::StreamAborted,
            format!("Stream aborted at {:.3}s", stream_time),
        );
    }

    pub fn log_stream_closed(&self, xruns: u64) {
        self.log_event(
            StreamEventType::StreamClosed,
            format!("Stream closed ({} xrun(s) during lifetime)", xruns),
        );
    }

    pub fn log_xrun(&self, new_xruns: u64, total: u64) {
        self.log_event(
            StreamEventType::Xrun,
            format!("{} xrun(s) detected (total: {})", new_xruns, total),
        );
    }

    pub fn log_stream_error(&self, error: &str) {
        self.log_event(StreamEventType::StreamError, format!("Stream error: {}", error));
    }

    /// Most recent events, oldest first
    pub fn get_recent_events(&self, count: usize) -> Vec<StreamEvent> {
        let events = self.events();
        let skip = events.len().saturating_sub(count);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn count(&self, event_type: StreamEventType) -> usize {
        self.events()
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }

    pub fn clear_events(&self) {
        self.events().clear();
    }
}

impl Default for StreamLogger {
    fn default() -> Self {
        Self::new()
    }
}
