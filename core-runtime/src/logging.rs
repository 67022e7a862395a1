//! Tracing subscriber setup for hosts embedding the core.
//!
//! Hosts call [`init_logging`] once at startup. Events from the workspace
//! crates pass at the configured level; everything else is held at `warn`.
//! When a [`LoggerSink`] is configured, each event that survives the filter
//! is also turned into a [`LogEntry`] and handed to the host.
//!
//! ```ignore
//! use bridge_traits::time::{ConsoleLogger, LogLevel};
//! use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
//! use std::sync::Arc;
//!
//! init_logging(
//!     LoggingConfig::default()
//!         .with_format(LogFormat::Compact)
//!         .with_level(LogLevel::Debug)
//!         .with_logger_sink(Arc::new(ConsoleLogger::default())),
//! )?;
//! tracing::info!(root = "music", "Library rescanned");
//! ```
//!
//! Share roots are absolute user paths. Fields named like paths (`path`,
//! `dest`, `root_path`, ...) are cut down to their last component before they
//! reach a sink unless `redact_paths` is turned off.

use crate::error::{Error, Result};
use bridge_traits::time::{LogEntry, LogLevel, LoggerSink};
use core_async::runtime;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::{LookupSpan, Registry};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

const WORKSPACE_CRATES: &[&str] = &[
    "musync_workspace",
    "core_runtime",
    "core_library",
    "core_sync",
    "core_service",
    "bridge_desktop",
];

const PATH_FIELDS: &[&str] = &["path", "dir", "dest", "file"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human readable
    Pretty,
    /// One JSON object per event
    Json,
    /// One line per event
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// Replaces the generated directives when set, e.g.
    /// `"core_sync=trace,core_library=debug"`
    pub filter: Option<String>,
    pub logger_sink: Option<Arc<dyn LoggerSink>>,
    pub redact_paths: bool,
    /// Log span enter/exit (pretty) or the span list (json)
    pub spans: bool,
    pub show_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: LogLevel::Info,
            filter: None,
            logger_sink: None,
            redact_paths: true,
            spans: false,
            show_target: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_logger_sink(mut self, sink: Arc<dyn LoggerSink>) -> Self {
        self.logger_sink = Some(sink);
        self
    }

    pub fn with_path_redaction(mut self, redact: bool) -> Self {
        self.redact_paths = redact;
        self
    }

    pub fn with_spans(mut self, spans: bool) -> Self {
        self.spans = spans;
        self
    }

    pub fn with_target(mut self, show: bool) -> Self {
        self.show_target = show;
        self
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// `Error::Config` if the filter does not parse or a global subscriber is
/// already installed.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let filter = build_filter(&config)?;
    let sink = config
        .logger_sink
        .clone()
        .map(|sink| SinkLayer::new(sink, config.redact_paths));

    tracing_subscriber::registry()
        .with(fmt_layer(&config))
        .with(sink)
        .with(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

fn fmt_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer().with_target(config.show_target);
    match config.format {
        LogFormat::Pretty => layer
            .pretty()
            .with_span_events(if config.spans {
                FmtSpan::ENTER | FmtSpan::CLOSE
            } else {
                FmtSpan::NONE
            })
            .boxed(),
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(config.spans)
            .with_span_list(config.spans)
            .boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    let directives = match &config.filter {
        Some(custom) => custom.clone(),
        None => {
            let level = level_name(config.level);
            let mut directives = vec!["warn".to_string()];
            directives.extend(
                WORKSPACE_CRATES
                    .iter()
                    .map(|krate| format!("{}={}", krate, level)),
            );
            directives.join(",")
        }
    };

    EnvFilter::try_new(&directives)
        .map_err(|e| Error::Config(format!("Invalid log filter '{}': {}", directives, e)))
}

fn level_name(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn from_tracing(level: &tracing::Level) -> LogLevel {
    match *level {
        tracing::Level::TRACE => LogLevel::Trace,
        tracing::Level::DEBUG => LogLevel::Debug,
        tracing::Level::INFO => LogLevel::Info,
        tracing::Level::WARN => LogLevel::Warn,
        tracing::Level::ERROR => LogLevel::Error,
    }
}

/// Mirrors events into a host [`LoggerSink`].
struct SinkLayer {
    sink: Arc<dyn LoggerSink>,
    redact_paths: bool,
}

impl SinkLayer {
    fn new(sink: Arc<dyn LoggerSink>, redact_paths: bool) -> Self {
        Self { sink, redact_paths }
    }

    fn entry(&self, event: &Event<'_>, span: Option<&str>) -> LogEntry {
        let metadata = event.metadata();
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let message = fields
            .message
            .take()
            .unwrap_or_else(|| metadata.name().to_string());
        let mut entry = LogEntry::new(from_tracing(metadata.level()), metadata.target(), message);
        for (name, value) in fields.values {
            let value = if self.redact_paths {
                redact_if_sensitive(&name, &value)
            } else {
                value
            };
            entry = entry.with_field(name, value);
        }
        if let Some(span) = span {
            entry = entry.with_span_id(span);
        }
        entry
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if from_tracing(event.metadata().level()) < self.sink.min_level() {
            return;
        }
        let span = ctx.lookup_current().map(|span| span.name());
        let entry = self.entry(event, span);
        let sink = Arc::clone(&self.sink);

        // Events from inside the runtime must not block it
        match runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = sink.log(entry).await {
                        eprintln!("logger sink failed: {}", e);
                    }
                });
            }
            Err(_) => match runtime::block_on(async move { sink.log(entry).await }) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => eprintln!("logger sink failed: {}", e),
                Err(e) => eprintln!("logger sink runtime unavailable: {}", e),
            },
        }
    }
}

#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    values: HashMap<String, String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_debug(field, &format_args!("{}", value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_debug(field, &format_args!("{}", value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let value = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(value);
        } else {
            self.values.insert(field.name().to_string(), value);
        }
    }
}

/// Strip `value` to its file name when `field` names a path.
///
/// ```ignore
/// assert_eq!(redact_if_sensitive("dest", "/home/me/Music/a.flac"), "a.flac");
/// assert_eq!(redact_if_sensitive("node_id", "f00d"), "f00d");
/// ```
pub fn redact_if_sensitive(field: &str, value: &str) -> String {
    let field = field.to_ascii_lowercase();
    if PATH_FIELDS.iter().any(|name| field.contains(name)) {
        strip_path(value.trim_matches('"')).to_string()
    } else {
        value.to_string()
    }
}

/// Last component of a `/` or `\` separated path.
pub fn strip_path(path: &str) -> &str {
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::error::Result as SinkResult;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LoggerSink for RecordingSink {
        async fn log(&self, entry: LogEntry) -> SinkResult<()> {
            self.entries.lock().unwrap().push(entry);
            Ok(())
        }

        fn min_level(&self) -> LogLevel {
            LogLevel::Debug
        }
    }

    #[test]
    fn test_default_filter_covers_workspace_crates() {
        let filter = build_filter(&LoggingConfig::default().with_level(LogLevel::Debug))
            .unwrap()
            .to_string();
        assert!(filter.contains("core_sync=debug"));
        assert!(filter.contains("core_library=debug"));
        assert!(filter.contains("warn"));
    }

    #[test]
    fn test_custom_filter_replaces_defaults() {
        let filter = build_filter(&LoggingConfig::default().with_filter("core_sync=trace"))
            .unwrap()
            .to_string();
        assert!(filter.contains("core_sync=trace"));
        assert!(!filter.contains("core_library"));
    }

    #[test]
    fn test_sink_receives_redacted_fields() {
        let sink = Arc::new(RecordingSink::default());
        let layer = SinkLayer::new(sink.clone(), true);
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        tracing::info!(
            target: "core_sync::client",
            job_id = 7u64,
            dest = "/home/alice/Music/remote/song.flac",
            "Download committed"
        );
        tracing::trace!("below the sink level");

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].target, "core_sync::client");
        assert_eq!(entries[0].message, "Download committed");
        assert_eq!(entries[0].fields["job_id"], "7");
        assert_eq!(entries[0].fields["dest"], "song.flac");
    }

    #[test]
    fn test_sink_keeps_paths_when_redaction_is_off() {
        let sink = Arc::new(RecordingSink::default());
        let layer = SinkLayer::new(sink.clone(), false);
        let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

        tracing::warn!(path = "/srv/music/a.mp3", "Skipped");

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries[0].fields["path"], "/srv/music/a.mp3");
        assert_eq!(entries[0].level, LogLevel::Warn);
    }

    #[test]
    fn test_strip_path() {
        assert_eq!(strip_path("/home/user/music/song.mp3"), "song.mp3");
        assert_eq!(strip_path("C:\\Users\\me\\Music\\song.mp3"), "song.mp3");
        assert_eq!(strip_path("song.mp3"), "song.mp3");
        assert_eq!(strip_path("/var/log/"), "");
    }
}
