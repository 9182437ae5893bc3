//! Logging setup for the service.
//!
//! Installs a console layer and an append-mode file layer on the global
//! subscriber, with either a plain `LEVEL - message` format or a structured
//! one-JSON-object-per-line format. Re-running the setup swaps the whole
//! output stack instead of stacking duplicate layers.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Log file used when no override is given, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "logs/app.log";

/// Targets pinned to WARN regardless of the root level. sqlx query logging
/// and the hyper/tower/axum internals drown out application logs at DEBUG.
const SUPPRESSED_TARGETS: [&str; 5] = ["sqlx", "sqlx::query", "hyper", "tower", "axum"];

/// JSON keys owned by the record itself. Extra fields with these names are
/// dropped at merge time so the rendered object keeps a single value per key.
const RESERVED_KEYS: [&str; 5] = ["timestamp", "level", "name", "message", "exception"];

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// Set on the first setup_logging call; later calls reload through it.
static RELOAD_HANDLE: OnceCell<reload::Handle<BoxedLayer, Registry>> = OnceCell::new();

/// Owns the background worker flushing the log file. Keep it alive for the
/// process lifetime; dropping it flushes and detaches the file writer.
#[must_use = "dropping the guard stops the background log file writer"]
pub struct LoggingGuard {
    _file_writer: WorkerGuard,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard").finish_non_exhaustive()
    }
}

/// Configures process-wide logging: a stdout layer and an append-mode file
/// layer, both using the format selected by `json_format`, filtered at
/// `log_level` with the noisy third-party targets pinned to WARN.
///
/// The first call installs the global subscriber; subsequent calls replace
/// the previous output stack, so reconfiguring never duplicates output.
/// Unknown level names and filesystem failures are configuration errors.
pub fn setup_logging(
    log_level: &str,
    json_format: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<LoggingGuard> {
    let level = parse_level(log_level)?;
    let path = resolve_log_file(log_file);

    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let stack = build_layers(level, json_format, file_writer)?;

    match RELOAD_HANDLE.get() {
        Some(handle) => handle
            .reload(stack)
            .context("failed to swap the logging configuration")?,
        None => {
            let (layer, handle) = reload::Layer::new(stack);
            tracing_subscriber::registry()
                .with(layer)
                .try_init()
                .context("failed to install the global logging subscriber")?;
            let _ = RELOAD_HANDLE.set(handle);
        }
    }

    tracing::info!(log_file = %path.display(), json = json_format, "Logging initialized");

    Ok(LoggingGuard {
        _file_writer: guard,
    })
}

/// Returns a span scoping subsequent events to a named component. Same name,
/// same dispatch target; the span inherits whatever `setup_logging` installed.
pub fn component_span(name: &str) -> tracing::Span {
    tracing::info_span!("component", component = name)
}

/// Resolves a severity name, case-insensitively. `warning` is accepted as an
/// alias for `warn`. Unknown names are rejected rather than defaulted.
pub fn parse_level(name: &str) -> anyhow::Result<Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => {
            bail!("unknown log level {other:?}, expected one of trace, debug, info, warn, error")
        }
    }
}

/// Path the file layer writes to: the override if given, `logs/app.log`
/// relative to the current working directory otherwise.
pub fn resolve_log_file(log_file: Option<&Path>) -> PathBuf {
    log_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
}

fn build_layers(
    level: Level,
    json_format: bool,
    file_writer: NonBlocking,
) -> anyhow::Result<BoxedLayer> {
    let filter = build_filter(level)?;
    let stack: BoxedLayer = if json_format {
        let console = tracing_subscriber::fmt::layer()
            .event_format(JsonFormatter)
            .with_writer(io::stdout);
        let file = tracing_subscriber::fmt::layer()
            .event_format(JsonFormatter)
            .with_writer(file_writer);
        Box::new(console.and_then(file).with_filter(filter))
    } else {
        let console = tracing_subscriber::fmt::layer()
            .event_format(PlainFormatter)
            .with_writer(io::stdout);
        let file = tracing_subscriber::fmt::layer()
            .event_format(PlainFormatter)
            .with_writer(file_writer);
        Box::new(console.and_then(file).with_filter(filter))
    };
    Ok(stack)
}

fn build_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::new(level.to_string().to_lowercase());
    for target in SUPPRESSED_TARGETS {
        filter = filter.add_directive(format!("{target}=warn").parse()?);
    }
    Ok(filter)
}

/// One log event, captured for formatting.
///
/// `extra` carries every caller-supplied field beyond the standard set, as
/// JSON values. Serializes flat: extras become top-level keys and the
/// exception is omitted entirely when absent.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub level: String,
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl LogRecord {
    /// Captures an event into a record, stamping the current UTC time.
    ///
    /// Two conventions feed `extra`: fields recorded directly on the event,
    /// and an `extra` field carrying a JSON object whose entries are promoted
    /// to top-level keys. Direct fields win key collisions.
    pub fn from_event(event: &Event<'_>) -> Self {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut extra = visitor.promoted;
        extra.extend(visitor.direct);
        for key in RESERVED_KEYS {
            extra.remove(key);
        }

        let metadata = event.metadata();
        LogRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            level: metadata.level().to_string(),
            name: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            exception: visitor.exception,
            extra,
        }
    }

    /// Renders the record as a single line of JSON. Pure; serde escaping
    /// keeps embedded newlines out of the output.
    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Structured formatter: one JSON object per line.
pub struct JsonFormatter;

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let record = LogRecord::from_event(event);
        let line = record.render_json().map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

/// Plain formatter: `LEVEL - message`, with any extra fields appended as
/// `key=value` pairs and the exception, when present, at the end.
pub struct PlainFormatter;

impl<S, N> FormatEvent<S, N> for PlainFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let record = LogRecord::from_event(event);
        write!(writer, "{} - {}", record.level, record.message)?;
        for (key, value) in &record.extra {
            write!(writer, " {key}={value}")?;
        }
        if let Some(exception) = &record.exception {
            write!(writer, " exception={exception:?}")?;
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    exception: Option<String>,
    direct: BTreeMap<String, serde_json::Value>,
    promoted: BTreeMap<String, serde_json::Value>,
}

impl FieldVisitor {
    fn record_json(&mut self, field: &Field, value: serde_json::Value) {
        self.direct.insert(field.name().to_string(), value);
    }

    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "exception" => self.exception = Some(value),
            "extra" => self.promote_extra(value),
            name => {
                self.direct
                    .insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }

    // The nested-mapping convention: an `extra` field carrying a JSON object
    // has its entries lifted to top-level keys. Anything else stays a plain
    // `extra` field with the value preserved.
    fn promote_extra(&mut self, raw: String) {
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Object(entries)) => self.promoted.extend(entries),
            _ => {
                self.direct
                    .insert("extra".to_string(), serde_json::Value::String(raw));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_json(field, serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_json(field, serde_json::json!(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record_json(field, serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record_json(field, serde_json::json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let rendered = render_error_chain(value);
        match field.name() {
            "exception" | "error" => self.exception = Some(rendered),
            name => {
                self.direct
                    .insert(name.to_string(), serde_json::Value::String(rendered));
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_text(field, format!("{value:?}"));
    }
}

/// Flattens an error and its source chain into one `outer: cause: ...` line.
fn render_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_accepts_names_case_insensitively() {
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_level("Info").unwrap(), Level::INFO);
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert_eq!(parse_level("error").unwrap(), Level::ERROR);
    }

    #[test]
    fn parse_level_accepts_warning_alias() {
        assert_eq!(parse_level("WARNING").unwrap(), Level::WARN);
    }

    #[test]
    fn parse_level_rejects_unknown_names() {
        let err = parse_level("verbose").unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn resolve_log_file_defaults_under_logs_dir() {
        assert_eq!(resolve_log_file(None), PathBuf::from("logs/app.log"));
        assert_eq!(
            resolve_log_file(Some(Path::new("/var/log/svc.log"))),
            PathBuf::from("/var/log/svc.log")
        );
    }

    #[test]
    fn build_filter_pins_noisy_targets_to_warn() {
        let rendered = build_filter(Level::DEBUG).unwrap().to_string();
        assert!(rendered.contains("debug"));
        for target in SUPPRESSED_TARGETS {
            assert!(
                rendered.contains(&format!("{target}=warn")),
                "missing directive for {target}: {rendered}"
            );
        }
    }

    fn sample_record() -> LogRecord {
        LogRecord {
            timestamp: "2026-01-01T00:00:00.000000Z".to_string(),
            level: "INFO".to_string(),
            name: "test_logger".to_string(),
            message: "Test message".to_string(),
            exception: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn render_json_contains_required_fields() {
        let line = sample_record().render_json().unwrap();
        let entry: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(entry["level"], "INFO");
        assert_eq!(entry["name"], "test_logger");
        assert_eq!(entry["message"], "Test message");
        assert!(entry["timestamp"].is_string());
    }

    #[test]
    fn render_json_omits_exception_when_absent() {
        let line = sample_record().render_json().unwrap();
        let entry: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(entry.get("exception").is_none());
    }

    #[test]
    fn render_json_includes_exception_when_present() {
        let mut record = sample_record();
        record.exception = Some("failed to process record: Test exception".to_string());
        let entry: serde_json::Value =
            serde_json::from_str(&record.render_json().unwrap()).unwrap();
        assert!(entry["exception"]
            .as_str()
            .unwrap()
            .contains("Test exception"));
    }

    #[test]
    fn render_json_surfaces_extra_fields_as_top_level_keys() {
        let mut record = sample_record();
        record
            .extra
            .insert("request_id".to_string(), serde_json::json!("123456"));
        record
            .extra
            .insert("attempt".to_string(), serde_json::json!(3));
        let entry: serde_json::Value =
            serde_json::from_str(&record.render_json().unwrap()).unwrap();
        assert_eq!(entry["request_id"], "123456");
        assert_eq!(entry["attempt"], 3);
    }

    #[test]
    fn render_json_stays_on_a_single_line() {
        let mut record = sample_record();
        record.message = "line one\nline two".to_string();
        let line = record.render_json().unwrap();
        assert!(!line.contains('\n'));
    }

    #[derive(Debug)]
    struct RootCause;

    impl fmt::Display for RootCause {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "Test exception")
        }
    }

    impl std::error::Error for RootCause {}

    #[derive(Debug)]
    struct WrapperError(RootCause);

    impl fmt::Display for WrapperError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "failed to process record")
        }
    }

    impl std::error::Error for WrapperError {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn render_error_chain_walks_sources() {
        let rendered = render_error_chain(&WrapperError(RootCause));
        assert_eq!(rendered, "failed to process record: Test exception");
    }
}
