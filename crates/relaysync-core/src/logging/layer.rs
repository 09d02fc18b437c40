//! Tracing layer that writes JSONL files, and the subscriber builder.
//!
//! Span fields are carried onto every event inside the span, so a line
//! logged deep inside a session still names its `cycle`, `worker` and
//! `relay`.

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Record};
use tracing::{Event, Id, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::JsonLogEntry;
use super::writer::InstanceLogWriter;

/// A tracing Layer that appends events to an instance's JSONL file
pub struct JsonlLayer {
    writer: Arc<InstanceLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        let writer = InstanceLogWriter::new(logs_dir, instance)?;
        Ok(Self {
            writer: Arc::new(writer),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn instance(&self) -> &str {
        self.writer.instance()
    }
}

/// Fields recorded on a span, kept in the span's extensions
struct SpanFields(Map<String, Value>);

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut visitor = JsonVisitor::new();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanFields(visitor.fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut visitor = JsonVisitor::new();
        values.record(&mut visitor);
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<SpanFields>() {
            Some(fields) => fields.0.extend(visitor.fields),
            None => extensions.insert(SpanFields(visitor.fields)),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let level = metadata.level().as_str().to_lowercase();

        let mut fields = Map::new();
        let mut spans = Vec::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                spans.push(span.name());
                if let Some(recorded) = span.extensions().get::<SpanFields>() {
                    fields.extend(recorded.0.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }

        let mut visitor = JsonVisitor::new();
        event.record(&mut visitor);
        fields.extend(visitor.fields);

        let mut entry = JsonLogEntry::new(
            level,
            self.writer.instance(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !fields.is_empty() {
            entry = entry.with_fields(Value::Object(fields));
        }
        if !spans.is_empty() {
            entry = entry.with_span(spans.join(" > "));
        }

        // A failing log write must never take the engine down.
        let _ = self.writer.write(&entry);
    }
}

/// Collects event or span fields as JSON
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: Map::new(),
        }
    }

    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::Number(value.into()));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Builds and installs the global subscriber
///
/// `RUST_LOG` wins over the default filter when set.
pub struct LoggingBuilder {
    instance: String,
    logs_dir: Option<PathBuf>,
    console_output: bool,
    default_filter: String,
}

impl LoggingBuilder {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            logs_dir: None,
            console_output: true,
            default_filter: "info".to_string(),
        }
    }

    /// Also write JSONL files under `dir`
    pub fn with_logs_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.logs_dir = dir;
        self
    }

    /// Disable console output (only write to JSONL).
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Filter used when `RUST_LOG` is unset, e.g. "relaysync_core=debug"
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    /// Build the JSONL layer alone, if a log directory was given
    pub fn build_layer(&self) -> std::io::Result<Option<JsonlLayer>> {
        self.logs_dir
            .as_ref()
            .map(|dir| JsonlLayer::new(dir, &self.instance))
            .transpose()
    }

    /// Install the subscriber, returning the JSONL file path if any
    pub fn init(self) -> std::io::Result<Option<PathBuf>> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.default_filter));
        let jsonl = self.build_layer()?;
        let path = jsonl.as_ref().map(|l| l.log_path().to_path_buf());
        let console = self.console_output.then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
        });

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(jsonl)
            .try_init()
            .map_err(std::io::Error::other)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_jsonl_layer_captures_events() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");

        let layer = JsonlLayer::new(&logs_dir, "test").unwrap();
        let log_path = layer.log_path().to_path_buf();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Coordinator running");
            tracing::warn!(count = 42, "Window saturated");
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Coordinator running"));
        assert!(lines[0].contains("\"level\":\"info\""));
        assert!(lines[1].contains("\"count\":42"));
    }

    #[test]
    fn test_span_fields_flow_into_events() {
        let temp = TempDir::new().unwrap();
        let logs_dir = temp.path().join("logs");
        let layer = JsonlLayer::new(&logs_dir, "test").unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let cycle = tracing::info_span!("cycle", cycle = "cycle_01");
            let _c = cycle.enter();
            let session = tracing::info_span!("relay_session", relay = "r.example:1", worker = 3u64);
            let _s = session.enter();
            tracing::info!(stored = 7u64, "Session finished");
        });

        let entries = crate::logging::writer::read_all_entries(&logs_dir).unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.span.as_deref(), Some("cycle > relay_session"));
        assert_eq!(entry.field("relay").and_then(Value::as_str), Some("r.example:1"));
        assert_eq!(entry.field("cycle").and_then(Value::as_str), Some("cycle_01"));
        assert_eq!(entry.field("worker").and_then(Value::as_u64), Some(3));
        assert_eq!(entry.field("stored").and_then(Value::as_u64), Some(7));
    }

    #[test]
    fn test_builder_without_dir_has_no_layer() {
        assert!(LoggingBuilder::new("x").build_layer().unwrap().is_none());
        let temp = TempDir::new().unwrap();
        let layer = LoggingBuilder::new("x")
            .with_logs_dir(Some(temp.path().to_path_buf()))
            .build_layer()
            .unwrap();
        assert!(layer.is_some());
    }
}
