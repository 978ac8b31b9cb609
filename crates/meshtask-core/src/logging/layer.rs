//! tracing Layer that mirrors every event into the peer's JSONL file

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::JsonLogEntry;
use super::writer::PeerLogWriter;
use crate::error::{MeshError, MeshResult};

pub struct JsonlLayer {
    writer: Arc<PeerLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, peer: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(PeerLogWriter::new(logs_dir, peer)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn peer(&self) -> &str {
        self.writer.peer()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = JsonLogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.peer(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // Logging must never take the peer down.
        let _ = self.writer.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl JsonVisitor {
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
        if let Some(n) = Number::from_f64(value) {
            self.insert(field, Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, Value::String(value.to_string()));
    }
}

/// Installs the global subscriber: env filter, console output and the
/// peer's JSONL file
pub struct LoggingBuilder {
    logs_dir: PathBuf,
    peer: String,
    console_output: bool,
    env_filter: Option<String>,
}

impl LoggingBuilder {
    pub fn new(logs_dir: impl Into<PathBuf>, peer: impl Into<String>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            peer: peer.into(),
            console_output: true,
            env_filter: None,
        }
    }

    /// Write only to the JSONL file
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Filter directives, e.g. "meshtask_core=debug". `RUST_LOG` wins when set.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    pub fn build_layer(&self) -> std::io::Result<JsonlLayer> {
        JsonlLayer::new(&self.logs_dir, &self.peer)
    }

    /// Install as the global default subscriber, returning the log file path
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Io` if the log file cannot be opened and
    /// `MeshError::Config` if a global subscriber is already installed.
    pub fn init(self) -> MeshResult<PathBuf> {
        let jsonl = self.build_layer()?;
        let path = jsonl.log_path().to_path_buf();

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(self.env_filter.as_deref().unwrap_or("info"))
        });
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_target(false));

        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .with(jsonl)
            .try_init()
            .map_err(|e| MeshError::Config(e.to_string()))?;
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
        let layer = JsonlLayer::new(temp.path(), "peer-k3x").unwrap();
        let log_path = layer.log_path().to_path_buf();

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Link open");
            tracing::warn!(peer = "peer-b", attempt = 2u64, "Link closed");
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        let entries: Vec<JsonLogEntry> = content
            .lines()
            .map(|l| JsonLogEntry::from_json_line(l).unwrap())
            .collect();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].msg, "Link open");
        assert_eq!(entries[0].peer, "peer-k3x");
        assert_eq!(entries[1].level, "warn");
        assert_eq!(entries[1].field_str("peer"), Some("peer-b"));
    }

    #[test]
    fn test_span_names_recorded() {
        let temp = TempDir::new().unwrap();
        let layer = JsonlLayer::new(temp.path(), "p").unwrap();
        let log_path = layer.log_path().to_path_buf();

        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            let _outer = tracing::info_span!("node").entered();
            let _inner = tracing::info_span!("link").entered();
            tracing::debug!("Frame");
        });

        let content = std::fs::read_to_string(&log_path).unwrap();
        let entry = JsonLogEntry::from_json_line(content.lines().next().unwrap()).unwrap();
        assert_eq!(entry.span.as_deref(), Some("node > link"));
    }
}
