use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_id: Option<String>,
    pub session_id: Option<String>,
    pub plugin: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub session_id: Option<String>,
    pub plugin: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 span_id TEXT,
                 session_id TEXT,
                 plugin TEXT,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
             CREATE INDEX IF NOT EXISTS idx_logs_plugin ON logs(plugin);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, session_id, plugin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.session_id,
                record.plugin,
            ],
        );
    }

    /// Newest first. Unset filters match everything; `target` matches as a
    /// substring.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, level, target, message, fields, span_id, session_id, plugin
             FROM logs
             WHERE (?1 IS NULL OR level = ?1)
               AND (?2 IS NULL OR instr(target, ?2) > 0)
               AND (?3 IS NULL OR session_id = ?3)
               AND (?4 IS NULL OR plugin = ?4)
               AND (?5 IS NULL OR timestamp >= ?5)
             ORDER BY id DESC
             LIMIT ?6",
        )?;
        let limit = i64::from(q.limit.unwrap_or(DEFAULT_QUERY_LIMIT));
        let rows = stmt.query_map(
            rusqlite::params![q.level, q.target, q.session_id, q.plugin, q.since, limit],
            |row| {
                Ok(LogRecord {
                    id: row.get("id")?,
                    timestamp: row.get("timestamp")?,
                    level: row.get("level")?,
                    target: row.get("target")?,
                    message: row.get("message")?,
                    fields: row.get("fields")?,
                    span_id: row.get("span_id")?,
                    session_id: row.get("session_id")?,
                    plugin: row.get("plugin")?,
                })
            },
        )?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

const DEFAULT_QUERY_LIMIT: u32 = 100;

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    session_id: Option<String>,
    plugin: Option<String>,
}

/// Persists WARN and ERROR events through a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

/// The correlation keys lifted out of the field set into their own columns.
#[derive(Default)]
struct Correlation {
    session_id: Option<String>,
    plugin: Option<String>,
}

impl Correlation {
    fn is_complete(&self) -> bool {
        self.session_id.is_some() && self.plugin.is_some()
    }

    fn fill_from(&mut self, other: &Correlation) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&other.session_id);
        }
        if self.plugin.is_none() {
            self.plugin.clone_from(&other.plugin);
        }
    }
}

#[derive(Default)]
struct Collected {
    message: Option<String>,
    keys: Correlation,
    fields: Map<String, Value>,
}

impl Collected {
    fn put(&mut self, field: &Field, value: Value) {
        let text = || match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match field.name() {
            "message" => self.message = Some(text()),
            "session_id" => self.keys.session_id = Some(text()),
            "plugin" => self.keys.plugin = Some(text()),
            name => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }
}

impl Visit for Collected {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.put(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > tracing::Level::WARN {
            return;
        }

        let mut collected = Collected::default();
        event.record(&mut collected);

        let mut span_id = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                span_id.get_or_insert_with(|| format!("{:?}", span.id()));
                if collected.keys.is_complete() {
                    break;
                }
                if let Some(keys) = span.extensions().get::<Correlation>() {
                    collected.keys.fill_from(keys);
                }
            }
        }

        let fields = (!collected.fields.is_empty())
            .then(|| serde_json::to_string(&collected.fields).ok())
            .flatten();

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: meta.level().as_str().to_string(),
            target: meta.target().to_string(),
            message: collected.message.unwrap_or_default(),
            fields,
            span_id,
            session_id: collected.keys.session_id,
            plugin: collected.keys.plugin,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collected = Collected::default();
        attrs.record(&mut collected);
        if collected.keys.session_id.is_none() && collected.keys.plugin.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collected.keys);
        }
    }
}
