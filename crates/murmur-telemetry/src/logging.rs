//! Warn+ incident persistence.
//!
//! Every WARN or ERROR event is written to a SQLite file together with the
//! chat identity (`client_id`, `session_id`, `user_id`) of the connection it
//! happened on. Identity is taken from the event itself first, then from the
//! innermost enclosing span that carries it.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const INCIDENT_SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA busy_timeout = 5000;
    CREATE TABLE IF NOT EXISTS incidents (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        at_ms INTEGER NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        client_id TEXT,
        session_id TEXT,
        user_id TEXT,
        detail TEXT,
        pid INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_incidents_user ON incidents(user_id, at_ms);
";

/// Which connection an incident belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct ChatIdentity {
    client_id: Option<String>,
    session_id: Option<String>,
    user_id: Option<String>,
}

impl ChatIdentity {
    fn is_empty(&self) -> bool {
        self.client_id.is_none() && self.session_id.is_none() && self.user_id.is_none()
    }

    fn is_complete(&self) -> bool {
        self.client_id.is_some() && self.session_id.is_some() && self.user_id.is_some()
    }

    /// Fill whatever is still unknown from `outer`.
    fn inherit(&mut self, outer: &ChatIdentity) {
        for (mine, theirs) in [
            (&mut self.client_id, &outer.client_id),
            (&mut self.session_id, &outer.session_id),
            (&mut self.user_id, &outer.user_id),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }

    /// Overwrite with anything `newer` knows.
    fn update(&mut self, newer: ChatIdentity) {
        if newer.client_id.is_some() {
            self.client_id = newer.client_id;
        }
        if newer.session_id.is_some() {
            self.session_id = newer.session_id;
        }
        if newer.user_id.is_some() {
            self.user_id = newer.user_id;
        }
    }
}

/// Splits recorded fields into message, identity and free-form detail.
#[derive(Default)]
struct Fields {
    message: Option<String>,
    identity: ChatIdentity,
    detail: Map<String, Value>,
}

impl Fields {
    fn put(&mut self, field: &Field, value: Value) {
        let slot = match field.name() {
            "message" => &mut self.message,
            "client_id" => &mut self.identity.client_id,
            "session_id" => &mut self.identity.session_id,
            "user_id" => &mut self.identity.user_id,
            name => {
                self.detail.insert(name.to_string(), value);
                return;
            }
        };
        *slot = Some(match value {
            Value::String(s) => s,
            other => other.to_string(),
        });
    }
}

impl Visit for Fields {
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

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }
}

/// Append-only writer for the `incidents` table.
pub struct IncidentSink {
    conn: Mutex<Connection>,
}

impl IncidentSink {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(INCIDENT_SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn write(&self, level: &tracing::Level, target: &str, fields: Fields) {
        let detail = (!fields.detail.is_empty())
            .then(|| serde_json::to_string(&fields.detail).ok())
            .flatten();
        let conn = self.conn.lock();
        // Write errors are dropped; there is nowhere left to report them.
        let _ = conn.execute(
            "INSERT INTO incidents (at_ms, level, target, message, client_id, session_id, user_id, detail, pid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            rusqlite::params![
                Utc::now().timestamp_millis(),
                level.as_str(),
                target,
                fields.message.unwrap_or_default(),
                fields.identity.client_id,
                fields.identity.session_id,
                fields.identity.user_id,
                detail,
                std::process::id(),
            ],
        );
    }
}

/// `tracing` layer feeding an [`IncidentSink`].
pub struct IncidentLayer {
    sink: Arc<IncidentSink>,
}

impl IncidentLayer {
    pub fn new(sink: Arc<IncidentSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for IncidentLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        attrs.record(&mut fields);
        if fields.identity.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.identity);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        values.record(&mut fields);
        if fields.identity.is_empty() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<ChatIdentity>() {
            Some(known) => known.update(fields.identity),
            None => extensions.insert(fields.identity),
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = event.metadata().level();
        if *level > tracing::Level::WARN {
            return;
        }

        let mut fields = Fields::default();
        event.record(&mut fields);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if fields.identity.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<ChatIdentity>() {
                    fields.identity.inherit(outer);
                }
            }
        }

        self.sink.write(level, event.metadata().target(), fields);
    }
}
