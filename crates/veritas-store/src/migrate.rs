//! Inference-based migration of persisted session documents.
//!
//! Documents carry no schema version. Every load walks the raw JSON tree,
//! repairs what it can, and drops only what it cannot interpret at all
//! (non-object entries). Migration is total and idempotent: running it over
//! its own output changes nothing.

use std::collections::HashSet;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use veritas_core::session::PLACEHOLDER_TITLE;
use veritas_core::{
    ContextState, Message, MessageId, MessageLog, MessagePayload, Session, SessionId,
    SessionPhase, SessionsState,
};

const CONTEXT_FIELDS: [&str; 7] = [
    "user_query",
    "clarification_questions",
    "clarification_answers",
    "research_plan",
    "plan_version",
    "session_title",
    "current_step",
];

/// What a migration pass had to repair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub sessions: usize,
    pub sessions_dropped: usize,
    pub ids_assigned: usize,
    pub phases_inferred: usize,
    pub messages_repaired: usize,
    pub messages_dropped: usize,
    pub active_repaired: bool,
}

impl MigrationReport {
    pub fn is_clean(&self) -> bool {
        self.sessions_dropped == 0
            && self.ids_assigned == 0
            && self.phases_inferred == 0
            && self.messages_repaired == 0
            && self.messages_dropped == 0
            && !self.active_repaired
    }
}

/// Parse and migrate a raw slot value. Unparsable text yields an empty state.
pub fn migrate_document(raw: &str) -> (SessionsState, MigrationReport) {
    match serde_json::from_str::<Value>(raw) {
        Ok(doc) => migrate(doc),
        Err(err) => {
            warn!(error = %err, "persisted session document is not valid JSON, starting empty");
            (SessionsState::default(), MigrationReport::default())
        }
    }
}

/// Migrate a loosely-typed document into a consistent [`SessionsState`].
pub fn migrate(doc: Value) -> (SessionsState, MigrationReport) {
    let mut report = MigrationReport::default();

    let Value::Object(mut root) = doc else {
        warn!("persisted session document is not an object, starting empty");
        return (SessionsState::default(), report);
    };

    let entries = match root.remove("sessions") {
        Some(Value::Array(entries)) => entries,
        Some(other) => {
            warn!(found = json_kind(&other), "sessions is not an array, starting empty");
            Vec::new()
        }
        None => Vec::new(),
    };

    let mut state = SessionsState::default();
    let mut seen = HashSet::new();
    for entry in entries {
        let Some(session) = migrate_session(entry, &mut report) else {
            report.sessions_dropped += 1;
            continue;
        };
        if !seen.insert(session.id.clone()) {
            warn!(session_id = %session.id, "dropping session with duplicate id");
            report.sessions_dropped += 1;
            continue;
        }
        state.sessions.push(session);
    }
    report.sessions = state.sessions.len();

    state.active_session_id = match root.get("activeSessionId") {
        Some(Value::String(id)) if !id.is_empty() => Some(SessionId::from_raw(id.clone())),
        _ => None,
    };
    report.active_repaired = state.repair_active();

    (state, report)
}

fn migrate_session(entry: Value, report: &mut MigrationReport) -> Option<Session> {
    let Value::Object(mut obj) = entry else {
        warn!(found = json_kind(&entry), "dropping session entry that is not an object");
        return None;
    };

    let id = match obj.remove("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => SessionId::from_raw(id),
        Some(Value::Number(n)) => SessionId::from_raw(n.to_string()),
        _ => {
            report.ids_assigned += 1;
            SessionId::new()
        }
    };

    let title = match obj.remove("title") {
        Some(Value::String(title)) if !title.trim().is_empty() => title,
        _ => PLACEHOLDER_TITLE.to_string(),
    };

    let created = obj.get("createdAt").and_then(parse_timestamp);
    let updated = obj.get("updatedAt").and_then(parse_timestamp);
    let (created_at, updated_at) = match (created, updated) {
        (Some(c), Some(u)) => (c, u.max(c)),
        (Some(c), None) => (c, c),
        (None, Some(u)) => (u, u),
        (None, None) => {
            let now = Utc::now();
            (now, now)
        }
    };

    let context_state = obj.remove("contextState").and_then(migrate_context);

    let messages: Vec<Message> = match obj.remove("messages") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| migrate_message(item, created_at, report))
            .collect(),
        _ => Vec::new(),
    };

    let phase = match obj.get("phase").and_then(Value::as_str).and_then(SessionPhase::parse) {
        Some(phase) => phase,
        None => {
            let inferred = SessionPhase::infer(context_state.as_ref(), messages.len());
            debug!(session_id = %id, phase = %inferred, "inferred missing phase");
            report.phases_inferred += 1;
            inferred
        }
    };

    Some(Session {
        id,
        title,
        created_at,
        updated_at,
        phase,
        context_state,
        messages: MessageLog::from(messages),
    })
}

const CONTEXT_LIST_FIELDS: [&str; 3] = [
    "clarification_questions",
    "clarification_answers",
    "research_plan",
];

/// Keep strings, stringify scalars, drop null and nested values.
fn coerce_string_list(items: Vec<Value>) -> Vec<Value> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(_) => Some(item),
            Value::Number(n) => Some(Value::from(n.to_string())),
            Value::Bool(b) => Some(Value::from(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        })
        .collect()
}

/// Pass the snapshot through, repairing list entries element by element and
/// dropping only known fields of the wrong shape.
fn migrate_context(value: Value) -> Option<ContextState> {
    let Value::Object(mut obj) = value else {
        if !value.is_null() {
            warn!(found = json_kind(&value), "ignoring contextState that is not an object");
        }
        return None;
    };

    match serde_json::from_value(Value::Object(obj.clone())) {
        Ok(ctx) => return Some(ctx),
        Err(err) => warn!(error = %err, "repairing malformed contextState"),
    }

    for key in CONTEXT_LIST_FIELDS {
        if let Some(Value::Array(items)) = obj.get_mut(key) {
            let before = items.len();
            *items = coerce_string_list(std::mem::take(items));
            if items.len() != before {
                debug!(field = key, dropped = before - items.len(), "dropping malformed list entries");
            }
        }
    }

    for key in CONTEXT_FIELDS {
        let Some(field) = obj.get(key) else { continue };
        let mut single = Map::new();
        single.insert(key.to_string(), field.clone());
        if serde_json::from_value::<ContextState>(Value::Object(single)).is_err() {
            debug!(field = key, "dropping malformed contextState field");
            obj.remove(key);
        }
    }
    serde_json::from_value(Value::Object(obj)).ok()
}

fn migrate_message(
    value: Value,
    fallback_ts: DateTime<Utc>,
    report: &mut MigrationReport,
) -> Option<Message> {
    let Value::Object(mut obj) = value else {
        warn!(found = json_kind(&value), "dropping message that is not an object");
        report.messages_dropped += 1;
        return None;
    };
    let mut repaired = false;

    let known_type = matches!(
        obj.get("type"),
        Some(Value::String(t)) if MessagePayload::KINDS.contains(&t.as_str())
    );
    if !known_type {
        if let Some(t) = obj.get("type") {
            debug!(found = %t, "demoting unknown message type to text");
        }
        obj.insert("type".into(), Value::from("text"));
        repaired = true;
    }

    match obj.get("id") {
        Some(Value::String(id)) if !id.is_empty() => {}
        Some(Value::Number(n)) => {
            let id = n.to_string();
            obj.insert("id".into(), Value::from(id));
            repaired = true;
        }
        _ => {
            obj.insert("id".into(), Value::from(MessageId::new().to_string()));
            repaired = true;
        }
    }

    if !matches!(
        obj.get("role").and_then(Value::as_str),
        Some("user" | "assistant" | "system")
    ) {
        obj.insert("role".into(), Value::from("assistant"));
        repaired = true;
    }

    match obj.get("content") {
        Some(Value::String(_)) => {}
        Some(Value::Null) | None => {
            obj.insert("content".into(), Value::from(""));
            repaired = true;
        }
        Some(other) => {
            let text = other.to_string();
            obj.insert("content".into(), Value::from(text));
            repaired = true;
        }
    }

    let rfc3339 = matches!(obj.get("timestamp"), Some(Value::String(s)) if DateTime::parse_from_rfc3339(s).is_ok());
    if !rfc3339 {
        let ts = obj
            .get("timestamp")
            .and_then(parse_timestamp)
            .unwrap_or(fallback_ts);
        obj.insert("timestamp".into(), Value::from(ts.to_rfc3339()));
        repaired = true;
    }

    if repaired {
        report.messages_repaired += 1;
    }

    let candidate = Value::Object(obj.clone());
    match serde_json::from_value::<Message>(candidate) {
        Ok(message) => Some(message),
        Err(err) => {
            // A type-specific field has the wrong shape; keep the text.
            debug!(error = %err, "demoting malformed message to text");
            if !repaired {
                report.messages_repaired += 1;
            }
            obj.insert("type".into(), Value::from("text"));
            match serde_json::from_value::<Message>(Value::Object(obj)) {
                Ok(message) => Some(message),
                Err(err) => {
                    warn!(error = %err, "dropping unreadable message");
                    report.messages_dropped += 1;
                    None
                }
            }
        }
    }
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.trim().parse::<i64>().ok().and_then(from_millis)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_millis),
        _ => None,
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
