//! Decoding raw frames into typed [`StreamEvent`]s.
//!
//! Frames are `{type, message, data?}` objects. Kind-specific fields are read
//! from `data` first and then from the frame's top level, since the ask and
//! research backends place them differently.

use serde_json::{Map, Value};

use veritas_core::events::{ErrorOrigin, LogLevel, SourceRef, StepState};
use veritas_core::{SourceRegistry, StreamEvent};

/// A frame that cannot be turned into an event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotObject,
    #[error("frame has no type")]
    MissingType,
    #[error("unknown frame type {0:?}")]
    UnknownKind(String),
    #[error("{kind} frame is missing {field}")]
    MissingField { kind: &'static str, field: &'static str },
}

impl DecodeError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "invalid_json",
            Self::NotObject => "not_object",
            Self::MissingType => "missing_type",
            Self::UnknownKind(_) => "unknown_kind",
            Self::MissingField { .. } => "missing_field",
        }
    }
}

/// Decode one frame body.
pub fn decode_frame(raw: &str) -> Result<StreamEvent, DecodeError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(top) = value else {
        return Err(DecodeError::NotObject);
    };
    let kind = top
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();
    let frame = Frame::new(&top);
    let message = frame.message();

    let event = match kind.as_str() {
        "ping" => StreamEvent::Ping,
        "connected" => StreamEvent::Connected { message },
        "starting" => StreamEvent::Starting { message },
        "stage_start" => StreamEvent::StageStart {
            stage: frame.required_str("stage_start", "stage")?,
            message,
        },
        "stage_content" => StreamEvent::StageContent {
            stage: frame.required_str("stage_content", "stage")?,
            message,
            content: frame.str("content").unwrap_or_default(),
            queries: frame.strings("queries"),
            sources: frame.sources("sources"),
        },
        "scrape_start" => StreamEvent::ScrapeStart {
            phase: frame.u32("phase").unwrap_or(1),
            message,
        },
        "scrape_progress" => StreamEvent::ScrapeProgress {
            phase: frame.u32("phase").unwrap_or(1),
            done: frame.u32("done").unwrap_or(0),
            total: frame.u32("total").unwrap_or(0),
            message,
        },
        "scrape_done" => StreamEvent::ScrapeDone {
            phase: frame.u32("phase").unwrap_or(1),
            count: frame.u32("count").unwrap_or(0),
            total: frame.u32("total").unwrap_or(0),
            message,
        },
        "step_start" => StreamEvent::Step { state: StepState::Start, message },
        "step_progress" => StreamEvent::Step { state: StepState::Progress, message },
        "step_done" => StreamEvent::Step { state: StepState::Done, message },
        "status" => StreamEvent::Status { message },
        "sources" => StreamEvent::Sources {
            urls: frame.strings("urls"),
            message,
        },
        "point_complete" => StreamEvent::PointComplete {
            point_title: frame.str("point_title").unwrap_or_default(),
            point_number: frame.u32("point_number").unwrap_or(0),
            total_points: frame.u32("total_points").unwrap_or(0),
            key_learnings: frame.str("key_learnings").unwrap_or_default(),
            dossier_full: frame.str("dossier_full"),
            skipped: frame.bool("skipped").unwrap_or(false),
            skip_reason: frame.str("skip_reason"),
        },
        "bereich_start" => StreamEvent::SectionStart {
            title: frame.required_str("bereich_start", "bereich_title")?,
            number: frame.u32("bereich_number").unwrap_or(0),
            total: frame.u32("total_bereiche").unwrap_or(0),
            points: frame.u32("points_in_bereich"),
        },
        "bereich_complete" => StreamEvent::SectionComplete {
            title: frame.required_str("bereich_complete", "bereich_title")?,
            number: frame.u32("bereich_number").unwrap_or(0),
            total: frame.u32("total_bereiche").unwrap_or(0),
            synthesis: frame
                .str("synthese")
                .or_else(|| frame.str("synthese_preview"))
                .filter(|s| !s.trim().is_empty()),
            dossier_count: frame.u32("dossiers_count"),
            source_count: frame.u32("sources_count"),
        },
        "meta_synthesis_start" => StreamEvent::MetaSynthesisStart {
            message,
            section_count: frame.u32("bereiche_count"),
            total_sources: frame.u32("total_sources"),
        },
        "synthesis_start" => StreamEvent::SynthesisStart {
            message,
            estimated_minutes: frame.u32("estimated_minutes"),
            dossier_count: frame.u32("dossier_count"),
            total_sources: frame.u32("total_sources"),
        },
        "session_id" => StreamEvent::SessionAssigned {
            session_id: frame.required_str("session_id", "session_id")?,
        },
        "log" => StreamEvent::Log {
            level: frame.str("level").map_or(LogLevel::Info, |l| LogLevel::parse(&l)),
            message,
            full: frame.str("full"),
        },
        "done" => StreamEvent::Done {
            message,
            final_document: frame.str("final_document"),
            source_registry: frame.registry("source_registry"),
            duration_seconds: frame.f64("duration_seconds").or_else(|| frame.f64("duration")),
            total_sources: frame.u32("total_sources"),
        },
        "error" => StreamEvent::Error {
            message,
            detail: frame.str("error").or_else(|| frame.str("detail")),
            origin: ErrorOrigin::Pipeline,
        },
        _ => return Err(DecodeError::UnknownKind(kind)),
    };
    Ok(event)
}

/// Field lookup over `data` then the top level.
struct Frame<'a> {
    top: &'a Map<String, Value>,
    data: Option<&'a Map<String, Value>>,
}

impl<'a> Frame<'a> {
    fn new(top: &'a Map<String, Value>) -> Self {
        Self {
            top,
            data: top.get("data").and_then(Value::as_object),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.data
            .and_then(|d| d.get(key))
            .filter(|v| !v.is_null())
            .or_else(|| self.top.get(key).filter(|v| !v.is_null()))
    }

    fn message(&self) -> String {
        self.top
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn required_str(&self, kind: &'static str, field: &'static str) -> Result<String, DecodeError> {
        self.str(field)
            .filter(|s| !s.is_empty())
            .ok_or(DecodeError::MissingField { kind, field })
    }

    fn u32(&self, key: &str) -> Option<u32> {
        let n = self.get(key)?;
        n.as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .or_else(|| n.as_str().and_then(|s| s.trim().parse().ok()))
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
    }

    fn f64(&self, key: &str) -> Option<f64> {
        let n = self.get(key)?;
        n.as_f64().or_else(|| n.as_str().and_then(|s| s.trim().parse().ok()))
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    fn strings(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// `{url, content?, success?}` objects; bare URL strings are accepted too.
    fn sources(&self, key: &str) -> Vec<SourceRef> {
        let Some(Value::Array(items)) = self.get(key) else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(url) => Some(SourceRef {
                    url: url.clone(),
                    ..SourceRef::default()
                }),
                Value::Object(_) => serde_json::from_value(item.clone()).ok(),
                _ => None,
            })
            .collect()
    }

    fn registry(&self, key: &str) -> SourceRegistry {
        self.get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}
