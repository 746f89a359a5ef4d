use serde::{Deserialize, Serialize};

use crate::errors::StreamError;
use crate::messages::SourceRegistry;

/// A scraped source as reported by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

impl SourceRef {
    /// Sources without an explicit `success` flag count as usable.
    pub fn is_usable(&self) -> bool {
        self.success.unwrap_or(true) && !self.url.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Lenient parse of the backend's level names (`WARNING`, `warn`, ...).
    pub fn parse(s: &str) -> LogLevel {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "warn" | "warning" => Self::Warning,
            "error" | "critical" | "fatal" => Self::Error,
            _ => Self::Info,
        }
    }

    pub fn is_user_visible(self) -> bool {
        matches!(self, Self::Warning | Self::Error)
    }
}

/// Where an `Error` event came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    /// An `error` frame sent by the pipeline.
    Pipeline,
    /// Synthesised locally after a transport fault.
    Transport,
}

/// Progress step of the research event bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Start,
    Progress,
    Done,
}

/// Typed inbound event, decoded from one `{type, message, data?}` frame.
///
/// `Ping` never reaches a handler; it exists so the decoder can classify
/// heartbeats.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected {
        message: String,
    },
    Starting {
        message: String,
    },
    StageStart {
        stage: String,
        message: String,
    },
    StageContent {
        stage: String,
        message: String,
        content: String,
        queries: Vec<String>,
        sources: Vec<SourceRef>,
    },
    ScrapeStart {
        phase: u32,
        message: String,
    },
    ScrapeProgress {
        phase: u32,
        done: u32,
        total: u32,
        message: String,
    },
    ScrapeDone {
        phase: u32,
        count: u32,
        total: u32,
        message: String,
    },
    Step {
        state: StepState,
        message: String,
    },
    Status {
        message: String,
    },
    Sources {
        urls: Vec<String>,
        message: String,
    },
    PointComplete {
        point_title: String,
        point_number: u32,
        total_points: u32,
        key_learnings: String,
        dossier_full: Option<String>,
        skipped: bool,
        skip_reason: Option<String>,
    },
    /// Academic pipeline: one titled group of plan points begins.
    SectionStart {
        title: String,
        number: u32,
        total: u32,
        points: Option<u32>,
    },
    /// Academic pipeline: a section's points are researched and synthesized.
    SectionComplete {
        title: String,
        number: u32,
        total: u32,
        synthesis: Option<String>,
        dossier_count: Option<u32>,
        source_count: Option<u32>,
    },
    /// Academic pipeline: the cross-section conclusion starts.
    MetaSynthesisStart {
        message: String,
        section_count: Option<u32>,
        total_sources: Option<u32>,
    },
    SynthesisStart {
        message: String,
        estimated_minutes: Option<u32>,
        dossier_count: Option<u32>,
        total_sources: Option<u32>,
    },
    SessionAssigned {
        session_id: String,
    },
    Log {
        level: LogLevel,
        message: String,
        full: Option<String>,
    },
    Done {
        message: String,
        final_document: Option<String>,
        source_registry: SourceRegistry,
        duration_seconds: Option<f64>,
        total_sources: Option<u32>,
    },
    Error {
        message: String,
        detail: Option<String>,
        origin: ErrorOrigin,
    },
    Ping,
}

impl StreamEvent {
    /// Local stand-in for a transport fault, forwarded before teardown.
    pub fn transport_error(err: &StreamError) -> Self {
        Self::Error {
            message: "Connection to the research backend was lost".into(),
            detail: Some(err.to_string()),
            origin: ErrorOrigin::Transport,
        }
    }

    /// After a terminal event no further frames are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping)
    }

    /// Wire name of the frame kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Starting { .. } => "starting",
            Self::StageStart { .. } => "stage_start",
            Self::StageContent { .. } => "stage_content",
            Self::ScrapeStart { .. } => "scrape_start",
            Self::ScrapeProgress { .. } => "scrape_progress",
            Self::ScrapeDone { .. } => "scrape_done",
            Self::Step { state: StepState::Start, .. } => "step_start",
            Self::Step { state: StepState::Progress, .. } => "step_progress",
            Self::Step { state: StepState::Done, .. } => "step_done",
            Self::Status { .. } => "status",
            Self::Sources { .. } => "sources",
            Self::PointComplete { .. } => "point_complete",
            Self::SectionStart { .. } => "bereich_start",
            Self::SectionComplete { .. } => "bereich_complete",
            Self::MetaSynthesisStart { .. } => "meta_synthesis_start",
            Self::SynthesisStart { .. } => "synthesis_start",
            Self::SessionAssigned { .. } => "session_id",
            Self::Log { .. } => "log",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
            Self::Ping => "ping",
        }
    }
}
