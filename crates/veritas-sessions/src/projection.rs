//! Folding stream events into a session: at most one log operation and an
//! optional phase request per event.

use veritas_core::events::{LogLevel, StepState};
use veritas_core::{
    Message, MessagePayload, Role, Session, SessionPhase, SourceEntry, SourceRegistry,
    StreamEvent, TailPatch,
};

const SNIPPET_CHARS: usize = 280;

/// Which pipeline stages carry user-facing results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectionConfig {
    pub answer_stage: String,
    pub verification_stage: String,
    pub title_max_chars: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            answer_stage: "C4".to_string(),
            verification_stage: "C6".to_string(),
            title_max_chars: 50,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogOp {
    Append(Message),
    Patch(TailPatch),
}

/// The effect of one event on one session.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Projection {
    pub log: Option<LogOp>,
    pub phase: Option<SessionPhase>,
}

impl Projection {
    fn append(message: Message) -> Self {
        Self {
            log: Some(LogOp::Append(message)),
            phase: None,
        }
    }

    fn patch(patch: TailPatch) -> Self {
        Self {
            log: Some(LogOp::Patch(patch)),
            phase: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_none() && self.phase.is_none()
    }
}

/// Decide what `event` does to `session`. Pure: the caller applies it.
pub fn project(event: &StreamEvent, session: &Session, config: &ProjectionConfig) -> Projection {
    match event {
        StreamEvent::Connected { .. } | StreamEvent::SessionAssigned { .. } | StreamEvent::Ping => {
            Projection::default()
        }
        StreamEvent::Starting { message } => stage_progress(session, "starting", message),
        StreamEvent::Status { message } => stage_progress(session, "status", message),
        StreamEvent::Step { state, message } => {
            let label = match state {
                StepState::Start | StepState::Progress => "research",
                StepState::Done => "research_done",
            };
            stage_progress(session, label, message)
        }
        StreamEvent::StageStart { stage, message } => {
            let text = if message.is_empty() { stage.as_str() } else { message.as_str() };
            stage_progress(session, stage, text)
        }
        StreamEvent::StageContent {
            stage,
            content,
            sources,
            ..
        } => {
            if *stage == config.answer_stage {
                let mut registry = SourceRegistry::new();
                for source in sources.iter().filter(|s| s.is_usable()) {
                    registry.push(SourceEntry {
                        url: source.url.clone(),
                        snippet: source.content.as_deref().map(snippet),
                    });
                }
                Projection::append(Message::new(
                    Role::Assistant,
                    content.clone(),
                    MessagePayload::FinalAnswer {
                        source_registry: registry,
                        duration_seconds: None,
                    },
                ))
            } else if *stage == config.verification_stage {
                Projection::append(Message::new(
                    Role::Assistant,
                    content.clone(),
                    MessagePayload::Verification {
                        stage: stage.clone(),
                        source_registry: SourceRegistry::new(),
                    },
                ))
            } else if content.is_empty() {
                Projection::default()
            } else {
                stage_progress(session, stage, content)
            }
        }
        StreamEvent::ScrapeStart { phase, message } => Projection::append(Message::new(
            Role::Assistant,
            message.clone(),
            MessagePayload::ScrapeProgress {
                phase: *phase,
                done: 0,
                total: 0,
                succeeded: None,
                finished: false,
            },
        )),
        StreamEvent::ScrapeProgress {
            phase,
            done,
            total,
            message,
        } => {
            if open_scrape(session, *phase) {
                Projection::patch(TailPatch::ScrapeCounters {
                    done: *done,
                    total: *total,
                })
            } else {
                Projection::append(Message::new(
                    Role::Assistant,
                    message.clone(),
                    MessagePayload::ScrapeProgress {
                        phase: *phase,
                        done: *done,
                        total: *total,
                        succeeded: None,
                        finished: false,
                    },
                ))
            }
        }
        StreamEvent::ScrapeDone {
            phase,
            count,
            total,
            message,
        } => {
            if open_scrape(session, *phase) {
                Projection::patch(TailPatch::ScrapeFinished {
                    succeeded: *count,
                    total: *total,
                })
            } else {
                Projection::append(Message::new(
                    Role::Assistant,
                    message.clone(),
                    MessagePayload::ScrapeProgress {
                        phase: *phase,
                        done: *total,
                        total: *total,
                        succeeded: Some(*count),
                        finished: true,
                    },
                ))
            }
        }
        StreamEvent::Sources { urls, message } => {
            let text = if message.is_empty() {
                format!("Found {} sources", urls.len())
            } else {
                message.clone()
            };
            Projection::append(Message::new(
                Role::Assistant,
                text,
                MessagePayload::Sources { urls: urls.clone() },
            ))
        }
        StreamEvent::PointComplete {
            point_title,
            point_number,
            total_points,
            key_learnings,
            dossier_full,
            skipped,
            skip_reason,
        } => Projection::append(Message::new(
            Role::Assistant,
            key_learnings.clone(),
            MessagePayload::PointSummary {
                point_title: point_title.clone(),
                point_number: *point_number,
                total_points: *total_points,
                dossier_full: dossier_full.clone(),
                skipped: *skipped,
                skip_reason: skip_reason.clone(),
            },
        )),
        StreamEvent::SectionStart {
            title,
            number,
            total,
            points,
        } => {
            let text = match points {
                Some(n) => format!("Section {number}/{total}: {title} ({n} points)"),
                None => format!("Section {number}/{total}: {title}"),
            };
            stage_progress(session, "section", &text)
        }
        StreamEvent::SectionComplete {
            title,
            number,
            total,
            synthesis,
            dossier_count,
            source_count,
        } => Projection::append(Message::new(
            Role::Assistant,
            synthesis
                .clone()
                .unwrap_or_else(|| format!("Section {number}/{total} complete: {title}")),
            MessagePayload::SectionSummary {
                section_title: title.clone(),
                section_number: *number,
                total_sections: *total,
                dossier_count: *dossier_count,
                source_count: *source_count,
            },
        )),
        StreamEvent::MetaSynthesisStart {
            message,
            section_count,
            total_sources,
        } => {
            let text = if message.is_empty() {
                format!("Combining {} sections", section_count.unwrap_or(0))
            } else {
                message.clone()
            };
            Projection::append(Message::new(
                Role::Assistant,
                text,
                MessagePayload::SynthesisWaiting {
                    estimated_minutes: None,
                    dossier_count: None,
                    total_sources: *total_sources,
                },
            ))
        }
        StreamEvent::SynthesisStart {
            message,
            estimated_minutes,
            dossier_count,
            total_sources,
        } => Projection::append(Message::new(
            Role::Assistant,
            message.clone(),
            MessagePayload::SynthesisWaiting {
                estimated_minutes: *estimated_minutes,
                dossier_count: *dossier_count,
                total_sources: *total_sources,
            },
        )),
        StreamEvent::Log { level, message, .. } => {
            if level.is_user_visible() {
                let prefix = if *level == LogLevel::Error { "Error" } else { "Warning" };
                Projection::append(Message::system_text(format!("{prefix}: {message}")))
            } else {
                Projection::default()
            }
        }
        StreamEvent::Done {
            message,
            final_document,
            source_registry,
            duration_seconds,
            ..
        } => {
            let message = match final_document {
                Some(document) => Message::new(
                    Role::Assistant,
                    document.clone(),
                    MessagePayload::FinalAnswer {
                        source_registry: source_registry.clone(),
                        duration_seconds: *duration_seconds,
                    },
                ),
                None => Message::system_text(completion_text(message, *duration_seconds)),
            };
            Projection {
                log: Some(LogOp::Append(message)),
                phase: (session.phase == SessionPhase::Researching).then_some(SessionPhase::Done),
            }
        }
        StreamEvent::Error { message, detail, .. } => {
            Projection::append(Message::error(message.clone(), detail.clone()))
        }
    }
}

/// Patch the tail if it is the same in-flight stage, else start a new one.
fn stage_progress(session: &Session, stage: &str, text: &str) -> Projection {
    let same_stage = matches!(
        session.messages.last().map(|m| &m.payload),
        Some(MessagePayload::StageUpdate { stage: tail }) if tail == stage
    );
    if same_stage {
        Projection::patch(TailPatch::ReplaceContent(text.to_string()))
    } else {
        Projection::append(Message::new(
            Role::Assistant,
            text,
            MessagePayload::StageUpdate {
                stage: stage.to_string(),
            },
        ))
    }
}

fn open_scrape(session: &Session, phase: u32) -> bool {
    matches!(
        session.messages.last().map(|m| &m.payload),
        Some(MessagePayload::ScrapeProgress { phase: p, finished: false, .. }) if *p == phase
    )
}

fn completion_text(message: &str, duration_seconds: Option<f64>) -> String {
    let base = if message.is_empty() { "Complete" } else { message };
    match duration_seconds {
        Some(secs) => format!("{base} ({secs:.1}s)"),
        None => base.to_string(),
    }
}

fn snippet(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= SNIPPET_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SNIPPET_CHARS).collect();
    format!("{}…", cut.trim_end())
}
