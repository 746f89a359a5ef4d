use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::MessageId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One event-derived record in a session's log.
///
/// `payload` carries the `type` discriminant and only the fields that type
/// owns; everything else is absent on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: MessagePayload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MessagePayload {
    Text,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Plan {
        #[serde(default)]
        points: Vec<String>,
        #[serde(default)]
        version: u32,
    },
    Sources {
        #[serde(default)]
        urls: Vec<String>,
    },
    PointSummary {
        #[serde(default)]
        point_title: String,
        #[serde(default)]
        point_number: u32,
        #[serde(default)]
        total_points: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dossier_full: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        skipped: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        skip_reason: Option<String>,
    },
    /// Synthesis of one section of an academic plan.
    SectionSummary {
        #[serde(default)]
        section_title: String,
        #[serde(default)]
        section_number: u32,
        #[serde(default)]
        total_sections: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dossier_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source_count: Option<u32>,
    },
    SynthesisWaiting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        estimated_minutes: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dossier_count: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_sources: Option<u32>,
    },
    StageUpdate {
        #[serde(default)]
        stage: String,
    },
    ScrapeProgress {
        #[serde(default)]
        phase: u32,
        #[serde(default)]
        done: u32,
        #[serde(default)]
        total: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        succeeded: Option<u32>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        finished: bool,
    },
    FinalAnswer {
        #[serde(default, skip_serializing_if = "SourceRegistry::is_empty")]
        source_registry: SourceRegistry,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<f64>,
    },
    Verification {
        #[serde(default)]
        stage: String,
        #[serde(default, skip_serializing_if = "SourceRegistry::is_empty")]
        source_registry: SourceRegistry,
    },
}

impl MessagePayload {
    /// Wire discriminant.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Error { .. } => "error",
            Self::Plan { .. } => "plan",
            Self::Sources { .. } => "sources",
            Self::PointSummary { .. } => "point_summary",
            Self::SectionSummary { .. } => "section_summary",
            Self::SynthesisWaiting { .. } => "synthesis_waiting",
            Self::StageUpdate { .. } => "stage_update",
            Self::ScrapeProgress { .. } => "scrape_progress",
            Self::FinalAnswer { .. } => "final_answer",
            Self::Verification { .. } => "verification",
        }
    }

    /// Known discriminants, used when repairing legacy documents.
    pub const KINDS: [&'static str; 11] = [
        "text",
        "error",
        "plan",
        "sources",
        "point_summary",
        "section_summary",
        "synthesis_waiting",
        "stage_update",
        "scrape_progress",
        "final_answer",
        "verification",
    ];

    /// Whether a tail message of this type may be filled in progressively.
    pub fn accepts(&self, patch: &TailPatch) -> bool {
        matches!(
            (self, patch),
            (
                Self::StageUpdate { .. },
                TailPatch::AppendContent(_) | TailPatch::ReplaceContent(_)
            ) | (
                Self::ScrapeProgress { .. },
                TailPatch::ScrapeCounters { .. } | TailPatch::ScrapeFinished { .. }
            )
        )
    }
}

/// The single sanctioned in-place mutation: filling in the most recent
/// message while its content is still streaming.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TailPatch {
    AppendContent(String),
    ReplaceContent(String),
    ScrapeCounters { done: u32, total: u32 },
    ScrapeFinished { succeeded: u32, total: u32 },
}

impl TailPatch {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppendContent(_) => "append_content",
            Self::ReplaceContent(_) => "replace_content",
            Self::ScrapeCounters { .. } => "scrape_counters",
            Self::ScrapeFinished { .. } => "scrape_finished",
        }
    }
}

/// A citable source: numbered for inline `[n]` references.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// Citation index → source. Keys are 1-based.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SourceRegistry(BTreeMap<u32, SourceEntry>);

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: u32, entry: SourceEntry) {
        self.0.insert(index, entry);
    }

    /// Append after the highest index and return it. When the highest index
    /// is `u32::MAX` the lowest free index from 1 is used instead.
    pub fn push(&mut self, entry: SourceEntry) -> u32 {
        let index = match self.0.keys().next_back() {
            None => 1,
            Some(last) => last.checked_add(1).unwrap_or_else(|| self.first_free()),
        };
        self.0.insert(index, entry);
        index
    }

    fn first_free(&self) -> u32 {
        let mut candidate = 1u32;
        for &key in self.0.keys() {
            if key == candidate {
                candidate = candidate.saturating_add(1);
            } else if key > candidate {
                break;
            }
        }
        candidate
    }

    pub fn get(&self, index: u32) -> Option<&SourceEntry> {
        self.0.get(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &SourceEntry)> {
        self.0.iter().map(|(k, v)| (*k, v))
    }
}

/// Accepts both `{"1": "https://..."}` (what the backend sends) and
/// `{"1": {"url": ..., "snippet": ...}}` (what we persist). Keys that are not
/// integers are skipped.
impl<'de> Deserialize<'de> for SourceRegistry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawEntry {
            Url(String),
            Entry(SourceEntry),
        }

        let raw = BTreeMap::<String, RawEntry>::deserialize(deserializer)?;
        let mut registry = SourceRegistry::new();
        for (key, value) in raw {
            let Ok(index) = key.trim().parse::<u32>() else {
                tracing::debug!(key = %key, "skipping non-numeric source index");
                continue;
            };
            let entry = match value {
                RawEntry::Url(url) => SourceEntry { url, snippet: None },
                RawEntry::Entry(entry) => entry,
            };
            registry.insert(index, entry);
        }
        Ok(registry)
    }
}

// --- Convenience constructors ---

impl Message {
    pub fn new(role: Role, content: impl Into<String>, payload: MessagePayload) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn user_text(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, MessagePayload::Text)
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, MessagePayload::Text)
    }

    pub fn system_text(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, MessagePayload::Text)
    }

    pub fn error(content: impl Into<String>, detail: Option<String>) -> Self {
        Self::new(Role::System, content, MessagePayload::Error { detail })
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Apply a tail patch in place. Callers check [`MessagePayload::accepts`].
    pub(crate) fn apply(&mut self, patch: TailPatch) {
        match (patch, &mut self.payload) {
            (TailPatch::AppendContent(more), _) => self.content.push_str(&more),
            (TailPatch::ReplaceContent(text), _) => self.content = text,
            (
                TailPatch::ScrapeCounters { done: d, total: t },
                MessagePayload::ScrapeProgress { done, total, .. },
            ) => {
                *done = d;
                *total = t;
            }
            (
                TailPatch::ScrapeFinished { succeeded: s, total: t },
                MessagePayload::ScrapeProgress {
                    done,
                    total,
                    succeeded,
                    finished,
                    ..
                },
            ) => {
                *done = t;
                *total = t;
                *succeeded = Some(s);
                *finished = true;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_message_has_no_payload_fields() {
        let msg = Message::user_text("hello");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"], "hello");
        let obj = v.as_object().unwrap();
        assert_eq!(obj.len(), 5, "unexpected keys: {obj:?}");
    }

    #[test]
    fn point_summary_fields_are_camel_case_and_sparse() {
        let msg = Message::new(
            Role::Assistant,
            "key learnings",
            MessagePayload::PointSummary {
                point_title: "History".into(),
                point_number: 2,
                total_points: 5,
                dossier_full: None,
                skipped: false,
                skip_reason: None,
            },
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "point_summary");
        assert_eq!(v["pointTitle"], "History");
        assert_eq!(v["pointNumber"], 2);
        assert!(v.get("skipped").is_none());
        assert!(v.get("dossierFull").is_none());
        assert!(v.get("skipReason").is_none());
    }

    #[test]
    fn section_summary_is_a_known_kind() {
        let payload = MessagePayload::SectionSummary {
            section_title: "Foundations".into(),
            section_number: 1,
            total_sections: 3,
            dossier_count: Some(4),
            source_count: None,
        };
        assert!(MessagePayload::KINDS.contains(&payload.kind()));
        let v = serde_json::to_value(Message::new(Role::Assistant, "synthesis", payload)).unwrap();
        assert_eq!(v["type"], "section_summary");
        assert_eq!(v["sectionTitle"], "Foundations");
        assert_eq!(v["dossierCount"], 4);
        assert!(v.get("sourceCount").is_none());
    }

    #[test]
    fn final_answer_roundtrips_registry() {
        let mut registry = SourceRegistry::new();
        registry.push(SourceEntry { url: "https://a".into(), snippet: Some("a".into()) });
        registry.push(SourceEntry { url: "https://b".into(), snippet: None });
        let msg = Message::new(
            Role::Assistant,
            "answer [1][2]",
            MessagePayload::FinalAnswer {
                source_registry: registry.clone(),
                duration_seconds: Some(12.5),
            },
        );
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
        match parsed.payload {
            MessagePayload::FinalAnswer { source_registry, .. } => {
                assert_eq!(source_registry.get(2).unwrap().url, "https://b");
            }
            other => panic!("expected final answer, got {other:?}"),
        }
    }

    #[test]
    fn registry_accepts_backend_url_map() {
        let registry: SourceRegistry =
            serde_json::from_value(json!({"1": "https://x", "2": {"url": "https://y"}, "n/a": "z"}))
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(1).unwrap().url, "https://x");
        assert_eq!(registry.get(2).unwrap().url, "https://y");
    }

    #[test]
    fn registry_push_continues_after_highest_index() {
        let mut registry = SourceRegistry::new();
        registry.insert(4, SourceEntry { url: "u4".into(), snippet: None });
        assert_eq!(registry.push(SourceEntry { url: "u5".into(), snippet: None }), 5);
    }

    #[test]
    fn registry_push_after_max_index_fills_first_gap() {
        let mut registry = SourceRegistry::new();
        registry.insert(1, SourceEntry { url: "u1".into(), snippet: None });
        registry.insert(2, SourceEntry { url: "u2".into(), snippet: None });
        registry.insert(u32::MAX, SourceEntry { url: "last".into(), snippet: None });
        assert_eq!(registry.push(SourceEntry { url: "u3".into(), snippet: None }), 3);
        assert_eq!(registry.get(u32::MAX).unwrap().url, "last");
        assert_eq!(registry.len(), 4);

        let mut registry: SourceRegistry =
            serde_json::from_str(r#"{"4294967295": "https://x"}"#).unwrap();
        assert_eq!(registry.push(SourceEntry { url: "https://y".into(), snippet: None }), 1);
    }

    #[test]
    fn accepts_table() {
        let stage = MessagePayload::StageUpdate { stage: "C1".into() };
        let scrape = MessagePayload::ScrapeProgress {
            phase: 1,
            done: 0,
            total: 0,
            succeeded: None,
            finished: false,
        };
        let append = TailPatch::AppendContent("x".into());
        let counters = TailPatch::ScrapeCounters { done: 1, total: 2 };
        assert!(stage.accepts(&append));
        assert!(!stage.accepts(&counters));
        assert!(scrape.accepts(&counters));
        assert!(!scrape.accepts(&append));
        assert!(!MessagePayload::Text.accepts(&append));
    }

    #[test]
    fn scrape_finished_fills_counters() {
        let mut msg = Message::new(
            Role::Assistant,
            "scraping",
            MessagePayload::ScrapeProgress {
                phase: 1,
                done: 3,
                total: 10,
                succeeded: None,
                finished: false,
            },
        );
        msg.apply(TailPatch::ScrapeFinished { succeeded: 7, total: 10 });
        assert_eq!(
            msg.payload,
            MessagePayload::ScrapeProgress {
                phase: 1,
                done: 10,
                total: 10,
                succeeded: Some(7),
                finished: true,
            }
        );
    }
}
