//! Settings type definitions.
//!
//! Every section is `#[serde(default)]` so partial JSON works: missing fields
//! keep their compiled default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VeritasSettings {
    pub backend: BackendSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
    pub projection: ProjectionSettings,
    pub research: ResearchSettings,
}

/// Where the pipeline server lives and how patient we are with it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    pub base_url: String,
    pub connect_timeout_secs: u64,
    /// The backend sends a heartbeat every 30s; this allows three misses.
    pub idle_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8420".to_string(),
            connect_timeout_secs: 30,
            idle_timeout_secs: 90,
        }
    }
}

impl BackendSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    pub db_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: veritas_home().join("database").join("sessions.db"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// How stream events are folded into session logs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectionSettings {
    /// Stage whose content is the answer shown to the user.
    pub answer_stage: String,
    /// Stage whose content is the verification report.
    pub verification_stage: String,
    pub title_max_chars: usize,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        Self {
            answer_stage: "C4".to_string(),
            verification_stage: "C6".to_string(),
            title_max_chars: 50,
        }
    }
}

/// Model choices forwarded in deep-research requests. The API key itself is
/// never stored here; it comes from `VERITAS_API_KEY`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResearchSettings {
    pub provider: String,
    /// Model for per-point work (search strategy, URL picking, dossiers).
    pub work_model: String,
    /// Model for the final synthesis.
    pub final_model: String,
    pub language: String,
    pub llm_base_url: String,
    /// The pipeline stream has no heartbeat; one point can take minutes.
    pub idle_timeout_secs: u64,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            provider: "openrouter".to_string(),
            work_model: "google/gemini-2.5-flash-lite-preview-09-2025".to_string(),
            final_model: "qwen/qwen3-vl-235b-a22b-instruct".to_string(),
            language: "de".to_string(),
            llm_base_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            idle_timeout_secs: 600,
        }
    }
}

impl ResearchSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// `~/.veritas`, or `/tmp/.veritas` when HOME is unset.
pub fn veritas_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".veritas")
}
