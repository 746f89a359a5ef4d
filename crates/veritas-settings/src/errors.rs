use std::path::PathBuf;

/// Why a settings file could not be turned into [`VeritasSettings`](crate::VeritasSettings).
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not valid settings JSON: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A value that parsed but cannot be used, e.g. a backend URL without a scheme.
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl SettingsError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Read { .. } => "settings_read",
            Self::Parse { .. } => "settings_parse",
            Self::Invalid { .. } => "settings_invalid",
        }
    }

    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
