use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{info, instrument};

use veritas_core::{ContextState, SessionId, StreamError};

use crate::transport::{build_client, open_stream, BackendUrl, EventSource, FrameStream};

/// Which research pipeline runs a confirmed plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResearchMode {
    Standard,
    /// Plan grouped into titled sections, each synthesized on its own
    /// before a final meta-synthesis.
    Academic,
}

impl ResearchMode {
    /// Academic when the context carries a non-empty section plan.
    pub fn for_context(ctx: &ContextState) -> Self {
        match ctx.extra.get("academic_bereiche") {
            Some(serde_json::Value::Object(sections)) if !sections.is_empty() => Self::Academic,
            _ => Self::Standard,
        }
    }

    pub fn route(self) -> &'static str {
        match self {
            Self::Standard => "deep",
            Self::Academic => "academic",
        }
    }
}

/// Everything the backend needs to run the pipeline besides the session id.
pub struct DeepResearchRequest {
    pub context_state: ContextState,
    pub api_key: SecretString,
    pub provider: String,
    pub work_model: String,
    pub final_model: String,
    pub language: String,
    pub llm_base_url: String,
}

impl std::fmt::Debug for DeepResearchRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepResearchRequest")
            .field("api_key", &"[REDACTED]")
            .field("provider", &self.provider)
            .field("work_model", &self.work_model)
            .field("final_model", &self.final_model)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct RequestBody<'a> {
    context_state: &'a ContextState,
    session_id: &'a str,
    api_key: &'a str,
    provider: &'a str,
    work_model: &'a str,
    final_model: &'a str,
    language: &'a str,
    base_url: &'a str,
}

/// Starts the research pipeline with `POST {base}/research/{deep|academic}`
/// and yields the progress frames of its response body.
///
/// The response is newline-delimited JSON with no keep-alive, so the idle
/// timeout has to cover the longest silent pipeline step.
pub struct DeepResearchSource {
    client: Client,
    base: BackendUrl,
    request: DeepResearchRequest,
    mode: ResearchMode,
    idle_timeout: Duration,
}

impl DeepResearchSource {
    pub fn new(
        base_url: &str,
        request: DeepResearchRequest,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, StreamError> {
        let mode = ResearchMode::for_context(&request.context_state);
        Ok(Self {
            client: build_client(connect_timeout)?,
            base: BackendUrl::parse(base_url)?,
            request,
            mode,
            idle_timeout,
        })
    }

    pub fn mode(&self) -> ResearchMode {
        self.mode
    }

    pub fn url(&self) -> Url {
        self.base.endpoint(["research", self.mode.route()])
    }
}

#[async_trait]
impl EventSource for DeepResearchSource {
    #[instrument(skip(self), fields(mode = ?self.mode))]
    async fn open(&self, session_id: &SessionId) -> Result<FrameStream, StreamError> {
        let req = &self.request;
        let body = RequestBody {
            context_state: &req.context_state,
            session_id: session_id.as_str(),
            api_key: req.api_key.expose_secret(),
            provider: &req.provider,
            work_model: &req.work_model,
            final_model: &req.final_model,
            language: &req.language,
            base_url: &req.llm_base_url,
        };
        info!(
            points = req.context_state.research_plan.len(),
            model = %req.final_model,
            "starting research pipeline"
        );
        open_stream(self.client.post(self.url()).json(&body), self.idle_timeout).await
    }
}
