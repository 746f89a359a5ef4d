use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Snapshot of an in-progress clarification/planning exchange.
///
/// Present on a session only once the pipeline has emitted it. Fields the
/// current model does not know are kept in `extra` so a load/save cycle
/// passes the snapshot through unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextState {
    pub user_query: String,
    pub clarification_questions: Vec<String>,
    pub clarification_answers: Vec<String>,
    pub research_plan: Vec<String>,
    pub plan_version: u32,
    pub session_title: String,
    pub current_step: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContextState {
    pub fn for_query(query: impl Into<String>) -> Self {
        Self {
            user_query: query.into(),
            ..Self::default()
        }
    }

    /// Replace the plan and bump the revision counter.
    pub fn set_plan(&mut self, points: Vec<String>) {
        self.research_plan = points;
        self.plan_version += 1;
        tracing::debug!(
            version = self.plan_version,
            points = self.research_plan.len(),
            "research plan set"
        );
    }

    pub fn has_plan(&self) -> bool {
        !self.research_plan.is_empty()
    }

    /// Plan as numbered `(n) point` lines for display.
    pub fn format_plan(&self) -> String {
        self.research_plan
            .iter()
            .enumerate()
            .map(|(i, point)| format!("({}) {point}", i + 1))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
