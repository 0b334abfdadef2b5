use async_trait::async_trait;

use webpilot_core_types::{Action, Observation};

use crate::history::StepHistory;

/// The decision boundary: given what the page looks like and what has
/// happened so far, choose the next action.
///
/// The engine treats implementations as pure functions of their inputs —
/// it never inspects their internals, never retries them, and leaves any
/// working memory to the implementation itself. Element-addressing actions
/// must echo `observation.generation` so stale indexes are rejected
/// instead of acted on.
#[async_trait]
pub trait DecisionPolicy: Send + Sync {
    async fn decide(
        &self,
        observation: &Observation,
        history: &StepHistory,
        task: &str,
    ) -> anyhow::Result<Action>;
}
