//! The observe → decide → act → record loop.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use action_executor::ActionExecutor;
use cdp_session::CdpCommands;
use dom_perceiver::{ElementExtractor, PerceptionPort, SessionPort};
use webpilot_core_types::{ActionResult, HistoryItem, Observation, StepOutcome};

use crate::checkpoint::SessionSnapshot;
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::history::StepHistory;
use crate::observer::Observer;
use crate::policy::DecisionPolicy;

struct RunState {
    step: u32,
    generation: u64,
    history: StepHistory,
    last_observation: Option<Observation>,
}

/// Drives one session through observe/decide/act/record cycles until the
/// policy declares `done` or the step budget runs out.
pub struct Engine {
    observer: Observer,
    executor: Arc<ActionExecutor>,
    policy: Arc<dyn DecisionPolicy>,
    cfg: EngineConfig,
    task: String,
    state: Mutex<RunState>,
}

impl Engine {
    pub fn new(
        session: Arc<dyn CdpCommands>,
        policy: Arc<dyn DecisionPolicy>,
        task: impl Into<String>,
        cfg: EngineConfig,
    ) -> Self {
        let history = StepHistory::new(cfg.max_steps);
        Self::assemble(session, policy, task.into(), cfg, 0, history)
    }

    /// Rebuild an engine from a checkpoint on a fresh session. History is
    /// informational: nothing recorded in it is replayed, and the
    /// generation counter restarts so every pre-resume element index is
    /// stale by construction.
    pub(crate) fn resume_from(
        session: Arc<dyn CdpCommands>,
        policy: Arc<dyn DecisionPolicy>,
        cfg: EngineConfig,
        snapshot: SessionSnapshot,
    ) -> Self {
        Self::assemble(
            session,
            policy,
            snapshot.task,
            cfg,
            snapshot.step,
            snapshot.history,
        )
    }

    fn assemble(
        session: Arc<dyn CdpCommands>,
        policy: Arc<dyn DecisionPolicy>,
        task: String,
        cfg: EngineConfig,
        step: u32,
        history: StepHistory,
    ) -> Self {
        let port: Arc<dyn PerceptionPort> = Arc::new(SessionPort::new(Arc::clone(&session)));
        let extractor = ElementExtractor::new(port);
        let executor = Arc::new(ActionExecutor::new(session));
        let observer = Observer::new(extractor, Arc::clone(&executor), &cfg);

        Self {
            observer,
            executor,
            policy,
            cfg,
            task,
            state: Mutex::new(RunState {
                step,
                generation: 0,
                history,
                last_observation: None,
            }),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    /// The recorded history so far, as plain data.
    pub async fn history(&self) -> StepHistory {
        self.state.lock().await.history.clone()
    }

    /// Plain-data capture of the run for external persistence. Holds no
    /// live handles; resuming goes through [`SessionSnapshot::resume`].
    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot::capture(
            self.executor.session().state(),
            self.task.clone(),
            state.step,
            state.history.clone(),
        )
    }

    /// Run one observe → decide → act → record cycle.
    ///
    /// Action-level failures are recorded as failed outcomes and returned
    /// as ordinary history items; only transport faults, policy faults,
    /// and budget exhaustion surface as errors.
    pub async fn run_step(&self) -> Result<HistoryItem, EngineError> {
        let mut state = self.state.lock().await;

        if state.history.remaining() == 0 {
            return Err(EngineError::StepBudgetExhausted {
                max_steps: state.history.max_steps(),
            });
        }

        state.step += 1;
        state.generation += 1;
        let (step, generation) = (state.step, state.generation);

        let observation = self.observer.observe(step, generation).await?;

        let action = self
            .policy
            .decide(&observation, &state.history, &self.task)
            .await
            .map_err(EngineError::Policy)?;

        info!(
            target: "agent-loop",
            step,
            max_steps = self.cfg.max_steps,
            action = action.name(),
            "decided next action"
        );

        let mut result = self.executor.execute(&action, Some(&observation)).await?;
        if result.is_terminal() {
            result = result.with_observation(observation.clone());
        }
        if result.outcome.is_failure() {
            warn!(target: "agent-loop", step, summary = %result.summary, "step ended in failure");
        }

        state.last_observation = Some(observation);
        state.history.record(step, action, &result)
    }

    /// Loop until the policy plays `done` or the budget is exhausted.
    /// Returns the terminal result with the final observation attached.
    pub async fn run_until_done(&self) -> Result<ActionResult, EngineError> {
        loop {
            let item = self.run_step().await?;

            if let StepOutcome::Completed { success } = &item.outcome {
                info!(
                    target: "agent-loop",
                    step = item.step,
                    success = *success,
                    "task reached terminal action"
                );
                let last_observation = self.state.lock().await.last_observation.clone();
                let mut result = ActionResult::new(item.outcome, item.summary);
                if let Some(observation) = last_observation {
                    result = result.with_observation(observation);
                }
                return Ok(result);
            }
        }
    }
}
