//! Plain-data run checkpoints.
//!
//! A snapshot carries everything an external persistence collaborator
//! needs to describe or resume a run — and nothing live: no connection,
//! no tasks, no element indexes worth trusting. Resuming re-establishes a
//! fresh protocol session and replays no actions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cdp_session::CdpCommands;
use webpilot_core_types::SessionState;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::history::StepHistory;
use crate::policy::DecisionPolicy;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Lifecycle state of the session at capture time.
    pub session_state: SessionState,
    pub task: String,
    /// Last completed step number.
    pub step: u32,
    pub history: StepHistory,
    pub captured_at: DateTime<Utc>,
}

impl SessionSnapshot {
    pub(crate) fn capture(
        session_state: SessionState,
        task: String,
        step: u32,
        history: StepHistory,
    ) -> Self {
        Self {
            session_state,
            task,
            step,
            history,
            captured_at: Utc::now(),
        }
    }

    /// Build an engine continuing this run on a fresh session.
    pub fn resume(
        self,
        session: Arc<dyn CdpCommands>,
        policy: Arc<dyn DecisionPolicy>,
        cfg: EngineConfig,
    ) -> Engine {
        Engine::resume_from(session, policy, cfg, self)
    }
}
