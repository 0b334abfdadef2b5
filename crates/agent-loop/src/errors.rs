use thiserror::Error;

use cdp_session::SessionError;
use dom_perceiver::ExtractorError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The configured step budget ran out before the task finished. A
    /// normal, expected termination — distinct from task success or
    /// failure, and from any transport fault.
    #[error("step budget of {max_steps} exhausted")]
    StepBudgetExhausted { max_steps: u32 },

    /// Transport failure; terminates the run.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Extraction failure that could not be absorbed.
    #[error(transparent)]
    Extraction(#[from] ExtractorError),

    /// The decision policy itself failed.
    #[error(transparent)]
    Policy(#[from] anyhow::Error),
}

impl EngineError {
    /// Budget exhaustion is an orderly stop, not a fault.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, EngineError::StepBudgetExhausted { .. })
    }
}
