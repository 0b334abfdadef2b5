use serde::{Deserialize, Serialize};

/// Tuning for the observe→decide→act→record loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hard cap on recorded steps; reaching it stops the run with
    /// `StepBudgetExhausted` rather than silently truncating history.
    pub max_steps: u32,

    /// Attach a screenshot to every observation for vision-capable
    /// decision policies.
    pub vision: bool,

    /// How many times an extraction that raced a navigation is retried
    /// before the observation degrades.
    pub extract_retries: u32,

    /// Wait between extraction retries.
    pub extract_retry_wait_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            vision: false,
            extract_retries: 2,
            extract_retry_wait_ms: 250,
        }
    }
}
