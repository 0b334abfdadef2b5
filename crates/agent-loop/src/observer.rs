//! Observation assembly.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use action_executor::ActionExecutor;
use dom_perceiver::{ElementExtractor, ExtractorError};
use webpilot_core_types::Observation;

use crate::config::EngineConfig;
use crate::errors::EngineError;

/// Composes URL, title, extracted elements, and an optional screenshot
/// into one immutable [`Observation`].
pub struct Observer {
    extractor: ElementExtractor,
    executor: Arc<ActionExecutor>,
    vision: bool,
    extract_retries: u32,
    retry_wait: Duration,
}

impl Observer {
    pub fn new(extractor: ElementExtractor, executor: Arc<ActionExecutor>, cfg: &EngineConfig) -> Self {
        Self {
            extractor,
            executor,
            vision: cfg.vision,
            extract_retries: cfg.extract_retries,
            retry_wait: Duration::from_millis(cfg.extract_retry_wait_ms),
        }
    }

    /// Snapshot the page.
    ///
    /// An extraction that races a navigation is retried a bounded number
    /// of times. If it still cannot complete (and the session itself is
    /// healthy), the observation degrades to an empty element list so the
    /// decision policy sees the failure and reacts on the next cycle;
    /// transport failures propagate.
    pub async fn observe(&self, step: u32, generation: u64) -> Result<Observation, EngineError> {
        let mut attempt = 0;
        let elements = loop {
            match self.extractor.extract().await {
                Ok(elements) => break elements,
                Err(err) if err.is_retryable() && attempt < self.extract_retries => {
                    attempt += 1;
                    debug!(
                        target: "agent-loop",
                        attempt,
                        retries = self.extract_retries,
                        "extraction raced a navigation; retrying after a short wait"
                    );
                    sleep(self.retry_wait).await;
                }
                Err(ExtractorError::Session(err)) => return Err(err.into()),
                Err(err) => {
                    warn!(target: "agent-loop", error = %err, "extraction failed; degrading to an empty observation");
                    break Vec::new();
                }
            }
        };

        let info = self.extractor.port().page_info().await?;

        let screenshot = if self.vision {
            match self.executor.capture_screenshot().await {
                Ok(shot) => Some(shot),
                Err(err) => {
                    warn!(target: "agent-loop", error = %err, "screenshot capture failed; observing without vision");
                    None
                }
            }
        } else {
            None
        };

        debug!(
            target: "agent-loop",
            step,
            generation,
            url = %info.url,
            elements = elements.len(),
            "observation assembled"
        );

        Ok(Observation {
            generation,
            step,
            url: info.url,
            title: info.title,
            elements,
            screenshot,
        })
    }
}
