//! Primitive action execution.
//!
//! Every action runs the same small state machine:
//! capture-before → perform → capture-after → classify. A mutex serializes
//! actions against one session; concurrent extraction is the caller's to
//! avoid (extraction is commanded between actions, never raced).
//!
//! Action-level failures (stale index, unreachable URL, non-editable
//! target) come back as failed `ActionResult`s so the decision loop can
//! recover by re-observing. Only transport failures escape as errors.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use cdp_session::{CdpCommands, SessionError};
use webpilot_core_types::{
    Action, ActionResult, InteractiveElement, Observation, Screenshot, ScrollDirection,
    StepOutcome,
};

use crate::errors::{ActionError, ExecResult};
use crate::fingerprint::{classify, PageFingerprint};
use crate::keys;

/// Bounded post-action wait tuning. Every wait here terminates: settle
/// polling stops at `ready_timeout_ms` whether or not the page quieted.
#[derive(Clone, Debug)]
pub struct SettleConfig {
    /// Fixed pause after performing an action, before the first poll.
    pub settle_ms: u64,
    /// Interval between readyState polls.
    pub ready_poll_ms: u64,
    /// Give up settling after this long.
    pub ready_timeout_ms: u64,
    /// Navigation load deadline.
    pub load_timeout_ms: u64,
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            settle_ms: 300,
            ready_poll_ms: 100,
            ready_timeout_ms: 2_000,
            load_timeout_ms: 15_000,
        }
    }
}

enum StepError {
    Action(ActionError),
    Session(SessionError),
}

impl From<ActionError> for StepError {
    fn from(err: ActionError) -> Self {
        StepError::Action(err)
    }
}

impl From<SessionError> for StepError {
    fn from(err: SessionError) -> Self {
        StepError::Session(err)
    }
}

type StepResult<T> = Result<T, StepError>;

/// Capability object binding one session to the action primitives.
///
/// Holds the session reference explicitly (no captured environment) and is
/// handed to the control loop as a value.
pub struct ActionExecutor {
    session: Arc<dyn CdpCommands>,
    perform_lock: Mutex<()>,
    settle: SettleConfig,
}

impl ActionExecutor {
    pub fn new(session: Arc<dyn CdpCommands>) -> Self {
        Self::with_settle(session, SettleConfig::default())
    }

    pub fn with_settle(session: Arc<dyn CdpCommands>, settle: SettleConfig) -> Self {
        Self {
            session,
            perform_lock: Mutex::new(()),
            settle,
        }
    }

    pub fn session(&self) -> Arc<dyn CdpCommands> {
        Arc::clone(&self.session)
    }

    /// Execute one action against the session.
    ///
    /// `observation` is the snapshot the action's element indexes were read
    /// from; element-addressing actions fail as stale without it. At most
    /// one action is in flight per executor at a time.
    pub async fn execute(
        &self,
        action: &Action,
        observation: Option<&Observation>,
    ) -> ExecResult<ActionResult> {
        let _guard = self.perform_lock.lock().await;

        let action_id = Uuid::new_v4();
        let started = Instant::now();
        info!(
            target: "action-executor",
            action_id = %action_id,
            action = action.name(),
            "executing action"
        );

        let result = match action {
            // `done` is the explicit exit point of the loop: always valid,
            // terminal, and it never touches the page.
            Action::Done { text, success } => Ok(ActionResult::completed(text.clone(), *success)),
            Action::Navigate { url } => self.navigate(url).await,
            Action::Click { index, generation } => {
                self.click(*index, *generation, observation).await
            }
            Action::InputText {
                index,
                generation,
                text,
            } => self.input_text(*index, *generation, text, observation).await,
            Action::SendKeys { keys } => self.send_keys(keys).await,
            Action::Scroll { direction, pages } => self.scroll(*direction, *pages).await,
            Action::Screenshot => self.screenshot_action().await,
        };

        match result {
            Ok(result) => {
                info!(
                    target: "action-executor",
                    action_id = %action_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    outcome = ?result.outcome,
                    "action completed"
                );
                Ok(result)
            }
            Err(StepError::Action(err)) => {
                warn!(
                    target: "action-executor",
                    action_id = %action_id,
                    error = %err,
                    "action failed"
                );
                Ok(ActionResult::failed(err.to_string()))
            }
            Err(StepError::Session(err)) => Err(err),
        }
    }

    // -- primitives ---------------------------------------------------------

    async fn navigate(&self, url: &str) -> StepResult<ActionResult> {
        let parsed = Url::parse(url)
            .map_err(|err| ActionError::Navigation(format!("not an absolute url '{url}': {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https" | "file" | "about") {
            return Err(ActionError::Navigation(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            ))
            .into());
        }

        let before = self.capture_fingerprint().await?;

        self.session.mark_navigating();
        let outcome = self.perform_navigation(url).await;
        self.session.mark_ready();
        outcome?;

        let after = self.capture_fingerprint().await?;
        let outcome = classify(&before, &after);
        let summary = format!("Navigated to {}", after.url);
        Ok(ActionResult::new(outcome, summary))
    }

    async fn perform_navigation(&self, url: &str) -> StepResult<()> {
        let response = self
            .session
            .command("Page.navigate", json!({ "url": url }))
            .await?;

        if let Some(error_text) = response
            .get("errorText")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            return Err(ActionError::Navigation(error_text.to_string()).into());
        }

        self.wait_for_load().await
    }

    async fn click(
        &self,
        index: u32,
        generation: u64,
        observation: Option<&Observation>,
    ) -> StepResult<ActionResult> {
        let element = resolve_element(index, generation, observation)?;
        let before = self.capture_fingerprint().await?;

        self.scroll_into_view(element).await?;
        let (x, y) = self.element_center(element).await?;

        for event_type in ["mousePressed", "mouseReleased"] {
            self.session
                .command(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": event_type,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "clickCount": 1,
                    }),
                )
                .await?;
        }

        self.settle().await?;
        let after = self.capture_fingerprint().await?;
        let outcome = classify(&before, &after);
        let summary = match &outcome {
            StepOutcome::Navigated { url } => {
                format!("Clicked element [{index}]; page navigated to {url}")
            }
            StepOutcome::ModalAppeared => {
                format!("Clicked element [{index}]; a modal or popup appeared")
            }
            StepOutcome::ContentChanged => {
                format!("Clicked element [{index}]; page content changed")
            }
            _ => format!("Clicked element [{index}]; no obvious change detected"),
        };
        Ok(ActionResult::new(outcome, summary))
    }

    async fn input_text(
        &self,
        index: u32,
        generation: u64,
        text: &str,
        observation: Option<&Observation>,
    ) -> StepResult<ActionResult> {
        let element = resolve_element(index, generation, observation)?;
        if !accepts_text(element) {
            return Err(ActionError::NotEditable(format!(
                "element [{index}] is <{}>, not a text input",
                element.tag
            ))
            .into());
        }

        let before = self.capture_fingerprint().await?;

        self.session
            .command(
                "DOM.focus",
                json!({ "backendNodeId": element.backend_node_id }),
            )
            .await?;

        // Replace, don't append: select everything first.
        for step in keys::key_sequence("Control+A") {
            self.session
                .command("Input.dispatchKeyEvent", step.params)
                .await?;
        }
        self.session
            .command("Input.insertText", json!({ "text": text }))
            .await?;

        self.settle().await?;
        let after = self.capture_fingerprint().await?;
        let outcome = classify(&before, &after);
        let summary = format!("Typed '{text}' into element [{index}]");
        Ok(ActionResult::new(outcome, summary))
    }

    async fn send_keys(&self, spec: &str) -> StepResult<ActionResult> {
        let before = self.capture_fingerprint().await?;

        for step in keys::key_sequence(spec) {
            self.session
                .command("Input.dispatchKeyEvent", step.params)
                .await?;
        }

        self.settle().await?;
        let after = self.capture_fingerprint().await?;
        let outcome = classify(&before, &after);
        let summary = match &outcome {
            StepOutcome::Navigated { url } => format!("Sent keys '{spec}'; page navigated to {url}"),
            _ => format!("Sent keys '{spec}'"),
        };
        Ok(ActionResult::new(outcome, summary))
    }

    async fn scroll(&self, direction: ScrollDirection, pages: f64) -> StepResult<ActionResult> {
        let before = self.capture_fingerprint().await?;

        let viewport_height = self.viewport_height().await?;
        let mut delta = pages.abs() * viewport_height;
        if direction == ScrollDirection::Up {
            delta = -delta;
        }

        self.session
            .command(
                "Input.dispatchMouseEvent",
                json!({
                    "type": "mouseWheel",
                    "x": 400,
                    "y": 300,
                    "deltaX": 0,
                    "deltaY": delta,
                }),
            )
            .await?;

        self.settle().await?;
        let after = self.capture_fingerprint().await?;
        let outcome = classify(&before, &after);
        let label = match direction {
            ScrollDirection::Down => "down",
            ScrollDirection::Up => "up",
        };
        Ok(ActionResult::new(
            outcome,
            format!("Scrolled {label} {pages} page(s)"),
        ))
    }

    async fn screenshot_action(&self) -> StepResult<ActionResult> {
        let shot = self.capture_screenshot().await?;
        let summary = format!(
            "Captured {} screenshot ({} base64 chars)",
            shot.format,
            shot.data.len()
        );
        Ok(ActionResult::new(StepOutcome::NoObservableChange, summary))
    }

    // -- shared helpers -----------------------------------------------------

    /// Capture a screenshot as the browser hands it over: an opaque
    /// base64 payload.
    pub async fn capture_screenshot(&self) -> Result<Screenshot, SessionError> {
        let response = self
            .session
            .command(
                "Page.captureScreenshot",
                json!({ "format": "jpeg", "quality": 60 }),
            )
            .await?;

        let data = response
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                SessionError::Protocol("captureScreenshot returned no data".to_string())
            })?
            .to_string();

        Ok(Screenshot {
            format: "jpeg".to_string(),
            data,
        })
    }

    /// Screenshot decoded to raw image bytes.
    pub async fn capture_screenshot_bytes(&self) -> Result<Vec<u8>, SessionError> {
        let shot = self.capture_screenshot().await?;
        B64.decode(shot.data.as_bytes())
            .map_err(|err| SessionError::Protocol(format!("screenshot base64: {err}")))
    }

    async fn capture_fingerprint(&self) -> Result<PageFingerprint, SessionError> {
        PageFingerprint::capture(self.session.as_ref()).await
    }

    async fn scroll_into_view(&self, element: &InteractiveElement) -> Result<(), SessionError> {
        let result = self
            .session
            .command(
                "DOM.scrollIntoViewIfNeeded",
                json!({ "backendNodeId": element.backend_node_id }),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // Already-visible or detached nodes answer with a CDP error;
            // the click itself will surface anything real.
            Err(SessionError::Cdp { code, message }) => {
                debug!(target: "action-executor", code, %message, "scrollIntoViewIfNeeded declined");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn element_center(&self, element: &InteractiveElement) -> StepResult<(f64, f64)> {
        let response = self
            .session
            .command(
                "DOM.getBoxModel",
                json!({ "backendNodeId": element.backend_node_id }),
            )
            .await;

        match response {
            Ok(response) => {
                if let Some(center) = quad_center(&response) {
                    return Ok(center);
                }
            }
            Err(SessionError::Cdp { code, message }) => {
                debug!(target: "action-executor", code, %message, "getBoxModel declined; using cached bounds");
            }
            Err(err) => return Err(err.into()),
        }

        element
            .bounds
            .map(|bounds| bounds.center())
            .ok_or_else(|| {
                ActionError::NotInteractable(format!(
                    "element [{}] has no box model and no cached bounds",
                    element.index
                ))
                .into()
            })
    }

    async fn viewport_height(&self) -> Result<f64, SessionError> {
        let response = self
            .session
            .command("Page.getLayoutMetrics", json!({}))
            .await?;
        let height = response
            .get("cssVisualViewport")
            .or_else(|| response.get("visualViewport"))
            .and_then(|viewport| viewport.get("clientHeight"))
            .and_then(Value::as_f64)
            .unwrap_or(800.0);
        Ok(height)
    }

    async fn ready_state(&self) -> Result<Option<String>, SessionError> {
        let response = self
            .session
            .command(
                "Runtime.evaluate",
                json!({ "expression": "document.readyState", "returnByValue": true }),
            )
            .await?;
        Ok(response
            .get("result")
            .and_then(|result| result.get("value"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Wait for a navigation's load to finish. Bounded by
    /// `load_timeout_ms`; timing out is a navigation failure, not a
    /// session failure.
    async fn wait_for_load(&self) -> StepResult<()> {
        let timeout = Duration::from_millis(self.settle.load_timeout_ms);
        let deadline = Instant::now() + timeout;

        loop {
            match self.ready_state().await {
                Ok(Some(state)) if state == "interactive" || state == "complete" => return Ok(()),
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    // Evaluation can fail mid-transition; keep polling.
                    debug!(target: "action-executor", error = %err, "readyState probe failed during load");
                }
            }
            if Instant::now() >= deadline {
                return Err(
                    ActionError::Navigation(format!("page load timed out after {timeout:?}")).into(),
                );
            }
            sleep(Duration::from_millis(self.settle.ready_poll_ms)).await;
        }
    }

    /// Short bounded wait for the page to absorb an action before the
    /// after-fingerprint. Best-effort: it never fails the action and never
    /// polls past `ready_timeout_ms`.
    async fn settle(&self) -> Result<(), SessionError> {
        sleep(Duration::from_millis(self.settle.settle_ms)).await;

        let deadline = Instant::now() + Duration::from_millis(self.settle.ready_timeout_ms);
        loop {
            match self.ready_state().await {
                Ok(Some(state)) if state == "interactive" || state == "complete" => return Ok(()),
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => return Ok(()),
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            sleep(Duration::from_millis(self.settle.ready_poll_ms)).await;
        }
    }
}

fn resolve_element<'a>(
    index: u32,
    generation: u64,
    observation: Option<&'a Observation>,
) -> Result<&'a InteractiveElement, ActionError> {
    let observation =
        observation.ok_or_else(|| ActionError::stale(index, "no observation supplied"))?;

    if generation != observation.generation {
        return Err(ActionError::stale(
            index,
            format!(
                "generation {generation} superseded by {}",
                observation.generation
            ),
        ));
    }

    observation.elements.get(index as usize).ok_or_else(|| {
        ActionError::stale(
            index,
            format!(
                "only {} elements in the current observation",
                observation.elements.len()
            ),
        )
    })
}

fn accepts_text(element: &InteractiveElement) -> bool {
    if matches!(element.tag.as_str(), "input" | "textarea") {
        return true;
    }
    matches!(
        element.role.as_deref(),
        Some("textbox") | Some("searchbox") | Some("combobox")
    )
}

/// Center of a `DOM.getBoxModel` content quad
/// ([x1,y1, x2,y2, x3,y3, x4,y4]).
fn quad_center(response: &Value) -> Option<(f64, f64)> {
    let content = response
        .get("model")
        .and_then(|model| model.get("content"))
        .and_then(Value::as_array)?;
    if content.len() < 8 {
        return None;
    }
    let coords: Vec<f64> = content.iter().filter_map(Value::as_f64).collect();
    if coords.len() < 8 {
        return None;
    }
    let xs: Vec<f64> = coords.iter().step_by(2).copied().collect();
    let ys: Vec<f64> = coords.iter().skip(1).step_by(2).copied().collect();
    let min_x = xs.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_x = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min_y = ys.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_y = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    Some(((min_x + max_x) / 2.0, (min_y + max_y) / 2.0))
}
