//! Shared primitives for the WebPilot control engine crates.
//!
//! Everything here is plain data: `Clone + Serialize + Deserialize`, no live
//! handles. The checkpoint interface hands these types to external
//! persistence collaborators verbatim, so nothing in this crate may hold a
//! connection, a task handle, or an `Instant`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one protocol session.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Browser-assigned target identifier (the page we attached to).
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub String);

/// Lifecycle of a protocol session.
///
/// `Closed` is terminal: a session never leaves it, and any command issued
/// afterwards fails with `SessionClosed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Navigating,
    Closed,
}

impl SessionState {
    /// Whether commands may be issued in this state.
    pub fn can_send(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Navigating)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Navigating => "navigating",
            SessionState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// Which render-tree root an element was discovered under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRoot {
    /// Ordinary light-DOM content.
    Light,
    /// Content inside a shadow root; `host_backend_id` is the CDP backend
    /// node id of the host element.
    Shadow { host_backend_id: u64 },
}

/// Path from the document root to an element as a sequence of child
/// offsets. Crossing into a shadow root appends the offset within the
/// host's `shadowRoots` list, then continues with ordinary child offsets.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct DomPath(pub Vec<u32>);

impl DomPath {
    pub fn child(&self, offset: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(offset);
        Self(segments)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

/// Bounding box of an element in CSS pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementBounds {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

/// One interaction candidate discovered during extraction.
///
/// The `index` is dense (0..n-1) and valid only for the observation it was
/// extracted under; it is a lookup key, not a persistent handle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InteractiveElement {
    /// Dense index within the owning observation.
    pub index: u32,

    /// Lowercased tag name.
    pub tag: String,

    /// Explicit ARIA role, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// Rendered (flattened) text, not serialized markup. Bounded length.
    pub text: String,

    /// Confirmed visible at extraction time.
    pub visible: bool,

    /// Child-offset path from the document root, crossing shadow roots.
    pub path: DomPath,

    /// Light vs. shadow DOM provenance.
    pub source: SourceRoot,

    /// CDP backend node id (stable across the page's lifetime).
    pub backend_node_id: u64,

    /// CDP node id from the tree the element was extracted from.
    pub node_id: i64,

    /// Layout bounds, when the snapshot reported them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<ElementBounds>,
}

impl InteractiveElement {
    /// Single-line rendering used when listing elements for the decision
    /// policy, e.g. `[3] <button> Add to cart`.
    pub fn describe(&self) -> String {
        let role = self
            .role
            .as_deref()
            .map(|r| format!(" role={r}"))
            .unwrap_or_default();
        format!("[{}] <{}{}> {}", self.index, self.tag, role, self.text)
    }
}

/// Opaque screenshot payload, passed through to vision-capable consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Screenshot {
    /// Image format as reported by the capture command (e.g. "jpeg").
    pub format: String,
    /// Base64-encoded image bytes, exactly as the browser returned them.
    pub data: String,
}

/// One immutable snapshot of browser state offered to the decision policy.
///
/// Superseded, never mutated, by the next extraction. The `generation`
/// stamp ties element indexes to this snapshot: actions referencing an
/// index must echo the generation they read it from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub generation: u64,
    pub step: u32,
    pub url: String,
    pub title: String,
    pub elements: Vec<InteractiveElement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<Screenshot>,
}

impl Observation {
    /// Look up an element by index, enforcing the generation invariant.
    pub fn element(&self, index: u32, generation: u64) -> Option<&InteractiveElement> {
        if generation != self.generation {
            return None;
        }
        self.elements.get(index as usize)
    }

    /// Multi-line element listing for the decision policy.
    pub fn describe_elements(&self) -> String {
        if self.elements.is_empty() {
            return "No interactive elements found".to_string();
        }
        self.elements
            .iter()
            .map(InteractiveElement::describe)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Scroll direction for the scroll primitive.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// A primitive action the decision policy can request.
///
/// Element-addressing actions carry the generation of the observation the
/// index was read from; a mismatch at execution time is a stale-element
/// failure, never a click on the wrong node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate {
        url: String,
    },
    Click {
        index: u32,
        generation: u64,
    },
    InputText {
        index: u32,
        generation: u64,
        text: String,
    },
    SendKeys {
        keys: String,
    },
    Scroll {
        direction: ScrollDirection,
        pages: f64,
    },
    Screenshot,
    Done {
        text: String,
        success: bool,
    },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::InputText { .. } => "input_text",
            Action::SendKeys { .. } => "send_keys",
            Action::Scroll { .. } => "scroll",
            Action::Screenshot => "screenshot",
            Action::Done { .. } => "done",
        }
    }

    /// `done` is the explicit exit point of the control loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Done { .. })
    }
}

/// Classified side effect of one executed action.
///
/// The first four variants come from fingerprint comparison, in strictly
/// decreasing priority; `Completed` is the terminal `done` outcome, and
/// `Failed` carries action-level errors the decision policy can react to
/// on the next cycle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepOutcome {
    Navigated { url: String },
    ModalAppeared,
    ContentChanged,
    NoObservableChange,
    Completed { success: bool },
    Failed { error: String },
}

impl StepOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepOutcome::Failed { .. } | StepOutcome::Completed { success: false }
        )
    }
}

/// Outcome of one executed action. Produced exactly once per action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionResult {
    pub outcome: StepOutcome,
    pub summary: String,
    /// Final observation, attached when the action is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
}

impl ActionResult {
    pub fn new(outcome: StepOutcome, summary: impl Into<String>) -> Self {
        Self {
            outcome,
            summary: summary.into(),
            observation: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            summary: error.clone(),
            outcome: StepOutcome::Failed { error },
            observation: None,
        }
    }

    pub fn completed(text: impl Into<String>, success: bool) -> Self {
        Self {
            outcome: StepOutcome::Completed { success },
            summary: text.into(),
            observation: None,
        }
    }

    pub fn with_observation(mut self, observation: Observation) -> Self {
        self.observation = Some(observation);
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.outcome, StepOutcome::Completed { .. })
    }
}

/// Append-only record of one executed step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryItem {
    /// 1-indexed step number.
    pub step: u32,
    pub action: Action,
    pub outcome: StepOutcome,
    pub summary: String,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryItem {
    pub fn new(step: u32, action: Action, result: &ActionResult) -> Self {
        Self {
            step,
            action,
            outcome: result.outcome.clone(),
            summary: result.summary.clone(),
            recorded_at: Utc::now(),
        }
    }

    /// Compact rendering for policy prompts: one step per block.
    pub fn describe(&self) -> String {
        format!(
            "<step_{}>\nAction: {}\nResult: {}\n</step_{}>",
            self.step,
            self.action.name(),
            self.summary,
            self.step
        )
    }
}
