//! CDP-facing port for the extractor.
//!
//! The walk itself is pure code over JSON trees; everything that touches
//! the browser goes through [`PerceptionPort`], so tests (and future
//! alternative backends) can feed the extractor canned payloads.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use cdp_session::CdpCommands;
use webpilot_core_types::SessionState;

use crate::errors::ExtractorError;

/// Page-level facts sampled alongside the DOM.
#[derive(Clone, Debug, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub title: String,
    #[serde(rename = "readyState")]
    pub ready_state: String,
    #[serde(rename = "scrollY", default)]
    pub scroll_y: f64,
    #[serde(rename = "viewportHeight", default)]
    pub viewport_height: f64,
}

#[async_trait]
pub trait PerceptionPort: Send + Sync {
    async fn page_info(&self) -> Result<PageInfo, ExtractorError>;

    /// Full document tree, pierced through shadow roots
    /// (`DOM.getDocument` depth -1, pierce true); returns the root node.
    async fn document_tree(&self) -> Result<Value, ExtractorError>;

    /// Layout snapshot with computed styles and DOM rects
    /// (`DOMSnapshot.captureSnapshot`).
    async fn layout_snapshot(&self) -> Result<Value, ExtractorError>;

    /// Whether the owning session currently has a navigation in flight.
    fn navigation_in_progress(&self) -> bool;
}

/// Production port over a live session.
pub struct SessionPort {
    session: Arc<dyn CdpCommands>,
}

impl SessionPort {
    pub fn new(session: Arc<dyn CdpCommands>) -> Self {
        Self { session }
    }
}

const PAGE_INFO_PROBE: &str = r#"
(function() {
    return {
        url: window.location.href,
        title: document.title,
        readyState: document.readyState,
        scrollY: window.scrollY,
        viewportHeight: window.innerHeight,
    };
})()
"#;

#[async_trait]
impl PerceptionPort for SessionPort {
    async fn page_info(&self) -> Result<PageInfo, ExtractorError> {
        let response = self
            .session
            .command(
                "Runtime.evaluate",
                json!({ "expression": PAGE_INFO_PROBE, "returnByValue": true }),
            )
            .await?;

        let value = response
            .get("result")
            .and_then(|result| result.get("value"))
            .cloned()
            .ok_or_else(|| ExtractorError::Malformed("page probe returned no value".into()))?;

        serde_json::from_value(value)
            .map_err(|err| ExtractorError::Malformed(format!("page probe payload: {err}")))
    }

    async fn document_tree(&self) -> Result<Value, ExtractorError> {
        let response = self
            .session
            .command("DOM.getDocument", json!({ "depth": -1, "pierce": true }))
            .await?;

        response
            .get("root")
            .cloned()
            .ok_or_else(|| ExtractorError::Malformed("DOM.getDocument returned no root".into()))
    }

    async fn layout_snapshot(&self) -> Result<Value, ExtractorError> {
        let response = self
            .session
            .command(
                "DOMSnapshot.captureSnapshot",
                json!({
                    "computedStyles": ["display", "visibility", "opacity"],
                    "includePaintOrder": false,
                    "includeDOMRects": true,
                }),
            )
            .await?;
        Ok(response)
    }

    fn navigation_in_progress(&self) -> bool {
        self.session.state() == SessionState::Navigating
    }
}
