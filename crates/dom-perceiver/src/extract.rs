//! Interactive-element extraction.
//!
//! Walks the pierced document tree in document order, inlining shadow
//! content at its host's position, and keeps every node that passes both
//! the interactivity and the visibility predicate. Indexes are dense
//! (0..n-1), assigned in traversal order, and mean nothing outside the
//! observation they were extracted for.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use webpilot_core_types::{DomPath, ElementBounds, InteractiveElement, SourceRoot};

use crate::errors::ExtractorError;
use crate::layout::LayoutIndex;
use crate::ports::PerceptionPort;

/// Tags that are interactive on their own.
const INTERACTIVE_TAGS: &[&str] = &["a", "button", "input", "textarea", "select", "option", "summary"];

/// ARIA roles that mark an otherwise-plain element as actionable.
const INTERACTIVE_ROLES: &[&str] = &[
    "button",
    "link",
    "checkbox",
    "radio",
    "textbox",
    "combobox",
    "listbox",
    "option",
    "menuitem",
    "tab",
    "switch",
    "slider",
    "searchbox",
];

/// Attributes that signal a registered interaction handler.
const INTERACTIVE_ATTRIBUTES: &[&str] = &["onclick", "onmousedown", "contenteditable"];

#[derive(Clone, Debug)]
pub struct ExtractLimits {
    /// Hard cap on the returned list; extras are dropped (and logged).
    pub max_elements: usize,
    /// Defensive recursion cap; content deeper than this is skipped.
    pub max_depth: usize,
    /// Per-element rendered-text cap, in characters.
    pub max_text_len: usize,
    /// Elements up to this many viewport heights beyond either edge of the
    /// current scroll window still count as reachable.
    pub viewport_margin: f64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_elements: 100,
            max_depth: 50,
            max_text_len: 80,
            viewport_margin: 1.0,
        }
    }
}

pub struct ElementExtractor {
    port: Arc<dyn PerceptionPort>,
    limits: ExtractLimits,
}

impl ElementExtractor {
    pub fn new(port: Arc<dyn PerceptionPort>) -> Self {
        Self {
            port,
            limits: ExtractLimits::default(),
        }
    }

    pub fn with_limits(port: Arc<dyn PerceptionPort>, limits: ExtractLimits) -> Self {
        Self { port, limits }
    }

    pub fn port(&self) -> Arc<dyn PerceptionPort> {
        Arc::clone(&self.port)
    }

    /// Extract the current page's interactive elements.
    ///
    /// Fails with [`ExtractorError::NavigationRace`] when the page is
    /// mid-navigation rather than returning a partially-populated list.
    pub async fn extract(&self) -> Result<Vec<InteractiveElement>, ExtractorError> {
        if self.port.navigation_in_progress() {
            return Err(ExtractorError::NavigationRace);
        }

        let info = self.port.page_info().await?;
        if info.ready_state == "loading" {
            return Err(ExtractorError::NavigationRace);
        }

        let tree = self.port.document_tree().await?;
        let snapshot = self.port.layout_snapshot().await?;
        let layout = LayoutIndex::from_snapshot(&snapshot);

        let mut walker = Walker {
            layout: &layout,
            window: ViewportWindow::new(info.scroll_y, info.viewport_height, self.limits.viewport_margin),
            limits: &self.limits,
            out: Vec::new(),
            depth_capped: false,
        };
        walker.walk(&tree, DomPath::default(), SourceRoot::Light, 0);

        if walker.depth_capped {
            debug!(target: "dom-perceiver", max_depth = self.limits.max_depth, "walk hit the depth cap; deeper content skipped");
        }

        let mut elements = walker.out;
        if elements.len() > self.limits.max_elements {
            warn!(
                target: "dom-perceiver",
                found = elements.len(),
                cap = self.limits.max_elements,
                "truncating interactive element list"
            );
            elements.truncate(self.limits.max_elements);
        }

        for (index, element) in elements.iter_mut().enumerate() {
            element.index = index as u32;
        }

        debug!(target: "dom-perceiver", count = elements.len(), url = %info.url, "extraction complete");
        Ok(elements)
    }
}

/// Vertical slice of the document considered reachable without further
/// scrolling. An unreported viewport (height 0) disables the range check.
struct ViewportWindow {
    min_y: f64,
    max_y: f64,
    bounded: bool,
}

impl ViewportWindow {
    fn new(scroll_y: f64, viewport_height: f64, margin: f64) -> Self {
        if viewport_height <= 0.0 {
            return Self {
                min_y: 0.0,
                max_y: 0.0,
                bounded: false,
            };
        }
        Self {
            min_y: scroll_y - viewport_height * margin,
            max_y: scroll_y + viewport_height * (1.0 + margin),
            bounded: true,
        }
    }

    fn contains(&self, bounds: &ElementBounds) -> bool {
        if !self.bounded {
            return true;
        }
        bounds.y + bounds.height > self.min_y && bounds.y < self.max_y
    }
}

struct Walker<'a> {
    layout: &'a LayoutIndex,
    window: ViewportWindow,
    limits: &'a ExtractLimits,
    out: Vec<InteractiveElement>,
    depth_capped: bool,
}

impl Walker<'_> {
    fn walk(&mut self, node: &Value, path: DomPath, source: SourceRoot, depth: usize) {
        if depth > self.limits.max_depth {
            self.depth_capped = true;
            return;
        }

        let node_type = node.get("nodeType").and_then(Value::as_i64).unwrap_or(0);
        if node_type == 1 {
            self.consider(node, &path, source);
        }

        // Shadow subtrees are inlined at the host position: the host comes
        // first, then its shadow content, then its light children. Path
        // offsets number shadow roots before light children so the
        // combined ordering stays deterministic for a fixed DOM shape.
        let shadows = node.get("shadowRoots").and_then(Value::as_array);
        let shadow_count = shadows.map(|s| s.len()).unwrap_or(0);

        if let Some(shadows) = shadows {
            let host_backend_id = node
                .get("backendNodeId")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            for (offset, shadow) in shadows.iter().enumerate() {
                self.walk(
                    shadow,
                    path.child(offset as u32),
                    SourceRoot::Shadow { host_backend_id },
                    depth + 1,
                );
            }
        }

        if let Some(children) = node.get("children").and_then(Value::as_array) {
            for (offset, child) in children.iter().enumerate() {
                self.walk(
                    child,
                    path.child((shadow_count + offset) as u32),
                    source,
                    depth + 1,
                );
            }
        }
    }

    fn consider(&mut self, node: &Value, path: &DomPath, source: SourceRoot) {
        let tag = match node.get("localName").and_then(Value::as_str) {
            Some(tag) if !tag.is_empty() => tag.to_ascii_lowercase(),
            _ => return,
        };

        let attributes = parse_attributes(node);
        if !is_interactive(&tag, &attributes) {
            return;
        }

        let backend_node_id = match node.get("backendNodeId").and_then(Value::as_u64) {
            Some(id) => id,
            None => return,
        };

        // Visibility is decided by the layout snapshot: a node without a
        // layout box was never rendered.
        let info = match self.layout.get(backend_node_id) {
            Some(info) => info,
            None => return,
        };
        if !info.is_rendered() || !self.window.contains(&info.bounds) {
            return;
        }

        let mut text = flatten_text(node, self.limits.max_text_len);
        if text.is_empty() {
            text = fallback_label(&tag, &attributes);
        }

        self.out.push(InteractiveElement {
            index: 0, // densely reassigned after the walk
            role: attributes.get("role").cloned(),
            tag,
            text,
            visible: true,
            path: path.clone(),
            source,
            backend_node_id,
            node_id: node.get("nodeId").and_then(Value::as_i64).unwrap_or(0),
            bounds: Some(info.bounds),
        });
    }
}

/// Node attributes arrive as a flat [name, value, name, value, ...] array.
fn parse_attributes(node: &Value) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    if let Some(flat) = node.get("attributes").and_then(Value::as_array) {
        let mut iter = flat.iter();
        while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
            if let (Some(name), Some(value)) = (name.as_str(), value.as_str()) {
                attributes.insert(name.to_ascii_lowercase(), value.to_string());
            }
        }
    }
    attributes
}

fn is_interactive(tag: &str, attributes: &HashMap<String, String>) -> bool {
    if INTERACTIVE_TAGS.contains(&tag) {
        return true;
    }
    if let Some(role) = attributes.get("role") {
        if INTERACTIVE_ROLES.contains(&role.to_ascii_lowercase().as_str()) {
            return true;
        }
    }
    if INTERACTIVE_ATTRIBUTES
        .iter()
        .any(|attr| attributes.contains_key(*attr))
    {
        return true;
    }
    if let Some(tabindex) = attributes.get("tabindex") {
        if tabindex.trim().parse::<i32>().map(|t| t >= 0).unwrap_or(false) {
            return true;
        }
    }
    false
}

/// Rendered text: flattened text-node content, whitespace-collapsed,
/// bounded in length. Markup never leaks into it.
fn flatten_text(node: &Value, max_len: usize) -> String {
    let mut parts = Vec::new();
    collect_text(node, &mut parts);
    let joined = parts.join(" ");
    let collapsed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_len).collect()
}

fn collect_text(node: &Value, parts: &mut Vec<String>) {
    if node.get("nodeType").and_then(Value::as_i64) == Some(3) {
        if let Some(value) = node.get("nodeValue").and_then(Value::as_str) {
            parts.push(value.to_string());
        }
    }
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            collect_text(child, parts);
        }
    }
}

fn fallback_label(tag: &str, attributes: &HashMap<String, String>) -> String {
    for key in ["aria-label", "title", "placeholder", "value", "alt"] {
        if let Some(value) = attributes.get(key) {
            if !value.is_empty() {
                return value.clone();
            }
        }
    }
    format!("{tag} element")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use crate::ports::{PageInfo, PerceptionPort};

    use super::*;

    struct FakePort {
        tree: Value,
        snapshot: Value,
        ready_state: &'static str,
        navigating: bool,
    }

    impl FakePort {
        fn new(tree: Value, snapshot: Value) -> Self {
            Self {
                tree,
                snapshot,
                ready_state: "complete",
                navigating: false,
            }
        }
    }

    #[async_trait]
    impl PerceptionPort for FakePort {
        async fn page_info(&self) -> Result<PageInfo, ExtractorError> {
            Ok(PageInfo {
                url: "https://example.com/".into(),
                title: "Example".into(),
                ready_state: self.ready_state.into(),
                scroll_y: 0.0,
                viewport_height: 800.0,
            })
        }

        async fn document_tree(&self) -> Result<Value, ExtractorError> {
            Ok(self.tree.clone())
        }

        async fn layout_snapshot(&self) -> Result<Value, ExtractorError> {
            Ok(self.snapshot.clone())
        }

        fn navigation_in_progress(&self) -> bool {
            self.navigating
        }
    }

    fn element(
        node_id: i64,
        backend: u64,
        tag: &str,
        attrs: &[(&str, &str)],
        children: Vec<Value>,
    ) -> Value {
        let flat: Vec<Value> = attrs
            .iter()
            .flat_map(|(k, v)| [json!(k), json!(v)])
            .collect();
        json!({
            "nodeId": node_id,
            "backendNodeId": backend,
            "nodeType": 1,
            "localName": tag,
            "attributes": flat,
            "children": children,
        })
    }

    fn text(value: &str) -> Value {
        json!({ "nodeType": 3, "nodeValue": value })
    }

    fn document(children: Vec<Value>) -> Value {
        json!({
            "nodeId": 1,
            "backendNodeId": 1,
            "nodeType": 9,
            "nodeName": "#document",
            "children": children,
        })
    }

    /// Snapshot where every listed backend id is visibly rendered at the
    /// given rect.
    fn visible_snapshot(rects: &[(u64, f64, f64, f64, f64)]) -> Value {
        let backend_ids: Vec<Value> = rects.iter().map(|(id, ..)| json!(id)).collect();
        let node_index: Vec<Value> = (0..rects.len()).map(|i| json!(i)).collect();
        let bounds: Vec<Value> = rects
            .iter()
            .map(|(_, x, y, w, h)| json!([x, y, w, h]))
            .collect();
        let styles: Vec<Value> = rects.iter().map(|_| json!([0, 1, 2])).collect();
        json!({
            "documents": [{
                "nodes": { "backendNodeId": backend_ids },
                "layout": { "nodeIndex": node_index, "bounds": bounds, "styles": styles }
            }],
            "strings": ["block", "visible", "1"]
        })
    }

    fn extractor(port: FakePort) -> ElementExtractor {
        ElementExtractor::new(Arc::new(port))
    }

    #[tokio::test]
    async fn static_page_extracts_deterministically() {
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![
                element(3, 11, "a", &[("href", "/one")], vec![text("First")]),
                element(4, 12, "button", &[], vec![text("Second")]),
                element(5, 13, "input", &[("placeholder", "Search")], vec![]),
            ],
        )]);
        let snapshot = visible_snapshot(&[
            (10, 0.0, 0.0, 800.0, 600.0),
            (11, 0.0, 10.0, 100.0, 20.0),
            (12, 0.0, 40.0, 100.0, 20.0),
            (13, 0.0, 70.0, 100.0, 20.0),
        ]);
        let extractor = extractor(FakePort::new(tree, snapshot));

        let first = extractor.extract().await.unwrap();
        let second = extractor.extract().await.unwrap();

        assert_eq!(first.len(), 3);
        assert_eq!(first.len(), second.len());
        let texts: Vec<&str> = first.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["First", "Second", "Search"]);
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.index, b.index);
        }
        // Dense, in-order index space.
        for (expected, element) in first.iter().enumerate() {
            assert_eq!(element.index, expected as u32);
            assert!(element.visible);
        }
    }

    #[tokio::test]
    async fn hidden_and_unrendered_elements_are_excluded() {
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![
                element(3, 11, "button", &[], vec![text("Visible")]),
                element(4, 12, "button", &[], vec![text("Zero size")]),
                element(5, 13, "button", &[], vec![text("No layout box")]),
            ],
        )]);
        // Backend 12 has a zero-sized rect; backend 13 has no layout entry.
        let snapshot = json!({
            "documents": [{
                "nodes": { "backendNodeId": [10, 11, 12] },
                "layout": {
                    "nodeIndex": [0, 1, 2],
                    "bounds": [[0.0, 0.0, 800.0, 600.0], [0.0, 0.0, 80.0, 20.0], [0.0, 30.0, 0.0, 0.0]],
                    "styles": [[0, 1, 2], [0, 1, 2], [0, 1, 2]]
                }
            }],
            "strings": ["block", "visible", "1"]
        });
        let elements = extractor(FakePort::new(tree, snapshot))
            .extract()
            .await
            .unwrap();

        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text, "Visible");
        assert!(elements[0].bounds.unwrap().width > 0.0);
    }

    #[tokio::test]
    async fn shadow_content_is_indexed_in_host_position() {
        let host = json!({
            "nodeId": 4,
            "backendNodeId": 20,
            "nodeType": 1,
            "localName": "my-widget",
            "attributes": [],
            "children": [],
            "shadowRoots": [{
                "nodeId": 5,
                "backendNodeId": 21,
                "nodeType": 11,
                "nodeName": "#document-fragment",
                "children": [
                    element(6, 22, "button", &[], vec![text("Shadow button")])
                ]
            }]
        });
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![
                element(3, 11, "a", &[("href", "/")], vec![text("Before host")]),
                host,
                element(7, 23, "button", &[], vec![text("After host")]),
            ],
        )]);
        let snapshot = visible_snapshot(&[
            (10, 0.0, 0.0, 800.0, 600.0),
            (11, 0.0, 0.0, 80.0, 20.0),
            (22, 0.0, 30.0, 80.0, 20.0),
            (23, 0.0, 60.0, 80.0, 20.0),
        ]);
        let elements = extractor(FakePort::new(tree, snapshot))
            .extract()
            .await
            .unwrap();

        let texts: Vec<&str> = elements.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Before host", "Shadow button", "After host"]);

        let shadow_button = &elements[1];
        assert_eq!(
            shadow_button.source,
            SourceRoot::Shadow { host_backend_id: 20 }
        );
        assert_eq!(shadow_button.index, 1);
        assert_eq!(elements[0].source, SourceRoot::Light);
    }

    #[tokio::test]
    async fn extraction_refuses_to_race_a_navigation() {
        let tree = document(vec![]);
        let snapshot = visible_snapshot(&[]);

        let mut port = FakePort::new(tree.clone(), snapshot.clone());
        port.ready_state = "loading";
        let err = extractor(port).extract().await.unwrap_err();
        assert!(matches!(err, ExtractorError::NavigationRace));
        assert!(err.is_retryable());

        let mut port = FakePort::new(tree, snapshot);
        port.navigating = true;
        let err = extractor(port).extract().await.unwrap_err();
        assert!(matches!(err, ExtractorError::NavigationRace));
    }

    #[tokio::test]
    async fn depth_cap_skips_deeper_content_without_failing() {
        let deep_button = element(9, 30, "button", &[], vec![text("Too deep")]);
        let mut nested = deep_button;
        for i in 0..6 {
            nested = element(10 + i, 40 + i as u64, "div", &[], vec![nested]);
        }
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![element(3, 11, "button", &[], vec![text("Shallow")]), nested],
        )]);
        let snapshot = visible_snapshot(&[
            (10, 0.0, 0.0, 800.0, 600.0),
            (11, 0.0, 0.0, 80.0, 20.0),
            (30, 0.0, 30.0, 80.0, 20.0),
        ]);

        let limits = ExtractLimits {
            max_depth: 4,
            ..ExtractLimits::default()
        };
        let elements = ElementExtractor::with_limits(
            Arc::new(FakePort::new(tree, snapshot)),
            limits,
        )
        .extract()
        .await
        .unwrap();

        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text, "Shallow");
    }

    #[tokio::test]
    async fn far_offscreen_elements_are_out_of_reach() {
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![
                element(3, 11, "button", &[], vec![text("On screen")]),
                element(4, 12, "button", &[], vec![text("Way below the fold")]),
            ],
        )]);
        // Viewport is 800px with a one-viewport margin; y=5000 is out.
        let snapshot = visible_snapshot(&[
            (10, 0.0, 0.0, 800.0, 6000.0),
            (11, 0.0, 100.0, 80.0, 20.0),
            (12, 0.0, 5000.0, 80.0, 20.0),
        ]);
        let elements = extractor(FakePort::new(tree, snapshot))
            .extract()
            .await
            .unwrap();

        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].text, "On screen");
    }

    #[tokio::test]
    async fn role_and_handler_attributes_make_plain_tags_interactive() {
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![
                element(3, 11, "div", &[("role", "button")], vec![text("Role div")]),
                element(4, 12, "span", &[("onclick", "go()")], vec![text("Handler span")]),
                element(5, 13, "div", &[], vec![text("Plain div")]),
            ],
        )]);
        let snapshot = visible_snapshot(&[
            (10, 0.0, 0.0, 800.0, 600.0),
            (11, 0.0, 0.0, 80.0, 20.0),
            (12, 0.0, 30.0, 80.0, 20.0),
            (13, 0.0, 60.0, 80.0, 20.0),
        ]);
        let elements = extractor(FakePort::new(tree, snapshot))
            .extract()
            .await
            .unwrap();

        let texts: Vec<&str> = elements.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Role div", "Handler span"]);
        assert_eq!(elements[0].role.as_deref(), Some("button"));
    }

    #[tokio::test]
    async fn text_falls_back_to_labelling_attributes() {
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![element(
                3,
                11,
                "input",
                &[("placeholder", "Email address")],
                vec![],
            )],
        )]);
        let snapshot = visible_snapshot(&[
            (10, 0.0, 0.0, 800.0, 600.0),
            (11, 0.0, 0.0, 200.0, 24.0),
        ]);
        let elements = extractor(FakePort::new(tree, snapshot))
            .extract()
            .await
            .unwrap();

        assert_eq!(elements[0].text, "Email address");
        assert_eq!(elements[0].describe(), "[0] <input> Email address");
    }

    #[tokio::test]
    async fn overlapping_elements_are_both_kept() {
        let tree = document(vec![element(
            2,
            10,
            "body",
            &[],
            vec![
                element(3, 11, "button", &[], vec![text("Under")]),
                element(4, 12, "button", &[], vec![text("Over")]),
            ],
        )]);
        // Identical rects: overlap resolution is the caller's problem.
        let snapshot = visible_snapshot(&[
            (10, 0.0, 0.0, 800.0, 600.0),
            (11, 10.0, 10.0, 80.0, 20.0),
            (12, 10.0, 10.0, 80.0, 20.0),
        ]);
        let elements = extractor(FakePort::new(tree, snapshot))
            .extract()
            .await
            .unwrap();
        assert_eq!(elements.len(), 2);
    }
}
