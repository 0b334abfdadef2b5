//! Decoder for the `DOMSnapshot.captureSnapshot` payload.
//!
//! The snapshot interleaves three indirections: per-document node arrays,
//! a layout table indexing into them, and a shared string table. This
//! module flattens all of that into a backendNodeId-keyed map of bounds
//! and the computed styles the visibility predicate cares about.

use std::collections::HashMap;

use serde_json::Value;

use webpilot_core_types::ElementBounds;

/// Computed-style order requested by the port; the layout table's style
/// entries are positional against this list.
const STYLE_DISPLAY: usize = 0;
const STYLE_VISIBILITY: usize = 1;
const STYLE_OPACITY: usize = 2;

#[derive(Clone, Debug, Default)]
pub struct LayoutInfo {
    pub bounds: ElementBounds,
    pub display_none: bool,
    pub hidden: bool,
    pub zero_opacity: bool,
}

impl LayoutInfo {
    /// Non-zero rendered size and not styled out of view.
    pub fn is_rendered(&self) -> bool {
        self.bounds.width > 0.0
            && self.bounds.height > 0.0
            && !self.display_none
            && !self.hidden
            && !self.zero_opacity
    }
}

#[derive(Debug, Default)]
pub struct LayoutIndex {
    entries: HashMap<u64, LayoutInfo>,
}

impl LayoutIndex {
    pub fn from_snapshot(snapshot: &Value) -> Self {
        let mut entries = HashMap::new();

        let strings = snapshot
            .get("strings")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if let Some(documents) = snapshot.get("documents").and_then(Value::as_array) {
            for document in documents {
                Self::extract_document(document, &strings, &mut entries);
            }
        }

        Self { entries }
    }

    pub fn get(&self, backend_node_id: u64) -> Option<&LayoutInfo> {
        self.entries.get(&backend_node_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn extract_document(
        document: &Value,
        strings: &[Value],
        entries: &mut HashMap<u64, LayoutInfo>,
    ) {
        let nodes = match document.get("nodes").and_then(Value::as_object) {
            Some(nodes) => nodes,
            None => return,
        };

        let backend_ids: Vec<u64> = nodes
            .get("backendNodeId")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        if backend_ids.is_empty() {
            return;
        }

        let layout = match document.get("layout").and_then(Value::as_object) {
            Some(layout) => layout,
            None => return,
        };
        let node_index = match layout.get("nodeIndex").and_then(Value::as_array) {
            Some(arr) => arr,
            None => return,
        };
        let bounds = layout.get("bounds").and_then(Value::as_array);
        let styles = layout.get("styles").and_then(Value::as_array);

        for (layout_pos, node_idx_value) in node_index.iter().enumerate() {
            let node_idx = match node_idx_value.as_u64().and_then(|v| usize::try_from(v).ok()) {
                Some(idx) => idx,
                None => continue,
            };
            // layout.nodeIndex points into the per-document node arrays,
            // which is where the backend id lives.
            let backend_id = match backend_ids.get(node_idx) {
                Some(id) => *id,
                None => continue,
            };

            let mut info = LayoutInfo::default();

            if let Some(rect) = bounds.and_then(|arr| arr.get(layout_pos)) {
                if let Some(rect) = decode_rect(rect) {
                    info.bounds = rect;
                }
            }

            if let Some(style_entry) = styles.and_then(|arr| arr.get(layout_pos)) {
                apply_styles(style_entry, strings, &mut info);
            }

            entries.insert(backend_id, info);
        }
    }
}

/// A layout rect is four numbers: x, y, width, height.
fn decode_rect(rect: &Value) -> Option<ElementBounds> {
    let values = rect.as_array()?;
    if values.len() < 4 {
        return None;
    }
    Some(ElementBounds {
        x: values[0].as_f64()?,
        y: values[1].as_f64()?,
        width: values[2].as_f64()?,
        height: values[3].as_f64()?,
    })
}

fn apply_styles(style_entry: &Value, strings: &[Value], info: &mut LayoutInfo) {
    let indexes = match style_entry.as_array() {
        Some(arr) => arr,
        None => return,
    };

    if let Some(display) = decode_indexed_string(strings, indexes.get(STYLE_DISPLAY)) {
        info.display_none = display == "none";
    }
    if let Some(visibility) = decode_indexed_string(strings, indexes.get(STYLE_VISIBILITY)) {
        info.hidden = visibility == "hidden" || visibility == "collapse";
    }
    if let Some(opacity) = decode_indexed_string(strings, indexes.get(STYLE_OPACITY)) {
        info.zero_opacity = opacity.parse::<f64>().map(|o| o == 0.0).unwrap_or(false);
    }
}

fn decode_indexed_string(strings: &[Value], value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(num) => {
            let idx = num.as_i64()?;
            if idx < 0 {
                return None;
            }
            strings
                .get(idx as usize)
                .and_then(Value::as_str)
                .map(str::to_string)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn snapshot() -> Value {
        json!({
            "documents": [{
                "nodes": { "backendNodeId": [10, 11, 12] },
                "layout": {
                    "nodeIndex": [0, 1, 2],
                    "bounds": [
                        [0.0, 0.0, 100.0, 20.0],
                        [0.0, 40.0, 0.0, 0.0],
                        [0.0, 80.0, 50.0, 50.0]
                    ],
                    "styles": [
                        [0, 1, 2],
                        [0, 1, 2],
                        [3, 1, 2]
                    ]
                }
            }],
            "strings": ["block", "visible", "1", "none"]
        })
    }

    #[test]
    fn decodes_bounds_and_styles_per_backend_id() {
        let index = LayoutIndex::from_snapshot(&snapshot());
        assert_eq!(index.len(), 3);

        let visible = index.get(10).unwrap();
        assert!(visible.is_rendered());
        assert_eq!(visible.bounds.width, 100.0);

        let zero_sized = index.get(11).unwrap();
        assert!(!zero_sized.is_rendered());

        let display_none = index.get(12).unwrap();
        assert!(display_none.display_none);
        assert!(!display_none.is_rendered());
    }

    #[test]
    fn tolerates_missing_layout_section() {
        let index = LayoutIndex::from_snapshot(&json!({
            "documents": [{ "nodes": { "backendNodeId": [1] } }],
            "strings": []
        }));
        assert!(index.is_empty());
    }

    #[test]
    fn hidden_visibility_defeats_rendered_check() {
        let snapshot = json!({
            "documents": [{
                "nodes": { "backendNodeId": [7] },
                "layout": {
                    "nodeIndex": [0],
                    "bounds": [[0.0, 0.0, 10.0, 10.0]],
                    "styles": [[0, 1, 2]]
                }
            }],
            "strings": ["block", "hidden", "1"]
        });
        let index = LayoutIndex::from_snapshot(&snapshot);
        assert!(index.get(7).unwrap().hidden);
        assert!(!index.get(7).unwrap().is_rendered());
    }
}
