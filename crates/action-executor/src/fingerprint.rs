//! Page fingerprints and effect classification.
//!
//! A fingerprint is a lightweight summary of page state — URL, overlay
//! count, a hash and length of the rendered body text, and a count of
//! interaction candidates — captured immediately before and after each
//! action. Comparing the two infers what the action did in an environment
//! with no synchronous "action completed" signal.

use serde::Deserialize;
use serde_json::{json, Value};

use cdp_session::{CdpCommands, SessionError};
use webpilot_core_types::StepOutcome;

/// Body-text length delta below this is treated as churn, not change.
pub const NOISE_BODY_LEN_DELTA: u64 = 64;

/// Candidate-element count delta at or above this corroborates a content
/// change on its own.
pub const NOISE_ELEMENT_COUNT_DELTA: u32 = 2;

/// In-page probe. The hash is FNV-1a over the body's rendered text,
/// truncated to 32 bits, so before/after comparison is exact and cheap;
/// the modal count uses the overlay selectors the page ecosystem actually
/// uses for dialogs.
const FINGERPRINT_PROBE: &str = r#"
(function() {
    const overlaySelector = '[role="dialog"], dialog[open], .modal, [class*="modal"], [class*="popup"], [class*="overlay"]';
    const candidateSelector = 'a, button, input, textarea, select, [role], [onclick]';
    const text = document.body ? document.body.innerText : '';
    let hash = 0x811c9dc5;
    for (let i = 0; i < text.length; i++) {
        hash ^= text.charCodeAt(i);
        hash = Math.imul(hash, 0x01000193) >>> 0;
    }
    return {
        url: window.location.href,
        modalCount: document.querySelectorAll(overlaySelector).length,
        bodyHash: hash,
        bodyLen: text.length,
        elementCount: document.querySelectorAll(candidateSelector).length,
    };
})()
"#;

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageFingerprint {
    pub url: String,
    pub modal_count: u32,
    pub body_hash: u64,
    pub body_len: u64,
    pub element_count: u32,
}

impl PageFingerprint {
    /// Capture the current fingerprint over the session.
    pub async fn capture(session: &dyn CdpCommands) -> Result<Self, SessionError> {
        let response = session
            .command(
                "Runtime.evaluate",
                json!({ "expression": FINGERPRINT_PROBE, "returnByValue": true }),
            )
            .await?;

        let value = response
            .get("result")
            .and_then(|result| result.get("value"))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}

/// Classify the effect of an action from its before/after fingerprints.
///
/// Total and deterministic, with a strict priority order: navigation is
/// the strongest, least ambiguous signal and must not be masked by the
/// DOM churn that accompanies page loads; a new overlay outranks content
/// movement underneath it.
pub fn classify(before: &PageFingerprint, after: &PageFingerprint) -> StepOutcome {
    if after.url != before.url {
        return StepOutcome::Navigated {
            url: after.url.clone(),
        };
    }

    if after.modal_count > before.modal_count {
        return StepOutcome::ModalAppeared;
    }

    if after.body_hash != before.body_hash {
        let len_delta = after.body_len.abs_diff(before.body_len);
        let count_delta = after.element_count.abs_diff(before.element_count);
        if len_delta >= NOISE_BODY_LEN_DELTA || count_delta >= NOISE_ELEMENT_COUNT_DELTA {
            return StepOutcome::ContentChanged;
        }
    }

    StepOutcome::NoObservableChange
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(url: &str, modals: u32, hash: u64, len: u64, count: u32) -> PageFingerprint {
        PageFingerprint {
            url: url.into(),
            modal_count: modals,
            body_hash: hash,
            body_len: len,
            element_count: count,
        }
    }

    #[test]
    fn url_change_wins_over_everything() {
        let before = fp("https://a.example/", 0, 1, 100, 10);
        let after = fp("https://b.example/", 3, 999, 5000, 90);
        assert_eq!(
            classify(&before, &after),
            StepOutcome::Navigated {
                url: "https://b.example/".into()
            }
        );
    }

    #[test]
    fn modal_beats_content_change() {
        // URL unchanged, modal count +1, hash unchanged: must be
        // ModalAppeared, never ContentChanged.
        let before = fp("https://a.example/", 0, 42, 100, 10);
        let after = fp("https://a.example/", 1, 42, 100, 10);
        assert_eq!(classify(&before, &after), StepOutcome::ModalAppeared);

        // Even when the hash changed underneath the new overlay.
        let after = fp("https://a.example/", 1, 43, 400, 20);
        assert_eq!(classify(&before, &after), StepOutcome::ModalAppeared);
    }

    #[test]
    fn modal_disappearing_is_not_modal_appeared() {
        let before = fp("https://a.example/", 2, 42, 100, 10);
        let after = fp("https://a.example/", 1, 42, 100, 10);
        assert_eq!(classify(&before, &after), StepOutcome::NoObservableChange);
    }

    #[test]
    fn hash_change_beyond_noise_is_content_change() {
        let before = fp("https://a.example/", 0, 42, 100, 10);

        let after = fp("https://a.example/", 0, 99, 100 + NOISE_BODY_LEN_DELTA, 10);
        assert_eq!(classify(&before, &after), StepOutcome::ContentChanged);

        let after = fp(
            "https://a.example/",
            0,
            99,
            100,
            10 + NOISE_ELEMENT_COUNT_DELTA,
        );
        assert_eq!(classify(&before, &after), StepOutcome::ContentChanged);
    }

    #[test]
    fn hash_churn_below_noise_is_no_change() {
        let before = fp("https://a.example/", 0, 42, 100, 10);
        let after = fp("https://a.example/", 0, 43, 101, 10);
        assert_eq!(classify(&before, &after), StepOutcome::NoObservableChange);
    }

    #[test]
    fn identical_fingerprints_are_no_change() {
        let fp_value = fp("https://a.example/", 1, 42, 100, 10);
        assert_eq!(
            classify(&fp_value, &fp_value.clone()),
            StepOutcome::NoObservableChange
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let before = fp("https://a.example/", 0, 1, 500, 30);
        let after = fp("https://a.example/", 0, 2, 700, 45);
        let first = classify(&before, &after);
        for _ in 0..10 {
            assert_eq!(classify(&before, &after), first);
        }
    }

    #[test]
    fn probe_payload_deserializes() {
        let value = serde_json::json!({
            "url": "https://a.example/",
            "modalCount": 2,
            "bodyHash": 12345,
            "bodyLen": 678,
            "elementCount": 40
        });
        let fingerprint: PageFingerprint = serde_json::from_value(value).unwrap();
        assert_eq!(fingerprint.modal_count, 2);
        assert_eq!(fingerprint.body_hash, 12345);
    }
}
