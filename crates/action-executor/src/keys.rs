//! Key-event synthesis for `Input.dispatchKeyEvent`.
//!
//! Accepts human-friendly key names ("enter", "Escape", "Control+A") and
//! turns them into the down/up event sequences the protocol expects,
//! including the modifier bitmask and Windows virtual key codes that real
//! pages key their handlers off.

use serde_json::{json, Value};

/// CDP modifier bitmask values.
const MOD_ALT: u32 = 1;
const MOD_CTRL: u32 = 2;
const MOD_META: u32 = 4;
const MOD_SHIFT: u32 = 8;

/// Normalize a key alias to its CDP name.
pub fn normalize_key(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "enter" => "Enter",
        "tab" => "Tab",
        "escape" | "esc" => "Escape",
        "ctrl" | "control" => "Control",
        "alt" => "Alt",
        "shift" => "Shift",
        "meta" | "cmd" | "command" => "Meta",
        "space" => " ",
        "backspace" => "Backspace",
        "delete" | "del" => "Delete",
        "arrowup" | "up" => "ArrowUp",
        "arrowdown" | "down" => "ArrowDown",
        "arrowleft" | "left" => "ArrowLeft",
        "arrowright" | "right" => "ArrowRight",
        "pageup" => "PageUp",
        "pagedown" => "PageDown",
        "home" => "Home",
        "end" => "End",
        _ => return raw.to_string(),
    }
    .to_string()
}

fn modifier_bit(key: &str) -> Option<u32> {
    match key {
        "Alt" => Some(MOD_ALT),
        "Control" => Some(MOD_CTRL),
        "Meta" => Some(MOD_META),
        "Shift" => Some(MOD_SHIFT),
        _ => None,
    }
}

fn virtual_key_code(key: &str) -> Option<u32> {
    let code = match key {
        "Enter" => 13,
        "Tab" => 9,
        "Escape" => 27,
        "Backspace" => 8,
        "Delete" => 46,
        " " => 32,
        "ArrowUp" => 38,
        "ArrowDown" => 40,
        "ArrowLeft" => 37,
        "ArrowRight" => 39,
        "PageUp" => 33,
        "PageDown" => 34,
        "Home" => 36,
        "End" => 35,
        "Control" => 17,
        "Alt" => 18,
        "Shift" => 16,
        "Meta" => 91,
        _ => return None,
    };
    Some(code)
}

/// Parameters for one `Input.dispatchKeyEvent` call.
pub fn key_event_params(event_type: &str, key: &str, modifiers: u32) -> Value {
    let mut params = json!({ "type": event_type, "key": key });

    if let Some(code) = virtual_key_code(key) {
        params["code"] = json!(named_code(key));
        params["windowsVirtualKeyCode"] = json!(code);
        params["nativeVirtualKeyCode"] = json!(code);
    } else {
        // Printable character.
        let code = if key.chars().count() == 1 {
            format!("Key{}", key.to_ascii_uppercase())
        } else {
            key.to_string()
        };
        params["code"] = json!(code);
        params["text"] = json!(key);
        params["unmodifiedText"] = json!(key);
        if let Some(ch) = key.chars().next() {
            if key.chars().count() == 1 && ch.is_ascii() {
                let vk = ch.to_ascii_uppercase() as u32;
                params["windowsVirtualKeyCode"] = json!(vk);
            }
        }
    }

    if modifiers != 0 {
        params["modifiers"] = json!(modifiers);
    }

    params
}

fn named_code(key: &str) -> String {
    match key {
        " " => "Space".to_string(),
        "Control" => "ControlLeft".to_string(),
        "Alt" => "AltLeft".to_string(),
        "Shift" => "ShiftLeft".to_string(),
        "Meta" => "MetaLeft".to_string(),
        other => other.to_string(),
    }
}

/// One step of a key sequence: event type plus full parameter payload.
#[derive(Clone, Debug)]
pub struct KeyStep {
    pub params: Value,
}

/// Expand a key spec ("Enter", "Control+A", "shift+Tab") into the ordered
/// `Input.dispatchKeyEvent` payloads to dispatch: modifiers press down
/// first, the main key cycles with the combined bitmask, modifiers release
/// in reverse order.
pub fn key_sequence(spec: &str) -> Vec<KeyStep> {
    let normalized = normalize_key(spec.trim());

    if normalized.contains('+') && normalized.chars().count() > 1 {
        let parts: Vec<String> = normalized.split('+').map(|p| normalize_key(p.trim())).collect();
        if let Some((main_key, modifier_keys)) = parts.split_last() {
            let modifiers: Vec<&String> = modifier_keys
                .iter()
                .filter(|k| modifier_bit(k).is_some())
                .collect();
            let mask: u32 = modifiers.iter().filter_map(|k| modifier_bit(k)).sum();

            let mut steps = Vec::new();
            for modifier in &modifiers {
                steps.push(KeyStep {
                    params: key_event_params("rawKeyDown", modifier, 0),
                });
            }
            steps.push(KeyStep {
                params: key_event_params("keyDown", main_key, mask),
            });
            steps.push(KeyStep {
                params: key_event_params("keyUp", main_key, mask),
            });
            for modifier in modifiers.iter().rev() {
                steps.push(KeyStep {
                    params: key_event_params("keyUp", modifier, 0),
                });
            }
            return steps;
        }
    }

    vec![
        KeyStep {
            params: key_event_params("keyDown", &normalized, 0),
        },
        KeyStep {
            params: key_event_params("keyUp", &normalized, 0),
        },
    ]
}
