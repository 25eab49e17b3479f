//! CEC user-control codes to Linux input key codes.

mod injector;

pub use injector::{build_injector, KeyInjector, LogInjector, YdotoolInjector};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::dispatch::KeyHandler;

/// Linux input event codes (`linux/input-event-codes.h`).
pub mod linux {
    pub const KEY_ESC: u16 = 1;
    pub const KEY_1: u16 = 2;
    pub const KEY_2: u16 = 3;
    pub const KEY_3: u16 = 4;
    pub const KEY_4: u16 = 5;
    pub const KEY_5: u16 = 6;
    pub const KEY_6: u16 = 7;
    pub const KEY_7: u16 = 8;
    pub const KEY_8: u16 = 9;
    pub const KEY_9: u16 = 10;
    pub const KEY_0: u16 = 11;
    pub const KEY_ENTER: u16 = 28;
    pub const KEY_UP: u16 = 103;
    pub const KEY_LEFT: u16 = 105;
    pub const KEY_RIGHT: u16 = 106;
    pub const KEY_DOWN: u16 = 108;
    pub const KEY_STOPCD: u16 = 166;
    pub const KEY_HOMEPAGE: u16 = 172;
    pub const KEY_PLAYCD: u16 = 200;
    pub const KEY_PAUSECD: u16 = 201;
}

/// CEC user-control codes by name, as printed by `cec-client`.
const CEC_CODES: &[(&str, u8)] = &[
    ("select", 0x00),
    ("up", 0x01),
    ("down", 0x02),
    ("left", 0x03),
    ("right", 0x04),
    ("root menu", 0x09),
    ("home", 0x09),
    ("exit", 0x0D),
    ("0", 0x20),
    ("1", 0x21),
    ("2", 0x22),
    ("3", 0x23),
    ("4", 0x24),
    ("5", 0x25),
    ("6", 0x26),
    ("7", 0x27),
    ("8", 0x28),
    ("9", 0x29),
    ("enter", 0x2B),
    ("play", 0x44),
    ("stop", 0x45),
    ("pause", 0x46),
];

/// Look up a CEC user-control code by name. Case and `_`/`-` vs. space are
/// ignored, and a numeric code (`0x2b`, `43`) is accepted as is.
pub fn cec_code_by_name(name: &str) -> Option<u8> {
    let normalized = name.trim().to_ascii_lowercase().replace(&['_', '-'][..], " ");
    if let Some(&(_, code)) = CEC_CODES.iter().find(|(n, _)| *n == normalized) {
        return Some(code);
    }
    match normalized.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => normalized.parse().ok(),
    }
}

fn base_map() -> HashMap<u8, Vec<u16>> {
    use linux::*;

    let mut map = HashMap::from([
        (0x00, vec![KEY_ENTER]),
        (0x2B, vec![KEY_ENTER]),
        (0x01, vec![KEY_UP]),
        (0x02, vec![KEY_DOWN]),
        (0x03, vec![KEY_LEFT]),
        (0x04, vec![KEY_RIGHT]),
        (0x0D, vec![KEY_ESC]),
        (0x44, vec![KEY_PLAYCD]),
        (0x46, vec![KEY_PAUSECD]),
        (0x45, vec![KEY_STOPCD]),
        (0x09, vec![KEY_HOMEPAGE]),
        (0x20, vec![KEY_0]),
    ]);
    let digits = [KEY_1, KEY_2, KEY_3, KEY_4, KEY_5, KEY_6, KEY_7, KEY_8, KEY_9];
    for (offset, key) in (1u8..).zip(digits) {
        map.insert(0x20 + offset, vec![key]);
    }
    map
}

/// Translates key presses and hands them to a [`KeyInjector`].
#[derive(Debug)]
pub struct KeyMap {
    map: HashMap<u8, Vec<u16>>,
    injector: Arc<dyn KeyInjector>,
}

impl KeyMap {
    /// Default table with `overrides` (CEC key name → Linux codes) applied.
    /// Unknown names are logged and skipped.
    pub fn new(overrides: &BTreeMap<String, Vec<u16>>, injector: Arc<dyn KeyInjector>) -> Self {
        let mut map = base_map();
        for (name, codes) in overrides {
            match cec_code_by_name(name) {
                Some(code) => {
                    map.insert(code, codes.clone());
                }
                None => tracing::warn!(key = %name, "Invalid CEC key name in overrides"),
            }
        }
        tracing::debug!(entries = map.len(), "Key map initialized");
        Self { map, injector }
    }

    pub fn lookup(&self, cec_code: u8) -> Option<&[u16]> {
        self.map.get(&cec_code).map(Vec::as_slice)
    }
}

impl KeyHandler for KeyMap {
    fn on_key_press(&self, code: u8) {
        let Some(keys) = self.lookup(code) else {
            tracing::warn!(cec_key_code = code, "Unmapped CEC key code");
            return;
        };
        if keys.is_empty() {
            return;
        }
        tracing::debug!(cec_key_code = code, linux_key_codes = ?keys, "Sending virtual key event");
        self.injector.inject(keys);
    }
}
