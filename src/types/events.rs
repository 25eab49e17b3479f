//! Events relayed from the sources to the dispatch loop.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A remote-control key notification.
///
/// A press arrives with `hold_duration_ms == 0`; the matching release repeats
/// the code with how long the key was held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPress {
    pub code: u8,
    pub hold_duration_ms: u32,
}

impl KeyPress {
    pub fn pressed(code: u8) -> Self {
        Self {
            code,
            hold_duration_ms: 0,
        }
    }

    pub fn released(code: u8, hold_duration_ms: u32) -> Self {
        Self {
            code,
            hold_duration_ms,
        }
    }

    pub fn is_release(&self) -> bool {
        self.hold_duration_ms != 0
    }
}

/// Kind of system power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerKind {
    On,
    Sleep,
    Resume,
    Shutdown,
}

impl fmt::Display for PowerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerKind::On => "on",
            PowerKind::Sleep => "sleep",
            PowerKind::Resume => "resume",
            PowerKind::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// A power-state notification.
///
/// `transitioning` is true while the transition is starting (going to sleep,
/// shutting down) and false once it has ended (resumed, shutdown cancelled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PowerEvent {
    pub kind: PowerKind,
    pub transitioning: bool,
}

impl PowerEvent {
    pub fn new(kind: PowerKind, transitioning: bool) -> Self {
        Self {
            kind,
            transitioning,
        }
    }

    /// Whether displays should be woken (as opposed to put in standby).
    pub fn wakes_devices(&self) -> bool {
        matches!(self.kind, PowerKind::On | PowerKind::Resume)
    }
}

/// Anything the queue relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Key(KeyPress),
    Power(PowerEvent),
}

impl Event {
    /// Type tag stored next to the payload in the on-disk envelope.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Event::Key(_) => Event::KEY_TAG,
            Event::Power(_) => Event::POWER_TAG,
        }
    }

    pub const KEY_TAG: &'static str = "key";
    pub const POWER_TAG: &'static str = "power";
}

impl From<KeyPress> for Event {
    fn from(key: KeyPress) -> Self {
        Event::Key(key)
    }
}

impl From<PowerEvent> for Event {
    fn from(power: PowerEvent) -> Self {
        Event::Power(power)
    }
}
