//! # cec-controller
//!
//! HDMI-CEC remote-control daemon. Remote key presses become virtual key
//! strokes; system sleep, resume and shutdown become CEC power commands for
//! the attached displays.
//!
//! ## Architecture
//!
//! Events from every source pass through a crash-durable queue before the
//! single dispatch loop acts on them, so nothing is lost when the process has
//! to replace itself to recover a wedged adapter:
//! ```text
//!   cec-client keys ──┐                        ┌──▶ KeyMap ──▶ injector
//!                     ├──▶ DurableQueue ──▶ Dispatcher
//!   logind power ─────┘    (on disk)           └──▶ Guardian ──▶ adapter
//!                                                   │ unrecoverable
//!                                                   ▼
//!                                          RestartSupervisor (execve)
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod dispatch;
pub mod guardian;
pub mod keymap;
pub mod queue;
pub mod sources;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
