//! Core types for the controller.
//!
//! This module provides foundational types used throughout the system:
//! - **Events**: key presses and power transitions relayed by the queue
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures loaded from TOML and the environment

mod config;
mod errors;
mod events;

pub use config::{
    parse_devices, parse_keymap_entries, CecConfig, Config, InjectorKind, KeymapConfig,
    ObservabilityConfig, PowerConfig, QueueConfig, RestartConfig, DEFAULT_CONFIG_PATH,
    QUEUE_DIR_ENV, RESTART_BUDGET_ENV,
};
pub use errors::{Error, Result};
pub use events::{Event, KeyPress, PowerEvent, PowerKind};
