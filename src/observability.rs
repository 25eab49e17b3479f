//! Observability utilities.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Environment variable selecting the log format (`json` or text).
pub const LOG_FORMAT_ENV: &str = "CEC_LOG_FORMAT";

/// Initialize tracing subscriber once for the process.
///
/// `RUST_LOG` wins when set; otherwise the filter is `debug` with `debug`
/// set, else the configured level. Output is compact text unless
/// `CEC_LOG_FORMAT=json` or `json_logs` asks for JSON.
pub fn init_tracing(config: &ObservabilityConfig, debug: bool) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive(config, debug)));
        let json = config.json_logs
            || std::env::var(LOG_FORMAT_ENV)
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false);

        let result = if json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().compact())
                .try_init()
        };

        if let Err(err) = result {
            eprintln!("tracing init skipped: {err}");
        }
    });
}

fn default_directive(config: &ObservabilityConfig, debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    let level = config.log_level.trim();
    if level.is_empty() {
        "info".to_string()
    } else {
        level.to_string()
    }
}
