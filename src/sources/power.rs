//! systemd-logind power-state listener.
//!
//! `dbus-monitor` prints each `PrepareForSleep` / `PrepareForShutdown` signal
//! as a header line naming the member (wrapped here), followed by its boolean
//! argument:
//!
//! ```text
//! signal time=1700000000.1 sender=:1.3 -> destination=(null destination) serial=912 \
//!     path=/org/freedesktop/login1; interface=org.freedesktop.login1.Manager; member=PrepareForSleep
//!    boolean true
//! ```

use std::ffi::OsString;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::QueueIngress;
use crate::types::{Error, PowerEvent, PowerKind, Result};

const LOGIND_MATCH: &str = "type='signal',sender='org.freedesktop.login1',\
interface='org.freedesktop.login1.Manager'";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Member {
    PrepareForSleep,
    PrepareForShutdown,
}

/// Incremental parser for `dbus-monitor` output.
#[derive(Debug, Default)]
pub struct SignalParser {
    pending: Option<Member>,
}

impl SignalParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one output line; returns an event once a signal's argument is seen.
    pub fn feed(&mut self, line: &str) -> Option<PowerEvent> {
        let line = line.trim();
        if line.contains("member=PrepareForSleep") {
            self.pending = Some(Member::PrepareForSleep);
            return None;
        }
        if line.contains("member=PrepareForShutdown") {
            self.pending = Some(Member::PrepareForShutdown);
            return None;
        }
        if line.starts_with("signal ") || line.starts_with("method ") {
            self.pending = None;
            return None;
        }

        let value = line.strip_prefix("boolean ")?;
        let active = match value.trim() {
            "true" => true,
            "false" => false,
            _ => return None,
        };
        let event = match self.pending.take()? {
            Member::PrepareForSleep if active => PowerEvent::new(PowerKind::Sleep, true),
            Member::PrepareForSleep => PowerEvent::new(PowerKind::Resume, false),
            Member::PrepareForShutdown => PowerEvent::new(PowerKind::Shutdown, active),
        };
        Some(event)
    }
}

/// Runs the monitor process and enqueues every parsed power event.
#[derive(Debug, Clone)]
pub struct LogindListener {
    program: OsString,
    args: Vec<OsString>,
}

impl LogindListener {
    /// `dbus-monitor --system` filtered to logind's manager interface.
    pub fn new() -> Self {
        Self::with_command(
            "dbus-monitor",
            [OsString::from("--system"), OsString::from(LOGIND_MATCH)],
        )
    }

    /// Any command printing `dbus-monitor` formatted output.
    pub fn with_command(
        program: impl Into<OsString>,
        args: impl IntoIterator<Item = OsString>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    /// Start the monitor. Failure to start it is returned; once running, the
    /// task stops on cancellation or when the monitor exits.
    pub fn spawn(self, ingress: QueueIngress, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::connection(format!(
                    "cannot start power event listener {:?}: {}",
                    self.program, e
                ))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::connection("power event listener has no stdout"))?;

        tracing::info!(program = ?self.program, "Listening for logind power events");
        Ok(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = SignalParser::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(event) = parser.feed(&line) {
                                tracing::debug!(
                                    kind = %event.kind,
                                    transitioning = event.transitioning,
                                    "Power event"
                                );
                                ingress.enqueue(event).await;
                            }
                        }
                        Ok(None) => {
                            tracing::warn!("Power event listener exited");
                            break;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to read power events");
                            break;
                        }
                    },
                }
            }
            let _ = child.kill().await;
        }))
    }
}

impl Default for LogindListener {
    fn default() -> Self {
        Self::new()
    }
}
