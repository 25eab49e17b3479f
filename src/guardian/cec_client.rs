//! Production connector backed by a long-running `cec-client` process.
//!
//! One child process owns the adapter for the lifetime of a connection.
//! Commands are written to its stdin; a write that reaches a live child is
//! acknowledged with the command text, anything else yields the empty reply.
//! A reader thread turns the child's key log lines into [`KeyPress`] values.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use super::{AdapterIdentity, Connection, Connector, KeySink, RawReply};
use crate::types::{Error, KeyPress, Result};

/// Log mask passed to `-d`: errors, warnings and debug (key events).
const LOG_MASK: &str = "19";

/// Spawns `cec-client` as a playback device.
#[derive(Debug, Clone)]
pub struct CecClientConnector {
    binary: PathBuf,
}

impl CecClientConnector {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Connector for CecClientConnector {
    fn open(&self, adapter: &AdapterIdentity) -> Result<Box<dyn Connection>> {
        let mut command = Command::new(&self.binary);
        command
            .args(["-t", "p", "-o"])
            .arg(&adapter.device_name)
            .args(["-d", LOG_MASK]);
        if let Some(port) = &adapter.port {
            command.arg(port);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|e| {
            Error::connection(format!("cannot start {}: {}", self.binary.display(), e))
        })?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::connection("cec-client pipes unavailable"));
            }
        };

        let sink: Arc<Mutex<Option<KeySink>>> = Arc::new(Mutex::new(None));
        let reader_sink = sink.clone();
        let reader = std::thread::Builder::new()
            .name("cec-client-keys".to_string())
            .spawn(move || read_keys(stdout, reader_sink))?;

        tracing::debug!(pid = child.id(), adapter = %adapter, "cec-client started");
        Ok(Box::new(CecClientConnection {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            sink,
            reader: Mutex::new(Some(reader)),
        }))
    }
}

#[derive(Debug)]
struct CecClientConnection {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    sink: Arc<Mutex<Option<KeySink>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl CecClientConnection {
    fn send_line(&self, line: String) -> RawReply {
        if !matches!(self.child.lock().try_wait(), Ok(None)) {
            return RawReply::empty();
        }
        let mut stdin = self.stdin.lock();
        let Some(stdin) = stdin.as_mut() else {
            return RawReply::empty();
        };
        match writeln!(stdin, "{}", line).and_then(|()| stdin.flush()) {
            Ok(()) => RawReply::ack(line),
            Err(e) => {
                tracing::debug!(command = %line, error = %e, "Write to cec-client failed");
                RawReply::empty()
            }
        }
    }
}

impl Connection for CecClientConnection {
    fn power_on(&self, address: u8) -> RawReply {
        self.send_line(format!("on {:x}", address))
    }

    fn standby(&self, address: u8) -> RawReply {
        self.send_line(format!("standby {:x}", address))
    }

    fn attach_key_sink(&self, sink: KeySink) {
        *self.sink.lock() = Some(sink);
    }

    fn close(&self) {
        self.stdin.lock().take();
        {
            let mut child = self.child.lock();
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(reader) = self.reader.lock().take() {
            let _ = reader.join();
        }
    }
}

fn read_keys(stdout: ChildStdout, sink: Arc<Mutex<Option<KeySink>>>) {
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };
        let Some(key) = parse_key_line(&line) else {
            continue;
        };
        let Some(tx) = sink.lock().clone() else {
            continue;
        };
        tracing::debug!(code = key.code, duration_ms = key.hold_duration_ms, "CEC key");
        if tx.blocking_send(key).is_err() {
            tracing::debug!("Key sink closed, dropping key");
        }
    }
    tracing::debug!("cec-client output closed");
}

/// Parse a `cec-client` key log line.
///
/// Recognised forms:
/// - `... key pressed: select (0) current(ff) duration(0)` → press
/// - `... key released: select (0) D:120ms` → release held for 120 ms
pub fn parse_key_line(line: &str) -> Option<KeyPress> {
    if let Some(rest) = after(line, "key pressed: ") {
        return Some(KeyPress::pressed(paren_code(rest)?));
    }
    let rest = after(line, "key released: ")?;
    let code = paren_code(rest)?;
    let duration = after(rest, "D:")
        .and_then(|d| d.trim().strip_suffix("ms"))
        .and_then(|d| d.trim().parse::<u32>().ok())
        .unwrap_or(0);
    Some(KeyPress::released(code, duration))
}

fn after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker).map(|at| &line[at + marker.len()..])
}

/// First parenthesised hex value, e.g. `select (2b) ...` → 0x2b.
fn paren_code(rest: &str) -> Option<u8> {
    let open = rest.find('(')?;
    let close = open + rest[open..].find(')')?;
    u8::from_str_radix(rest[open + 1..close].trim(), 16).ok()
}
