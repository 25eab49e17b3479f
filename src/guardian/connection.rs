//! Boundary with the hardware command layer.
//!
//! The adapter layer reports command results with inverted polarity: a
//! non-empty reply means the command went through, an empty or missing reply
//! means it failed. [`normalize`] is the only place that reads a [`RawReply`];
//! everything past it sees a conventional `Result`.

use std::fmt;

use tokio::sync::mpsc;

use crate::types::{KeyPress, Result};

/// Where a connection pushes remote-control key notifications.
pub type KeySink = mpsc::Sender<KeyPress>;

/// Reply of a raw adapter command. Non-empty = success.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawReply(Option<String>);

impl RawReply {
    /// A reply carrying the adapter's acknowledgement.
    pub fn ack(text: impl Into<String>) -> Self {
        Self(Some(text.into()))
    }

    /// The empty reply, which the adapter layer uses for failure.
    pub fn empty() -> Self {
        Self(None)
    }
}

/// The adapter did not accept a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("adapter rejected the command")]
pub struct Rejected;

/// Translate the adapter's inverted result into a conventional one.
pub fn normalize(reply: RawReply) -> std::result::Result<(), Rejected> {
    match reply.0 {
        Some(text) if !text.is_empty() => Ok(()),
        _ => Err(Rejected),
    }
}

/// Power command understood by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerCommand {
    PowerOn,
    Standby,
}

impl PowerCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerCommand::PowerOn => "power_on",
            PowerCommand::Standby => "standby",
        }
    }

    /// Run the command on a connection.
    pub fn send(&self, conn: &dyn Connection, address: u8) -> RawReply {
        match self {
            PowerCommand::PowerOn => conn.power_on(address),
            PowerCommand::Standby => conn.standby(address),
        }
    }
}

impl fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which adapter to open and the name to announce on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterIdentity {
    /// Adapter port; `None` lets the adapter layer autodetect.
    pub port: Option<String>,
    pub device_name: String,
}

impl AdapterIdentity {
    pub fn new(port: &str, device_name: impl Into<String>) -> Self {
        let port = port.trim();
        Self {
            port: (!port.is_empty()).then(|| port.to_string()),
            device_name: device_name.into(),
        }
    }
}

impl fmt::Display for AdapterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port {
            Some(port) => write!(f, "{} ({})", port, self.device_name),
            None => write!(f, "autodetect ({})", self.device_name),
        }
    }
}

/// An open adapter handle.
///
/// Implementations are owned exclusively by the guardian and are never used
/// after `close`.
pub trait Connection: Send + Sync + fmt::Debug {
    fn power_on(&self, address: u8) -> RawReply;

    fn standby(&self, address: u8) -> RawReply;

    /// Route key notifications from this handle into `sink`.
    fn attach_key_sink(&self, sink: KeySink);

    fn close(&self);
}

/// Opens adapter handles.
pub trait Connector: Send + Sync + fmt::Debug {
    fn open(&self, adapter: &AdapterIdentity) -> Result<Box<dyn Connection>>;
}
