//! Scripted adapter used by unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{AdapterIdentity, Connection, Connector, KeySink, PowerCommand, RawReply};
use crate::types::{Error, Result};

#[derive(Debug, Default)]
pub(crate) struct Script {
    failing_commands: AtomicU32,
    always_fail: AtomicBool,
    refuse_opens: AtomicBool,
    opens: AtomicU32,
    closes: AtomicU32,
    sent: Mutex<Vec<(PowerCommand, u8)>>,
    sinks: Mutex<Vec<KeySink>>,
    delay: Mutex<Duration>,
}

impl Script {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` commands get an empty reply.
    pub(crate) fn fail_next(&self, n: u32) {
        self.failing_commands.store(n, Ordering::SeqCst);
    }

    pub(crate) fn fail_always(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    /// Every following open returns an error.
    pub(crate) fn refuse_opens(&self) {
        self.refuse_opens.store(true, Ordering::SeqCst);
    }

    /// Every following command blocks its thread for `delay` first.
    pub(crate) fn delay_commands(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub(crate) fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Every command attempted, successful or not.
    pub(crate) fn sent(&self) -> Vec<(PowerCommand, u8)> {
        self.sent.lock().clone()
    }

    pub(crate) fn last_sink(&self) -> Option<KeySink> {
        self.sinks.lock().last().cloned()
    }

    fn reply(&self, command: PowerCommand, address: u8) -> RawReply {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.sent.lock().push((command, address));
        if self.always_fail.load(Ordering::SeqCst) {
            return RawReply::empty();
        }
        let failing = self
            .failing_commands
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            RawReply::empty()
        } else {
            RawReply::ack(format!("{} {}", command, address))
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptedConnector(pub(crate) Arc<Script>);

impl Connector for ScriptedConnector {
    fn open(&self, _adapter: &AdapterIdentity) -> Result<Box<dyn Connection>> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        if self.0.refuse_opens.load(Ordering::SeqCst) {
            return Err(Error::connection("adapter busy"));
        }
        Ok(Box::new(ScriptedConnection(self.0.clone())))
    }
}

#[derive(Debug)]
struct ScriptedConnection(Arc<Script>);

impl Connection for ScriptedConnection {
    fn power_on(&self, address: u8) -> RawReply {
        self.0.reply(PowerCommand::PowerOn, address)
    }

    fn standby(&self, address: u8) -> RawReply {
        self.0.reply(PowerCommand::Standby, address)
    }

    fn attach_key_sink(&self, sink: KeySink) {
        self.0.sinks.lock().push(sink);
    }

    fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}
