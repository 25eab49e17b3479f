//! Event producers feeding the durable queue.

mod keys;
mod power;
mod signals;

pub use keys::spawn_key_forwarder;
pub use power::{LogindListener, SignalParser};
pub use signals::{spawn_signal_watcher, wait_for_shutdown_signal};
