//! Moves key presses from the adapter's sink into the durable queue.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::queue::QueueIngress;
use crate::types::KeyPress;

pub fn spawn_key_forwarder(
    mut keys: mpsc::Receiver<KeyPress>,
    ingress: QueueIngress,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                key = keys.recv() => match key {
                    Some(key) => {
                        ingress.enqueue(key).await;
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Key forwarder stopped");
    })
}
