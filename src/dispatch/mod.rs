//! Dispatch loop.
//!
//! The single consumer of the queue's egress streams. Key presses go to the
//! [`KeyHandler`], power transitions become CEC commands through the
//! [`Guardian`]. When the guardian gives up, the loop stops every background
//! task and hands over to the [`RestartSupervisor`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::guardian::Guardian;
use crate::queue::{DurableQueue, EventStreams};
use crate::supervisor::RestartSupervisor;
use crate::types::{Error, KeyPress, PowerEvent, Result};

/// How long a background task may take to stop after cancellation.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives remote-control key presses.
pub trait KeyHandler: Send + Sync + fmt::Debug {
    fn on_key_press(&self, code: u8);
}

/// Why [`Dispatcher::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// Cancelled; the queue log was deleted.
    Shutdown,
    /// The process image was replaced. Only observable with a test image.
    Restarted,
    /// Both egress streams closed; the log is left on disk.
    Drained,
}

#[derive(Debug)]
pub struct Dispatcher {
    guardian: Arc<Guardian>,
    queue: Arc<DurableQueue>,
    supervisor: RestartSupervisor,
    key_handler: Arc<dyn KeyHandler>,
    devices: Vec<u8>,
    restart_budget: u32,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// `cancel` is shared with the background tasks: cancelling it stops the
    /// loop gracefully, and the loop cancels it before a restart.
    pub fn new(
        guardian: Arc<Guardian>,
        queue: Arc<DurableQueue>,
        supervisor: RestartSupervisor,
        key_handler: Arc<dyn KeyHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            guardian,
            queue,
            supervisor,
            key_handler,
            devices: vec![0],
            restart_budget: 0,
            cancel,
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Logical addresses that receive power commands, in order.
    pub fn with_devices(mut self, devices: Vec<u8>) -> Self {
        self.devices = devices;
        self
    }

    /// Restarts left for this process lineage.
    pub fn with_restart_budget(mut self, budget: u32) -> Self {
        self.restart_budget = budget;
        self
    }

    /// Background tasks stopped by `cancel`. They are awaited before the
    /// queue is closed and before the process image is replaced.
    pub fn with_tasks(self, tasks: impl IntoIterator<Item = JoinHandle<()>>) -> Self {
        self.tasks.lock().extend(tasks);
        self
    }

    pub async fn run(self, mut streams: EventStreams) -> Result<DispatchExit> {
        let mut keys_open = true;
        let mut power_open = true;

        loop {
            if !keys_open && !power_open {
                tracing::info!("Event streams closed, dispatch loop exiting");
                return Ok(DispatchExit::Drained);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.shutdown().await,
                power = streams.power.recv(), if power_open => match power {
                    Some(event) => {
                        if let Err(e) = self.handle_power(event).await {
                            return self.escalate(e).await;
                        }
                    }
                    None => power_open = false,
                },
                key = streams.keys.recv(), if keys_open => match key {
                    Some(key) => self.handle_key(key),
                    None => keys_open = false,
                },
            }
        }
    }

    fn handle_key(&self, key: KeyPress) {
        if key.is_release() {
            tracing::debug!(code = key.code, duration_ms = key.hold_duration_ms, "Ignoring key release");
            return;
        }
        tracing::info!(code = key.code, "CEC key pressed");
        self.key_handler.on_key_press(key.code);
    }

    async fn handle_power(&self, event: PowerEvent) -> Result<()> {
        tracing::info!(
            kind = %event.kind,
            transitioning = event.transitioning,
            devices = ?self.devices,
            "Power event"
        );
        if event.wakes_devices() {
            self.guardian.power_on(&self.devices).await
        } else {
            self.guardian.standby(&self.devices).await
        }
    }

    async fn shutdown(&self) -> Result<DispatchExit> {
        tracing::info!("Shutting down");
        self.stop_tasks().await;
        self.guardian.close().await;
        self.queue.close(true).await?;
        Ok(DispatchExit::Shutdown)
    }

    async fn escalate(&self, cause: Error) -> Result<DispatchExit> {
        tracing::error!(
            error = %cause,
            budget = self.restart_budget,
            "CEC connection unrecoverable, restarting process"
        );
        self.cancel.cancel();
        self.stop_tasks().await;
        // The adapter must be free before the next image opens it.
        self.guardian.close().await;

        if self.supervisor.restart(&self.queue, self.restart_budget).await {
            return Ok(DispatchExit::Restarted);
        }

        if let Err(e) = self.queue.close(false).await {
            tracing::error!(error = %e, "Failed to close queue");
        }
        if self.restart_budget == 0 {
            Err(Error::RestartBudgetExhausted)
        } else {
            Err(Error::restart_failed(cause.to_string()))
        }
    }

    async fn stop_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout(TASK_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Background task ended abnormally"),
                Err(_) => {
                    tracing::warn!("Background task did not stop in time, aborting it");
                    abort.abort();
                }
            }
        }
    }
}
