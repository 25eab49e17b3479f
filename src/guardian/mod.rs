//! Connection health guardian.
//!
//! Owns the single adapter handle and hides its failures: a command that gets
//! a failure reply triggers a reconnect and one retry. The handle lives behind
//! a read/write lock and is never handed out; commands run under the read
//! lock, replacement under the write lock.
//!
//! ```text
//!  Connected ──command fails──▶ Reconnecting ──open succeeds──▶ Connected
//!                                    │
//!                                    └──retries exhausted──▶ Failed
//! ```
//!
//! Adapter calls can block on pipes and child processes, so they run on the
//! blocking pool rather than on the async workers.
//!
//! Every successful open bumps a generation counter. A caller that saw a
//! failure records the generation it used; if another caller has already
//! replaced the handle by the time it gets the write lock, it retries on the
//! new handle instead of tearing that one down again.

mod cec_client;
mod connection;
#[cfg(test)]
pub(crate) mod mock;

pub use cec_client::{parse_key_line, CecClientConnector};
pub use connection::{
    normalize, AdapterIdentity, Connection, Connector, KeySink, PowerCommand, RawReply, Rejected,
};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::types::{Error, Result};

/// Health of the adapter link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Reconnecting,
    /// Reopen attempts exhausted; terminal for this process.
    Failed,
}

/// Reconnect settings.
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub adapter: AdapterIdentity,
    /// Open attempts per reconnect, clamped to at least 1.
    pub retry_budget: u32,
    /// Pause between open attempts.
    pub reconnect_delay: Duration,
}

#[derive(Debug)]
struct Link {
    conn: Option<Arc<dyn Connection>>,
    generation: u64,
    state: LinkState,
}

impl Link {
    async fn send(&self, command: PowerCommand, address: u8) -> std::result::Result<(), Rejected> {
        let Some(conn) = self.conn.clone() else {
            return Err(Rejected);
        };
        blocking(move || normalize(command.send(conn.as_ref(), address)))
            .await
            .unwrap_or(Err(Rejected))
    }
}

/// Run an adapter call on the blocking pool. `None` if the call panicked.
async fn blocking<R, F>(f: F) -> Option<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::error!(error = %e, "Adapter call panicked");
            None
        }
    }
}

/// Owner of the adapter connection.
#[derive(Debug)]
pub struct Guardian {
    connector: Arc<dyn Connector>,
    adapter: AdapterIdentity,
    retry_budget: u32,
    reconnect_delay: Duration,
    key_sink: KeySink,
    link: RwLock<Link>,
}

impl Guardian {
    /// Open the initial connection. Failure here is fatal for the caller.
    pub fn connect(
        connector: Arc<dyn Connector>,
        config: GuardianConfig,
        key_sink: KeySink,
    ) -> Result<Self> {
        let retry_budget = if config.retry_budget < 1 {
            tracing::warn!("Connection retries must be at least 1, setting to 1");
            1
        } else {
            config.retry_budget
        };

        let conn: Arc<dyn Connection> = Arc::from(connector.open(&config.adapter)?);
        conn.attach_key_sink(key_sink.clone());
        tracing::info!(adapter = %config.adapter, "CEC connection opened");

        Ok(Self {
            connector,
            adapter: config.adapter,
            retry_budget,
            reconnect_delay: config.reconnect_delay,
            key_sink,
            link: RwLock::new(Link {
                conn: Some(conn),
                generation: 1,
                state: LinkState::Connected,
            }),
        })
    }

    /// Send a power command, reconnecting and retrying once on failure.
    pub async fn issue_command(&self, command: PowerCommand, address: u8) -> Result<()> {
        let observed = {
            let link = self.link.read().await;
            if link.send(command, address).await.is_ok() {
                return Ok(());
            }
            link.generation
        };

        tracing::warn!(
            command = command.as_str(),
            address,
            generation = observed,
            "CEC command failed, reconnecting"
        );
        self.reconnect_from(Some(observed)).await?;

        let link = self.link.read().await;
        link.send(command, address).await.map_err(|_| {
            tracing::error!(
                command = command.as_str(),
                address,
                generation = link.generation,
                "CEC command failed after reconnect"
            );
            Error::CommandFailed {
                command: command.as_str(),
                address,
            }
        })
    }

    /// Replace the connection with a freshly opened one.
    pub async fn reconnect(&self) -> Result<()> {
        self.reconnect_from(None).await
    }

    async fn reconnect_from(&self, observed: Option<u64>) -> Result<()> {
        let mut link = self.link.write().await;
        if let Some(observed) = observed {
            if link.state == LinkState::Failed {
                return Err(Error::ReconnectExhausted {
                    attempts: self.retry_budget,
                });
            }
            if link.generation != observed && link.state == LinkState::Connected {
                tracing::debug!(
                    generation = link.generation,
                    "Connection already replaced by another caller"
                );
                return Ok(());
            }
        }

        link.state = LinkState::Reconnecting;
        if let Some(stale) = link.conn.take() {
            tracing::warn!(adapter = %self.adapter, "CEC connection lost, reopening");
            blocking(move || stale.close()).await;
        }

        for attempt in 1..=self.retry_budget {
            let connector = self.connector.clone();
            let adapter = self.adapter.clone();
            let opened = blocking(move || connector.open(&adapter))
                .await
                .unwrap_or_else(|| Err(Error::connection("adapter open panicked")));
            match opened {
                Ok(conn) => {
                    let conn: Arc<dyn Connection> = Arc::from(conn);
                    conn.attach_key_sink(self.key_sink.clone());
                    link.conn = Some(conn);
                    link.generation += 1;
                    link.state = LinkState::Connected;
                    tracing::info!(
                        attempt,
                        generation = link.generation,
                        "CEC connection re-established"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        budget = self.retry_budget,
                        error = %e,
                        "Failed to open CEC connection"
                    );
                    if attempt < self.retry_budget && !self.reconnect_delay.is_zero() {
                        tokio::time::sleep(self.reconnect_delay).await;
                    }
                }
            }
        }

        link.state = LinkState::Failed;
        Err(Error::ReconnectExhausted {
            attempts: self.retry_budget,
        })
    }

    /// Wake every address, in order. Stops at the first hard error.
    pub async fn power_on(&self, addresses: &[u8]) -> Result<()> {
        self.broadcast(PowerCommand::PowerOn, addresses).await
    }

    /// Put every address in standby, in order. Stops at the first hard error.
    pub async fn standby(&self, addresses: &[u8]) -> Result<()> {
        self.broadcast(PowerCommand::Standby, addresses).await
    }

    async fn broadcast(&self, command: PowerCommand, addresses: &[u8]) -> Result<()> {
        for &address in addresses {
            tracing::info!(command = command.as_str(), address, "Sending CEC command");
            self.issue_command(command, address).await?;
        }
        Ok(())
    }

    pub async fn state(&self) -> LinkState {
        self.link.read().await.state
    }

    pub async fn generation(&self) -> u64 {
        self.link.read().await.generation
    }

    /// Close the live handle, releasing the adapter.
    pub async fn close(&self) {
        let mut link = self.link.write().await;
        if let Some(conn) = link.conn.take() {
            blocking(move || conn.close()).await;
            tracing::debug!("CEC connection closed");
        }
    }
}
