//! cec-controller daemon - main entry point.
//!
//! Wires the event sources, the durable queue, the adapter guardian and the
//! restart supervisor together and runs the dispatch loop until shutdown.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cec_controller::dispatch::{DispatchExit, Dispatcher};
use cec_controller::guardian::{AdapterIdentity, CecClientConnector, Guardian, GuardianConfig};
use cec_controller::keymap::{build_injector, KeyMap};
use cec_controller::queue::DurableQueue;
use cec_controller::sources::{spawn_key_forwarder, spawn_signal_watcher, LogindListener};
use cec_controller::supervisor::RestartSupervisor;
use cec_controller::types::{
    parse_devices, parse_keymap_entries, PowerEvent, PowerKind, RESTART_BUDGET_ENV,
};
use cec_controller::{observability, Config, Error, Result};

/// HDMI-CEC remote control daemon.
#[derive(Parser, Debug)]
#[command(name = "cec-controller", version, about)]
struct Cli {
    /// Config file (default: /etc/cec-controller.toml if present).
    #[arg(long, env = "CEC_CONTROLLER_CONFIG")]
    config: Option<PathBuf>,

    /// CEC adapter path (leave empty for auto-detect).
    #[arg(long)]
    cec_adapter: Option<String>,

    /// Name announced on the CEC bus (default: host name).
    #[arg(long)]
    device_name: Option<String>,

    /// Enable debug output.
    #[arg(long)]
    debug: bool,

    /// Disable power event handling.
    #[arg(long)]
    no_power_events: bool,

    /// Power event device addresses, e.g. `--devices 0,1`.
    #[arg(long, value_name = "ADDR[,ADDR]")]
    devices: Vec<String>,

    /// Key mapping override, e.g. `--keymap up:103` or `--keymap select:29+28`.
    #[arg(long, value_name = "NAME:CODE[+CODE]")]
    keymap: Vec<String>,

    /// Adapter reopen attempts before the connection counts as failed.
    #[arg(long)]
    retries: Option<u32>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(adapter) = &self.cec_adapter {
            config.cec.adapter = adapter.clone();
        }
        if let Some(name) = self.device_name.as_ref().filter(|n| !n.is_empty()) {
            config.cec.device_name = name.clone();
        }
        if let Some(retries) = self.retries {
            config.cec.connection_retries = retries;
        }
        if !self.devices.is_empty() {
            config.power.devices = parse_devices(&self.devices);
        }
        if self.no_power_events || config.power.devices.is_empty() {
            config.power.enabled = false;
        }
        config
            .keymap
            .overrides
            .extend(parse_keymap_entries(&self.keymap));
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("cec-controller: {e}");
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut config);
    observability::init_tracing(&config.observability, cli.debug);

    match run(config).await {
        Ok(exit) => {
            tracing::info!(?exit, "cec-controller stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "cec-controller failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<DispatchExit> {
    let fresh_lineage = std::env::var_os(RESTART_BUDGET_ENV).is_none();
    let queue_dir = config.queue.resolve_dir();

    tracing::info!(
        adapter = %config.cec.adapter,
        device_name = %config.cec.device_name,
        devices = ?config.power.devices,
        power_events = config.power.is_active(),
        restart_budget = config.restart.budget,
        queue_dir = %queue_dir.display(),
        fresh_lineage,
        "Starting cec-controller"
    );

    let (queue, streams) = DurableQueue::open(&queue_dir, &config.queue)?;
    let queue = Arc::new(queue);

    let (key_sink, key_rx) = mpsc::channel(config.queue.capacity.max(1));
    let connector = Arc::new(CecClientConnector::new(&config.cec.client_binary));
    let guardian_config = GuardianConfig {
        adapter: AdapterIdentity::new(&config.cec.adapter, config.cec.device_name.clone()),
        retry_budget: config.cec.retries(),
        reconnect_delay: config.cec.reconnect_delay,
    };
    let guardian = tokio::task::spawn_blocking(move || {
        Guardian::connect(connector, guardian_config, key_sink)
    })
    .await
    .unwrap_or_else(|e| Err(Error::connection(format!("adapter open panicked: {}", e))));
    let guardian = match guardian {
        Ok(guardian) => Arc::new(guardian),
        Err(e) => {
            queue.close(false).await?;
            return Err(e);
        }
    };

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    if config.power.is_active() {
        match LogindListener::new().spawn(queue.ingress(), cancel.clone()) {
            Ok(listener) => tasks.push(listener),
            Err(e) => {
                guardian.close().await;
                queue.close(false).await?;
                return Err(e);
            }
        }
        if fresh_lineage && config.power.startup_power_on {
            queue.enqueue(PowerEvent::new(PowerKind::On, true)).await;
        }
    }
    tasks.push(spawn_key_forwarder(key_rx, queue.ingress(), cancel.clone()));
    tasks.push(spawn_signal_watcher(cancel.clone()));

    let keymap = KeyMap::new(
        &config.keymap.overrides,
        build_injector(config.keymap.injector),
    );
    tracing::info!("Listening for CEC key events... (Ctrl+C to exit)");

    let exit = Dispatcher::new(
        guardian,
        queue,
        RestartSupervisor::new(),
        Arc::new(keymap),
        cancel.clone(),
    )
    .with_devices(config.power.devices.clone())
    .with_restart_budget(config.restart.budget)
    .with_tasks(tasks)
    .run(streams)
    .await;

    cancel.cancel();
    exit
}
