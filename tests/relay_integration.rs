//! Relay integration tests: queue→dispatch→guardian flow and the restart
//! hand-over between two process lineages sharing one queue directory.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cec_controller::dispatch::{DispatchExit, Dispatcher, KeyHandler};
use cec_controller::guardian::{
    AdapterIdentity, Connection, Connector, Guardian, GuardianConfig, KeySink, RawReply,
};
use cec_controller::queue::{DurableQueue, EventStreams};
use cec_controller::supervisor::{ExecPlan, ProcessImage, RestartSupervisor};
use cec_controller::types::{
    Config, Error, KeyPress, PowerEvent, PowerKind, QueueConfig, Result,
};

/// Fake CEC bus: records accepted commands; `wedged` makes every command
/// fail and every open get refused.
#[derive(Debug, Default)]
struct Bus {
    wedged: AtomicBool,
    opens: AtomicU32,
    accepted: Mutex<Vec<(&'static str, u8)>>,
}

impl Bus {
    fn command(&self, name: &'static str, address: u8) -> RawReply {
        if self.wedged.load(Ordering::SeqCst) {
            return RawReply::empty();
        }
        self.accepted.lock().push((name, address));
        RawReply::ack(format!("{} {}", name, address))
    }
}

#[derive(Debug, Clone)]
struct BusConnector(Arc<Bus>);

impl Connector for BusConnector {
    fn open(&self, _adapter: &AdapterIdentity) -> Result<Box<dyn Connection>> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        if self.0.wedged.load(Ordering::SeqCst) {
            return Err(Error::connection("adapter wedged"));
        }
        Ok(Box::new(BusConnection(self.0.clone())))
    }
}

#[derive(Debug)]
struct BusConnection(Arc<Bus>);

impl Connection for BusConnection {
    fn power_on(&self, address: u8) -> RawReply {
        self.0.command("on", address)
    }

    fn standby(&self, address: u8) -> RawReply {
        self.0.command("standby", address)
    }

    fn attach_key_sink(&self, _sink: KeySink) {}

    fn close(&self) {}
}

#[derive(Debug, Default)]
struct Keys(Mutex<Vec<u8>>);

impl KeyHandler for Keys {
    fn on_key_press(&self, code: u8) {
        self.0.lock().push(code);
    }
}

#[derive(Debug, Default, Clone)]
struct RecordedExec(Arc<Mutex<Vec<ExecPlan>>>);

impl ProcessImage for RecordedExec {
    fn replace(&self, plan: &ExecPlan) -> io::Result<()> {
        self.0.lock().push(plan.clone());
        Ok(())
    }
}

struct Instance {
    queue: Arc<DurableQueue>,
    streams: EventStreams,
    keys: Arc<Keys>,
    cancel: CancellationToken,
    dispatcher: Dispatcher,
}

/// One "process": queue, guardian and dispatcher wired like the binary does.
fn start_instance(
    dir: &Path,
    queue_config: &QueueConfig,
    bus: &Arc<Bus>,
    exec: &RecordedExec,
    devices: Vec<u8>,
    budget: u32,
) -> Instance {
    let (queue, streams) = DurableQueue::open(dir, queue_config).unwrap();
    let queue = Arc::new(queue);
    let (sink, _) = mpsc::channel(1);
    let guardian = Guardian::connect(
        Arc::new(BusConnector(bus.clone())),
        GuardianConfig {
            adapter: AdapterIdentity::new("", "integration"),
            retry_budget: 2,
            reconnect_delay: Duration::ZERO,
        },
        sink,
    )
    .unwrap();
    let keys = Arc::new(Keys::default());
    let cancel = CancellationToken::new();
    let supervisor = RestartSupervisor::with_image(
        Box::new(exec.clone()),
        PathBuf::from("/usr/bin/cec-controller"),
        vec![OsString::from("cec-controller"), OsString::from("--debug")],
    );
    let dispatcher = Dispatcher::new(
        Arc::new(guardian),
        queue.clone(),
        supervisor,
        keys.clone(),
        cancel.clone(),
    )
    .with_devices(devices)
    .with_restart_budget(budget);

    Instance {
        queue,
        streams,
        keys,
        cancel,
        dispatcher,
    }
}

async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn fast_queue() -> QueueConfig {
    QueueConfig {
        poll_interval: Duration::from_millis(5),
        ..QueueConfig::default()
    }
}

#[tokio::test]
async fn test_power_and_keys_flow_to_the_adapter() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("queue");
    let bus = Arc::new(Bus::default());
    let exec = RecordedExec::default();
    let instance = start_instance(&dir, &fast_queue(), &bus, &exec, vec![0, 5], 3);

    let queue = instance.queue.clone();
    let keys = instance.keys.clone();
    let cancel = instance.cancel.clone();
    let run = tokio::spawn(instance.dispatcher.run(instance.streams));

    queue.enqueue(PowerEvent::new(PowerKind::On, true)).await.unwrap();
    queue.enqueue(KeyPress::pressed(0x01)).await.unwrap();
    queue.enqueue(KeyPress::released(0x01, 90)).await.unwrap();
    queue.enqueue(PowerEvent::new(PowerKind::Sleep, true)).await.unwrap();
    queue.enqueue(KeyPress::pressed(0x2B)).await.unwrap();

    eventually(|| bus.accepted.lock().len() == 4 && keys.0.lock().len() == 2).await;
    assert_eq!(
        *bus.accepted.lock(),
        vec![("on", 0), ("on", 5), ("standby", 0), ("standby", 5)]
    );
    assert_eq!(*keys.0.lock(), vec![0x01, 0x2B]);

    cancel.cancel();
    assert_eq!(run.await.unwrap().unwrap(), DispatchExit::Shutdown);
    assert!(!dir.exists());
    assert!(exec.0.lock().is_empty());
}

#[tokio::test]
async fn test_restart_hands_queue_to_next_lineage() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("queue");
    let queue_config = fast_queue();
    let bus = Arc::new(Bus::default());
    let exec = RecordedExec::default();

    // First lineage: the adapter wedges right before a sleep request.
    let first = start_instance(&dir, &queue_config, &bus, &exec, vec![0], 2);
    bus.wedged.store(true, Ordering::SeqCst);
    first
        .queue
        .enqueue(PowerEvent::new(PowerKind::Sleep, true))
        .await
        .unwrap();
    let backlog: Vec<u8> = (0x20..0x26).collect();
    for &code in &backlog {
        first.queue.enqueue(KeyPress::pressed(code)).await.unwrap();
    }
    let first_cancel = first.cancel.clone();
    let first_keys = first.keys.clone();
    // Let the drain task fill the egress queues before the adapter fails.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let exit = tokio::time::timeout(Duration::from_secs(5), first.dispatcher.run(first.streams))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(exit, DispatchExit::Restarted);
    assert!(first_cancel.is_cancelled());
    assert!(dir.exists());
    assert_eq!(bus.opens.load(Ordering::SeqCst), 1 + 2);
    drop(first.queue);

    // The replacement process reads its state from the handed-over environment.
    let plan = exec.0.lock()[0].clone();
    assert_eq!(
        plan.args,
        vec![OsString::from("cec-controller"), OsString::from("--debug")]
    );
    let mut config = Config::default();
    config.queue = queue_config.clone();
    config.apply_env(|key| {
        plan.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.to_string_lossy().into_owned())
    });
    assert_eq!(config.queue.dir.as_deref(), Some(dir.as_path()));
    assert_eq!(config.restart.budget, 1);

    // Second lineage: adapter healthy again, same directory.
    bus.wedged.store(false, Ordering::SeqCst);
    let second = start_instance(
        &config.queue.resolve_dir(),
        &config.queue,
        &bus,
        &exec,
        vec![0],
        config.restart.budget,
    );
    let keys = second.keys.clone();
    let cancel = second.cancel.clone();
    let run = tokio::spawn(second.dispatcher.run(second.streams));

    // Every key accepted by the first process but never received by its
    // dispatch loop is replayed, in order, even though it was already
    // buffered in memory when the image was replaced.
    assert!(first_keys.0.lock().is_empty());
    eventually(|| keys.0.lock().len() == backlog.len()).await;
    assert_eq!(*keys.0.lock(), backlog);
    assert!(bus.accepted.lock().is_empty());

    cancel.cancel();
    assert_eq!(run.await.unwrap().unwrap(), DispatchExit::Shutdown);
    assert!(!dir.exists());
    assert_eq!(exec.0.lock().len(), 1);
}
