//! # Engine Runtime
//!
//! Hosts an [`Orchestrator`] on a dedicated worker thread. Every input
//! (external signals, transport completions, snapshot requests) arrives on
//! one bounded channel and is handled in order, so the registries are only
//! ever touched by that thread. Retry alarms are serviced by bounding each
//! `recv_timeout` with the next alarm deadline.

use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use quanta::Clock;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::orchestrator::{EngineSnapshot, Event, Notification, Orchestrator};
use crate::pool::SlotId;
use crate::service::ServiceType;
use crate::transport::{BearerTransport, SetupContext, SetupOutcome};

const COMMAND_QUEUE_DEPTH: usize = 1024;
const IDLE_WAIT: Duration = Duration::from_secs(1);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

enum Command {
    Event(Event),
    Snapshot(Sender<EngineSnapshot>),
    Shutdown,
}

/// Cloneable sender into the engine queue.
#[derive(Clone)]
pub struct EngineHandle {
    sender: Sender<Command>,
}

impl EngineHandle {
    pub fn post(&self, event: Event) -> anyhow::Result<()> {
        self.sender
            .send(Command::Event(event))
            .map_err(|_| anyhow::anyhow!("engine worker has stopped"))
    }

    pub fn reconcile(&self, reason: &str) -> anyhow::Result<()> {
        self.post(Event::Reconcile {
            reason: reason.to_string(),
        })
    }

    pub fn setup_done(&self, context: SetupContext, outcome: SetupOutcome) -> anyhow::Result<()> {
        self.post(Event::SetupDone { context, outcome })
    }

    pub fn teardown_done(&self, slot: SlotId, reason: &str) -> anyhow::Result<()> {
        self.post(Event::TeardownDone {
            slot,
            reason: reason.to_string(),
        })
    }

    pub fn set_service_enabled(&self, service: ServiceType, enabled: bool) -> anyhow::Result<()> {
        self.post(Event::ServiceEnabled { service, enabled })
    }

    /// Requests power off. The returned receiver yields once every bearer
    /// has been torn down.
    pub fn power_off(&self) -> anyhow::Result<Receiver<()>> {
        let (tx, rx) = bounded(1);
        self.post(Event::DesiredPower {
            on: false,
            ack: Some(tx),
        })?;
        Ok(rx)
    }

    pub fn snapshot(&self) -> anyhow::Result<EngineSnapshot> {
        let (tx, rx) = bounded(1);
        self.sender
            .send(Command::Snapshot(tx))
            .map_err(|_| anyhow::anyhow!("engine worker has stopped"))?;
        rx.recv_timeout(SNAPSHOT_TIMEOUT)
            .context("engine did not answer snapshot request")
    }
}

pub struct EngineRuntime {
    handle: EngineHandle,
    notifications: Receiver<Notification>,
    worker: Option<thread::JoinHandle<()>>,
}

impl EngineRuntime {
    /// Starts the worker. `make_transport` receives a handle so the
    /// transport can post its completions back onto the queue.
    pub fn spawn<T, F>(config: EngineConfig, make_transport: F) -> anyhow::Result<Self>
    where
        T: BearerTransport + Send + 'static,
        F: FnOnce(EngineHandle) -> T,
    {
        Self::spawn_with_clock(config, Clock::new(), make_transport)
    }

    pub fn spawn_with_clock<T, F>(
        config: EngineConfig,
        clock: Clock,
        make_transport: F,
    ) -> anyhow::Result<Self>
    where
        T: BearerTransport + Send + 'static,
        F: FnOnce(EngineHandle) -> T,
    {
        let (tx, rx) = bounded(COMMAND_QUEUE_DEPTH);
        let (notify_tx, notify_rx) = unbounded();
        let handle = EngineHandle { sender: tx };
        let transport = make_transport(handle.clone());

        let worker = thread::Builder::new()
            .name("conduit-engine".into())
            .spawn(move || {
                let orchestrator = Orchestrator::new(&config, transport, clock.clone());
                engine_worker(orchestrator, rx, notify_tx, clock);
            })
            .context("failed to spawn engine worker")?;

        Ok(Self {
            handle,
            notifications: notify_rx,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    pub fn shutdown(&mut self) {
        let _ = self.handle.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn engine_worker<T: BearerTransport>(
    mut orchestrator: Orchestrator<T>,
    rx: Receiver<Command>,
    notify: Sender<Notification>,
    clock: Clock,
) {
    info!("engine worker started");
    loop {
        let wait = orchestrator
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(clock.now()))
            .unwrap_or(IDLE_WAIT);

        match rx.recv_timeout(wait) {
            Ok(Command::Event(event)) => orchestrator.dispatch(event),
            Ok(Command::Snapshot(reply)) => {
                let _ = reply.send(orchestrator.snapshot());
            }
            Ok(Command::Shutdown) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        orchestrator.fire_due_alarms();
        for notification in orchestrator.drain_notifications() {
            if notify.send(notification).is_err() {
                debug!("notification receiver dropped");
            }
        }
    }
    info!("engine worker stopped");
}
