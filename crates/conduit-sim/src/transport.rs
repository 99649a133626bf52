//! Simulated modem.
//!
//! [`SimTransport`] is the engine-facing half: it forwards connect and
//! disconnect requests onto a channel and returns at once. [`SimModem`]
//! owns the thread on the other end, which decides each outcome, waits
//! the configured latency and posts the completion back to the engine.
//!
//! Outcomes, in order of precedence:
//! 1. the next scripted cause for the profile, if any remain
//! 2. `NoMoreBearers` once the network-side bearer limit is reached
//! 3. a random transient failure with `failure_probability`
//! 4. success

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info};

use conduit_core::failure::FailCause;
use conduit_core::orchestrator::Event;
use conduit_core::runtime::EngineHandle;
use conduit_core::transport::{
    BearerCallState, BearerTransport, ConnectRequest, ConnectionId, DisconnectRequest, LinkState,
    SetupOutcome,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub latency_ms: u64,
    /// Bearers the network will grant at once.
    pub network_bearer_limit: usize,
    pub failure_probability: f64,
    pub seed: u64,
    /// Causes returned, in order, for a profile's first attempts.
    pub scripted: BTreeMap<String, Vec<FailCause>>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency_ms: 20,
            network_bearer_limit: 4,
            failure_probability: 0.0,
            seed: 1,
            scripted: BTreeMap::new(),
        }
    }
}

pub enum ModemRequest {
    Connect(ConnectRequest),
    Disconnect(DisconnectRequest),
    /// Network drops every live bearer without being asked.
    DropAll,
    SetDormant(bool),
    Shutdown,
}

/// Engine-facing half of the simulated modem.
pub struct SimTransport {
    requests: Sender<ModemRequest>,
}

/// Receiving end handed to [`SimModem::spawn`].
pub struct ModemInbox {
    requests: Receiver<ModemRequest>,
    control: Sender<ModemRequest>,
}

impl SimTransport {
    pub fn channel() -> (SimTransport, ModemInbox) {
        let (tx, rx) = unbounded();
        (
            SimTransport {
                requests: tx.clone(),
            },
            ModemInbox {
                requests: rx,
                control: tx,
            },
        )
    }

    fn forward(&self, request: ModemRequest) {
        if self.requests.send(request).is_err() {
            debug!("modem thread has stopped, request dropped");
        }
    }
}

impl BearerTransport for SimTransport {
    fn connect(&mut self, request: ConnectRequest) {
        self.forward(ModemRequest::Connect(request));
    }

    fn disconnect(&mut self, request: DisconnectRequest) {
        self.forward(ModemRequest::Disconnect(request));
    }
}

type EventSink = Box<dyn FnMut(Event) -> anyhow::Result<()> + Send>;

pub struct SimModem {
    control: Sender<ModemRequest>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SimModem {
    pub fn spawn(config: SimConfig, inbox: ModemInbox, engine: EngineHandle) -> anyhow::Result<Self> {
        Self::spawn_with_sink(config, inbox, Box::new(move |event| engine.post(event)))
    }

    pub fn spawn_with_sink(
        config: SimConfig,
        inbox: ModemInbox,
        sink: EventSink,
    ) -> anyhow::Result<Self> {
        let ModemInbox { requests, control } = inbox;
        let worker = thread::Builder::new()
            .name("conduit-sim-modem".into())
            .spawn(move || ModemState::new(config, sink).run(requests))
            .context("failed to spawn modem thread")?;
        Ok(Self {
            control,
            worker: Some(worker),
        })
    }

    pub fn drop_all_bearers(&self) -> anyhow::Result<()> {
        self.send(ModemRequest::DropAll)
    }

    pub fn set_dormant(&self, dormant: bool) -> anyhow::Result<()> {
        self.send(ModemRequest::SetDormant(dormant))
    }

    fn send(&self, request: ModemRequest) -> anyhow::Result<()> {
        self.control
            .send(request)
            .map_err(|_| anyhow::anyhow!("modem thread has stopped"))
    }

    pub fn shutdown(&mut self) {
        let _ = self.control.send(ModemRequest::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SimModem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ModemState {
    latency: Duration,
    limit: usize,
    failure_probability: f64,
    rng: StdRng,
    scripted: HashMap<String, VecDeque<FailCause>>,
    live: BTreeMap<u32, ConnectionId>,
    next_id: u32,
    dormant: bool,
    /// Completions waiting out the latency, oldest first.
    pending: VecDeque<(Instant, Event)>,
    sink: EventSink,
}

impl ModemState {
    fn new(config: SimConfig, sink: EventSink) -> Self {
        Self {
            latency: Duration::from_millis(config.latency_ms),
            limit: config.network_bearer_limit,
            failure_probability: config.failure_probability.clamp(0.0, 1.0),
            rng: StdRng::seed_from_u64(config.seed),
            scripted: config
                .scripted
                .into_iter()
                .map(|(name, causes)| (name, causes.into()))
                .collect(),
            live: BTreeMap::new(),
            next_id: 0,
            dormant: false,
            pending: VecDeque::new(),
            sink,
        }
    }

    fn run(mut self, requests: Receiver<ModemRequest>) {
        info!(latency_ms = self.latency.as_millis() as u64, limit = self.limit, "sim modem started");
        loop {
            let wait = self
                .pending
                .front()
                .map(|(due, _)| due.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(250));

            match requests.recv_timeout(wait) {
                Ok(ModemRequest::Connect(request)) => self.on_connect(request),
                Ok(ModemRequest::Disconnect(request)) => self.on_disconnect(request),
                Ok(ModemRequest::DropAll) => self.on_drop_all(),
                Ok(ModemRequest::SetDormant(dormant)) => {
                    self.dormant = dormant;
                    self.report_bearer_list();
                }
                Ok(ModemRequest::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.flush_due();
        }
        debug!("sim modem stopped");
    }

    fn on_connect(&mut self, request: ConnectRequest) {
        let profile = request.profile.name().to_string();
        let scripted = self
            .scripted
            .get_mut(&profile)
            .and_then(|causes| causes.pop_front());

        let outcome = if let Some(cause) = scripted {
            SetupOutcome::Failed(cause)
        } else if self.live.len() >= self.limit {
            SetupOutcome::Failed(FailCause::NoMoreBearers)
        } else if self.failure_probability > 0.0
            && self.rng.random::<f64>() < self.failure_probability
        {
            SetupOutcome::Failed(FailCause::Unknown)
        } else {
            self.next_id += 1;
            let id = ConnectionId(self.next_id);
            self.live.insert(id.0, id);
            SetupOutcome::Connected(id)
        };

        debug!(
            slot = %request.slot,
            profile = %profile,
            ip_version = %request.ip_version,
            outcome = ?outcome,
            "modem answered connect"
        );
        self.schedule(Event::SetupDone {
            context: request.context,
            outcome,
        });
    }

    fn on_disconnect(&mut self, request: DisconnectRequest) {
        if let Some(id) = request.connection_id {
            self.live.remove(&id.0);
        }
        self.schedule(Event::TeardownDone {
            slot: request.slot,
            reason: request.reason,
        });
    }

    fn on_drop_all(&mut self) {
        info!(bearers = self.live.len(), "network dropping every bearer");
        self.live.clear();
        self.report_bearer_list();
    }

    fn report_bearer_list(&mut self) {
        let link = if self.dormant {
            LinkState::Dormant
        } else {
            LinkState::Up
        };
        let list = self
            .live
            .values()
            .map(|id| BearerCallState {
                connection_id: *id,
                link,
            })
            .collect();
        self.schedule(Event::BearerListChanged(list));
    }

    fn schedule(&mut self, event: Event) {
        self.pending.push_back((Instant::now() + self.latency, event));
    }

    fn flush_due(&mut self) {
        let now = Instant::now();
        while self.pending.front().is_some_and(|(due, _)| *due <= now) {
            if let Some((_, event)) = self.pending.pop_front() {
                if let Err(err) = (self.sink)(event) {
                    debug!(error = %err, "engine gone, dropping completion");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::pool::SlotId;
    use conduit_core::profile::{ProfileRegistry, ProfileSpec, ProfileType};
    use conduit_core::service::{IpVersion, ServiceType};
    use conduit_core::transport::SetupContext;
    use std::sync::{Arc, Mutex};

    fn request(slot: usize, profile: &str) -> ConnectRequest {
        let registry = ProfileRegistry::new(vec![ProfileSpec::new(
            profile,
            ProfileType::Apn,
            &[ServiceType::Default],
        )]);
        let profile = registry.iter().next().cloned().unwrap();
        ConnectRequest {
            slot: SlotId(slot),
            ip_version: IpVersion::V4,
            context: SetupContext {
                service: ServiceType::Default,
                ip_version: IpVersion::V4,
                profile: profile.id,
                slot: SlotId(slot),
                attempt: slot as u64 + 1,
                reason: "test".into(),
            },
            profile,
        }
    }

    fn spawn(config: SimConfig) -> (SimTransport, SimModem, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let (transport, inbox) = SimTransport::channel();
        let modem = SimModem::spawn_with_sink(
            config,
            inbox,
            Box::new(move |event| {
                sink_seen.lock().unwrap().push(event);
                Ok(())
            }),
        )
        .unwrap();
        (transport, modem, seen)
    }

    fn wait_for(seen: &Arc<Mutex<Vec<Event>>>, count: usize) -> Vec<Event> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            let events = seen.lock().unwrap().clone();
            if events.len() >= count {
                return events;
            }
            thread::sleep(Duration::from_millis(5));
        }
        seen.lock().unwrap().clone()
    }

    fn outcome(event: &Event) -> Option<&SetupOutcome> {
        match event {
            Event::SetupDone { outcome, .. } => Some(outcome),
            _ => None,
        }
    }

    #[test]
    fn network_limit_answers_no_more_bearers() {
        let (mut transport, _modem, seen) = spawn(SimConfig {
            latency_ms: 1,
            network_bearer_limit: 1,
            ..Default::default()
        });
        transport.connect(request(0, "internet"));
        transport.connect(request(1, "internet"));

        let events = wait_for(&seen, 2);
        assert!(matches!(
            outcome(&events[0]),
            Some(SetupOutcome::Connected(_))
        ));
        assert_eq!(
            outcome(&events[1]),
            Some(&SetupOutcome::Failed(FailCause::NoMoreBearers))
        );
    }

    #[test]
    fn scripted_causes_come_first() {
        let mut scripted = BTreeMap::new();
        scripted.insert(
            "internet".to_string(),
            vec![FailCause::MissingUnknownApn, FailCause::Unknown],
        );
        let (mut transport, _modem, seen) = spawn(SimConfig {
            latency_ms: 1,
            scripted,
            ..Default::default()
        });
        for slot in 0..3 {
            transport.connect(request(slot, "internet"));
        }

        let events = wait_for(&seen, 3);
        assert_eq!(
            outcome(&events[0]),
            Some(&SetupOutcome::Failed(FailCause::MissingUnknownApn))
        );
        assert_eq!(
            outcome(&events[1]),
            Some(&SetupOutcome::Failed(FailCause::Unknown))
        );
        assert!(matches!(
            outcome(&events[2]),
            Some(SetupOutcome::Connected(_))
        ));
    }

    #[test]
    fn disconnect_frees_network_capacity() {
        let (mut transport, _modem, seen) = spawn(SimConfig {
            latency_ms: 1,
            network_bearer_limit: 1,
            ..Default::default()
        });
        transport.connect(request(0, "internet"));
        let events = wait_for(&seen, 1);
        let Some(SetupOutcome::Connected(id)) = outcome(&events[0]).cloned() else {
            panic!("first connect should succeed");
        };

        transport.disconnect(DisconnectRequest {
            slot: SlotId(0),
            connection_id: Some(id),
            reason: "test".into(),
        });
        transport.connect(request(1, "internet"));
        let events = wait_for(&seen, 3);
        assert!(matches!(events[1], Event::TeardownDone { .. }));
        assert!(matches!(
            outcome(&events[2]),
            Some(SetupOutcome::Connected(_))
        ));
    }

    #[test]
    fn drop_all_reports_empty_bearer_list() {
        let (mut transport, modem, seen) = spawn(SimConfig {
            latency_ms: 1,
            ..Default::default()
        });
        transport.connect(request(0, "internet"));
        wait_for(&seen, 1);
        modem.drop_all_bearers().unwrap();

        let events = wait_for(&seen, 2);
        assert!(matches!(&events[1], Event::BearerListChanged(list) if list.is_empty()));
    }

    #[test]
    fn certain_failure_probability_always_fails() {
        let (mut transport, _modem, seen) = spawn(SimConfig {
            latency_ms: 1,
            failure_probability: 1.0,
            ..Default::default()
        });
        transport.connect(request(0, "internet"));
        let events = wait_for(&seen, 1);
        assert_eq!(
            outcome(&events[0]),
            Some(&SetupOutcome::Failed(FailCause::Unknown))
        );
    }
}
