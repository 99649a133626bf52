//! Timed scenarios replayed against a live engine and simulated modem.
//!
//! ```toml
//! [engine]
//! pool_size = 2
//! [[engine.profiles]]
//! name = "internet"
//! services = ["default"]
//!
//! [sim]
//! latency_ms = 30
//!
//! [[events]]
//! at_ms = 0
//! kind = "radio_on"
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use conduit_core::config::{ConfigError, EngineConfig, EngineConfigInput, ProfileInput};
use conduit_core::orchestrator::{EngineSnapshot, Event, Notification};
use conduit_core::readiness::{RadioTechnology, RecordSource, SubscriptionSource};
use conduit_core::runtime::EngineRuntime;
use conduit_core::service::ServiceType;

use crate::transport::{SimConfig, SimModem, SimTransport};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("invalid scenario TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] ConfigError),
    #[error("failure_probability must be within 0..=1, got {0}")]
    FailureProbability(f64),
    #[error("network_bearer_limit must be at least 1")]
    NoNetworkCapacity,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScenarioInput {
    engine: EngineConfigInput,
    sim: SimConfig,
    events: Vec<EventInput>,
}

#[derive(Debug, Deserialize)]
struct EventInput {
    at_ms: u64,
    #[serde(flatten)]
    action: ActionInput,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ActionInput {
    RadioOn,
    RadioOff,
    DataAttached,
    DataDetached,
    RoamingOn,
    RoamingOff,
    DataRoamingAllowed { allowed: bool },
    PsRestricted { restricted: bool },
    RecordsLoaded { source: RecordSource },
    ProfilesChanged { profiles: Vec<ProfileInput> },
    OtaProvisioned,
    VoiceCallStarted,
    VoiceCallEnded,
    MasterData { enabled: bool },
    ServiceEnabled { service: ServiceType, enabled: bool },
    SetServicePriority { service: ServiceType, priority: i32 },
    Registration { in_service: bool, technology: RadioTechnology },
    SubscriptionSource { source: SubscriptionSource },
    PowerOn,
    PowerOff,
    NetworkDrop,
    Dormant { dormant: bool },
}

/// What a scenario step does once its time comes.
#[derive(Debug, Clone)]
pub enum Action {
    Engine(Event),
    PowerOff,
    NetworkDrop,
    Dormant(bool),
}

#[derive(Debug, Clone)]
pub struct TimedAction {
    pub at: Duration,
    pub action: Action,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub engine: EngineConfig,
    pub sim: SimConfig,
    /// Sorted by time; steps sharing a time keep file order.
    pub steps: Vec<TimedAction>,
}

impl Scenario {
    pub fn from_toml_str(input: &str) -> Result<Self, ScenarioError> {
        let parsed: ScenarioInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Time of the last step.
    pub fn span(&self) -> Duration {
        self.steps.last().map(|s| s.at).unwrap_or_default()
    }
}

impl ScenarioInput {
    fn resolve(self) -> Result<Scenario, ScenarioError> {
        if !(0.0..=1.0).contains(&self.sim.failure_probability) {
            return Err(ScenarioError::FailureProbability(
                self.sim.failure_probability,
            ));
        }
        if self.sim.network_bearer_limit == 0 {
            return Err(ScenarioError::NoNetworkCapacity);
        }
        let engine = self.engine.resolve()?;

        let mut steps = self
            .events
            .into_iter()
            .map(|input| {
                Ok(TimedAction {
                    at: Duration::from_millis(input.at_ms),
                    action: input.action.resolve()?,
                })
            })
            .collect::<Result<Vec<_>, ScenarioError>>()?;
        steps.sort_by_key(|s| s.at);

        Ok(Scenario {
            engine,
            sim: self.sim,
            steps,
        })
    }
}

impl ActionInput {
    fn resolve(self) -> Result<Action, ScenarioError> {
        let event = match self {
            ActionInput::RadioOn => Event::RadioOn,
            ActionInput::RadioOff => Event::RadioOff,
            ActionInput::DataAttached => Event::DataAttached,
            ActionInput::DataDetached => Event::DataDetached,
            ActionInput::RoamingOn => Event::RoamingOn,
            ActionInput::RoamingOff => Event::RoamingOff,
            ActionInput::DataRoamingAllowed { allowed } => Event::DataRoamingAllowed(allowed),
            ActionInput::PsRestricted { restricted } => Event::PsRestricted(restricted),
            ActionInput::RecordsLoaded { source } => Event::RecordsLoaded(source),
            ActionInput::ProfilesChanged { profiles } => {
                let resolved = EngineConfigInput {
                    profiles,
                    ..Default::default()
                }
                .resolve()?;
                Event::ProfilesChanged(resolved.profiles)
            }
            ActionInput::OtaProvisioned => Event::OtaProvisioned,
            ActionInput::VoiceCallStarted => Event::VoiceCallStarted,
            ActionInput::VoiceCallEnded => Event::VoiceCallEnded,
            ActionInput::MasterData { enabled } => Event::MasterData(enabled),
            ActionInput::ServiceEnabled { service, enabled } => {
                Event::ServiceEnabled { service, enabled }
            }
            ActionInput::SetServicePriority { service, priority } => {
                Event::SetServicePriority { service, priority }
            }
            ActionInput::Registration {
                in_service,
                technology,
            } => Event::Registration {
                in_service,
                technology,
            },
            ActionInput::SubscriptionSource { source } => Event::SubscriptionSource(source),
            ActionInput::PowerOn => Event::DesiredPower { on: true, ack: None },
            ActionInput::PowerOff => return Ok(Action::PowerOff),
            ActionInput::NetworkDrop => return Ok(Action::NetworkDrop),
            ActionInput::Dormant { dormant } => return Ok(Action::Dormant(dormant)),
        };
        Ok(Action::Engine(event))
    }
}

/// Outcome of one scenario run.
#[derive(Debug)]
pub struct RunReport {
    pub notifications: Vec<Notification>,
    pub power_off_acked: bool,
    pub snapshot: EngineSnapshot,
}

/// Plays `scenario` in real time for `duration` (or until `stop` is set).
pub fn run(
    scenario: Scenario,
    duration: Duration,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<RunReport> {
    let (transport, inbox) = SimTransport::channel();
    let runtime = EngineRuntime::spawn(scenario.engine, move |_| transport)?;
    let handle = runtime.handle();
    let modem = SimModem::spawn(scenario.sim, inbox, runtime.handle())?;

    let mut notifications = Vec::new();
    let mut power_acks: Vec<Receiver<()>> = Vec::new();
    let mut power_off_acked = false;
    let started = Instant::now();
    let end = started + duration;

    let mut steps = scenario.steps.into_iter().peekable();
    loop {
        if stop.load(Ordering::Relaxed) {
            warn!("stopped early");
            break;
        }
        let now = Instant::now();
        if now >= end {
            break;
        }

        while let Some(step) = steps.next_if(|s| started + s.at <= now) {
            info!(at_ms = step.at.as_millis() as u64, action = ?step.action, "scenario step");
            match step.action {
                Action::Engine(event) => handle.post(event)?,
                Action::PowerOff => power_acks.push(handle.power_off()?),
                Action::NetworkDrop => modem.drop_all_bearers()?,
                Action::Dormant(dormant) => modem.set_dormant(dormant)?,
            }
        }

        let next_step = steps.peek().map(|s| started + s.at).unwrap_or(end);
        let wait = next_step
            .min(end)
            .saturating_duration_since(Instant::now())
            .min(POLL_INTERVAL);
        if let Ok(notification) = runtime.notifications().recv_timeout(wait) {
            log_notification(&notification);
            notifications.push(notification);
        }

        power_acks.retain(|ack| {
            if ack.try_recv().is_ok() {
                info!("power off acknowledged");
                power_off_acked = true;
                false
            } else {
                true
            }
        });
    }

    while let Ok(notification) = runtime.notifications().try_recv() {
        log_notification(&notification);
        notifications.push(notification);
    }
    let snapshot = handle.snapshot()?;

    drop(runtime);
    drop(modem);

    Ok(RunReport {
        notifications,
        power_off_acked,
        snapshot,
    })
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::BindingState {
            service,
            ip_version,
            state,
            reason,
        } => info!(service = %service, ip_version = %ip_version, state = ?state, reason = %reason, "binding"),
        Notification::ConnectivityFailed { reason } => {
            warn!(reason = %reason, "data connectivity failed")
        }
        Notification::DataActivity { activity } => info!(activity = ?activity, "data activity"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::failure::FailCause;

    #[test]
    fn parses_events_and_sorts_them() {
        let toml = r#"
            [engine]
            pool_size = 1
            [[engine.profiles]]
            name = "internet"
            services = ["default"]

            [sim]
            latency_ms = 5
            [sim.scripted]
            internet = ["missing_unknown_apn"]

            [[events]]
            at_ms = 200
            kind = "service_enabled"
            service = "mms"
            enabled = true

            [[events]]
            at_ms = 0
            kind = "registration"
            in_service = true
            technology = "lte"

            [[events]]
            at_ms = 0
            kind = "records_loaded"
            source = "sim"

            [[events]]
            at_ms = 300
            kind = "power_off"
        "#;
        let scenario = Scenario::from_toml_str(toml).unwrap();
        assert_eq!(scenario.engine.pool_size, 1);
        assert_eq!(
            scenario.sim.scripted["internet"],
            vec![FailCause::MissingUnknownApn]
        );
        assert_eq!(scenario.steps.len(), 4);
        assert!(matches!(
            scenario.steps[0].action,
            Action::Engine(Event::Registration { .. })
        ));
        assert!(matches!(
            scenario.steps[1].action,
            Action::Engine(Event::RecordsLoaded(RecordSource::Sim))
        ));
        assert!(matches!(scenario.steps[3].action, Action::PowerOff));
        assert_eq!(scenario.span(), Duration::from_millis(300));
    }

    #[test]
    fn profile_reload_is_validated() {
        let toml = r#"
            [[events]]
            at_ms = 10
            kind = "profiles_changed"
            profiles = [{ name = "a", services = ["wap"] }]
        "#;
        assert!(matches!(
            Scenario::from_toml_str(toml),
            Err(ScenarioError::Engine(ConfigError::UnknownService(_)))
        ));
    }

    #[test]
    fn rejects_bad_sim_settings() {
        assert!(matches!(
            Scenario::from_toml_str("[sim]\nfailure_probability = 1.5"),
            Err(ScenarioError::FailureProbability(_))
        ));
        assert!(matches!(
            Scenario::from_toml_str("[sim]\nnetwork_bearer_limit = 0"),
            Err(ScenarioError::NoNetworkCapacity)
        ));
        assert!(matches!(
            Scenario::from_toml_str("[[events]]\nat_ms = 1\nkind = \"warp\""),
            Err(ScenarioError::Toml(_))
        ));
    }
}
