//! # Orchestrator
//!
//! Owns the service registry, profile registry and bearer pool, and makes
//! reality match the desired state one reconcile pass at a time.
//!
//! Every stimulus (external signal, transport completion, retry alarm) is
//! an [`Event`] appended to a single FIFO queue and handled to completion
//! before the next one. A handler that wants another pass appends a
//! follow-up [`Event::Reconcile`] rather than recursing, so passes never
//! nest.
//!
//! ## Reconcile pass
//!
//! 1. Teardown: clear bindings that point at inactive bearers; disconnect
//!    active bearers no enabled service claims (or all of them while a
//!    disconnect-all is pending). If anything is being torn down, stop.
//! 2. Finish a pending disconnect-all and fire the power-off ack.
//! 3. Readiness gate.
//! 4. Setup: in descending priority, issue at most one connect (or one
//!    pre-emptive disconnect) and stop. The transport completion drives
//!    the next pass.
//! 5. Nothing active, something enabled, nothing started: report overall
//!    connectivity failure.

use std::collections::VecDeque;
use std::time::Duration;

use quanta::{Clock, Instant};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::failure::{FailCause, FailureClass};
use crate::pool::{BearerSnapshot, BearerState, ConnectionPool, SlotId};
use crate::profile::{Profile, ProfileRegistry, ProfileSpec, ProfileType};
use crate::readiness::{RadioTechnology, ReadinessSignals, RecordSource, SubscriptionSource};
use crate::registry::{BindingSnapshot, BindingState, ServiceStateRegistry};
use crate::service::{IpVersion, ServiceType};
use crate::transport::{BearerCallState, BearerTransport, LinkState, SetupContext, SetupOutcome};

/// Reason strings attached to passes, notifications and transport calls.
pub mod reason {
    pub const RADIO_ON: &str = "radio-on";
    pub const RADIO_TURNED_OFF: &str = "radio-turned-off";
    pub const POWER_ON: &str = "power-on";
    pub const DATA_ATTACHED: &str = "data-attached";
    pub const ROAMING_ON: &str = "roaming-on";
    pub const ROAMING_OFF: &str = "roaming-off";
    pub const ROAMING_SETTING_CHANGED: &str = "roaming-setting-changed";
    pub const PS_RESTRICT_DISABLED: &str = "ps-restrict-disabled";
    pub const RECORDS_LOADED: &str = "records-loaded";
    pub const PROFILE_DB_CHANGED: &str = "profile-db-changed";
    pub const OTA_PROVISIONED: &str = "ota-provisioned";
    pub const VOICE_CALL_STARTED: &str = "voice-call-started";
    pub const VOICE_CALL_ENDED: &str = "voice-call-ended";
    pub const MASTER_DATA_DISABLED: &str = "master-data-disabled";
    pub const MASTER_DATA_ENABLED: &str = "master-data-enabled";
    pub const SERVICE_ENABLED: &str = "service-enabled";
    pub const SERVICE_DISABLED: &str = "service-disabled";
    pub const PRIORITY_CHANGED: &str = "priority-changed";
    pub const REGISTRATION_CHANGED: &str = "registration-changed";
    pub const SUBSCRIPTION_CHANGED: &str = "subscription-changed";
    pub const NETWORK_DISCONNECT: &str = "network-disconnect";
}

/// Acknowledgement channel for a power-off request; receives one `()`
/// once every bearer is down.
pub type PowerAck = crossbeam_channel::Sender<()>;

/// Inputs to the engine.
#[derive(Debug, Clone)]
pub enum Event {
    Reconcile { reason: String },
    ReconnectAlarm { reason: String },
    SetupDone { context: SetupContext, outcome: SetupOutcome },
    TeardownDone { slot: SlotId, reason: String },
    BearerListChanged(Vec<BearerCallState>),
    RadioOn,
    RadioOff,
    DataAttached,
    DataDetached,
    RoamingOn,
    RoamingOff,
    DataRoamingAllowed(bool),
    PsRestricted(bool),
    RecordsLoaded(RecordSource),
    ProfilesChanged(Vec<ProfileSpec>),
    OtaProvisioned,
    VoiceCallStarted,
    VoiceCallEnded,
    MasterData(bool),
    ServiceEnabled { service: ServiceType, enabled: bool },
    SetServicePriority { service: ServiceType, priority: i32 },
    Registration { in_service: bool, technology: RadioTechnology },
    SubscriptionSource(SubscriptionSource),
    DesiredPower { on: bool, ack: Option<PowerAck> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    None,
    Dormant,
}

/// Outputs of the engine, drained by whoever hosts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    BindingState {
        service: ServiceType,
        ip_version: IpVersion,
        state: BindingState,
        reason: String,
    },
    ConnectivityFailed {
        reason: String,
    },
    DataActivity {
        activity: Activity,
    },
}

#[derive(Debug, Clone)]
struct Backoff {
    deadline: Instant,
    reason: String,
}

/// Result of trying to bring up one (service, IP version).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupAttempt {
    Started,
    Preempting,
    PoolExhausted,
    NoProfile,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub ready: bool,
    pub signals: ReadinessSignals,
    pub disconnect_all_pending: bool,
    pub next_retry_in_ms: Option<u64>,
    pub bindings: Vec<BindingSnapshot>,
    pub bearers: Vec<BearerSnapshot>,
}

impl EngineSnapshot {
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub struct Orchestrator<T: BearerTransport> {
    ip_versions: Vec<IpVersion>,
    registry: ServiceStateRegistry,
    profiles: ProfileRegistry,
    pool: ConnectionPool,
    signals: ReadinessSignals,
    transport: T,
    clock: Clock,
    queue: VecDeque<Event>,
    outbox: Vec<Notification>,
    backoff: [Option<Backoff>; ServiceType::COUNT],
    disconnect_all: bool,
    pending_power_ack: Option<PowerAck>,
    connectivity_failure_reported: bool,
    last_activity: Option<Activity>,
}

impl<T: BearerTransport> Orchestrator<T> {
    pub fn new(config: &EngineConfig, transport: T, clock: Clock) -> Self {
        let mut registry =
            ServiceStateRegistry::new(config.priorities.clone(), |ds| config.schedule_for(ds), config.seed);
        registry.set_enabled(ServiceType::Default, !config.data_disabled_on_boot);

        let signals = ReadinessSignals {
            roaming_allowed: config.data_roaming_allowed,
            no_auto_attach: config.data_disabled_on_boot,
            ehrpd_capable: config.ehrpd_capable,
            ..Default::default()
        };

        info!(
            pool_size = config.pool_size,
            profiles = config.profiles.len(),
            ip_versions = ?config.ip_versions,
            "orchestrator created"
        );

        Self {
            ip_versions: config.ip_versions.clone(),
            registry,
            profiles: ProfileRegistry::new(config.profiles.clone()),
            pool: ConnectionPool::new(config.pool_size),
            signals,
            transport,
            clock,
            queue: VecDeque::new(),
            outbox: Vec::new(),
            backoff: Default::default(),
            disconnect_all: false,
            pending_power_ack: None,
            connectivity_failure_reported: false,
            last_activity: None,
        }
    }

    // ─── Entry points ───────────────────────────────────────────────────

    /// Queues `event` and handles it, plus every follow-up it causes.
    pub fn dispatch(&mut self, event: Event) {
        self.queue.push_back(event);
        while let Some(event) = self.queue.pop_front() {
            self.handle(event);
        }
    }

    pub fn reconcile(&mut self, reason: &str) {
        self.dispatch(Event::Reconcile {
            reason: reason.to_string(),
        });
    }

    /// Earliest pending retry alarm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.backoff.iter().flatten().map(|b| b.deadline).min()
    }

    /// Fires every retry alarm whose deadline has passed.
    pub fn fire_due_alarms(&mut self) {
        let now = self.clock.now();
        for ds in ServiceType::ALL {
            let due = self.backoff[ds.index()]
                .as_ref()
                .is_some_and(|b| b.deadline <= now);
            if due {
                if let Some(backoff) = self.backoff[ds.index()].take() {
                    debug!(service = %ds, reason = %backoff.reason, "retry alarm fired");
                    self.queue.push_back(Event::ReconnectAlarm {
                        reason: backoff.reason,
                    });
                }
            }
        }
        while let Some(event) = self.queue.pop_front() {
            self.handle(event);
        }
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.outbox)
    }

    pub fn registry(&self) -> &ServiceStateRegistry {
        &self.registry
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.profiles
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn signals(&self) -> &ReadinessSignals {
        &self.signals
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_disconnect_all_pending(&self) -> bool {
        self.disconnect_all
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let now = self.clock.now();
        EngineSnapshot {
            ready: self.signals.is_ready(),
            signals: self.signals.clone(),
            disconnect_all_pending: self.disconnect_all,
            next_retry_in_ms: self
                .next_deadline()
                .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            bindings: self.registry.snapshot(),
            bearers: self.pool.snapshot(),
        }
    }

    // ─── Event handling ─────────────────────────────────────────────────

    fn handle(&mut self, event: Event) {
        match event {
            Event::Reconcile { reason } | Event::ReconnectAlarm { reason } => {
                self.run_reconcile(&reason)
            }
            Event::SetupDone { context, outcome } => self.on_setup_done(context, outcome),
            Event::TeardownDone { slot, reason } => self.on_teardown_done(slot, &reason),
            Event::BearerListChanged(list) => self.on_bearer_list_changed(&list),
            Event::RadioOn => {
                self.signals.radio_on = true;
                self.reset_all();
                self.request_reconcile(reason::RADIO_ON);
            }
            Event::RadioOff => {
                self.signals.radio_on = false;
                self.reset_all();
            }
            Event::DataAttached => {
                self.signals.in_service = true;
                self.reset_all();
                self.request_reconcile(reason::DATA_ATTACHED);
            }
            Event::DataDetached => {
                // bearers drop one by one; each loss triggers its own pass
                debug!("data detached");
            }
            Event::RoamingOn => {
                self.signals.roaming = true;
                if !self.signals.roaming_allowed {
                    self.disconnect_all = true;
                }
                self.request_reconcile(reason::ROAMING_ON);
            }
            Event::RoamingOff => {
                self.signals.roaming = false;
                self.reset_all();
                self.request_reconcile(reason::ROAMING_OFF);
            }
            Event::DataRoamingAllowed(allowed) => {
                self.signals.roaming_allowed = allowed;
                if self.signals.roaming && !allowed {
                    self.disconnect_all = true;
                }
                self.request_reconcile(reason::ROAMING_SETTING_CHANGED);
            }
            Event::PsRestricted(true) => {
                // the baseband deactivates bearers itself and reports it
                info!("PS restrict enabled");
                self.signals.ps_restricted = true;
            }
            Event::PsRestricted(false) => {
                info!("PS restrict disabled");
                self.signals.ps_restricted = false;
                self.request_reconcile(reason::PS_RESTRICT_DISABLED);
            }
            Event::RecordsLoaded(source) => {
                match source {
                    RecordSource::Sim => self.signals.sim_records_loaded = true,
                    RecordSource::Ruim => self.signals.ruim_records_loaded = true,
                }
                self.reset_all();
                self.request_reconcile(reason::RECORDS_LOADED);
            }
            Event::ProfilesChanged(specs) => {
                info!(profiles = specs.len(), "profile database changed");
                self.profiles.reload(specs);
                self.reset_all();
                self.disconnect_all_bearers(reason::PROFILE_DB_CHANGED);
            }
            Event::OtaProvisioned => {
                self.reset_all();
                self.request_reconcile(reason::OTA_PROVISIONED);
            }
            Event::VoiceCallStarted => self.request_reconcile(reason::VOICE_CALL_STARTED),
            Event::VoiceCallEnded => {
                self.reset_all();
                self.request_reconcile(reason::VOICE_CALL_ENDED);
            }
            Event::MasterData(false) => {
                self.signals.master_data_enabled = false;
                self.disconnect_all_bearers(reason::MASTER_DATA_DISABLED);
            }
            Event::MasterData(true) => {
                self.signals.master_data_enabled = true;
                self.reset_all();
                self.request_reconcile(reason::MASTER_DATA_ENABLED);
            }
            Event::ServiceEnabled {
                service,
                enabled: true,
            } => {
                info!(service = %service, "service enabled");
                self.registry.set_enabled(service, true);
                self.profiles.reset_all_working();
                self.registry.reset_service(service);
                self.backoff[service.index()] = None;
                self.request_reconcile(reason::SERVICE_ENABLED);
            }
            Event::ServiceEnabled {
                service,
                enabled: false,
            } => {
                info!(service = %service, "service disabled");
                self.registry.set_enabled(service, false);
                self.request_reconcile(reason::SERVICE_DISABLED);
            }
            Event::SetServicePriority { service, priority } => {
                info!(service = %service, priority, "service priority changed");
                self.registry.set_priority(service, priority);
                self.request_reconcile(reason::PRIORITY_CHANGED);
            }
            Event::Registration {
                in_service,
                technology,
            } => {
                self.signals.in_service = in_service;
                self.signals.technology = technology;
                self.request_reconcile(reason::REGISTRATION_CHANGED);
            }
            Event::SubscriptionSource(source) => {
                self.signals.subscription_source = source;
                self.request_reconcile(reason::SUBSCRIPTION_CHANGED);
            }
            Event::DesiredPower { on, ack } => self.on_desired_power(on, ack),
        }
    }

    fn request_reconcile(&mut self, reason: &str) {
        self.queue.push_back(Event::Reconcile {
            reason: reason.to_string(),
        });
    }

    fn disconnect_all_bearers(&mut self, reason: &str) {
        self.disconnect_all = true;
        self.request_reconcile(reason);
    }

    /// Gives every profile and service a fair chance again.
    fn reset_all(&mut self) {
        self.profiles.reset_all_working();
        self.registry.reset_all();
        self.backoff = Default::default();
        self.connectivity_failure_reported = false;
    }

    fn on_desired_power(&mut self, on: bool, ack: Option<PowerAck>) {
        self.signals.desired_power = on;
        self.pending_power_ack = None;

        if !on && self.signals.technology != RadioTechnology::OneXRtt {
            self.pending_power_ack = ack;
            self.disconnect_all_bearers(reason::RADIO_TURNED_OFF);
            return;
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
        if on {
            self.request_reconcile(reason::POWER_ON);
        }
    }

    // ─── Reconcile ──────────────────────────────────────────────────────

    fn run_reconcile(&mut self, reason: &str) {
        debug!(reason, "reconcile pass");

        // Phase 1: teardown
        let mut teardown_pending = false;
        let mut any_active = false;
        for slot in (0..self.pool.capacity()).map(SlotId) {
            let Some((state, ip_version)) = self.pool.get(slot).map(|b| (b.state, b.ip_version))
            else {
                continue;
            };
            match state {
                BearerState::Inactive => {
                    for (ds, ipv) in self.registry.bound_to(slot) {
                        debug!(service = %ds, ip_version = %ipv, slot = %slot, "clearing stale binding");
                        self.set_inactive_and_notify(ds, ipv, reason);
                    }
                }
                BearerState::Active => {
                    any_active = true;
                    let Some(ipv) = ip_version else {
                        continue;
                    };
                    let unclaimed = !self.registry.is_claimed(slot, ipv);
                    if unclaimed || self.disconnect_all {
                        info!(slot = %slot, ip_version = %ipv, unclaimed, reason, "tearing down bearer");
                        teardown_pending |= self.pool.disconnect(slot, reason, &mut self.transport);
                    }
                }
                BearerState::Disconnecting => teardown_pending = true,
                BearerState::Connecting => {}
            }
        }
        if teardown_pending {
            debug!("waiting for teardown before any setup");
            return;
        }

        // Phase 2: disconnect-all drained
        if self.disconnect_all {
            if self.pool.any_in(BearerState::Connecting) {
                debug!("disconnect-all waiting for in-flight setup");
                return;
            }
            self.disconnect_all = false;
            if let Some(ack) = self.pending_power_ack.take() {
                info!("all bearers down, acknowledging power off");
                let _ = ack.send(());
            }
        }

        // Phase 3: readiness
        if !self.signals.is_ready() {
            let s = &self.signals;
            info!(
                radio_on = s.radio_on,
                desired_power = s.desired_power,
                in_service = s.in_service,
                technology = ?s.technology,
                roaming = s.roaming,
                roaming_allowed = s.roaming_allowed,
                sim_loaded = s.sim_records_loaded,
                ruim_loaded = s.ruim_records_loaded,
                ps_restricted = s.ps_restricted,
                master_data_enabled = s.master_data_enabled,
                "not ready for data"
            );
            return;
        }

        // Phase 4: setup, one at a time in priority order
        if self.pool.any_in(BearerState::Connecting) {
            debug!("setup already in flight");
            return;
        }
        let now = self.clock.now();
        let mut any_enabled = false;
        let mut retry_pending = false;
        for ds in self.registry.priorities().sorted_descending() {
            if !self.registry.is_enabled(ds) {
                continue;
            }
            any_enabled = true;
            self.adopt_shared_bearers(ds, reason);

            if let Some(backoff) = &self.backoff[ds.index()] {
                if backoff.deadline > now {
                    debug!(service = %ds, "in retry backoff, skipping");
                    retry_pending = true;
                    continue;
                }
            }

            for ipv in self.ip_versions.clone() {
                if self.registry.is_active_on(ds, ipv) {
                    continue;
                }
                match self.try_setup(ds, ipv, reason) {
                    SetupAttempt::Started | SetupAttempt::Preempting | SetupAttempt::PoolExhausted => {
                        return;
                    }
                    SetupAttempt::NoProfile => {}
                }
            }
        }

        // Phase 5: a scheduled retry is still an attempt
        if !any_active && any_enabled && !retry_pending {
            self.report_connectivity_failure(reason);
        }
    }

    /// Binds `ds` to any active bearer whose profile can also carry it.
    fn adopt_shared_bearers(&mut self, ds: ServiceType, reason: &str) {
        for ipv in self.ip_versions.clone() {
            if self.registry.is_active_on(ds, ipv) {
                continue;
            }
            let shared = self
                .pool
                .iter()
                .find(|b| b.can_serve(ds, ipv))
                .map(|b| b.id);
            if let Some(slot) = shared {
                debug!(service = %ds, ip_version = %ipv, slot = %slot, "sharing active bearer");
                if self.registry.set_active(ds, slot, ipv) {
                    self.notify_state(ds, ipv, BindingState::Connected, reason);
                }
            }
        }
    }

    fn next_profile_for(&self, ds: ServiceType, ipv: IpVersion) -> Option<&Profile> {
        self.profiles
            .next_working(ds, self.signals.profile_type_hint(), ipv)
            .or_else(|| {
                if self.signals.allows_nai_fallback() {
                    self.profiles.next_working(ds, Some(ProfileType::Nai), ipv)
                } else {
                    None
                }
            })
    }

    fn try_setup(&mut self, ds: ServiceType, ipv: IpVersion, reason: &str) -> SetupAttempt {
        let Some(profile) = self.next_profile_for(ds, ipv).cloned() else {
            warn!(service = %ds, ip_version = %ipv, "no working profile available");
            self.update_state(ds, ipv, BindingState::Failed, reason);
            if ds.is_baseline() && !self.registry.is_active(ds) {
                self.retry_baseline_forever(ds, ipv, reason);
            }
            return SetupAttempt::NoProfile;
        };

        let Some(slot) = self.pool.find_free_slot() else {
            self.update_state(ds, ipv, BindingState::Scanning, reason);
            if self.disconnect_one_lower_priority(ds, reason) {
                return SetupAttempt::Preempting;
            }
            debug!(service = %ds, ip_version = %ipv, "bearer pool exhausted, nothing to pre-empt");
            return SetupAttempt::PoolExhausted;
        };

        self.update_state(ds, ipv, BindingState::Connecting, reason);
        self.registry.set_last_profile(ds, ipv, profile.id);
        info!(
            service = %ds,
            ip_version = %ipv,
            profile = %profile.short_name(),
            slot = %slot,
            reason,
            "setting up bearer"
        );
        match self
            .pool
            .connect(slot, &profile, ipv, ds, reason, &mut self.transport)
        {
            Some(_) => SetupAttempt::Started,
            None => SetupAttempt::PoolExhausted,
        }
    }

    /// Disconnects exactly one bearer of an enabled, strictly lower
    /// priority service, least important first. Bearers shared with a
    /// service at or above `ds` are left alone.
    fn disconnect_one_lower_priority(&mut self, ds: ServiceType, reason: &str) -> bool {
        let priorities = self.registry.priorities().clone();
        let mut victims = priorities.sorted_descending();
        victims.reverse();

        for victim in victims {
            if !priorities.is_lower(victim, ds)
                || !self.registry.is_enabled(victim)
                || !self.registry.is_active(victim)
            {
                continue;
            }
            for ipv in IpVersion::ALL {
                let Some(slot) = self.registry.active_bearer(victim, ipv) else {
                    continue;
                };
                let shared_upward = self.registry.bound_to(slot).iter().any(|(other, _)| {
                    self.registry.is_enabled(*other) && !priorities.is_lower(*other, ds)
                });
                if shared_upward {
                    continue;
                }
                if self.pool.disconnect(slot, reason, &mut self.transport) {
                    info!(
                        service = %ds,
                        victim = %victim,
                        ip_version = %ipv,
                        slot = %slot,
                        "pre-empting lower priority bearer"
                    );
                    return true;
                }
            }
        }
        false
    }

    // ─── Transport completions ──────────────────────────────────────────

    fn on_setup_done(&mut self, context: SetupContext, outcome: SetupOutcome) {
        if !self.pool.is_current(&context) {
            warn!(slot = %context.slot, service = %context.service, "dropping stale setup result");
            return;
        }
        let ds = context.service;
        let ipv = context.ip_version;
        let profile_name = self
            .profiles
            .get(context.profile)
            .map(|p| p.short_name())
            .unwrap_or_else(|| context.profile.to_string());

        match outcome {
            SetupOutcome::Connected(connection_id) => {
                self.pool.mark_connected(&context, connection_id);
                info!(
                    service = %ds,
                    ip_version = %ipv,
                    profile = %profile_name,
                    slot = %context.slot,
                    connection_id = connection_id.0,
                    "bearer setup succeeded"
                );
                // claim it now or the teardown pass would reap it
                if self.registry.set_active(ds, context.slot, ipv) {
                    self.notify_state(ds, ipv, BindingState::Connected, &context.reason);
                }
                self.connectivity_failure_reported = false;
                self.request_reconcile(&context.reason);
            }
            SetupOutcome::Failed(cause) => {
                self.pool.mark_setup_failed(&context);
                info!(
                    service = %ds,
                    ip_version = %ipv,
                    profile = %profile_name,
                    cause = %cause,
                    "bearer setup failed"
                );
                if cause.is_event_loggable() {
                    warn!(
                        service = %ds,
                        ip_version = %ipv,
                        profile = %profile_name,
                        cause = %cause,
                        technology = ?self.signals.technology,
                        "network rejected bearer setup"
                    );
                }
                if self.handle_setup_failure(&context, cause) {
                    self.request_reconcile(&context.reason);
                }
            }
        }
    }

    /// Applies the remedy for `cause`. Returns whether a follow-up pass
    /// should run right away.
    fn handle_setup_failure(&mut self, context: &SetupContext, cause: FailCause) -> bool {
        let ds = context.service;
        let ipv = context.ip_version;
        let reason = context.reason.as_str();

        match cause.classify() {
            FailureClass::IpVersionUnsupported
            | FailureClass::ProfileRejected
            | FailureClass::PermanentProfileFailure => {
                self.profiles.set_working(context.profile, false, ipv);
                self.update_state(ds, ipv, BindingState::Scanning, reason);
                true
            }
            // only resource exhaustion pre-empts; other causes keep to their class
            FailureClass::ResourceExhausted => {
                if self.disconnect_one_lower_priority(ds, reason) {
                    // teardown completion drives the next pass
                    self.update_state(ds, ipv, BindingState::Scanning, reason);
                    false
                } else {
                    self.handle_transient_failure(context)
                }
            }
            FailureClass::Transient => self.handle_transient_failure(context),
        }
    }

    fn handle_transient_failure(&mut self, context: &SetupContext) -> bool {
        let ds = context.service;
        let ipv = context.ip_version;
        let reason = context.reason.as_str();

        let retry = self.registry.retry_manager(ds);
        if retry.is_retry_needed() {
            let delay = retry.retry_timer();
            retry.increase_retry_count();
            self.update_state(ds, ipv, BindingState::Scanning, reason);
            self.schedule_retry(ds, delay, reason);
            return false;
        }

        self.profiles.set_working(context.profile, false, ipv);
        if self.next_profile_for(ds, ipv).is_some() {
            self.update_state(ds, ipv, BindingState::Scanning, reason);
            return true;
        }

        if !ds.is_baseline() {
            self.update_state(ds, ipv, BindingState::Failed, reason);
            if !self.registry.is_active(ds) {
                info!(service = %ds, "profiles exhausted, disabling service");
                self.registry.set_enabled(ds, false);
            }
            return true;
        }

        // the baseline service never gives up: keep retrying its last profile
        self.profiles.set_working(context.profile, true, ipv);
        self.update_state(ds, ipv, BindingState::Failed, reason);
        self.report_connectivity_failure(reason);
        let retry = self.registry.retry_manager(ds);
        retry.retry_forever_using_last_timeout();
        let delay = retry.retry_timer();
        retry.increase_retry_count();
        self.schedule_retry(ds, delay, reason);
        false
    }

    /// Baseline service found no working profile during setup: revive the
    /// last one it tried and retry it at a fixed interval.
    fn retry_baseline_forever(&mut self, ds: ServiceType, ipv: IpVersion, reason: &str) {
        let Some(last) = self.registry.binding(ds, ipv).last_profile else {
            return;
        };
        if !self.profiles.set_working(last, true, ipv) {
            return;
        }
        self.report_connectivity_failure(reason);
        let retry = self.registry.retry_manager(ds);
        retry.retry_forever_using_last_timeout();
        let delay = retry.retry_timer();
        retry.increase_retry_count();
        self.schedule_retry(ds, delay, reason);
    }

    fn schedule_retry(&mut self, ds: ServiceType, delay: Duration, reason: &str) {
        info!(
            service = %ds,
            delay_ms = delay.as_millis() as u64,
            forever = self.registry.retry(ds).is_forever(),
            "scheduling retry"
        );
        self.backoff[ds.index()] = Some(Backoff {
            deadline: self.clock.now() + delay,
            reason: reason.to_string(),
        });
    }

    fn on_teardown_done(&mut self, slot: SlotId, reason: &str) {
        debug!(slot = %slot, reason, "teardown complete");
        self.pool.mark_inactive(slot);
        self.request_reconcile(reason);
    }

    fn on_bearer_list_changed(&mut self, list: &[BearerCallState]) {
        let mut lost = false;
        let mut dormant = true;

        let active: Vec<_> = self
            .pool
            .iter()
            .filter(|b| b.is_active())
            .map(|b| (b.id, b.connection_id))
            .collect();
        for (slot, connection_id) in active {
            let reported = connection_id
                .and_then(|cid| list.iter().find(|s| s.connection_id == cid))
                .map(|s| s.link);
            match reported {
                None | Some(LinkState::Inactive) => {
                    info!(slot = %slot, link = ?reported, "bearer dropped by network");
                    self.pool.mark_inactive(slot);
                    lost = true;
                }
                Some(LinkState::Up) => dormant = false,
                Some(LinkState::Dormant) => {}
            }
        }

        if lost {
            self.request_reconcile(reason::NETWORK_DISCONNECT);
        }

        let activity = if dormant {
            Activity::Dormant
        } else {
            Activity::None
        };
        if self.last_activity != Some(activity) {
            self.last_activity = Some(activity);
            self.outbox.push(Notification::DataActivity { activity });
        }
    }

    // ─── State + notifications ──────────────────────────────────────────

    fn update_state(&mut self, ds: ServiceType, ipv: IpVersion, state: BindingState, reason: &str) {
        if self.registry.set_state(ds, ipv, state) {
            self.notify_state(ds, ipv, state, reason);
        }
    }

    fn set_inactive_and_notify(&mut self, ds: ServiceType, ipv: IpVersion, reason: &str) {
        if self.registry.set_inactive(ds, ipv) {
            self.notify_state(ds, ipv, BindingState::Idle, reason);
        }
    }

    fn notify_state(&mut self, ds: ServiceType, ipv: IpVersion, state: BindingState, reason: &str) {
        debug!(service = %ds, ip_version = %ipv, state = ?state, reason, "binding state changed");
        self.outbox.push(Notification::BindingState {
            service: ds,
            ip_version: ipv,
            state,
            reason: reason.to_string(),
        });
    }

    fn report_connectivity_failure(&mut self, reason: &str) {
        if self.connectivity_failure_reported {
            return;
        }
        self.connectivity_failure_reported = true;
        warn!(reason, "data connectivity failed");
        self.outbox.push(Notification::ConnectivityFailed {
            reason: reason.to_string(),
        });
    }
}
