//! # Service State Registry
//!
//! Per service: the enabled flag, priority and retry backoff. Per
//! (service, IP version): the binding state and which bearer slot, if
//! any, currently satisfies it.

use serde::Serialize;

use crate::pool::SlotId;
use crate::profile::ProfileId;
use crate::retry::{RetryManager, RetrySchedule};
use crate::service::{IpVersion, ServicePriorities, ServiceType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Failed,
}

/// Tracking unit for one (service, IP version) pair.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    pub state: BindingState,
    pub bearer: Option<SlotId>,
    /// Profile of the most recent setup attempt.
    pub last_profile: Option<ProfileId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindingSnapshot {
    pub service: ServiceType,
    pub ip_version: IpVersion,
    pub enabled: bool,
    pub priority: i32,
    pub state: BindingState,
    pub bearer: Option<SlotId>,
    pub retry_attempts: u32,
    pub retry_forever: bool,
}

#[derive(Debug)]
pub struct ServiceStateRegistry {
    enabled: [bool; ServiceType::COUNT],
    bindings: [[Binding; 2]; ServiceType::COUNT],
    retry: Vec<RetryManager>,
    priorities: ServicePriorities,
}

impl ServiceStateRegistry {
    /// `schedule_for` supplies each service's backoff schedule; `seed`
    /// makes the retry jitter reproducible.
    pub fn new(
        priorities: ServicePriorities,
        schedule_for: impl Fn(ServiceType) -> RetrySchedule,
        seed: u64,
    ) -> Self {
        let retry = ServiceType::ALL
            .iter()
            .map(|ds| RetryManager::new(schedule_for(*ds), seed.wrapping_add(ds.index() as u64)))
            .collect();
        Self {
            enabled: [false; ServiceType::COUNT],
            bindings: Default::default(),
            retry,
            priorities,
        }
    }

    // ─── Enabled / priority ─────────────────────────────────────────────

    pub fn is_enabled(&self, ds: ServiceType) -> bool {
        self.enabled[ds.index()]
    }

    pub fn set_enabled(&mut self, ds: ServiceType, enabled: bool) {
        self.enabled[ds.index()] = enabled;
    }

    pub fn any_enabled(&self) -> bool {
        self.enabled.iter().any(|e| *e)
    }

    pub fn priorities(&self) -> &ServicePriorities {
        &self.priorities
    }

    pub fn set_priority(&mut self, ds: ServiceType, priority: i32) {
        self.priorities.set(ds, priority);
    }

    /// Enabled services, highest priority first.
    pub fn enabled_by_priority(&self) -> Vec<ServiceType> {
        self.priorities
            .sorted_descending()
            .into_iter()
            .filter(|ds| self.is_enabled(*ds))
            .collect()
    }

    // ─── Bindings ───────────────────────────────────────────────────────

    pub fn binding(&self, ds: ServiceType, ipv: IpVersion) -> &Binding {
        &self.bindings[ds.index()][ipv.index()]
    }

    fn binding_mut(&mut self, ds: ServiceType, ipv: IpVersion) -> &mut Binding {
        &mut self.bindings[ds.index()][ipv.index()]
    }

    /// Returns true if the state actually changed.
    pub fn set_state(&mut self, ds: ServiceType, ipv: IpVersion, state: BindingState) -> bool {
        let binding = self.binding_mut(ds, ipv);
        let changed = binding.state != state;
        binding.state = state;
        changed
    }

    pub fn set_last_profile(&mut self, ds: ServiceType, ipv: IpVersion, profile: ProfileId) {
        self.binding_mut(ds, ipv).last_profile = Some(profile);
    }

    pub fn active_bearer(&self, ds: ServiceType, ipv: IpVersion) -> Option<SlotId> {
        self.binding(ds, ipv).bearer
    }

    pub fn is_active_on(&self, ds: ServiceType, ipv: IpVersion) -> bool {
        self.binding(ds, ipv).bearer.is_some()
    }

    /// Active on any IP version.
    pub fn is_active(&self, ds: ServiceType) -> bool {
        IpVersion::ALL.iter().any(|ipv| self.is_active_on(ds, *ipv))
    }

    /// Binds the service to `slot`; returns true if the state changed.
    pub fn set_active(&mut self, ds: ServiceType, slot: SlotId, ipv: IpVersion) -> bool {
        self.binding_mut(ds, ipv).bearer = Some(slot);
        self.set_state(ds, ipv, BindingState::Connected)
    }

    pub fn set_inactive(&mut self, ds: ServiceType, ipv: IpVersion) -> bool {
        self.binding_mut(ds, ipv).bearer = None;
        self.set_state(ds, ipv, BindingState::Idle)
    }

    /// Whether any enabled service is bound to `slot` on `ipv`.
    pub fn is_claimed(&self, slot: SlotId, ipv: IpVersion) -> bool {
        ServiceType::ALL
            .iter()
            .any(|ds| self.is_enabled(*ds) && self.active_bearer(*ds, ipv) == Some(slot))
    }

    /// Every (service, IP version) bound to `slot`.
    pub fn bound_to(&self, slot: SlotId) -> Vec<(ServiceType, IpVersion)> {
        let mut out = Vec::new();
        for ds in ServiceType::ALL {
            for ipv in IpVersion::ALL {
                if self.active_bearer(ds, ipv) == Some(slot) {
                    out.push((ds, ipv));
                }
            }
        }
        out
    }

    // ─── Retry ──────────────────────────────────────────────────────────

    pub fn retry_manager(&mut self, ds: ServiceType) -> &mut RetryManager {
        &mut self.retry[ds.index()]
    }

    pub fn retry(&self, ds: ServiceType) -> &RetryManager {
        &self.retry[ds.index()]
    }

    // ─── Reset ──────────────────────────────────────────────────────────

    /// Gives a service a fresh start: backoff cleared and every binding
    /// that is neither connected nor mid-setup goes back to idle.
    pub fn reset_service(&mut self, ds: ServiceType) {
        self.retry[ds.index()].reset();
        for ipv in IpVersion::ALL {
            let binding = self.binding_mut(ds, ipv);
            if binding.bearer.is_none() && binding.state != BindingState::Connecting {
                binding.state = BindingState::Idle;
                binding.last_profile = None;
            }
        }
    }

    pub fn reset_all(&mut self) {
        for ds in ServiceType::ALL {
            self.reset_service(ds);
        }
    }

    pub fn snapshot(&self) -> Vec<BindingSnapshot> {
        let mut out = Vec::with_capacity(ServiceType::COUNT * 2);
        for ds in self.priorities.sorted_descending() {
            for ipv in IpVersion::ALL {
                let b = self.binding(ds, ipv);
                out.push(BindingSnapshot {
                    service: ds,
                    ip_version: ipv,
                    enabled: self.is_enabled(ds),
                    priority: self.priorities.get(ds),
                    state: b.state,
                    bearer: b.bearer,
                    retry_attempts: self.retry(ds).attempt_count(),
                    retry_forever: self.retry(ds).is_forever(),
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ServiceStateRegistry {
        ServiceStateRegistry::new(ServicePriorities::default(), |_| RetrySchedule::default(), 1)
    }

    #[test]
    fn enabled_services_come_out_in_priority_order() {
        let mut reg = registry();
        reg.set_enabled(ServiceType::Default, true);
        reg.set_enabled(ServiceType::Mms, true);
        reg.set_enabled(ServiceType::Hipri, true);
        assert_eq!(
            reg.enabled_by_priority(),
            vec![ServiceType::Hipri, ServiceType::Mms, ServiceType::Default]
        );

        reg.set_priority(ServiceType::Default, 1000);
        assert_eq!(reg.enabled_by_priority()[0], ServiceType::Default);
    }

    #[test]
    fn active_inactive_transitions() {
        let mut reg = registry();
        reg.set_enabled(ServiceType::Mms, true);
        assert!(reg.set_active(ServiceType::Mms, SlotId(2), IpVersion::V4));
        assert!(!reg.set_active(ServiceType::Mms, SlotId(2), IpVersion::V4));
        assert!(reg.is_active(ServiceType::Mms));
        assert!(!reg.is_active_on(ServiceType::Mms, IpVersion::V6));
        assert!(reg.is_claimed(SlotId(2), IpVersion::V4));
        assert!(!reg.is_claimed(SlotId(2), IpVersion::V6));

        reg.set_enabled(ServiceType::Mms, false);
        assert!(!reg.is_claimed(SlotId(2), IpVersion::V4));

        assert!(reg.set_inactive(ServiceType::Mms, IpVersion::V4));
        assert_eq!(
            reg.binding(ServiceType::Mms, IpVersion::V4).state,
            BindingState::Idle
        );
        assert!(!reg.is_active(ServiceType::Mms));
    }

    #[test]
    fn bound_to_lists_every_claim() {
        let mut reg = registry();
        reg.set_active(ServiceType::Default, SlotId(0), IpVersion::V4);
        reg.set_active(ServiceType::Supl, SlotId(0), IpVersion::V4);
        reg.set_active(ServiceType::Mms, SlotId(1), IpVersion::V4);
        assert_eq!(
            reg.bound_to(SlotId(0)),
            vec![
                (ServiceType::Default, IpVersion::V4),
                (ServiceType::Supl, IpVersion::V4)
            ]
        );
    }

    #[test]
    fn reset_keeps_connected_bindings() {
        let mut reg = registry();
        reg.set_active(ServiceType::Default, SlotId(0), IpVersion::V4);
        reg.set_state(ServiceType::Default, IpVersion::V6, BindingState::Failed);
        reg.retry_manager(ServiceType::Default).increase_retry_count();

        reg.reset_all();
        assert_eq!(
            reg.binding(ServiceType::Default, IpVersion::V4).state,
            BindingState::Connected
        );
        assert_eq!(
            reg.binding(ServiceType::Default, IpVersion::V6).state,
            BindingState::Idle
        );
        assert_eq!(reg.retry(ServiceType::Default).attempt_count(), 0);
    }
}
