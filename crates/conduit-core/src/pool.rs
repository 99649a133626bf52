//! # Bearer Pool
//!
//! Fixed-capacity set of bearer slots. Each slot is a small state machine:
//!
//! ```text
//! Inactive → Connecting → Active → Disconnecting → Inactive
//!                ↓                                    ↑
//!                └──────────── (setup failed) ────────┘
//! ```
//!
//! Running out of slots is an ordinary condition, resolved by pre-emption
//! in the orchestrator.

use std::fmt;

use serde::Serialize;

use crate::profile::Profile;
use crate::service::{IpVersion, ServiceType};
use crate::transport::{
    BearerTransport, ConnectRequest, ConnectionId, DisconnectRequest, SetupContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SlotId(pub usize);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dc#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BearerState {
    #[default]
    Inactive,
    Connecting,
    Active,
    Disconnecting,
}

/// One bearer slot.
#[derive(Debug, Clone)]
pub struct Bearer {
    pub id: SlotId,
    pub state: BearerState,
    pub profile: Option<Profile>,
    pub ip_version: Option<IpVersion>,
    pub connection_id: Option<ConnectionId>,
    attempt: u64,
}

impl Bearer {
    fn new(id: SlotId) -> Self {
        Self {
            id,
            state: BearerState::Inactive,
            profile: None,
            ip_version: None,
            connection_id: None,
            attempt: 0,
        }
    }

    fn clear(&mut self) {
        self.state = BearerState::Inactive;
        self.profile = None;
        self.ip_version = None;
        self.connection_id = None;
    }

    pub fn is_active(&self) -> bool {
        self.state == BearerState::Active
    }

    /// Whether this active bearer's profile can also carry `ds` on `ipv`.
    pub fn can_serve(&self, ds: ServiceType, ipv: IpVersion) -> bool {
        self.is_active()
            && self.ip_version == Some(ipv)
            && self.profile.as_ref().is_some_and(|p| p.can_handle(ds))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BearerSnapshot {
    pub slot: SlotId,
    pub state: BearerState,
    pub profile: Option<String>,
    pub ip_version: Option<IpVersion>,
    pub connection_id: Option<ConnectionId>,
}

#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Bearer>,
    next_attempt: u64,
}

impl ConnectionPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|i| Bearer::new(SlotId(i))).collect(),
            next_attempt: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bearer> {
        self.slots.iter()
    }

    pub fn get(&self, slot: SlotId) -> Option<&Bearer> {
        self.slots.get(slot.0)
    }

    /// First inactive slot.
    pub fn find_free_slot(&self) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|b| b.state == BearerState::Inactive)
            .map(|b| b.id)
    }

    pub fn find_by_connection(&self, connection_id: ConnectionId) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|b| b.connection_id == Some(connection_id))
            .map(|b| b.id)
    }

    pub fn count(&self, state: BearerState) -> usize {
        self.slots.iter().filter(|b| b.state == state).count()
    }

    pub fn any_in(&self, state: BearerState) -> bool {
        self.slots.iter().any(|b| b.state == state)
    }

    /// Claims an inactive slot and asks the transport to bring it up.
    /// Returns `None` if the slot was not free.
    pub fn connect<T: BearerTransport + ?Sized>(
        &mut self,
        slot: SlotId,
        profile: &Profile,
        ip_version: IpVersion,
        service: ServiceType,
        reason: &str,
        transport: &mut T,
    ) -> Option<SetupContext> {
        let attempt = self.next_attempt;
        let bearer = self.slots.get_mut(slot.0)?;
        if bearer.state != BearerState::Inactive {
            return None;
        }
        self.next_attempt += 1;
        bearer.state = BearerState::Connecting;
        bearer.profile = Some(profile.clone());
        bearer.ip_version = Some(ip_version);
        bearer.connection_id = None;
        bearer.attempt = attempt;

        let context = SetupContext {
            service,
            ip_version,
            profile: profile.id,
            slot,
            attempt,
            reason: reason.to_string(),
        };
        transport.connect(ConnectRequest {
            slot,
            profile: profile.clone(),
            ip_version,
            context: context.clone(),
        });
        Some(context)
    }

    /// Whether `context` still describes the slot's in-flight setup.
    pub fn is_current(&self, context: &SetupContext) -> bool {
        self.get(context.slot).is_some_and(|b| {
            b.state == BearerState::Connecting && b.attempt == context.attempt
        })
    }

    pub fn mark_connected(&mut self, context: &SetupContext, connection_id: ConnectionId) -> bool {
        if !self.is_current(context) {
            return false;
        }
        let bearer = &mut self.slots[context.slot.0];
        bearer.state = BearerState::Active;
        bearer.connection_id = Some(connection_id);
        true
    }

    pub fn mark_setup_failed(&mut self, context: &SetupContext) -> bool {
        if !self.is_current(context) {
            return false;
        }
        self.slots[context.slot.0].clear();
        true
    }

    /// Asks the transport to tear an active bearer down. Returns false when
    /// the slot is not active (including a disconnect already in flight).
    pub fn disconnect<T: BearerTransport + ?Sized>(
        &mut self,
        slot: SlotId,
        reason: &str,
        transport: &mut T,
    ) -> bool {
        let Some(bearer) = self.slots.get_mut(slot.0) else {
            return false;
        };
        if bearer.state != BearerState::Active {
            return false;
        }
        bearer.state = BearerState::Disconnecting;
        transport.disconnect(DisconnectRequest {
            slot,
            connection_id: bearer.connection_id,
            reason: reason.to_string(),
        });
        true
    }

    /// Teardown finished, or the bearer vanished under us.
    pub fn mark_inactive(&mut self, slot: SlotId) {
        if let Some(bearer) = self.slots.get_mut(slot.0) {
            if bearer.state != BearerState::Connecting {
                bearer.clear();
            }
        }
    }

    pub fn snapshot(&self) -> Vec<BearerSnapshot> {
        self.slots
            .iter()
            .map(|b| BearerSnapshot {
                slot: b.id,
                state: b.state,
                profile: b.profile.as_ref().map(|p| p.name().to_string()),
                ip_version: b.ip_version,
                connection_id: b.connection_id,
            })
            .collect()
    }
}
