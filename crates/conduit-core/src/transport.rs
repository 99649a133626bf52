//! Contract with the bearer layer that actually talks to the modem.
//!
//! Requests are fire-and-forget: an implementation must return
//! immediately and deliver the outcome later as
//! [`Event::SetupDone`](crate::orchestrator::Event::SetupDone) or
//! [`Event::TeardownDone`](crate::orchestrator::Event::TeardownDone) on the
//! engine's queue.

use serde::{Deserialize, Serialize};

use crate::failure::FailCause;
use crate::pool::SlotId;
use crate::profile::{Profile, ProfileId};
use crate::service::{IpVersion, ServiceType};

/// Identifier the bearer layer assigns to an established bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

/// Everything needed to interpret a setup result once it comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupContext {
    pub service: ServiceType,
    pub ip_version: IpVersion,
    pub profile: ProfileId,
    pub slot: SlotId,
    /// Matches the slot's current attempt; anything else is stale.
    pub attempt: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    Connected(ConnectionId),
    Failed(FailCause),
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub slot: SlotId,
    pub profile: Profile,
    pub ip_version: IpVersion,
    pub context: SetupContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectRequest {
    pub slot: SlotId,
    pub connection_id: Option<ConnectionId>,
    pub reason: String,
}

/// Physical link state of one bearer, as reported unsolicited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Inactive,
    Dormant,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerCallState {
    pub connection_id: ConnectionId,
    pub link: LinkState,
}

/// Abstraction over the modem's bearer setup/teardown primitives.
///
/// Implemented by the simulator transport and by recording mocks in tests.
pub trait BearerTransport {
    fn connect(&mut self, request: ConnectRequest);
    fn disconnect(&mut self, request: DisconnectRequest);
}

impl<T: BearerTransport + ?Sized> BearerTransport for Box<T> {
    fn connect(&mut self, request: ConnectRequest) {
        (**self).connect(request)
    }

    fn disconnect(&mut self, request: DisconnectRequest) {
        (**self).disconnect(request)
    }
}
