//! # conduit-core
//!
//! Bearer orchestration engine. A device exposes several logical data
//! services (default internet, MMS, SUPL, tethering, ...) over a small fixed
//! pool of bearers; this crate decides which services get a bearer, which
//! profile to try next after a failure, when to pre-empt a lower-priority
//! bearer, and how to back off.
//!
//! The [`orchestrator::Orchestrator`] is a plain single-threaded state
//! machine driven by [`orchestrator::Event`]s. [`runtime::EngineRuntime`]
//! hosts it on a worker thread for real use.

pub mod config;
pub mod failure;
pub mod orchestrator;
pub mod pool;
pub mod profile;
pub mod readiness;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use orchestrator::{Event, Notification, Orchestrator};
pub use runtime::{EngineHandle, EngineRuntime};
pub use service::{IpVersion, ServiceType};
