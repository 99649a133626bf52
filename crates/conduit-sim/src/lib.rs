//! Simulation toolkit for conduit-core.
//!
//! Provides a simulated modem transport with scripted failures and a
//! finite network-side bearer capacity, and a runner that replays timed
//! scenarios from TOML against a live engine.

pub mod scenario;
pub mod transport;

pub use scenario::{Scenario, ScenarioError, run};
pub use transport::{SimConfig, SimModem, SimTransport};
