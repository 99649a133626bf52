use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use conduit_core::orchestrator::Notification;
use conduit_core::pool::BearerState;
use conduit_core::registry::BindingState;
use conduit_core::service::{IpVersion, ServiceType};
use conduit_sim::{Scenario, run};

fn scenario(name: &str) -> Scenario {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("scenarios")
        .join(name);
    Scenario::from_file(path).unwrap()
}

fn state_of(report: &conduit_sim::scenario::RunReport, service: ServiceType) -> BindingState {
    report
        .snapshot
        .bindings
        .iter()
        .find(|b| b.service == service && b.ip_version == IpVersion::V4)
        .map(|b| b.state)
        .unwrap()
}

#[test]
fn shipped_scenarios_parse() {
    for name in ["preemption.toml", "flaky_network.toml", "roaming.toml"] {
        let s = scenario(name);
        assert!(!s.steps.is_empty(), "{name}");
    }
}

#[test]
fn hipri_preempts_default() {
    let report = run(
        scenario("preemption.toml"),
        Duration::from_millis(1_600),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert_eq!(state_of(&report, ServiceType::Hipri), BindingState::Connected);
    assert_eq!(state_of(&report, ServiceType::Mms), BindingState::Connected);
    assert_eq!(state_of(&report, ServiceType::Default), BindingState::Scanning);
    let active = report
        .snapshot
        .bearers
        .iter()
        .filter(|b| b.state == BearerState::Active)
        .count();
    assert_eq!(active, 2);
}

#[test]
fn roaming_pause_and_resume() {
    let report = run(
        scenario("roaming.toml"),
        Duration::from_millis(1_200),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert_eq!(state_of(&report, ServiceType::Default), BindingState::Connected);
    let connected = report
        .notifications
        .iter()
        .filter(|n| {
            matches!(
                n,
                Notification::BindingState {
                    service: ServiceType::Default,
                    state: BindingState::Connected,
                    ..
                }
            )
        })
        .count();
    assert_eq!(connected, 2);
}

#[test]
fn flaky_network_recovers_then_powers_off() {
    let report = run(
        scenario("flaky_network.toml"),
        Duration::from_millis(3_600),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert!(report.power_off_acked);
    assert!(!report.snapshot.ready);
    assert!(
        report
            .snapshot
            .bearers
            .iter()
            .all(|b| b.state == BearerState::Inactive)
    );
    assert!(report.notifications.iter().any(|n| matches!(
        n,
        Notification::BindingState {
            service: ServiceType::Default,
            state: BindingState::Connected,
            ..
        }
    )));
}

#[test]
fn stop_flag_ends_run_early() {
    let report = run(
        scenario("roaming.toml"),
        Duration::from_secs(60),
        Arc::new(AtomicBool::new(true)),
    )
    .unwrap();
    assert!(report.notifications.is_empty());
}
