//! Property-based checks of the pool and binding invariants under random
//! event sequences.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use quanta::{Clock, Mock};

use conduit_core::config::EngineConfig;
use conduit_core::failure::FailCause;
use conduit_core::orchestrator::{Event, Orchestrator};
use conduit_core::pool::BearerState;
use conduit_core::profile::{ProfileSpec, ProfileType};
use conduit_core::readiness::{RadioTechnology, RecordSource};
use conduit_core::registry::BindingState;
use conduit_core::retry::RetrySchedule;
use conduit_core::service::{IpVersion, ServiceType};
use conduit_core::transport::{
    BearerTransport, ConnectRequest, ConnectionId, DisconnectRequest, SetupOutcome,
};

#[derive(Default)]
struct QueueTransport {
    connects: VecDeque<ConnectRequest>,
    disconnects: VecDeque<DisconnectRequest>,
    calls: usize,
}

impl BearerTransport for QueueTransport {
    fn connect(&mut self, request: ConnectRequest) {
        self.calls += 1;
        self.connects.push_back(request);
    }

    fn disconnect(&mut self, request: DisconnectRequest) {
        self.calls += 1;
        self.disconnects.push_back(request);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Enable(ServiceType, bool),
    Succeed,
    Fail(FailCause),
    Teardown,
    Advance(u64),
    Radio(bool),
    Roaming(bool),
    NetworkDrop,
    Priority(ServiceType, i32),
    Reconcile,
}

fn service() -> impl Strategy<Value = ServiceType> {
    prop::sample::select(ServiceType::ALL.to_vec())
}

fn cause() -> impl Strategy<Value = FailCause> {
    prop::sample::select(vec![
        FailCause::MissingUnknownApn,
        FailCause::InsufficientResources,
        FailCause::OperatorBarred,
        FailCause::Unknown,
        FailCause::OnlyIpv6Allowed,
        FailCause::NoMoreBearers,
    ])
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (service(), any::<bool>()).prop_map(|(ds, on)| Op::Enable(ds, on)),
        4 => Just(Op::Succeed),
        2 => cause().prop_map(Op::Fail),
        3 => Just(Op::Teardown),
        2 => (0u64..5_000).prop_map(Op::Advance),
        1 => any::<bool>().prop_map(Op::Radio),
        1 => any::<bool>().prop_map(Op::Roaming),
        1 => Just(Op::NetworkDrop),
        1 => (service(), 0i32..500).prop_map(|(ds, p)| Op::Priority(ds, p)),
        1 => Just(Op::Reconcile),
    ]
}

fn engine() -> (Orchestrator<QueueTransport>, Arc<Mock>) {
    let schedule: RetrySchedule = "max_retries=2,1000,2000".parse().unwrap();
    let mut profiles: Vec<ProfileSpec> = ServiceType::ALL
        .iter()
        .map(|ds| ProfileSpec::new(ds.as_str(), ProfileType::Apn, &[*ds]))
        .collect();
    profiles.push(ProfileSpec::new(
        "shared",
        ProfileType::Apn,
        &[ServiceType::Default, ServiceType::Supl, ServiceType::Dun],
    ));
    let config = EngineConfig {
        pool_size: 3,
        ip_versions: vec![IpVersion::V4, IpVersion::V6],
        retry_schedules: vec![schedule; ServiceType::COUNT],
        profiles,
        ..Default::default()
    };
    let (clock, mock) = Clock::mock();
    let mut engine = Orchestrator::new(&config, QueueTransport::default(), clock);
    engine.dispatch(Event::RecordsLoaded(RecordSource::Sim));
    engine.dispatch(Event::Registration {
        in_service: true,
        technology: RadioTechnology::Hspa,
    });
    engine.dispatch(Event::RadioOn);
    (engine, mock)
}

fn apply(engine: &mut Orchestrator<QueueTransport>, mock: &Mock, op: Op, next_id: &mut u32) {
    match op {
        Op::Enable(service, enabled) => engine.dispatch(Event::ServiceEnabled { service, enabled }),
        Op::Succeed => {
            if let Some(request) = engine.transport_mut().connects.pop_front() {
                *next_id += 1;
                engine.dispatch(Event::SetupDone {
                    context: request.context,
                    outcome: SetupOutcome::Connected(ConnectionId(*next_id)),
                });
            }
        }
        Op::Fail(cause) => {
            if let Some(request) = engine.transport_mut().connects.pop_front() {
                engine.dispatch(Event::SetupDone {
                    context: request.context,
                    outcome: SetupOutcome::Failed(cause),
                });
            }
        }
        Op::Teardown => {
            if let Some(request) = engine.transport_mut().disconnects.pop_front() {
                engine.dispatch(Event::TeardownDone {
                    slot: request.slot,
                    reason: request.reason,
                });
            }
        }
        Op::Advance(ms) => {
            mock.increment(Duration::from_millis(ms));
            engine.fire_due_alarms();
        }
        Op::Radio(true) => engine.dispatch(Event::RadioOn),
        Op::Radio(false) => engine.dispatch(Event::RadioOff),
        Op::Roaming(true) => engine.dispatch(Event::RoamingOn),
        Op::Roaming(false) => engine.dispatch(Event::RoamingOff),
        Op::NetworkDrop => engine.dispatch(Event::BearerListChanged(Vec::new())),
        Op::Priority(service, priority) => {
            engine.dispatch(Event::SetServicePriority { service, priority })
        }
        Op::Reconcile => engine.reconcile("probe"),
    }
}

fn check_invariants(engine: &Orchestrator<QueueTransport>) -> Result<(), TestCaseError> {
    let pool = engine.pool();
    let registry = engine.registry();

    prop_assert!(pool.count(BearerState::Active) <= pool.capacity());
    // one setup in flight at a time
    prop_assert!(pool.count(BearerState::Connecting) <= 1);

    let mut connecting_bindings = 0;
    for ds in ServiceType::ALL {
        for ipv in IpVersion::ALL {
            let binding = registry.binding(ds, ipv);
            if binding.state == BindingState::Connecting {
                connecting_bindings += 1;
            }
            if registry.is_enabled(ds) && binding.state == BindingState::Connected {
                let slot = binding.bearer;
                prop_assert!(slot.is_some(), "{} {} connected without bearer", ds, ipv);
                let bearer = slot.and_then(|s| pool.get(s));
                // a pre-empted bearer keeps its binding until teardown completes
                prop_assert!(
                    bearer.is_some_and(|b| {
                        matches!(b.state, BearerState::Active | BearerState::Disconnecting)
                            && b.ip_version == Some(ipv)
                    }),
                    "{} {} bound to a bearer that is not up",
                    ds,
                    ipv
                );
            }
        }
    }
    prop_assert_eq!(connecting_bindings, pool.count(BearerState::Connecting));
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn invariants_hold_under_random_events(ops in prop::collection::vec(op(), 1..80)) {
        let (mut engine, mock) = engine();
        let mut next_id = 0;
        check_invariants(&engine)?;
        for op in ops {
            apply(&mut engine, &mock, op, &mut next_id);
            check_invariants(&engine)?;
        }
    }

    #[test]
    fn repeated_reconcile_is_idempotent(ops in prop::collection::vec(op(), 0..60)) {
        let (mut engine, mock) = engine();
        let mut next_id = 0;
        for op in ops {
            apply(&mut engine, &mock, op, &mut next_id);
        }

        engine.reconcile("first");
        let calls = engine.transport().calls;
        engine.drain_notifications();

        engine.reconcile("second");
        prop_assert_eq!(engine.transport().calls, calls);
        prop_assert!(engine.drain_notifications().is_empty());
    }
}
