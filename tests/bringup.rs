//! End-to-end bring-up tests against the mock driver.
//!
//! The control channel runs over real loopback TCP so the rendezvous is
//! exercised with genuine socket semantics; the hardware side is the
//! instrumented mock, whose event log backs the teardown-order and
//! rendezvous-ordering assertions.

#![cfg(feature = "mock-rdma")]

use iblink::verbs::mock::{Event, MockVerbs, Resource, Step};
use iblink::{
    BringupConfig, Endpoint, EndpointIdentity, IblinkError, PortPhysicalState, QpState, Role,
    Verbs, WIRE_SIZE,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = thread::spawn(move || TcpStream::connect(addr).unwrap());
    let (accepted, _) = listener.accept().unwrap();
    (accepted, connector.join().unwrap())
}

/// Peer that completes the raw 18-byte exchange and exits. Tolerates the
/// other side dying before (or during) the rendezvous.
fn spawn_raw_peer(mut stream: TcpStream) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let _ = stream.write(&[0u8; WIRE_SIZE]);
        let mut buf = [0u8; WIRE_SIZE];
        let _ = stream.read_exact(&mut buf);
    })
}

fn bring_up_with_peer(
    mock: &Arc<MockVerbs>,
    config: BringupConfig,
) -> std::result::Result<Endpoint, IblinkError> {
    let (mut stream, peer_stream) = tcp_pair();
    let peer = spawn_raw_peer(peer_stream);
    let driver: Arc<dyn Verbs> = Arc::clone(mock) as Arc<dyn Verbs>;
    let result = Endpoint::bring_up(driver, &config, &mut stream);
    drop(stream);
    peer.join().unwrap();
    result
}

#[test]
fn end_to_end_pair_reaches_rts() {
    let (a_stream, b_stream) = tcp_pair();
    let mock_a = Arc::new(MockVerbs::new());
    let mock_b = Arc::new(MockVerbs::new());

    let driver_a: Arc<dyn Verbs> = Arc::clone(&mock_a) as Arc<dyn Verbs>;
    let a = thread::spawn(move || {
        let mut stream = a_stream;
        let config = BringupConfig {
            role: Role::Initiator,
            ..BringupConfig::default()
        };
        Endpoint::bring_up(driver_a, &config, &mut stream).unwrap()
    });

    let driver_b: Arc<dyn Verbs> = Arc::clone(&mock_b) as Arc<dyn Verbs>;
    let b = thread::spawn(move || {
        let mut stream = b_stream;
        let config = BringupConfig {
            role: Role::Responder,
            ..BringupConfig::default()
        };
        Endpoint::bring_up(driver_b, &config, &mut stream).unwrap()
    });

    let a = a.join().unwrap();
    let b = b.join().unwrap();

    assert_eq!(a.state(), QpState::ReadyToSend);
    assert_eq!(b.state(), QpState::ReadyToSend);

    // Each side holds exactly what the other sent.
    assert_eq!(a.remote_identity(), b.local_identity());
    assert_eq!(b.remote_identity(), a.local_identity());

    // The RTR transition was driven by the peer's identity, which can only
    // have come from the rendezvous.
    let rtr = mock_a
        .events()
        .into_iter()
        .find_map(|e| match e {
            Event::TransitionedToRtr {
                dest_qp_num,
                dest_lid,
                ..
            } => Some((dest_qp_num, dest_lid)),
            _ => None,
        })
        .expect("RTR transition recorded");
    assert_eq!(rtr.0, b.local_identity().qp_num);
    assert_eq!(rtr.1, b.local_identity().lid);
}

#[test]
fn successful_teardown_is_exact_reverse_of_creation() {
    let mock = Arc::new(MockVerbs::new());
    let endpoint = bring_up_with_peer(&mock, BringupConfig::default()).unwrap();

    let created = mock.created_order();
    assert_eq!(created.len(), 5);
    assert!(matches!(created[0], Resource::Context(_)));
    assert!(matches!(created[1], Resource::Pd(_)));
    assert!(matches!(created[2], Resource::Cq(_)));
    assert!(matches!(created[3], Resource::Mr(_)));
    assert!(matches!(created[4], Resource::Qp(_)));

    drop(endpoint);

    let mut destroyed = mock.destroyed_order();
    destroyed.reverse();
    assert_eq!(destroyed, created);
    assert_eq!(mock.live_count(), 0);
}

#[test]
fn failure_at_each_step_unwinds_in_reverse() {
    let steps = [
        Step::ListDevices,
        Step::OpenDevice,
        Step::QueryDevice,
        Step::QueryPort,
        Step::AllocPd,
        Step::CreateCq,
        Step::RegisterMemory,
        Step::CreateQp,
        Step::ModifyInit,
        Step::ModifyRtr,
        Step::ModifyRts,
    ];

    for step in steps {
        let mock = Arc::new(MockVerbs::new());
        mock.fail_at(step);
        let err = bring_up_with_peer(&mock, BringupConfig::default()).unwrap_err();

        let matches_step = match step {
            Step::ListDevices => matches!(err, IblinkError::DeviceEnumerationFailed { .. }),
            Step::OpenDevice => matches!(err, IblinkError::DeviceOpenFailed { .. }),
            Step::QueryDevice => matches!(err, IblinkError::CapabilityQueryFailed { .. }),
            Step::QueryPort => matches!(err, IblinkError::PortQueryFailed { .. }),
            Step::AllocPd => {
                matches!(err, IblinkError::ProtectionDomainAllocationFailed { .. })
            }
            Step::CreateCq => {
                matches!(err, IblinkError::CompletionQueueAllocationFailed { .. })
            }
            Step::RegisterMemory => matches!(err, IblinkError::MemoryRegistrationFailed { .. }),
            Step::CreateQp => matches!(err, IblinkError::QueuePairCreateFailed { .. }),
            Step::ModifyInit => matches!(err, IblinkError::QpInitTransitionFailed { .. }),
            Step::ModifyRtr => matches!(err, IblinkError::QpRtrTransitionFailed { .. }),
            Step::ModifyRts => matches!(err, IblinkError::QpRtsTransitionFailed { .. }),
            Step::PostReceive => matches!(err, IblinkError::ReceivePostFailed { .. }),
        };
        assert!(matches_step, "step {step:?} produced {err}");

        // Everything created before the failure was destroyed, newest first.
        let created = mock.created_order();
        let mut destroyed = mock.destroyed_order();
        destroyed.reverse();
        assert_eq!(destroyed, created, "unwind mismatch at {step:?}");
        assert_eq!(mock.live_count(), 0, "leak at {step:?}");
    }
}

#[test]
fn responder_receive_post_failure_unwinds_everything() {
    let mock = Arc::new(MockVerbs::new());
    mock.fail_at(Step::PostReceive);
    let config = BringupConfig {
        role: Role::Responder,
        ..BringupConfig::default()
    };
    let err = bring_up_with_peer(&mock, config).unwrap_err();

    assert!(matches!(err, IblinkError::ReceivePostFailed { .. }));
    let created = mock.created_order();
    let mut destroyed = mock.destroyed_order();
    destroyed.reverse();
    assert_eq!(destroyed, created);
    assert_eq!(mock.live_count(), 0);
}

#[test]
fn port_not_ready_allocates_nothing_beyond_context() {
    let mock = Arc::new(MockVerbs::new());
    mock.set_phys_state(PortPhysicalState::Polling);
    let err = bring_up_with_peer(&mock, BringupConfig::default()).unwrap_err();

    match err {
        IblinkError::PortNotReady { port, state } => {
            assert_eq!(port, 1);
            assert_eq!(state, "POLLING");
        }
        other => panic!("expected PortNotReady, got {other}"),
    }

    let created = mock.created_order();
    assert_eq!(created.len(), 1, "only the context may exist: {created:?}");
    assert!(matches!(created[0], Resource::Context(_)));
    assert_eq!(mock.live_count(), 0);
}

#[test]
fn link_up_port_passes_the_gate() {
    let mock = Arc::new(MockVerbs::new());
    mock.set_phys_state(PortPhysicalState::LinkUp);
    let endpoint = bring_up_with_peer(&mock, BringupConfig::default()).unwrap();
    assert_eq!(endpoint.state(), QpState::ReadyToSend);
}

#[test]
fn responder_arms_receive_between_init_and_rtr() {
    let mock = Arc::new(MockVerbs::new());
    let config = BringupConfig {
        role: Role::Responder,
        ..BringupConfig::default()
    };
    let _endpoint = bring_up_with_peer(&mock, config).unwrap();

    let events = mock.events();
    let pos = |pred: &dyn Fn(&Event) -> bool| events.iter().position(pred).unwrap();
    let init = pos(&|e| matches!(e, Event::TransitionedToInit { .. }));
    let recv = pos(&|e| matches!(e, Event::ReceivePosted { .. }));
    let rtr = pos(&|e| matches!(e, Event::TransitionedToRtr { .. }));
    let rts = pos(&|e| matches!(e, Event::TransitionedToRts { .. }));
    assert!(init < recv, "receive posted before INIT completed");
    assert!(recv < rtr, "receive must be armed before RTR");
    assert!(rtr < rts);
}

#[test]
fn initiator_posts_no_receive_during_bringup() {
    let mock = Arc::new(MockVerbs::new());
    let _endpoint = bring_up_with_peer(&mock, BringupConfig::default()).unwrap();
    assert!(!mock
        .events()
        .iter()
        .any(|e| matches!(e, Event::ReceivePosted { .. })));
}

#[test]
fn identity_survives_loopback_exchange() {
    let (mut a, mut b) = tcp_pair();
    let id_a = EndpointIdentity {
        addr: 0x7fff_0000_1000,
        rkey: 0x2001,
        qp_num: 0x101,
        lid: 0x11,
    };
    let id_b = EndpointIdentity {
        addr: 0x7fff_0000_2000,
        rkey: 0x2002,
        qp_num: 0x102,
        lid: 0x12,
    };

    let peer = thread::spawn(move || iblink::channel::exchange(&mut b, &id_b).unwrap());
    let got_b = iblink::channel::exchange(&mut a, &id_a).unwrap();
    let got_a = peer.join().unwrap();

    assert_eq!(got_b, id_b);
    assert_eq!(got_a, id_a);
}

#[test]
fn peer_disappearing_fails_rendezvous_and_unwinds() {
    let (mut stream, peer_stream) = tcp_pair();
    drop(peer_stream);

    let mock = Arc::new(MockVerbs::new());
    let driver: Arc<dyn Verbs> = Arc::clone(&mock) as Arc<dyn Verbs>;
    let err = Endpoint::bring_up(driver, &BringupConfig::default(), &mut stream).unwrap_err();

    // Orderly close surfaces as ControlChannelClosed; a racing RST may
    // surface as a read or write failure instead. All are fatal.
    assert!(
        matches!(
            err,
            IblinkError::ControlChannelClosed { .. }
                | IblinkError::ControlChannelReadFailed { .. }
                | IblinkError::ControlChannelWriteFailed { .. }
        ),
        "unexpected error: {err}"
    );

    let created = mock.created_order();
    let mut destroyed = mock.destroyed_order();
    destroyed.reverse();
    assert_eq!(destroyed, created);
    assert_eq!(mock.live_count(), 0);
}

#[test]
fn concurrent_endpoints_use_independent_resources() {
    // Two endpoints on the same driver: nothing is shared, every handle is
    // distinct, and both bring-ups succeed side by side.
    let mock = Arc::new(MockVerbs::new());

    let (a_stream, b_stream) = tcp_pair();
    let driver_a: Arc<dyn Verbs> = Arc::clone(&mock) as Arc<dyn Verbs>;
    let a = thread::spawn(move || {
        let mut stream = a_stream;
        Endpoint::bring_up(driver_a, &BringupConfig::default(), &mut stream).unwrap()
    });
    let driver_b: Arc<dyn Verbs> = Arc::clone(&mock) as Arc<dyn Verbs>;
    let b = thread::spawn(move || {
        let mut stream = b_stream;
        let config = BringupConfig {
            role: Role::Responder,
            ..BringupConfig::default()
        };
        Endpoint::bring_up(driver_b, &config, &mut stream).unwrap()
    });

    let a = a.join().unwrap();
    let b = b.join().unwrap();

    assert_ne!(a.local_identity().qp_num, b.local_identity().qp_num);
    assert_ne!(a.local_identity().addr, b.local_identity().addr);
    assert_eq!(mock.created_order().len(), 10);

    drop(a);
    drop(b);
    assert_eq!(mock.live_count(), 0);
}
