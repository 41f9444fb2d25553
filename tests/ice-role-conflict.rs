use icecheck::{IceAgent, IceAgentEvent, IceConnectionState};

use common::{exchange_credentials, host, init_log, quick_config, signal, sock, wait_for, Network};

mod common;

async fn run(a_controlling: bool, b_controlling: bool) -> (IceAgent, IceAgent) {
    let network = Network::new();
    let (a, mut a_events) = common::agent(&network, quick_config(a_controlling));
    let (b, mut b_events) = common::agent(&network, quick_config(b_controlling));
    exchange_credentials(&a, &b);

    let sa = a.add_stream("audio", &[1]);
    let sb = b.add_stream("audio", &[1]);
    a.add_local_candidate(sa, host("1.1.1.1:4000")).unwrap();
    b.add_local_candidate(sb, host("2.2.2.2:5000")).unwrap();
    a.add_remote_candidates(sa, signal(&b.local_candidates(sb).unwrap()))
        .unwrap();
    b.add_remote_candidates(sb, signal(&a.local_candidates(sa).unwrap()))
        .unwrap();
    a.generate_check_lists();
    b.generate_check_lists();

    network.attach(&a, &[sock("1.1.1.1:4000")], "L");
    network.attach(&b, &[sock("2.2.2.2:5000")], "R");
    a.start_checks().unwrap();
    b.start_checks().unwrap();

    let completed = |e: &IceAgentEvent| matches!(e, IceAgentEvent::Completed { .. });
    wait_for(&mut a_events, completed).await;
    wait_for(&mut b_events, completed).await;

    (a, b)
}

#[tokio::test(start_paused = true)]
async fn both_controlling() {
    init_log();

    let (a, b) = run(true, true).await;

    assert_eq!(a.state(), IceConnectionState::Completed);
    assert_eq!(b.state(), IceConnectionState::Completed);

    // Exactly one ends up controlling.
    assert_ne!(a.controlling(), b.controlling());
    assert!(a.stats().role_conflict_count + b.stats().role_conflict_count >= 1);
}

#[tokio::test(start_paused = true)]
async fn both_controlled() {
    init_log();

    let (a, b) = run(false, false).await;

    assert_eq!(a.state(), IceConnectionState::Completed);
    assert_eq!(b.state(), IceConnectionState::Completed);
    assert_ne!(a.controlling(), b.controlling());
}
