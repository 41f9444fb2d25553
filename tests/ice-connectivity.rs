use std::collections::HashSet;

use icecheck::{Candidate, IceAgentEvent, IceConfig, IceConnectionState};

use common::{exchange_credentials, host, init_log, quick_config, signal, sock, wait_for, Network};

mod common;

#[tokio::test(start_paused = true)]
async fn host_host_two_components() {
    init_log();

    let network = Network::new();
    let (a, mut a_events) = common::agent(&network, quick_config(true));
    let (b, mut b_events) = common::agent(&network, quick_config(false));
    exchange_credentials(&a, &b);

    let sa = a.add_stream("audio", &[1, 2]);
    let sb = b.add_stream("audio", &[1, 2]);

    a.add_local_candidate(sa, host("1.1.1.1:4000")).unwrap();
    a.add_local_candidate(sa, host("1.1.1.1:4001").with_component(2).unwrap())
        .unwrap();
    b.add_local_candidate(sb, host("2.2.2.2:5000")).unwrap();
    b.add_local_candidate(sb, host("2.2.2.2:5001").with_component(2).unwrap())
        .unwrap();

    a.add_remote_candidates(sa, signal(&b.local_candidates(sb).unwrap()))
        .unwrap();
    b.add_remote_candidates(sb, signal(&a.local_candidates(sa).unwrap()))
        .unwrap();

    assert_eq!(a.generate_check_lists(), 2);
    assert_eq!(b.generate_check_lists(), 2);

    network.attach(&a, &[sock("1.1.1.1:4000"), sock("1.1.1.1:4001")], "L");
    network.attach(&b, &[sock("2.2.2.2:5000"), sock("2.2.2.2:5001")], "R");

    a.start_checks().unwrap();
    b.start_checks().unwrap();

    let completed = |e: &IceAgentEvent| matches!(e, IceAgentEvent::Completed { .. });

    let IceAgentEvent::Completed { selected } = wait_for(&mut a_events, completed).await else {
        unreachable!()
    };
    assert_eq!(selected.len(), 2);
    let components: HashSet<_> = selected.iter().map(|s| s.component).collect();
    assert_eq!(components, HashSet::from([1, 2]));
    for s in &selected {
        assert_eq!(s.stream, sa);
        assert_eq!(s.local.component_id(), s.component);
        assert_eq!(s.remote.component_id(), s.component);
        assert_eq!(s.session.local_addr(), s.local.base());
        assert_eq!(s.session.remote_addr(), s.remote.addr());
    }

    let IceAgentEvent::Completed { selected } = wait_for(&mut b_events, completed).await else {
        unreachable!()
    };
    assert_eq!(selected.len(), 2);

    assert_eq!(a.state(), IceConnectionState::Completed);
    assert_eq!(b.state(), IceConnectionState::Completed);

    // Exactly one nominated pair per component on each side.
    for (agent, stream) in [(&a, sa), (&b, sb)] {
        let nominated: Vec<_> = agent
            .pairs(stream)
            .unwrap()
            .into_iter()
            .filter(|p| p.nominated)
            .collect();
        assert_eq!(nominated.len(), 2);
    }

    let stats = a.stats();
    assert!(stats.nomination_send_count >= 2);
    assert!(stats.bind_success_recv >= 2);
    assert!(b.stats().bind_request_recv >= 2);
    assert_eq!(stats.role_conflict_count, 0);
}

#[tokio::test(start_paused = true)]
async fn component_established_before_completed() {
    init_log();

    let network = Network::new();
    let (a, mut a_events) = common::agent(&network, quick_config(true));
    let (b, _b_events) = common::agent(&network, quick_config(false));
    exchange_credentials(&a, &b);

    let sa = a.add_stream("video", &[1]);
    let sb = b.add_stream("video", &[1]);
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

    let mut seen = vec![];
    loop {
        let e = wait_for(&mut a_events, |_| true).await;
        let done = matches!(e, IceAgentEvent::Completed { .. });
        seen.push(e);
        if done {
            break;
        }
    }

    let pos = |f: &dyn Fn(&IceAgentEvent) -> bool| seen.iter().position(f).unwrap();
    let checking = pos(&|e| matches!(e, IceAgentEvent::StateChange(IceConnectionState::Checking)));
    let established = pos(&|e| matches!(e, IceAgentEvent::ComponentEstablished(_)));
    let connected = pos(&|e| matches!(e, IceAgentEvent::StateChange(IceConnectionState::Connected)));
    let stream_done = pos(&|e| matches!(e, IceAgentEvent::StreamCompleted(s) if *s == sa));

    assert!(checking < established);
    assert!(established < connected);
    assert!(connected < stream_done);
}

#[tokio::test(start_paused = true)]
async fn dropped_path_fails() {
    init_log();

    let network = Network::new();
    let (a, mut a_events) = common::agent(&network, quick_config(true));
    let (b, mut b_events) = common::agent(&network, quick_config(false));
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

    network.drop_path(sock("1.1.1.1:4000"), sock("2.2.2.2:5000"));
    network.attach(&a, &[sock("1.1.1.1:4000")], "L");
    network.attach(&b, &[sock("2.2.2.2:5000")], "R");
    a.start_checks().unwrap();
    b.start_checks().unwrap();

    let e = wait_for(&mut a_events, |e| matches!(e, IceAgentEvent::StreamFailed(_))).await;
    assert!(matches!(e, IceAgentEvent::StreamFailed(s) if s == sa));
    wait_for(&mut a_events, |e| matches!(e, IceAgentEvent::Failed)).await;
    assert_eq!(a.state(), IceConnectionState::Failed);

    wait_for(&mut b_events, |e| matches!(e, IceAgentEvent::Failed)).await;
    assert_eq!(b.state(), IceConnectionState::Failed);

    // One request and two retransmits, none answered.
    let stats = a.stats();
    assert_eq!(stats.bind_request_sent, 3);
    assert_eq!(stats.bind_success_recv, 0);
    assert!(network.sent() >= 6);
}

#[tokio::test(start_paused = true)]
async fn second_path_is_selected_when_first_is_dropped() {
    init_log();

    let network = Network::new();
    let (a, mut a_events) = common::agent(&network, quick_config(true));
    let (b, mut b_events) = common::agent(&network, quick_config(false));
    exchange_credentials(&a, &b);

    let sa = a.add_stream("audio", &[1]);
    let sb = b.add_stream("audio", &[1]);
    a.add_local_candidate(sa, host("1.1.1.1:4000")).unwrap();
    a.add_local_candidate(sa, host("1.1.1.2:4000")).unwrap();
    b.add_local_candidate(sb, host("2.2.2.2:5000")).unwrap();
    a.add_remote_candidates(sa, signal(&b.local_candidates(sb).unwrap()))
        .unwrap();
    b.add_remote_candidates(sb, signal(&a.local_candidates(sa).unwrap()))
        .unwrap();
    assert_eq!(a.generate_check_lists(), 2);
    assert_eq!(b.generate_check_lists(), 2);

    network.drop_path(sock("1.1.1.1:4000"), sock("2.2.2.2:5000"));
    network.attach(&a, &[sock("1.1.1.1:4000"), sock("1.1.1.2:4000")], "L");
    network.attach(&b, &[sock("2.2.2.2:5000")], "R");
    a.start_checks().unwrap();
    b.start_checks().unwrap();

    let completed = |e: &IceAgentEvent| matches!(e, IceAgentEvent::Completed { .. });
    let IceAgentEvent::Completed { selected } = wait_for(&mut a_events, completed).await else {
        unreachable!()
    };
    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].local.addr(), sock("1.1.1.2:4000"));
    assert_eq!(selected[0].remote.addr(), sock("2.2.2.2:5000"));

    let IceAgentEvent::Completed { selected } = wait_for(&mut b_events, completed).await else {
        unreachable!()
    };
    assert_eq!(selected[0].remote.addr(), sock("1.1.1.2:4000"));
}

#[tokio::test(start_paused = true)]
async fn unknown_source_becomes_peer_reflexive() {
    init_log();

    let network = Network::new();
    let (a, mut a_events) = common::agent(&network, quick_config(true));
    let (b, mut b_events) = common::agent(&network, quick_config(false));
    exchange_credentials(&a, &b);

    let sa = a.add_stream("audio", &[1]);
    let sb = b.add_stream("audio", &[1]);
    a.add_local_candidate(sa, host("1.1.1.1:4000")).unwrap();
    b.add_local_candidate(sb, host("2.2.2.2:5000")).unwrap();

    // Only the controlling side learns about the other. The controlled
    // side discovers it from the incoming checks.
    a.add_remote_candidates(sa, signal(&b.local_candidates(sb).unwrap()))
        .unwrap();
    assert_eq!(a.generate_check_lists(), 1);
    assert_eq!(b.generate_check_lists(), 0);

    network.attach(&a, &[sock("1.1.1.1:4000")], "L");
    network.attach(&b, &[sock("2.2.2.2:5000")], "R");
    a.start_checks().unwrap();
    b.start_checks().unwrap();

    let completed = |e: &IceAgentEvent| matches!(e, IceAgentEvent::Completed { .. });
    wait_for(&mut a_events, completed).await;
    let IceAgentEvent::Completed { selected } = wait_for(&mut b_events, completed).await else {
        unreachable!()
    };

    assert_eq!(selected.len(), 1);
    assert_eq!(selected[0].remote.kind(), icecheck::CandidateKind::PeerReflexive);
    assert_eq!(selected[0].remote.addr(), sock("1.1.1.1:4000"));
    assert!(b.stats().discovered_recv_count >= 1);

    let remote = b.remote_candidates(sb).unwrap();
    assert_eq!(remote.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn candidates_trickled_after_empty_check_lists() {
    init_log();

    let network = Network::new();
    let (a, mut a_events) = common::agent(&network, quick_config(true));
    let (b, mut b_events) = common::agent(&network, quick_config(false));
    exchange_credentials(&a, &b);

    let sa = a.add_stream("audio", &[1]);
    let sb = b.add_stream("audio", &[1]);
    a.add_local_candidate(sa, host("1.1.1.1:4000")).unwrap();
    b.add_local_candidate(sb, host("2.2.2.2:5000")).unwrap();

    // Nothing from the peer yet.
    assert_eq!(a.generate_check_lists(), 0);
    assert_eq!(b.generate_check_lists(), 0);

    network.attach(&a, &[sock("1.1.1.1:4000")], "L");
    network.attach(&b, &[sock("2.2.2.2:5000")], "R");
    a.start_checks().unwrap();
    b.start_checks().unwrap();

    a.add_remote_candidates(sa, signal(&b.local_candidates(sb).unwrap()))
        .unwrap();
    b.add_remote_candidates(sb, signal(&a.local_candidates(sa).unwrap()))
        .unwrap();
    assert_eq!(a.pairs(sa).unwrap().len(), 1);
    assert_eq!(b.pairs(sb).unwrap().len(), 1);

    let completed = |e: &IceAgentEvent| matches!(e, IceAgentEvent::Completed { .. });
    let IceAgentEvent::Completed { selected } = wait_for(&mut a_events, completed).await else {
        unreachable!()
    };
    assert_eq!(selected[0].remote.addr(), sock("2.2.2.2:5000"));
    wait_for(&mut b_events, completed).await;

    assert_eq!(a.state(), IceConnectionState::Completed);
    assert_eq!(b.state(), IceConnectionState::Completed);
}

#[test]
fn candidate_lines_feed_the_agent() {
    let line = "a=candidate:1 1 udp 2130706175 2.2.2.2 5000 typ host\r\n";
    let parsed = icecheck::parse_candidates(line).unwrap();
    assert_eq!(parsed.len(), 1);

    let c = Candidate::from_sdp_string(line.trim_start_matches("a=")).unwrap();
    assert_eq!(c.addr(), parsed[0].addr());
    assert_eq!(c.prio(), 2130706175);

    let config = IceConfig::default();
    assert!(config.include_tcp());
}
