//! End-to-end group formation through the public context API
//!
//! Every test drives a [`P2pContext`] with a recording driver and checks the
//! driver calls, notifications and leftover state.

mod common;

use std::time::Duration;

use common::test_helpers::*;
use lib_p2p::{
    ActionFrame, ConnectRequest, DiscoveryType, DriverEvent, FormationState, GoNegResult,
    GroupRemovalReason, GroupRole, GroupTarget, IfaceId, MacAddr, MemoryConfigStore, P2pConfig,
    P2pError, P2pEvent, P2pStatus, TimerKind, WorkKind, WpsMethod, DEVICE_IFACE,
};

fn go_neg_result(peer_dev: MacAddr, peer_iface: MacAddr, role_go: bool, freq: u32) -> GoNegResult {
    GoNegResult {
        status: P2pStatus::Success,
        role_go,
        freq,
        ssid: ssid(b"DIRECT-ab"),
        passphrase: Some("12345678".to_string()),
        peer_device_addr: peer_dev,
        peer_interface_addr: peer_iface,
        wps_method: WpsMethod::Pbc,
        persistent_group: false,
        peer_config_timeout: 0,
    }
}

fn assert_no_leftovers(rig: &TestRig) {
    assert!(rig.ctx.scheduler().is_empty(), "radio work left behind");
    assert!(rig.ctx.timers().is_empty(), "timers left behind");
    assert_eq!(rig.ctx.formation_iface(), None);
    assert!(rig.ctx.interfaces().all(|i| !i.dynamic), "dynamic interface left behind");
}

#[test]
fn test_go_negotiation_both_sides_share_group() {
    let mut a = rig();
    let mut b = rig();
    // A has an infrastructure link on 2437 and a single-channel radio
    a.ctx.set_station_freq(Some(2437));

    let iface_a = a
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).go_intent(15))
        .expect("connect A");
    let iface_b = b
        .ctx
        .connect(ConnectRequest::new(OWN_ADDR, WpsMethod::Pbc).go_intent(0))
        .expect("connect B");
    assert_eq!(a.ctx.group_state(iface_a), FormationState::Negotiating);

    let freq = match a.driver.last("go_neg_request") {
        Some(DriverOp::GoNegRequest(req)) => {
            assert_eq!(req.go_intent, 15);
            assert_eq!(req.force_freq, Some(2437));
            req.force_freq.unwrap_or(2437)
        }
        other => panic!("expected GO Negotiation request, got {:?}", other),
    };

    a.ctx
        .on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(PEER_DEV, PEER_IFACE, true, freq)));
    b.ctx
        .on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(OWN_ADDR, OWN_ADDR, false, freq)));

    assert!(matches!(
        a.driver.last("start_go"),
        Some(DriverOp::StartGo { freq: 2437, .. })
    ));
    assert_eq!(a.driver.count("start_wps_registrar"), 1);
    assert_eq!(b.driver.count("start_wps_enrollee"), 1);
    assert!(matches!(
        b.driver.last("associate"),
        Some(DriverOp::Associate(p)) if p.bssid == OWN_ADDR && p.freq == 2437
    ));
    assert!(a.ctx.timers().is_registered(iface_a, TimerKind::FormationTimeout));

    a.ctx.on_driver_event(DriverEvent::WpsSuccess {
        iface: iface_a,
        peer: PEER_IFACE,
    });
    b.ctx.on_driver_event(DriverEvent::WpsSuccess {
        iface: iface_b,
        peer: OWN_ADDR,
    });

    let started = |events: Vec<P2pEvent>| {
        events.into_iter().find_map(|e| match e {
            P2pEvent::GroupStarted { role, ssid, freq, .. } => Some((role, ssid, freq)),
            _ => None,
        })
    };
    let (role_a, ssid_a, freq_a) = started(a.sink.events()).expect("A started");
    let (role_b, ssid_b, freq_b) = started(b.sink.events()).expect("B started");
    assert_eq!(role_a, GroupRole::Go);
    assert_eq!(role_b, GroupRole::Client);
    assert_eq!(ssid_a, ssid_b);
    assert_eq!(freq_a, freq_b);
    assert_eq!(a.sink.count("P2P-GROUP-FORMATION-SUCCESS"), 1);
    assert_eq!(b.sink.count("P2P-GROUP-FORMATION-SUCCESS"), 1);

    a.ctx.on_driver_event(DriverEvent::StaConnected {
        iface: iface_a,
        sta: PEER_STA,
        p2p_dev_addr: Some(PEER_DEV),
    });
    b.ctx.on_driver_event(DriverEvent::Connected { iface: iface_b });
    assert_eq!(a.ctx.group_state(iface_a), FormationState::Operating);
    assert_eq!(b.ctx.group_state(iface_b), FormationState::Operating);
    assert!(a.sink.events().contains(&P2pEvent::StaConnected {
        iface: iface_a,
        peer: PEER_DEV
    }));
    // first-client wait was disarmed and no idle timeout applies to the GO
    assert!(a.ctx.timers().is_empty());
    assert!(b.ctx.scheduler().is_empty());
}

#[test]
fn test_join_found_on_first_scan() {
    let mut rig = rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).join(None))
        .expect("connect");
    assert_eq!(iface, DEVICE_IFACE);
    assert_eq!(rig.ctx.group_state(iface), FormationState::Discovering);
    assert_eq!(rig.driver.count("trigger_scan"), 1);

    rig.ctx.on_driver_event(DriverEvent::ScanResults(vec![go_bss(
        PEER_DEV,
        PEER_IFACE,
        b"DIRECT-ab",
        2437,
    )]));
    assert_eq!(rig.sink.count("P2P-DEVICE-FOUND"), 1);
    assert_eq!(rig.driver.count("trigger_scan"), 1);
    assert!(matches!(
        rig.driver.last("prov_disc_request"),
        Some(DriverOp::ProvDiscRequest { peer: PEER_DEV, config_methods: 0x0080, join: true })
    ));
    assert!(!rig.ctx.timers().is_registered(iface, TimerKind::JoinScan));

    rig.ctx.on_driver_event(DriverEvent::ProvDiscResponse {
        peer: PEER_DEV,
        config_methods: 0x0080,
    });
    // a PD answered as part of the join is not reported on its own
    assert_eq!(rig.sink.count("P2P-PROV-DISC-RESPONSE"), 0);
    assert_eq!(rig.driver.count("start_wps_enrollee"), 1);
    match rig.driver.last("associate") {
        Some(DriverOp::Associate(p)) => {
            assert_eq!(p.bssid, PEER_IFACE);
            assert_eq!(p.ssid, ssid(b"DIRECT-ab"));
            assert_eq!(p.freq, 2437);
            assert_eq!(p.handle, DEVICE_HANDLE);
        }
        other => panic!("expected associate, got {:?}", other),
    }
    assert_eq!(rig.ctx.group_state(iface), FormationState::Provisioning);
    assert_eq!(
        rig.ctx.timers().remaining(iface, TimerKind::FormationTimeout),
        Some(Duration::from_secs(60))
    );

    rig.ctx.on_driver_event(DriverEvent::WpsSuccess {
        iface,
        peer: PEER_IFACE,
    });
    assert!(!rig.ctx.scheduler().has_work(iface, WorkKind::Join));
    assert!(rig.sink.events().iter().any(|e| matches!(
        e,
        P2pEvent::GroupStarted { role: GroupRole::Client, freq: 2437, go_dev_addr: PEER_DEV, .. }
    )));
    assert!(rig.ctx.timers().is_registered(iface, TimerKind::FirstClientWait));

    rig.ctx.on_driver_event(DriverEvent::Connected { iface });
    assert_eq!(rig.ctx.group_state(iface), FormationState::Operating);
    assert_no_leftovers(&rig);

    assert_eq!(rig.ctx.group_remove(GroupTarget::Iface(iface)), Ok(1));
    assert_eq!(rig.driver.count("deauthenticate"), 1);
    assert!(rig.sink.events().iter().any(|e| matches!(
        e,
        P2pEvent::GroupRemoved { role: GroupRole::Client, reason: GroupRemovalReason::Requested, .. }
    )));
    assert_eq!(rig.ctx.group_state(iface), FormationState::Idle);
}

#[test]
fn test_join_scan_gives_up_after_ten_attempts() {
    let mut rig = rig();
    let backoff = rig.ctx.config().join_scan_backoff();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).join(None))
        .expect("connect");

    for attempt in 1..=10 {
        assert_eq!(rig.driver.count("trigger_scan"), attempt);
        rig.ctx.on_driver_event(DriverEvent::ScanResults(Vec::new()));
        if attempt < 10 {
            assert!(rig.ctx.timers().is_registered(iface, TimerKind::JoinScan));
            rig.ctx.advance(backoff);
        }
    }

    assert!(rig.sink.events().contains(&P2pEvent::GroupFormationFailure {
        iface,
        reason: "JOIN_SCAN_LIMIT".to_string()
    }));
    // the group never started, so there is nothing to announce as removed
    assert_eq!(rig.sink.count("P2P-GROUP-REMOVED"), 0);
    assert!(rig.ctx.scan().pending_join().is_none());
    assert_no_leftovers(&rig);

    rig.ctx.advance(Duration::from_secs(30));
    assert_eq!(rig.driver.count("trigger_scan"), 10);
}

#[test]
fn test_scan_submission_failure_counts_as_attempt() {
    let mut rig = rig();
    rig.driver.fail("trigger_scan");
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).join(None))
        .expect("connect");
    assert!(rig.ctx.timers().is_registered(iface, TimerKind::JoinScan));
    assert!(rig.ctx.scheduler().is_empty());

    rig.ctx.advance(Duration::from_secs(20));
    assert_eq!(rig.driver.count("trigger_scan"), 10);
    assert_eq!(rig.sink.count("P2P-GROUP-FORMATION-FAILURE"), 1);
    assert_no_leftovers(&rig);
}

#[test]
fn test_formation_timeout_removes_dynamic_interface() {
    let mut rig = group_iface_rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc))
        .expect("connect");
    assert_ne!(iface, DEVICE_IFACE);
    let ifname = rig.ctx.iface(iface).map(|i| i.name.clone()).expect("group iface");
    assert_eq!(ifname, "p2p-wlan0-0");
    assert!(rig.ctx.iface(iface).is_some_and(|i| i.dynamic));

    rig.ctx.advance(Duration::from_secs(15));

    assert!(rig.sink.events().contains(&P2pEvent::GroupFormationFailure {
        iface,
        reason: "FORMATION_TIMEOUT".to_string()
    }));
    assert!(rig.ctx.iface(iface).is_none());
    assert_eq!(rig.driver.count("remove_interface"), 1);
    assert_eq!(rig.sink.count("P2P-GROUP-REMOVED"), 0);
    assert_no_leftovers(&rig);
}

#[test]
fn test_client_wps_failure_after_grace_releases_join() {
    let mut rig = group_iface_rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::KeypadPin("12345670".to_string())))
        .expect("connect");
    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(
        PEER_DEV, PEER_IFACE, false, 2412,
    )));
    assert!(rig.ctx.scheduler().has_work(iface, WorkKind::Join));

    rig.ctx.on_driver_event(DriverEvent::WpsFailed { iface });
    // credentials may still arrive during the grace period
    assert_eq!(rig.ctx.group_state(iface), FormationState::Provisioning);
    rig.ctx.advance(rig.ctx.config().wps_fail_grace());

    assert!(rig.sink.events().contains(&P2pEvent::GroupFormationFailure {
        iface,
        reason: "WPS_FAILED".to_string()
    }));
    assert_eq!(rig.driver.count("deauthenticate"), 1);
    assert!(rig.ctx.iface(iface).is_none());
    assert_no_leftovers(&rig);
}

/// Connect as the lower-intent side and let GO Negotiation make us a client
fn client_after_go_neg(rig: &mut TestRig) -> IfaceId {
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).go_intent(0))
        .expect("connect");
    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(
        PEER_DEV, PEER_IFACE, false, 2412,
    )));
    iface
}

fn assert_client_failure(rig: &TestRig, iface: IfaceId, reason: &str) {
    assert!(rig.sink.events().contains(&P2pEvent::GroupFormationFailure {
        iface,
        reason: reason.to_string()
    }));
    assert_eq!(rig.driver.count("deauthenticate"), 1, "client left associated after {}", reason);
    assert_eq!(rig.ctx.group_state(iface), FormationState::Idle);
}

#[test]
fn test_client_association_failure_deauthenticates() {
    let mut rig = rig();
    rig.driver.fail("associate");
    let iface = client_after_go_neg(&mut rig);

    assert_eq!(rig.driver.count("associate"), 1);
    assert_client_failure(&rig, iface, "ASSOCIATION_FAILED");
    assert_no_leftovers(&rig);
}

#[test]
fn test_client_formation_timeout_deauthenticates() {
    let mut rig = rig();
    let iface = client_after_go_neg(&mut rig);
    assert_eq!(rig.ctx.group_state(iface), FormationState::Provisioning);
    assert!(rig.ctx.scheduler().has_work(iface, WorkKind::Join));

    rig.ctx.advance(Duration::from_secs(15));

    assert_client_failure(&rig, iface, "FORMATION_TIMEOUT");
    assert!(!rig.ctx.scheduler().has_work(iface, WorkKind::Join));
    assert_no_leftovers(&rig);
}

#[test]
fn test_client_join_queue_failure_deauthenticates() {
    let config = P2pConfig {
        no_group_iface: false,
        max_queued_work: 1,
        ..test_config()
    };
    let mut rig = rig_with(config, MemoryConfigStore::new());
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).go_intent(0))
        .expect("connect");

    // an off-channel TX holds the radio and a find scan fills the queue
    let frame = ActionFrame {
        freq: 2462,
        dst: PEER_DEV,
        src: OWN_ADDR,
        bssid: PEER_DEV,
        payload: vec![0x04, 0x0a],
        wait_ms: 200,
    };
    rig.ctx.send_action(DEVICE_IFACE, frame).expect("action tx");
    rig.ctx
        .start_discovery(None, DiscoveryType::Social, Vec::new())
        .expect("find");
    assert_eq!(rig.driver.count("trigger_scan"), 0);

    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(
        PEER_DEV, PEER_IFACE, false, 2412,
    )));

    assert_eq!(rig.driver.count("start_wps_enrollee"), 1);
    assert_eq!(rig.driver.count("associate"), 0);
    assert_client_failure(&rig, iface, "JOIN_FAILED");
    assert!(rig.ctx.iface(iface).is_none());
    assert_eq!(rig.driver.count("remove_interface"), 1);
}

#[test]
fn test_go_wps_failure_is_immediate() {
    let mut rig = rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).go_intent(15))
        .expect("connect");
    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(
        PEER_DEV, PEER_IFACE, true, 2462,
    )));
    rig.ctx.on_driver_event(DriverEvent::WpsFailed { iface });

    assert_eq!(rig.driver.count("stop_go"), 1);
    assert!(rig.sink.events().iter().any(|e| matches!(
        e,
        P2pEvent::GroupRemoved { role: GroupRole::Go, reason: GroupRemovalReason::FormationFailed, .. }
    )));
    assert_no_leftovers(&rig);
}

#[test]
fn test_go_neg_failure_reports_status() {
    let mut rig = group_iface_rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc))
        .expect("connect");
    let mut result = go_neg_result(PEER_DEV, PEER_IFACE, false, 0);
    result.status = P2pStatus::BothGoIntentOfFifteen;
    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(result));

    assert!(rig.sink.events().contains(&P2pEvent::GoNegFailure {
        peer: PEER_DEV,
        status: P2pStatus::BothGoIntentOfFifteen
    }));
    assert!(rig.ctx.iface(iface).is_none());
    assert_no_leftovers(&rig);
}

#[test]
fn test_go_without_client_is_removed_after_wait() {
    let mut rig = rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).go_intent(15))
        .expect("connect");
    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(
        PEER_DEV, PEER_IFACE, true, 2412,
    )));
    rig.ctx.on_driver_event(DriverEvent::WpsSuccess {
        iface,
        peer: PEER_IFACE,
    });
    assert_eq!(
        rig.ctx.timers().remaining(iface, TimerKind::FirstClientWait),
        Some(Duration::from_secs(10))
    );

    rig.ctx.advance(Duration::from_secs(10));
    assert_eq!(rig.driver.count("stop_go"), 1);
    assert_eq!(rig.ctx.group_state(iface), FormationState::Idle);
    assert_no_leftovers(&rig);
}

#[test]
fn test_client_idle_timeout_after_disconnect() {
    let mut rig = rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc))
        .expect("connect");
    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(
        PEER_DEV, PEER_IFACE, false, 2412,
    )));
    rig.ctx.on_driver_event(DriverEvent::WpsSuccess {
        iface,
        peer: PEER_IFACE,
    });
    rig.ctx.on_driver_event(DriverEvent::Connected { iface });
    assert!(!rig.ctx.timers().is_registered(iface, TimerKind::IdleTimeout));

    rig.ctx.on_driver_event(DriverEvent::Disconnected { iface });
    assert_eq!(
        rig.ctx.timers().remaining(iface, TimerKind::IdleTimeout),
        Some(Duration::from_secs(10))
    );
    rig.ctx.advance(Duration::from_secs(10));
    assert!(rig.sink.events().iter().any(|e| matches!(
        e,
        P2pEvent::GroupRemoved { reason: GroupRemovalReason::IdleTimeout, .. }
    )));
    assert_no_leftovers(&rig);
}

#[test]
fn test_auto_join_falls_back_to_negotiation() {
    let mut rig = rig();
    rig.ctx.on_driver_event(DriverEvent::ScanResults(vec![go_bss(
        PEER_DEV,
        PEER_IFACE,
        b"DIRECT-ab",
        2437,
    )]));
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).auto_join())
        .expect("connect");
    assert_eq!(rig.ctx.group_state(iface), FormationState::Discovering);

    // the GO is gone from the next scan
    rig.ctx.on_driver_event(DriverEvent::ScanResults(vec![device_bss(PEER_DEV, 2412)]));
    rig.ctx.on_driver_event(DriverEvent::ProvDiscFailure {
        peer: PEER_DEV,
        status: None,
        join_timeout: true,
    });
    assert_eq!(rig.driver.count("go_neg_request"), 1);
    assert_eq!(rig.ctx.group_state(iface), FormationState::Negotiating);
}

#[test]
fn test_cancel_pending_join_and_nothing_left() {
    let mut rig = rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).join(None))
        .expect("connect");
    assert!(rig.ctx.scheduler().has_work(iface, WorkKind::Scan));

    assert_eq!(rig.ctx.cancel(), Ok(()));
    assert!(rig.ctx.scan().pending_join().is_none());
    assert_no_leftovers(&rig);
    assert_eq!(rig.ctx.cancel(), Err(P2pError::NothingToCancel));
}

#[test]
fn test_cancel_during_provisioning_reports_failure() {
    let mut rig = rig();
    let iface = rig
        .ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc))
        .expect("connect");
    rig.ctx.on_driver_event(DriverEvent::GoNegCompleted(go_neg_result(
        PEER_DEV, PEER_IFACE, false, 2412,
    )));
    assert_eq!(rig.ctx.cancel(), Ok(()));
    assert!(rig.sink.events().contains(&P2pEvent::GroupFormationFailure {
        iface,
        reason: "CANCELLED".to_string()
    }));
    assert_no_leftovers(&rig);
}

#[test]
fn test_second_formation_is_busy() {
    let mut rig = rig();
    rig.ctx
        .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc))
        .expect("connect");
    assert_eq!(
        rig.ctx.connect(ConnectRequest::new(PEER_IFACE, WpsMethod::Pbc)),
        Err(P2pError::InProgress(DEVICE_IFACE))
    );
    assert_eq!(
        rig.ctx
            .connect(ConnectRequest::new(PEER_DEV, WpsMethod::Pbc).go_intent(16))
            .map_err(|e| e.reason_code()),
        Err("INVALID_GO_INTENT")
    );
}

#[test]
fn test_autonomous_go_and_remove_all() {
    let mut rig = group_iface_rig();
    let first = rig.ctx.group_add(false, 2437).expect("first GO");
    let second = rig.ctx.group_add(false, 2437).expect("second GO");
    assert_ne!(first, second);
    assert_eq!(rig.ctx.group_state(first), FormationState::Operating);
    assert_eq!(rig.sink.count("P2P-GROUP-STARTED"), 2);
    assert!(matches!(
        rig.driver.last("add_interface"),
        Some(DriverOp::AddInterface { name, .. }) if name == "p2p-wlan0-1"
    ));

    assert_eq!(rig.ctx.group_remove(GroupTarget::All), Ok(2));
    assert_eq!(rig.driver.count("stop_go"), 2);
    assert_eq!(rig.driver.count("remove_interface"), 2);
    assert_no_leftovers(&rig);
    assert_eq!(
        rig.ctx.group_remove(GroupTarget::Iface(IfaceId(7))),
        Err(P2pError::UnknownInterface(IfaceId(7)))
    );
}

#[test]
fn test_shutdown_tears_down_and_disables() {
    let mut rig = rig();
    rig.ctx.group_add(false, 2412).expect("GO");
    rig.ctx.shutdown();
    assert!(!rig.ctx.is_enabled());
    assert_eq!(rig.driver.count("stop_go"), 1);
    assert!(rig.sink.events().iter().any(|e| matches!(
        e,
        P2pEvent::GroupRemoved { reason: GroupRemovalReason::Unavailable, .. }
    )));
    assert_eq!(rig.ctx.group_add(false, 2412), Err(P2pError::Disabled));
}
