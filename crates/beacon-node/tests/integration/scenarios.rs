//! End-to-end behaviour between stations in range of each other.

use std::sync::Arc;
use std::time::Duration;

use beacon_engine::{MeshEvent, RemoteProfile, Role};
use beacon_node::transport::{LoopbackBus, Transport};
use beacon_protocol::{AttendantAck, EventAction, HexId, StableId};
use beacon_storage::{ConnectionStore, TrustAnchorStore};

use crate::harness::{StaticLookup, TestMesh, TestNodeBuilder};

#[tokio::test]
async fn test_discovery_records_sighting() {
    let bus = LoopbackBus::new();
    let ann = TestNodeBuilder::new("A1B2C3")
        .name("Ann")
        .bio("eng")
        .build(&bus)
        .unwrap();
    let observer = TestNodeBuilder::new("0B5E72").rssi(-55).build(&bus).unwrap();
    bus.link_all();
    ann.handle.start_scanning().await.unwrap();
    observer.handle.start_scanning().await.unwrap();

    let snapshot = observer
        .wait_snapshot(|s| s.profiles.iter().any(|p| p.profile.hex_id == "A1B2C3"))
        .await;
    let seen = &snapshot.profiles[0].profile;
    assert_eq!(seen.stable_id, StableId::derive("A1B2C3"));
    assert_eq!(seen.name, "Ann");
    assert_eq!(seen.bio, "eng");
    assert_eq!(seen.rssi, -55);
    assert!(!snapshot.profiles[0].is_enriched);

    ann.shutdown().await;
    observer.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_expires() {
    let bus = LoopbackBus::new();
    let mut timing = crate::harness::fast_timing();
    timing.nearby_ttl = Duration::from_millis(300);
    let ann = TestNodeBuilder::new("A1B2C3").build(&bus).unwrap();
    let observer = TestNodeBuilder::new("0B5E72")
        .timing(timing)
        .build(&bus)
        .unwrap();
    bus.link_all();
    ann.handle.start_scanning().await.unwrap();
    observer.handle.start_scanning().await.unwrap();

    observer.wait_snapshot(|s| s.profiles.len() == 1).await;
    ann.handle.stop_scanning().await.unwrap();
    observer.wait_snapshot(|s| s.profiles.is_empty()).await;

    ann.shutdown().await;
    observer.shutdown().await;
}

#[tokio::test]
async fn test_handshake_accept_persists_on_both_sides() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    let a_id = HexId::parse("AAAAAA").unwrap();
    let b_id = HexId::parse("BBBBBB").unwrap();

    mesh.node("BBBBBB")
        .handle
        .send_request(&a_id)
        .await
        .unwrap();

    let a = mesh.node("AAAAAA");
    let requested = a
        .wait_event(|e| matches!(e, MeshEvent::ConnectionRequested { .. }))
        .await;
    match requested {
        MeshEvent::ConnectionRequested { from_id, from_name } => {
            assert_eq!(from_id, "BBBBBB");
            assert_eq!(from_name, "node-bbbbbb");
        }
        other => panic!("unexpected {other:?}"),
    }

    a.handle.accept(&b_id).await.unwrap();
    assert!(a.storage.is_connected("BBBBBB").unwrap());

    let b = mesh.node("BBBBBB");
    let confirmed = b
        .wait_event(|e| matches!(e, MeshEvent::ConnectionConfirmed { .. }))
        .await;
    assert_eq!(
        confirmed,
        MeshEvent::ConnectionConfirmed {
            peer_id: "AAAAAA".into()
        }
    );
    assert!(b.storage.is_connected("AAAAAA").unwrap());

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_late_request_copy_does_not_reprompt() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    let a_id = HexId::parse("AAAAAA").unwrap();
    let b_id = HexId::parse("BBBBBB").unwrap();

    mesh.node("BBBBBB").handle.send_request(&a_id).await.unwrap();
    let a = mesh.node("AAAAAA");
    a.wait_event(|e| matches!(e, MeshEvent::ConnectionRequested { .. }))
        .await;
    a.handle.accept(&b_id).await.unwrap();

    // A straggling burst copy of B's request, heard after the accept.
    let (echo, _inbound) = mesh.bus.attach("E0E0E0", -70);
    mesh.bus.link("E0E0E0", "AAAAAA");
    echo.send("PMCC|node-bbbbbb|BBBBBB|AAAAAA|REQUEST".into(), None);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let a = mesh.node("AAAAAA");
    assert!(a
        .drain()
        .iter()
        .all(|e| !matches!(e, MeshEvent::ConnectionRequested { .. })));
    assert!(a.storage.is_connected("BBBBBB").unwrap());

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_handshake_reject_leaves_no_connection() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    let a_id = HexId::parse("AAAAAA").unwrap();
    let b_id = HexId::parse("BBBBBB").unwrap();

    mesh.node("BBBBBB").handle.send_request(&a_id).await.unwrap();
    let a = mesh.node("AAAAAA");
    a.wait_event(|e| matches!(e, MeshEvent::ConnectionRequested { .. }))
        .await;
    a.handle.reject(&b_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!mesh.node("AAAAAA").storage.is_connected("BBBBBB").unwrap());
    assert!(!mesh.node("BBBBBB").storage.is_connected("AAAAAA").unwrap());
    assert!(mesh.node("BBBBBB").drain().iter().all(|e| !matches!(
        e,
        MeshEvent::ConnectionConfirmed { .. }
    )));
    assert_eq!(mesh.sent("AAAAAA", "PMCC|").len(), 1);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_request_to_self_is_refused() {
    let mut mesh = TestMesh::full(&["AAAAAA"]).await.unwrap();
    let me = HexId::parse("AAAAAA").unwrap();
    let err = mesh.node("AAAAAA").handle.send_request(&me).await.unwrap_err();
    assert!(err.to_string().contains("own identity"), "{err}");
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_connected_peer_is_enriched_once() {
    let bus = LoopbackBus::new();
    let lookup = Arc::new(StaticLookup::default().with(
        "BBBBBB",
        RemoteProfile {
            full_name: Some("Bob Jones".into()),
            bio: Some("Distributed systems".into()),
            tech_stack: vec!["rust".into(), "sqlite".into()],
            link: Some("https://example.org/bob".into()),
        },
    ));
    let mut a = TestNodeBuilder::new("AAAAAA")
        .network_up(true)
        .lookup(lookup.clone())
        .build(&bus)
        .unwrap();
    let b = TestNodeBuilder::new("BBBBBB").build(&bus).unwrap();
    let c = TestNodeBuilder::new("CCCCCC").build(&bus).unwrap();
    a.storage.add_connection("BBBBBB").unwrap();
    bus.link_all();
    for node in [&a, &b, &c] {
        node.handle.start_scanning().await.unwrap();
    }

    let enriched = a
        .wait_event(|e| matches!(e, MeshEvent::ProfileEnriched { .. }))
        .await;
    let MeshEvent::ProfileEnriched { profile } = enriched else {
        unreachable!()
    };
    assert_eq!(profile.profile.hex_id, "BBBBBB");
    assert_eq!(profile.full_name.as_deref(), Some("Bob Jones"));
    assert_eq!(profile.tech_stack, vec!["rust", "sqlite"]);

    let snapshot = a
        .wait_snapshot(|s| s.profiles.iter().any(|p| p.is_enriched))
        .await;
    let bob = snapshot
        .profiles
        .iter()
        .find(|p| p.profile.hex_id == "BBBBBB")
        .unwrap();
    assert_eq!(bob.profile.name, "node-bbbbbb");
    assert_eq!(bob.link.as_deref(), Some("https://example.org/bob"));

    // Several more beacons from both peers; only the connected one was looked up.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(lookup.calls(), 1);
    let snapshot = a.handle.snapshot();
    let carol = snapshot
        .profiles
        .iter()
        .find(|p| p.profile.hex_id == "CCCCCC")
        .unwrap();
    assert!(!carol.is_enriched);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_accepting_nearby_peer_enriches_without_new_beacon() {
    let bus = LoopbackBus::new();
    let lookup = Arc::new(StaticLookup::default().with(
        "BBBBBB",
        RemoteProfile {
            full_name: Some("Bob Jones".into()),
            ..Default::default()
        },
    ));
    let mut a = TestNodeBuilder::new("AAAAAA")
        .network_up(true)
        .lookup(lookup.clone())
        .build(&bus)
        .unwrap();
    let b = TestNodeBuilder::new("BBBBBB").build(&bus).unwrap();
    bus.link_all();
    a.handle.start_scanning().await.unwrap();
    b.handle.start_scanning().await.unwrap();

    a.wait_snapshot(|s| s.profiles.len() == 1).await;
    assert_eq!(lookup.calls(), 0);

    // B goes quiet but stays in A's table; its request still goes out.
    b.handle.stop_scanning().await.unwrap();
    b.handle
        .send_request(&HexId::parse("AAAAAA").unwrap())
        .await
        .unwrap();
    a.wait_event(|e| matches!(e, MeshEvent::ConnectionRequested { .. }))
        .await;
    a.handle.accept(&HexId::parse("BBBBBB").unwrap()).await.unwrap();

    let enriched = a
        .wait_event(|e| matches!(e, MeshEvent::ProfileEnriched { .. }))
        .await;
    let MeshEvent::ProfileEnriched { profile } = enriched else {
        unreachable!()
    };
    assert_eq!(profile.profile.hex_id, "BBBBBB");
    assert_eq!(profile.full_name.as_deref(), Some("Bob Jones"));
    assert_eq!(lookup.calls(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_lookup_waits_for_network() {
    let bus = LoopbackBus::new();
    let lookup = Arc::new(StaticLookup::default().with(
        "BBBBBB",
        RemoteProfile {
            full_name: Some("Bob Jones".into()),
            ..Default::default()
        },
    ));
    let mut a = TestNodeBuilder::new("AAAAAA")
        .lookup(lookup.clone())
        .build(&bus)
        .unwrap();
    let b = TestNodeBuilder::new("BBBBBB").build(&bus).unwrap();
    a.storage.add_connection("BBBBBB").unwrap();
    bus.link_all();
    a.handle.start_scanning().await.unwrap();
    b.handle.start_scanning().await.unwrap();

    a.wait_snapshot(|s| s.profiles.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(lookup.calls(), 0);

    a.network.set_available(true);
    a.wait_event(|e| matches!(e, MeshEvent::ProfileEnriched { .. }))
        .await;
    assert_eq!(lookup.calls(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_impostor_host_is_dropped() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    let (forger, _inbound) = mesh.bus.attach("BADGUY", -40);
    mesh.bus.link("BADGUY", "BBBBBB");

    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();
    let x = mesh.node("BBBBBB");
    x.wait_event(|e| matches!(e, MeshEvent::EventJoined { .. }))
        .await;
    assert_eq!(
        x.storage.anchor("EVT001").unwrap().as_deref(),
        Some("AAAAAA")
    );

    forger.send("PMEH|EVT001|BADGUY|EN".into(), None);
    forger.send("PMEH|EVT001|BADGUY|AS".into(), None);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let x = mesh.node("BBBBBB");
    assert_eq!(
        x.storage.anchor("EVT001").unwrap().as_deref(),
        Some("AAAAAA")
    );
    assert_eq!(
        x.handle.snapshot().role,
        Role::Attending {
            event_id: "EVT001".into(),
            host_id: "AAAAAA".into()
        }
    );
    assert!(x.drain().iter().all(|e| !matches!(
        e,
        MeshEvent::EventEnded { .. } | MeshEvent::HostActionReceived { action: EventAction::Assemble, .. }
    )));
    assert!(mesh.sent("BBBBBB", "PMEH").iter().all(|p| !p.contains("BADGUY")));

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_repeated_roll_call_handled_once_relayed_each_time() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();

    // Initial broadcast plus two host repeats.
    tokio::time::sleep(Duration::from_millis(750)).await;

    let host_sends = mesh.sent("AAAAAA", "PMEH|EVT001|AAAAAA|RC");
    assert!(host_sends.len() >= 2, "host sent {}", host_sends.len());
    let relays = mesh.sent("BBBBBB", "PMEH|EVT001|AAAAAA|RC");
    assert_eq!(relays.len(), host_sends.len());

    assert_eq!(mesh.sent("BBBBBB", "PMEA|"), vec!["PMEA|EVT001|BBBBBB|PR"]);
    let x_events = mesh.node("BBBBBB").drain();
    let shown = x_events
        .iter()
        .filter(|e| matches!(e, MeshEvent::HostActionReceived { .. }))
        .count();
    assert_eq!(shown, 1);

    let host = mesh.node("AAAAAA");
    let responded = host
        .wait_event(|e| matches!(e, MeshEvent::AttendeeResponded { .. }))
        .await;
    assert_eq!(
        responded,
        MeshEvent::AttendeeResponded {
            event_id: "EVT001".into(),
            guest_id: "BBBBBB".into(),
            ack: Some(AttendantAck::Present),
        }
    );
    assert_eq!(host.handle.snapshot().roster["BBBBBB"].ack, "PR");

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_new_action_is_acknowledged() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();
    mesh.node("BBBBBB")
        .wait_event(|e| matches!(e, MeshEvent::EventJoined { .. }))
        .await;

    mesh.node("AAAAAA")
        .handle
        .broadcast_action(EventAction::Assemble)
        .await
        .unwrap();
    let x = mesh.node("BBBBBB");
    x.wait_event(|e| {
        matches!(
            e,
            MeshEvent::HostActionReceived {
                action: EventAction::Assemble,
                ..
            }
        )
    })
    .await;
    let shown = x.handle.snapshot().shown_action.unwrap();
    assert_eq!(shown.action, EventAction::Assemble);

    mesh.node("AAAAAA")
        .wait_snapshot(|s| s.roster.get("BBBBBB").is_some_and(|a| a.ack == "AK"))
        .await;

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_shown_action_clears_after_display_window() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();

    let x = mesh.node("BBBBBB");
    x.wait_snapshot(|s| s.shown_action.is_some()).await;
    x.wait_snapshot(|s| s.shown_action.is_none()).await;
    // Still attending; only the display went away.
    assert!(matches!(x.handle.snapshot().role, Role::Attending { .. }));

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_end_event_then_fresh_anchor() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();
    mesh.node("BBBBBB")
        .wait_event(|e| matches!(e, MeshEvent::EventJoined { .. }))
        .await;

    mesh.node("AAAAAA").handle.stop_hosting().await.unwrap();
    let x = mesh.node("BBBBBB");
    let ended = x
        .wait_event(|e| matches!(e, MeshEvent::EventEnded { .. }))
        .await;
    assert_eq!(
        ended,
        MeshEvent::EventEnded {
            event_id: "EVT001".into()
        }
    );
    assert_eq!(x.handle.snapshot().role, Role::Idle);
    assert_eq!(x.storage.anchor("EVT001").unwrap(), None);

    // Let the rest of the end-event volley land before hosting again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(mesh.sent("AAAAAA", "PMEH|EVT001|AAAAAA|EN").len(), 5);

    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();
    let x = mesh.node("BBBBBB");
    let joined = x
        .wait_event(|e| matches!(e, MeshEvent::EventJoined { .. }))
        .await;
    assert_eq!(
        joined,
        MeshEvent::EventJoined {
            event_id: "EVT001".into(),
            host_id: "AAAAAA".into()
        }
    );
    assert_eq!(
        x.storage.anchor("EVT001").unwrap().as_deref(),
        Some("AAAAAA")
    );

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_left_event_is_not_rejoined() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();
    let x = mesh.node("BBBBBB");
    x.wait_event(|e| matches!(e, MeshEvent::EventJoined { .. }))
        .await;

    x.handle.leave_event().await.unwrap();
    assert_eq!(x.handle.snapshot().role, Role::Idle);
    assert!(x.handle.snapshot().shown_action.is_none());

    // Host repeats keep arriving; X still relays them but stays out.
    tokio::time::sleep(Duration::from_millis(700)).await;
    let x = mesh.node("BBBBBB");
    assert_eq!(x.handle.snapshot().role, Role::Idle);
    assert!(x
        .drain()
        .iter()
        .all(|e| !matches!(e, MeshEvent::EventJoined { .. })));
    assert!(mesh.sent("BBBBBB", "PMEH|EVT001|AAAAAA|RC").len() >= 2);

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_claimed_event_cannot_be_hosted() {
    let mut mesh = TestMesh::full(&["AAAAAA", "BBBBBB"]).await.unwrap();
    mesh.node("AAAAAA").handle.start_hosting("EVT001").await.unwrap();
    let x = mesh.node("BBBBBB");
    x.wait_event(|e| matches!(e, MeshEvent::EventJoined { .. }))
        .await;
    x.handle.leave_event().await.unwrap();
    assert_eq!(x.storage.anchor("EVT001").unwrap(), None);

    // The next host repeat re-anchors the event without rejoining it.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let x = mesh.node("BBBBBB");
    assert_eq!(
        x.storage.anchor("EVT001").unwrap().as_deref(),
        Some("AAAAAA")
    );
    let err = x.handle.start_hosting("EVT001").await.unwrap_err();
    assert!(err.to_string().contains("AAAAAA"), "{err}");
    x.handle.start_hosting("EVT002").await.unwrap();

    mesh.shutdown().await;
}

#[tokio::test]
async fn test_stored_anchor_outlives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("beacon.db");
    {
        let storage = beacon_storage::SqliteStorage::open(&db).unwrap();
        storage.lock_anchor("EVT001", "AAAAAA").unwrap();
    }

    // Same event id, different host: the node reopened on that database refuses it.
    let bus = LoopbackBus::new();
    let rival = TestNodeBuilder::new("CCCCCC").build(&bus).unwrap();
    let mut x = TestNodeBuilder::new("BBBBBB")
        .database(&db)
        .build(&bus)
        .unwrap();
    bus.link_all();
    rival.handle.start_scanning().await.unwrap();
    x.handle.start_scanning().await.unwrap();
    rival.handle.start_hosting("EVT001").await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(x.handle.snapshot().role, Role::Idle);
    assert!(x
        .drain()
        .iter()
        .all(|e| !matches!(e, MeshEvent::EventJoined { .. })));
    assert!(x
        .storage
        .list_anchors()
        .unwrap()
        .iter()
        .any(|row| row.event_id == "EVT001" && row.host_id == "AAAAAA"));
    assert!(bus.sent_by("BBBBBB").iter().all(|p| !p.starts_with("PMEH")));

    rival.shutdown().await;
    x.shutdown().await;
}
