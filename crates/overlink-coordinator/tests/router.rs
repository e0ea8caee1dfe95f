//! Session router integration tests
//!
//! Runs the full router against the in-process transport and a SQLite
//! in-memory store: registration, relay dispatch, replacement, exhaustion,
//! back-pressure and liveness.

use chrono::Utc;
use overlink_coordinator::{AddressPool, RouterSettings, SessionRouter};
use overlink_db::entities::{agent, routing_rule, user};
use overlink_db::{connect, migrate, Repository};
use overlink_proto::{
    AgentKind, AgentMetadata, AgentStatus, ControlMessage, RejectReason, RouteAction,
    ServerSettings, TrafficStats, PROTOCOL_VERSION,
};
use overlink_transport::mem::{mem_link, MemConnection, MemConnector, MemStream};
use overlink_transport::{TransportConnection, TransportConnector, TransportStream};
use sea_orm::{ActiveModelTrait, Set};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TEST_KEY: &str = "test-api-key";

struct Harness {
    router: Arc<SessionRouter>,
    repo: Repository,
    connector: MemConnector,
    user_id: Uuid,
}

async fn setup(cidr: &str) -> Harness {
    setup_with(cidr, 90).await
}

async fn setup_with(cidr: &str, keepalive_timeout_secs: u16) -> Harness {
    let db = connect("sqlite::memory:").await.expect("connect");
    migrate(&db).await.expect("migrate");
    let repo = Repository::new(db);

    let user_id = seed_user(&repo, TEST_KEY, user::UserStatus::Active).await;

    let pool = Arc::new(AddressPool::new(cidr).expect("pool"));
    let settings = RouterSettings {
        gateway_ip: pool.gateway(),
        overlay_prefix: pool.prefix_len(),
        mtu: 1400,
        keepalive_interval_secs: 30,
        keepalive_timeout_secs,
    };
    let router = Arc::new(SessionRouter::new(repo.clone(), pool, settings));

    let (listener, connector) = mem_link();
    let accept_router = router.clone();
    tokio::spawn(async move {
        use overlink_transport::TransportListener;
        while let Ok((conn, peer)) = listener.accept().await {
            let router = accept_router.clone();
            tokio::spawn(router.handle_connection(Arc::new(conn), peer));
        }
    });

    Harness {
        router,
        repo,
        connector,
        user_id,
    }
}

async fn seed_user(repo: &Repository, api_key: &str, status: user::UserStatus) -> Uuid {
    let id = Uuid::new_v4();
    let now = Utc::now();
    user::ActiveModel {
        id: Set(id),
        username: Set(format!("user-{}", id)),
        email: Set(None),
        password_hash: Set("unused".to_string()),
        api_key: Set(api_key.to_string()),
        status: Set(status),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(repo.connection())
    .await
    .expect("seed user");
    id
}

async fn dial(h: &Harness) -> MemConnection {
    h.connector
        .connect("127.0.0.1:4433".parse().unwrap(), "localhost")
        .await
        .expect("dial")
}

struct Ack {
    accepted: bool,
    session_id: String,
    assigned_ip: String,
    settings: Option<ServerSettings>,
    reject: Option<RejectReason>,
}

async fn register(conn: &MemConnection, agent_id: &str, api_key: &str, kind: AgentKind) -> Ack {
    register_version(conn, agent_id, api_key, kind, PROTOCOL_VERSION).await
}

async fn register_version(
    conn: &MemConnection,
    agent_id: &str,
    api_key: &str,
    kind: AgentKind,
    version: &str,
) -> Ack {
    let mut stream = conn.open_stream().await.expect("open register stream");
    stream
        .send_message(&ControlMessage::Register {
            agent_id: agent_id.to_string(),
            api_key: api_key.to_string(),
            kind,
            protocol_version: version.to_string(),
            bandwidth_kbps: 0,
            metadata: AgentMetadata {
                hostname: format!("host-{}", agent_id),
                ..AgentMetadata::default()
            },
        })
        .await
        .expect("send register");

    let reply = timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .expect("register timed out")
        .expect("register recv");

    match reply {
        Some(ControlMessage::RegisterAck {
            accepted,
            session_id,
            assigned_ip,
            settings,
            reject,
            ..
        }) => Ack {
            accepted,
            session_id,
            assigned_ip,
            settings,
            reject,
        },
        other => panic!("Expected RegisterAck, got {:?}", other),
    }
}

async fn bind_relay(conn: &MemConnection, session_id: &str, agent_id: &str) -> MemStream {
    let mut stream = conn.open_stream().await.expect("open relay stream");
    stream
        .send_message(&ControlMessage::Packet {
            session_id: session_id.to_string(),
            source_agent_id: agent_id.to_string(),
            destination_agent_id: None,
            payload: Vec::new(),
        })
        .await
        .expect("send bind frame");
    stream
}

fn packet(session_id: &str, agent_id: &str, dest: Option<&str>, payload: Vec<u8>) -> ControlMessage {
    ControlMessage::Packet {
        session_id: session_id.to_string(),
        source_agent_id: agent_id.to_string(),
        destination_agent_id: dest.map(|s| s.to_string()),
        payload,
    }
}

#[tokio::test]
async fn test_cold_start_client_to_gateway() {
    let h = setup("10.200.0.0/16").await;

    let gw_conn = dial(&h).await;
    let gw = register(&gw_conn, "gw-1", TEST_KEY, AgentKind::Gateway).await;
    assert!(gw.accepted);
    assert_eq!(gw.assigned_ip, "10.200.0.2");
    let settings = gw.settings.expect("settings");
    assert_eq!(settings.gateway_ip, "10.200.0.1");
    assert_eq!(settings.overlay_prefix, 16);
    assert_eq!(settings.mtu, 1400);

    let client_conn = dial(&h).await;
    let client = register(&client_conn, "client-1", TEST_KEY, AgentKind::Client).await;
    assert!(client.accepted);
    assert_eq!(client.assigned_ip, "10.200.0.3");

    let gw_entry = h.router.sessions().get_by_agent("gw-1").unwrap();
    assert_eq!(gw_entry.user_id, h.user_id);

    let mut gw_relay = bind_relay(&gw_conn, &gw.session_id, "gw-1").await;
    let mut client_relay = bind_relay(&client_conn, &client.session_id, "client-1").await;

    let payload = vec![0xabu8; 64];
    client_relay
        .send_message(&packet(&client.session_id, "client-1", None, payload.clone()))
        .await
        .expect("send packet");

    let delivered = timeout(Duration::from_secs(5), gw_relay.recv_message())
        .await
        .expect("delivery timed out")
        .expect("recv");

    match delivered {
        Some(ControlMessage::Packet {
            source_agent_id,
            payload: received,
            ..
        }) => {
            assert_eq!(source_agent_id, "client-1");
            assert_eq!(received, payload);
        }
        other => panic!("Expected Packet, got {:?}", other),
    }
}

#[tokio::test]
async fn test_directed_packet_delivery() {
    let h = setup("10.200.0.0/16").await;

    let a_conn = dial(&h).await;
    let a = register(&a_conn, "client-a", TEST_KEY, AgentKind::Client).await;
    let b_conn = dial(&h).await;
    let b = register(&b_conn, "client-b", TEST_KEY, AgentKind::Client).await;

    let mut a_relay = bind_relay(&a_conn, &a.session_id, "client-a").await;
    let mut b_relay = bind_relay(&b_conn, &b.session_id, "client-b").await;

    a_relay
        .send_message(&packet(&a.session_id, "client-a", Some("client-b"), vec![1, 2, 3]))
        .await
        .unwrap();

    let delivered = timeout(Duration::from_secs(5), b_relay.recv_message())
        .await
        .expect("delivery timed out")
        .unwrap();
    match delivered {
        Some(ControlMessage::Packet { payload, .. }) => assert_eq!(payload, vec![1, 2, 3]),
        other => panic!("Expected Packet, got {:?}", other),
    }
}

#[tokio::test]
async fn test_packet_order_preserved() {
    let h = setup("10.200.0.0/16").await;

    let gw_conn = dial(&h).await;
    let gw = register(&gw_conn, "gw-1", TEST_KEY, AgentKind::Gateway).await;
    let client_conn = dial(&h).await;
    let client = register(&client_conn, "client-1", TEST_KEY, AgentKind::Client).await;

    let mut gw_relay = bind_relay(&gw_conn, &gw.session_id, "gw-1").await;
    let mut client_relay = bind_relay(&client_conn, &client.session_id, "client-1").await;

    for i in 0..50u8 {
        client_relay
            .send_message(&packet(&client.session_id, "client-1", None, vec![i]))
            .await
            .unwrap();
    }

    for i in 0..50u8 {
        let delivered = timeout(Duration::from_secs(5), gw_relay.recv_message())
            .await
            .expect("delivery timed out")
            .unwrap();
        match delivered {
            Some(ControlMessage::Packet { payload, .. }) => assert_eq!(payload, vec![i]),
            other => panic!("Expected Packet, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_reregistration_preempts_old_session() {
    let h = setup("10.200.0.0/16").await;

    let first_conn = dial(&h).await;
    let first = register(&first_conn, "client-1", TEST_KEY, AgentKind::Client).await;
    assert!(first.accepted);
    let mut first_relay = bind_relay(&first_conn, &first.session_id, "client-1").await;

    // A second process shows up with the same agent id and key
    let second_conn = dial(&h).await;
    let second = register(&second_conn, "client-1", TEST_KEY, AgentKind::Client).await;
    assert!(second.accepted);
    assert_ne!(second.session_id, first.session_id);
    assert_eq!(second.assigned_ip, first.assigned_ip);

    // The old relay stream ends
    let end = timeout(Duration::from_secs(2), first_relay.recv_message())
        .await
        .expect("old stream did not end")
        .expect("recv");
    assert_eq!(end, None);

    // Only the new session is live
    assert_eq!(h.router.sessions().count(), 1);
    assert_eq!(
        h.router
            .sessions()
            .get_by_agent("client-1")
            .unwrap()
            .session_id,
        second.session_id
    );
}

#[tokio::test]
async fn test_pool_exhaustion_and_release() {
    // One allocatable address after the three reserved ones
    let h = setup("10.0.0.0/30").await;

    let a_conn = dial(&h).await;
    let a = register(&a_conn, "agent-a", TEST_KEY, AgentKind::Client).await;
    assert!(a.accepted);
    assert_eq!(a.assigned_ip, "10.0.0.2");

    let b_conn = dial(&h).await;
    let b = register(&b_conn, "agent-b", TEST_KEY, AgentKind::Client).await;
    assert!(!b.accepted);
    assert_eq!(b.reject, Some(RejectReason::AddressPoolExhausted));

    // Administrative release frees the address for the next registration
    h.router.pool().release("agent-a").unwrap();

    let b2 = register(&b_conn, "agent-b", TEST_KEY, AgentKind::Client).await;
    assert!(b2.accepted);
    assert_eq!(b2.assigned_ip, "10.0.0.2");
}

#[tokio::test]
async fn test_protocol_mismatch_leaves_no_trace() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let ack = register_version(&conn, "client-old", TEST_KEY, AgentKind::Client, "0.9.0").await;

    assert!(!ack.accepted);
    assert_eq!(ack.reject, Some(RejectReason::IncompatibleProtocol));

    // No agent row, no allocation
    assert!(h.repo.agent_by_id("client-old").await.unwrap().is_none());
    assert_eq!(h.router.pool().allocated_count(), 0);
}

#[tokio::test]
async fn test_unauthenticated_register() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let ack = register(&conn, "client-1", "wrong-key", AgentKind::Client).await;

    assert!(!ack.accepted);
    assert_eq!(ack.reject, Some(RejectReason::Unauthenticated));
    assert!(h.repo.agent_by_id("client-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_register_rejects_foreign_agent_id() {
    let h = setup("10.200.0.0/16").await;
    seed_user(&h.repo, "other-key", user::UserStatus::Active).await;

    let conn = dial(&h).await;
    let first = register(&conn, "shared-id", TEST_KEY, AgentKind::Client).await;
    assert!(first.accepted);

    let thief_conn = dial(&h).await;
    let stolen = register(&thief_conn, "shared-id", "other-key", AgentKind::Client).await;
    assert!(!stolen.accepted);
    assert_eq!(stolen.reject, Some(RejectReason::PermissionDenied));
}

#[tokio::test]
async fn test_get_routes_sorted_by_priority() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let ack = register(&conn, "client-1", TEST_KEY, AgentKind::Client).await;
    assert!(ack.accepted);

    let now = Utc::now();
    for (destination, priority) in [("10.0.0.0/8", 50), ("192.168.1.0/24", 10)] {
        routing_rule::ActiveModel {
            agent_id: Set("client-1".to_string()),
            action: Set("forward".to_string()),
            destination: Set(destination.to_string()),
            gateway_id: Set(None),
            priority: Set(priority),
            enabled: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(h.repo.connection())
        .await
        .unwrap();
    }

    let mut stream = conn.open_stream().await.unwrap();
    stream
        .send_message(&ControlMessage::GetRoutes {
            agent_id: "client-1".to_string(),
        })
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .expect("routes timed out")
        .unwrap();

    match reply {
        Some(ControlMessage::Routes { rules }) => {
            assert_eq!(rules.len(), 2);
            assert_eq!(rules[0].priority, 10);
            assert_eq!(rules[0].destination, "192.168.1.0/24");
            assert_eq!(rules[0].action, RouteAction::Forward);
            assert_eq!(rules[1].priority, 50);
            assert!(rules.iter().all(|r| r.enabled));
        }
        other => panic!("Expected Routes, got {:?}", other),
    }
}

#[tokio::test]
async fn test_backpressure_drops_without_blocking() {
    let h = setup("10.200.0.0/16").await;

    let gw_conn = dial(&h).await;
    let gw = register(&gw_conn, "gw-1", TEST_KEY, AgentKind::Gateway).await;
    let client_conn = dial(&h).await;
    let client = register(&client_conn, "client-1", TEST_KEY, AgentKind::Client).await;

    // Bind the gateway's relay but never read from it, so its send path
    // backs up into the bounded mailbox
    let _gw_relay = bind_relay(&gw_conn, &gw.session_id, "gw-1").await;
    let mut client_relay = bind_relay(&client_conn, &client.session_id, "client-1").await;

    for _ in 0..10_000u32 {
        client_relay
            .send_message(&packet(&client.session_id, "client-1", None, vec![0u8; 64]))
            .await
            .expect("client send should never block permanently");
    }

    let gw_entry = h.router.sessions().get_by_agent("gw-1").unwrap();
    assert!(gw_entry.drops() > 0, "stalled gateway must shed packets");

    // The router is still responsive for the client session
    let mut hb = client_conn.open_stream().await.unwrap();
    hb.send_message(&ControlMessage::Heartbeat {
        session_id: client.session_id.clone(),
        timestamp_ms: 7,
        stats: TrafficStats::default(),
    })
    .await
    .unwrap();
    let ack = timeout(Duration::from_secs(5), hb.recv_message())
        .await
        .expect("heartbeat timed out")
        .unwrap();
    assert_eq!(
        ack,
        Some(ControlMessage::HeartbeatAck {
            alive: true,
            timestamp_ms: 7
        })
    );
}

#[tokio::test]
async fn test_relay_bind_unknown_session() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let mut stream = bind_relay(&conn, "no-such-session", "ghost").await;

    let reply = timeout(Duration::from_secs(2), stream.recv_message())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(
        reply,
        Some(ControlMessage::Disconnect {
            reason: "session not found".to_string()
        })
    );
}

#[tokio::test]
async fn test_undeliverable_packet_counts_drop() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let ack = register(&conn, "client-1", TEST_KEY, AgentKind::Client).await;
    let mut relay = bind_relay(&conn, &ack.session_id, "client-1").await;

    // No gateway is online: the packet is dropped, the session stays up
    relay
        .send_message(&packet(&ack.session_id, "client-1", None, vec![9; 32]))
        .await
        .unwrap();

    let entry = h.router.sessions().get_by_agent("client-1").unwrap();
    timeout(Duration::from_secs(2), async {
        while entry.drops() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("drop was never recorded");

    assert_eq!(h.router.sessions().count(), 1);
}

#[tokio::test]
async fn test_heartbeat_ack_and_stats() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let ack = register(&conn, "client-1", TEST_KEY, AgentKind::Client).await;

    let mut hb = conn.open_stream().await.unwrap();
    hb.send_message(&ControlMessage::Heartbeat {
        session_id: ack.session_id.clone(),
        timestamp_ms: 1234,
        stats: TrafficStats {
            bytes_sent: 100,
            bytes_received: 200,
            ..TrafficStats::default()
        },
    })
    .await
    .unwrap();

    let reply = timeout(Duration::from_secs(5), hb.recv_message())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(
        reply,
        Some(ControlMessage::HeartbeatAck {
            alive: true,
            timestamp_ms: 1234
        })
    );

    let entry = h.router.sessions().get(&ack.session_id).unwrap();
    assert_eq!(entry.reported_stats().bytes_sent, 100);
}

#[tokio::test]
async fn test_heartbeat_unknown_session() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let mut hb = conn.open_stream().await.unwrap();
    hb.send_message(&ControlMessage::Heartbeat {
        session_id: "no-such-session".to_string(),
        timestamp_ms: 1,
        stats: TrafficStats::default(),
    })
    .await
    .unwrap();

    let reply = timeout(Duration::from_secs(2), hb.recv_message())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(
        reply,
        Some(ControlMessage::Disconnect {
            reason: "session not found".to_string()
        })
    );
}

#[tokio::test]
async fn test_liveness_sweeper_kills_silent_session() {
    let h = setup_with("10.200.0.0/16", 1).await;

    let cancel = CancellationToken::new();
    tokio::spawn(overlink_coordinator::sweeper::run_liveness_sweeper(
        h.router.clone(),
        cancel.clone(),
    ));

    let conn = dial(&h).await;
    let ack = register(&conn, "client-1", TEST_KEY, AgentKind::Client).await;
    assert!(ack.accepted);
    assert_eq!(h.router.sessions().count(), 1);

    // Go silent past the keepalive timeout
    timeout(Duration::from_secs(5), async {
        while h.router.sessions().count() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("silent session was never reaped");

    let row = h.repo.agent_by_id("client-1").await.unwrap().unwrap();
    assert_eq!(row.status, agent::AgentState::Offline);

    // The dead session id is rejected on a later relay bind
    let mut stream = bind_relay(&conn, &ack.session_id, "client-1").await;
    let reply = timeout(Duration::from_secs(2), stream.recv_message())
        .await
        .expect("timed out")
        .unwrap();
    assert_eq!(
        reply,
        Some(ControlMessage::Disconnect {
            reason: "session not found".to_string()
        })
    );

    cancel.cancel();
}

#[tokio::test]
async fn test_update_status() {
    let h = setup("10.200.0.0/16").await;

    let conn = dial(&h).await;
    let ack = register(&conn, "client-1", TEST_KEY, AgentKind::Client).await;
    assert!(ack.accepted);

    let mut stream = conn.open_stream().await.unwrap();
    stream
        .send_message(&ControlMessage::UpdateStatus {
            agent_id: "client-1".to_string(),
            status: AgentStatus::Error,
        })
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(5), stream.recv_message())
        .await
        .expect("timed out")
        .unwrap();
    match reply {
        Some(ControlMessage::StatusAck { acknowledged, .. }) => assert!(acknowledged),
        other => panic!("Expected StatusAck, got {:?}", other),
    }

    let row = h.repo.agent_by_id("client-1").await.unwrap().unwrap();
    assert_eq!(row.status, agent::AgentState::Error);
}

#[tokio::test]
async fn test_sticky_address_across_reconnect() {
    let h = setup("10.200.0.0/16").await;

    let first_conn = dial(&h).await;
    let first = register(&first_conn, "client-1", TEST_KEY, AgentKind::Client).await;
    first_conn.close(0, "gone").await;

    let second_conn = dial(&h).await;
    let second = register(&second_conn, "client-1", TEST_KEY, AgentKind::Client).await;

    assert!(second.accepted);
    assert_eq!(second.assigned_ip, first.assigned_ip);
}
