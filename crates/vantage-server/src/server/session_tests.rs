//! End-to-end session tests over in-memory streams: registration replay,
//! viewer relay, and the register-first rule.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use tokio::io::DuplexStream;
use vantage_crypto::{credential_hash, Platform};
use vantage_proto::{
    read_frame, write_client_frame, Envelope, Opcode, Registration,
};

use super::agent_ws::agent_session;
use super::viewer_ws::viewer_session;
use super::AppState;
use crate::registry::Registry;
use crate::storage::{AgentRecord, SqliteStore, Store};

async fn test_state() -> AppState {
    AppState {
        store: Arc::new(SqliteStore::open_in_memory().await.unwrap()),
        platform: Arc::new(Platform::generate()),
        registry: Arc::new(Registry::new()),
        ca_cert_path: None,
    }
}

/// Enroll an agent directly in the store and return its credential.
async fn enroll_directly(state: &AppState, agent_id: &str) -> String {
    let credential = state.platform.sign_credential(agent_id);
    let now = vantage_crypto::token::now_utc();
    state
        .store
        .create_agent(&AgentRecord {
            id: agent_id.into(),
            name: "test-agent".into(),
            hostname: "host".into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            credential_hash: credential_hash(&credential),
            enrolled_at: now,
            last_seen: now,
        })
        .await
        .unwrap();
    credential
}

async fn send_envelope(stream: &mut DuplexStream, envelope: &Envelope) {
    let data = serde_json::to_vec(envelope).unwrap();
    write_client_frame(stream, Opcode::Text, &data).await.unwrap();
}

/// Open an agent connection, register with `credential`, and consume the
/// `registered` acknowledgement.
async fn connect_agent(state: &AppState, credential: &str) -> DuplexStream {
    let (mut client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(agent_session(state.clone(), "test:0".into(), server));

    send_envelope(
        &mut client,
        &Envelope::Register(Registration {
            credential: credential.into(),
            name: "test-agent".into(),
            display_count: 1,
            ..Default::default()
        }),
    )
    .await;

    let (opcode, data) = read_frame(&mut client).await.unwrap();
    assert_eq!(opcode, Opcode::Text);
    match serde_json::from_slice::<Envelope>(&data).unwrap() {
        Envelope::Registered(ack) => assert!(!ack.id.is_empty()),
        other => panic!("expected registered, got {other:?}"),
    }

    client
}

#[tokio::test]
async fn register_with_valid_credential_succeeds() {
    let state = test_state().await;
    let credential = enroll_directly(&state, "aaaa111122223333").await;

    let _conn = connect_agent(&state, &credential).await;
    assert!(state.registry.get_agent("aaaa111122223333").await.is_some());
}

#[tokio::test]
async fn register_with_tampered_credential_closes_silently() {
    let state = test_state().await;
    let credential = enroll_directly(&state, "aaaa111122223333").await;
    let mut tampered = credential.clone();
    tampered.pop();
    tampered.push(if credential.ends_with('0') { '1' } else { '0' });

    let (mut client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(agent_session(state.clone(), "test:0".into(), server));

    send_envelope(
        &mut client,
        &Envelope::Register(Registration {
            credential: tampered,
            ..Default::default()
        }),
    )
    .await;

    // No acknowledgement: the socket just closes.
    assert!(read_frame(&mut client).await.is_err());
    assert_eq!(state.registry.agent_count().await, 0);
}

#[tokio::test]
async fn unenrolled_credential_is_rejected() {
    let state = test_state().await;
    // A valid MAC for an id the store has never seen.
    let credential = state.platform.sign_credential("ffff000011112222");

    let (mut client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(agent_session(state.clone(), "test:0".into(), server));

    send_envelope(
        &mut client,
        &Envelope::Register(Registration {
            credential,
            ..Default::default()
        }),
    )
    .await;

    assert!(read_frame(&mut client).await.is_err());
}

#[tokio::test]
async fn non_register_first_message_closes_the_socket() {
    let state = test_state().await;
    enroll_directly(&state, "aaaa111122223333").await;

    let (mut client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(agent_session(state.clone(), "test:0".into(), server));

    send_envelope(&mut client, &Envelope::Heartbeat).await;

    assert!(read_frame(&mut client).await.is_err());
    assert_eq!(state.registry.agent_count().await, 0);
}

#[tokio::test]
async fn second_registration_evicts_the_first_connection() {
    let state = test_state().await;
    let credential = enroll_directly(&state, "aaaa111122223333").await;

    let mut first = connect_agent(&state, &credential).await;
    let first_session = state
        .registry
        .get_agent("aaaa111122223333")
        .await
        .unwrap()
        .session;

    let _second = connect_agent(&state, &credential).await;

    // The first connection is closed by the eviction.
    assert!(read_frame(&mut first).await.is_err());

    // Exactly one live entry remains, and it is the newer session.
    assert_eq!(state.registry.agent_count().await, 1);
    let current = state.registry.get_agent("aaaa111122223333").await.unwrap();
    assert_ne!(current.session, first_session);
}

#[tokio::test]
async fn viewer_relay_roundtrip() {
    let state = test_state().await;
    let credential = enroll_directly(&state, "aaaa111122223333").await;
    let mut agent_conn = connect_agent(&state, &credential).await;

    let agent = state.registry.get_agent("aaaa111122223333").await.unwrap();
    let (mut viewer_conn, viewer_server) = tokio::io::duplex(1 << 20);
    tokio::spawn(viewer_session(
        state.clone(),
        agent,
        "aaaa111122223333".into(),
        viewer_server,
    ));

    // The agent sees start_capture before anything is relayed.
    let (opcode, data) = read_frame(&mut agent_conn).await.unwrap();
    assert_eq!(opcode, Opcode::Text);
    assert_eq!(
        serde_json::from_slice::<Envelope>(&data).unwrap(),
        Envelope::StartCapture
    );

    // Agent -> viewer: binary frames relayed byte-for-byte, tag included.
    write_client_frame(&mut agent_conn, Opcode::Binary, &[0x01, 0xAA, 0xBB])
        .await
        .unwrap();
    let (opcode, data) = read_frame(&mut viewer_conn).await.unwrap();
    assert_eq!(opcode, Opcode::Binary);
    assert_eq!(data, vec![0x01, 0xAA, 0xBB]);

    // Viewer -> agent: input envelopes forwarded verbatim.
    let input = br#"{"type":"input","payload":{"kind":"mouse","action":"move","x":10,"y":20}}"#;
    write_client_frame(&mut viewer_conn, Opcode::Text, input)
        .await
        .unwrap();
    let (opcode, data) = read_frame(&mut agent_conn).await.unwrap();
    assert_eq!(opcode, Opcode::Text);
    assert_eq!(data, input.to_vec());

    // Agent -> viewer: display_switched forwarded as text.
    let switched = br#"{"type":"display_switched","payload":{"display":2,"display_count":2}}"#;
    write_client_frame(&mut agent_conn, Opcode::Text, switched)
        .await
        .unwrap();
    let (opcode, data) = read_frame(&mut viewer_conn).await.unwrap();
    assert_eq!(opcode, Opcode::Text);
    assert_eq!(data, switched.to_vec());

    // Viewer hangup sends stop_capture to the agent.
    drop(viewer_conn);
    let (opcode, data) = read_frame(&mut agent_conn).await.unwrap();
    assert_eq!(opcode, Opcode::Text);
    assert_eq!(
        serde_json::from_slice::<Envelope>(&data).unwrap(),
        Envelope::StopCapture
    );
}

#[tokio::test]
async fn viewer_drops_unrelated_text_messages() {
    let state = test_state().await;
    let credential = enroll_directly(&state, "aaaa111122223333").await;
    let mut agent_conn = connect_agent(&state, &credential).await;

    let agent = state.registry.get_agent("aaaa111122223333").await.unwrap();
    let (mut viewer_conn, viewer_server) = tokio::io::duplex(1 << 20);
    tokio::spawn(viewer_session(
        state.clone(),
        agent,
        "aaaa111122223333".into(),
        viewer_server,
    ));

    // Consume start_capture.
    let (_, _) = read_frame(&mut agent_conn).await.unwrap();

    // A message type the broker does not forward, then one it does.
    write_client_frame(&mut viewer_conn, Opcode::Text, br#"{"type":"heartbeat"}"#)
        .await
        .unwrap();
    let forwarded = br#"{"type":"switch_display","payload":{"display":2}}"#;
    write_client_frame(&mut viewer_conn, Opcode::Text, forwarded)
        .await
        .unwrap();

    // Only the switch_display arrives at the agent.
    let (_, data) = read_frame(&mut agent_conn).await.unwrap();
    assert_eq!(data, forwarded.to_vec());
}

#[tokio::test]
async fn agent_ping_gets_pong_with_same_payload() {
    let state = test_state().await;
    let credential = enroll_directly(&state, "aaaa111122223333").await;
    let mut agent_conn = connect_agent(&state, &credential).await;

    write_client_frame(&mut agent_conn, Opcode::Ping, b"keepalive")
        .await
        .unwrap();
    let (opcode, data) = read_frame(&mut agent_conn).await.unwrap();
    assert_eq!(opcode, Opcode::Pong);
    assert_eq!(data, b"keepalive");
}

#[tokio::test]
async fn disconnect_persists_last_seen() {
    let state = test_state().await;
    let credential = enroll_directly(&state, "aaaa111122223333").await;

    let before = state
        .store
        .get_agent("aaaa111122223333")
        .await
        .unwrap()
        .unwrap()
        .last_seen;

    let conn = connect_agent(&state, &credential).await;
    drop(conn);

    // The session task notices the hangup and persists last_seen.
    let mut retries = 0;
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        if state.registry.agent_count().await == 0 {
            break;
        }
        retries += 1;
        assert!(retries < 100, "session never cleaned up");
    }

    let after = state
        .store
        .get_agent("aaaa111122223333")
        .await
        .unwrap()
        .unwrap()
        .last_seen;
    assert!(after >= before);
}
