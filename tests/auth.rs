//! Integration tests for the challenge-response handshake

mod common;

use common::{settle, transport_config, wait_for, MockConnector, AUTHORIZED, CHALLENGE};
use ed25519_dalek::{Signature, Verifier};
use resilient_session::identity::decode_base64;
use resilient_session::{
    AuthenticatedConnection, CloseReason, ConnectingPhase, ConnectionStatus, Ed25519Identity,
    Frame, Identity, SessionError,
};
use std::sync::Arc;

const URL: &str = "ws://mock.test/session";

fn identity() -> Arc<Ed25519Identity> {
    Arc::new(Ed25519Identity::from_seed([7u8; 32]))
}

fn connect(
    identity: Arc<Ed25519Identity>,
    connector: Arc<MockConnector>,
) -> AuthenticatedConnection {
    AuthenticatedConnection::connect(URL, identity, connector, transport_config(10)).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_handshake_reaches_connected() {
    common::init_tracing();
    let identity = identity();
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity.clone(), connector);
    let mut status = connection.watch_status();

    let mut socket = server.accept().await;
    let client_id = socket
        .url
        .query_pairs()
        .find(|(key, _)| key == "client_id")
        .map(|(_, value)| value.into_owned());
    assert_eq!(client_id, Some(identity.client_id()));

    socket.send(CHALLENGE);
    let response = socket.recv_json().await;
    assert_eq!(response["type"], "CHALLENGE_RESPONSE");
    assert_eq!(response["data"]["payload"], "bm9uY2U=");

    let signature = decode_base64(response["data"]["signature"].as_str().unwrap()).unwrap();
    let signature = Signature::from_slice(&signature).unwrap();
    assert!(identity.verifying_key().verify(b"nonce", &signature).is_ok());

    wait_for(&mut status, |s| {
        *s == ConnectionStatus::Connecting(ConnectingPhase::AwaitingAuthorization)
    })
    .await;

    socket.send(AUTHORIZED);
    wait_for(&mut status, ConnectionStatus::is_connected).await;
    assert!(!connection.has_failed());
}

#[tokio::test(start_paused = true)]
async fn test_unexpected_first_frame_is_bad_challenge() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);
    let mut status = connection.watch_status();

    let mut socket = server.accept().await;
    socket.send(r#"{"type":"HELLO"}"#);

    let error = connection.on_fail().wait().await;
    assert_eq!(error, SessionError::BadChallengeRequest);

    let closed = wait_for(&mut status, ConnectionStatus::is_closed).await;
    assert_eq!(
        closed,
        ConnectionStatus::Closed(CloseReason::ConnectionError(SessionError::BadChallengeRequest))
    );
    assert!(socket.closed_by_client().await);
}

#[tokio::test(start_paused = true)]
async fn test_rejection_keeps_response_body() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);

    let mut socket = server.accept().await;
    socket.send(CHALLENGE);
    socket.recv_json().await;
    socket.send(r#"{"type":"DENIED","reason":"unknown client"}"#);

    let error = connection.on_fail().wait().await;
    assert_eq!(
        error,
        SessionError::BadAuthorizationResponse {
            body: serde_json::json!({ "type": "DENIED", "reason": "unknown client" })
        }
    );
    assert!(connection.is_closed());
}

/// The first socket dies after the client answered its challenge. The
/// handshake must start over on the second socket and only answer the
/// second socket's challenge.
#[tokio::test(start_paused = true)]
async fn test_reconnect_mid_handshake_restarts_on_new_epoch() {
    let identity = identity();
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity, connector.clone());
    let mut status = connection.watch_status();

    let mut first = server.accept().await;
    first.send(CHALLENGE);
    first.recv_json().await;
    drop(first);

    let mut second = server.accept().await;
    wait_for(&mut status, |s| {
        *s == ConnectionStatus::Connecting(ConnectingPhase::AwaitingChallenge)
    })
    .await;

    second.send(r#"{"type":"CHALLENGE","data":{"payload":"c2Vjb25k"}}"#);
    let response = second.recv_json().await;
    assert_eq!(response["data"]["payload"], "c2Vjb25k");

    second.send(AUTHORIZED);
    wait_for(&mut status, ConnectionStatus::is_connected).await;

    assert!(!connection.has_failed());
    assert_eq!(connector.attempts().len(), 2);
    assert_eq!(connection.transport().epoch(), 1);
}

/// Frames the old socket delivered before dying are still queued when the
/// handshake restarts. They are neither answered nor taken as authorization.
#[tokio::test(start_paused = true)]
async fn test_frames_from_old_epoch_are_ignored_after_restart() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);
    let mut status = connection.watch_status();

    let mut first = server.accept().await;
    wait_for(&mut status, |s| {
        *s == ConnectionStatus::Connecting(ConnectingPhase::AwaitingChallenge)
    })
    .await;
    first.send(CHALLENGE);
    first.send(AUTHORIZED);
    first.fail("reset");
    assert_eq!(first.recv().await, None);

    let mut second = server.accept().await;
    settle().await;
    assert_eq!(connection.transport().epoch(), 1);
    assert_eq!(
        connection.status(),
        ConnectionStatus::Connecting(ConnectingPhase::AwaitingChallenge)
    );

    second.send(r#"{"type":"CHALLENGE","data":{"payload":"c2Vjb25k"}}"#);
    let response = second.recv_json().await;
    assert_eq!(response["data"]["payload"], "c2Vjb25k");
    settle().await;
    assert_eq!(
        connection.status(),
        ConnectionStatus::Connecting(ConnectingPhase::AwaitingAuthorization)
    );

    second.send(AUTHORIZED);
    wait_for(&mut status, ConnectionStatus::is_connected).await;
    assert!(!connection.has_failed());
}

/// A drop while waiting for the challenge is not a failure either.
#[tokio::test(start_paused = true)]
async fn test_drop_before_challenge_is_not_a_failure() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);
    let mut status = connection.watch_status();

    let mut first = server.accept().await;
    first.fail("reset");

    let mut second = server.accept().await;
    second.authorize().await;
    wait_for(&mut status, ConnectionStatus::is_connected).await;
    assert!(!connection.has_failed());
}

#[tokio::test(start_paused = true)]
async fn test_application_frames_after_connected() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);
    let mut frames = connection.message_events().subscribe();
    let mut status = connection.watch_status();

    let mut socket = server.accept().await;
    socket.authorize().await;
    wait_for(&mut status, ConnectionStatus::is_connected).await;

    socket.send(r#"{"type":"EVENT","n":1}"#);
    assert_eq!(frames.recv().await, Some(Frame::from(r#"{"type":"EVENT","n":1}"#)));

    connection.send("reply").await.unwrap();
    assert_eq!(socket.recv().await.as_deref(), Some("reply"));
}

#[tokio::test(start_paused = true)]
async fn test_send_before_connected_fails() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);
    let _socket = server.accept().await;

    assert_eq!(connection.send("early").await, Err(SessionError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn test_drop_after_connected_fails_connection() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector.clone());
    let mut status = connection.watch_status();

    let mut socket = server.accept().await;
    socket.authorize().await;
    wait_for(&mut status, ConnectionStatus::is_connected).await;

    socket.fail("broken pipe");
    let error = connection.on_fail().wait().await;
    assert_eq!(error, SessionError::connection("broken pipe"));

    let closed = wait_for(&mut status, ConnectionStatus::is_closed).await;
    assert!(matches!(
        closed,
        ConnectionStatus::Closed(CloseReason::ConnectionError(SessionError::Connection(_)))
    ));
    assert!(connection.transport().is_closed());
    assert_eq!(connector.attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_close_after_connected() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);
    let mut status = connection.watch_status();

    let mut socket = server.accept().await;
    socket.authorize().await;
    wait_for(&mut status, ConnectionStatus::is_connected).await;

    socket.hang_up();
    assert_eq!(connection.on_fail().wait().await, SessionError::ServerClosed);
    let closed = wait_for(&mut status, ConnectionStatus::is_closed).await;
    assert_eq!(
        closed,
        ConnectionStatus::Closed(CloseReason::ConnectionError(SessionError::ServerClosed))
    );
}

#[tokio::test(start_paused = true)]
async fn test_client_close() {
    let (connector, mut server) = MockConnector::new();
    let connection = connect(identity(), connector);
    let mut status = connection.watch_status();

    let mut socket = server.accept().await;
    socket.authorize().await;
    wait_for(&mut status, ConnectionStatus::is_connected).await;

    connection.close();
    let closed = wait_for(&mut status, ConnectionStatus::is_closed).await;
    assert_eq!(closed, ConnectionStatus::Closed(CloseReason::ClientClosed));
    assert!(!connection.has_failed());
    assert!(socket.closed_by_client().await);
}
