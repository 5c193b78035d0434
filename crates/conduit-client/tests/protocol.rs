//! Client protocol tests against a hand-rolled mock server.
//!
//! The mock speaks the wire protocol directly with core primitives, which
//! pins down the client's behavior on paths a healthy daemon never takes:
//! handshake rejections, authentication rejections, out-of-order
//! responses, unsolicited goodbyes, and garbage frames.

use std::time::Duration;

use bytes::Bytes;
use conduit_client::{
    AuthError, CallError, Channel, ConnectError, Connection, RemotingError,
};
use conduit_core::framing::FrameCodec;
use conduit_core::handshake::{
    HandshakeMessage, HelloNack, ServerHandshake, parse_hello, serialize_handshake_message,
};
use conduit_core::identity::KeyPair;
use conduit_core::wire::{
    AuthResponse, CallId, CallOutcome, WireMessage, decode_message, encode_message,
};
use conduit_core::{Command, ProtocolError};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

type MockConn = Framed<TcpStream, FrameCodec>;

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Accept one connection and complete the handshake.
async fn accept_handshaked(listener: &TcpListener) -> MockConn {
    let (stream, _) = listener.accept().await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new());

    let frame = framed.next().await.unwrap().unwrap();
    let hello = parse_hello(&frame).unwrap();
    let mut handshake = ServerHandshake::new("mock-daemon/1.0");
    let response = handshake.process_hello(&hello).unwrap();
    framed
        .send(serialize_handshake_message(&response).unwrap())
        .await
        .unwrap();
    framed
}

/// Accept one connection, handshake, and accept its authentication proof.
async fn accept_authenticated(listener: &TcpListener, server_key: &KeyPair) -> MockConn {
    let mut framed = accept_handshaked(listener).await;

    let frame = framed.next().await.unwrap().unwrap();
    let WireMessage::AuthRequest(request) = decode_message(&frame).unwrap() else {
        panic!("expected AuthRequest");
    };
    assert!(request.public_key.verify(&request.nonce, &request.signature));

    let accept = WireMessage::AuthResponse(AuthResponse::Accepted {
        server_public_key: server_key.public_key(),
    });
    framed.send(encode_message(&accept).unwrap()).await.unwrap();
    framed.codec_mut().lift_frame_limit();
    framed
}

/// Read the next frame and return the call id of the `CallRequest` in it.
async fn expect_call(framed: &mut MockConn) -> (CallId, String) {
    let frame = framed.next().await.unwrap().unwrap();
    match decode_message(&frame).unwrap() {
        WireMessage::CallRequest { call_id, command } => (call_id, command.op),
        other => panic!("expected CallRequest, got {other:?}"),
    }
}

async fn send_success(framed: &mut MockConn, call_id: CallId, value: serde_json::Value) {
    let response = WireMessage::CallResponse {
        call_id,
        outcome: CallOutcome::Success { value },
    };
    framed
        .send(encode_message(&response).unwrap())
        .await
        .unwrap();
}

/// Open a client channel against a mock that has already accepted auth.
async fn client_channel(addr: &str, keypair: &KeyPair) -> Channel {
    let connection = Connection::open(addr).await.unwrap();
    connection.authenticate(keypair).await.unwrap()
}

#[tokio::test]
async fn test_open_unreachable_endpoint() {
    // Bind then drop to obtain a port with no listener behind it.
    let (listener, addr) = listener().await;
    drop(listener);

    let result = timeout(TEST_TIMEOUT, Connection::open(&addr))
        .await
        .expect("connect attempt timed out");
    assert!(matches!(result, Err(ConnectError::Unreachable(_))));
}

#[tokio::test]
async fn test_handshake_rejection_is_refused() {
    let (listener, addr) = listener().await;
    let mock = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        let _hello = framed.next().await.unwrap().unwrap();
        let nack = HandshakeMessage::HelloNack(HelloNack::rejected("maintenance window"));
        framed
            .send(serialize_handshake_message(&nack).unwrap())
            .await
            .unwrap();
    });

    let result = timeout(TEST_TIMEOUT, Connection::open(&addr))
        .await
        .expect("connect timed out");
    match result {
        Err(ConnectError::Refused { reason }) => assert_eq!(reason, "maintenance window"),
        other => panic!("expected refusal, got {other:?}"),
    }
    mock.await.unwrap();
}

#[tokio::test]
async fn test_handshake_version_mismatch() {
    let (listener, addr) = listener().await;
    let mock = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        let _hello = framed.next().await.unwrap().unwrap();
        let nack = HandshakeMessage::HelloNack(HelloNack::version_mismatch(99));
        framed
            .send(serialize_handshake_message(&nack).unwrap())
            .await
            .unwrap();
    });

    let result = timeout(TEST_TIMEOUT, Connection::open(&addr))
        .await
        .expect("connect timed out");
    assert!(matches!(
        result,
        Err(ConnectError::Protocol(ProtocolError::VersionMismatch { .. }))
    ));
    mock.await.unwrap();
}

#[tokio::test]
async fn test_authentication_rejection() {
    let (listener, addr) = listener().await;
    let mock = tokio::spawn(async move {
        let mut framed = accept_handshaked(&listener).await;
        let _auth = framed.next().await.unwrap().unwrap();
        let reject = WireMessage::AuthResponse(AuthResponse::Rejected {
            reason: "authentication failed".to_string(),
        });
        framed.send(encode_message(&reject).unwrap()).await.unwrap();
    });

    let keypair = KeyPair::generate();
    let connection = Connection::open(&addr).await.unwrap();
    let result = timeout(TEST_TIMEOUT, connection.authenticate(&keypair))
        .await
        .expect("authenticate timed out");

    assert!(matches!(result, Err(AuthError::Rejected { .. })));
    mock.await.unwrap();
}

#[tokio::test]
async fn test_responses_correlate_out_of_arrival_order() {
    let (listener, addr) = listener().await;
    let server_key = KeyPair::generate();
    let keypair = KeyPair::generate();

    let mock_key = server_key.clone();
    let mock = tokio::spawn(async move {
        let mut framed = accept_authenticated(&listener, &mock_key).await;

        let (first_id, first_op) = expect_call(&mut framed).await;
        let (second_id, second_op) = expect_call(&mut framed).await;
        assert_eq!(first_op, "first");
        assert_eq!(second_op, "second");

        // Answer in reverse order; each waiter must still get its own
        // value.
        send_success(&mut framed, second_id, serde_json::json!("for second")).await;
        send_success(&mut framed, first_id, serde_json::json!("for first")).await;
    });

    let channel = client_channel(&addr, &keypair).await;
    let mut first = channel
        .call_async::<String>(&Command::new("first"))
        .await
        .unwrap();
    let mut second = channel
        .call_async::<String>(&Command::new("second"))
        .await
        .unwrap();

    let second_value = timeout(TEST_TIMEOUT, second.get())
        .await
        .expect("second call timed out")
        .unwrap();
    let first_value = timeout(TEST_TIMEOUT, first.get())
        .await
        .expect("first call timed out")
        .unwrap();

    assert_eq!(first_value, "for first");
    assert_eq!(second_value, "for second");

    channel.close().await;
    mock.await.unwrap();
}

#[tokio::test]
async fn test_server_goodbye_poisons_pending_calls() {
    let (listener, addr) = listener().await;
    let server_key = KeyPair::generate();
    let keypair = KeyPair::generate();

    let mock = tokio::spawn(async move {
        let mut framed = accept_authenticated(&listener, &server_key).await;
        let _call = expect_call(&mut framed).await;
        framed
            .send(encode_message(&WireMessage::Goodbye).unwrap())
            .await
            .unwrap();
    });

    let channel = client_channel(&addr, &keypair).await;
    let mut pending = channel
        .call_async::<String>(&Command::new("doomed"))
        .await
        .unwrap();

    let result = timeout(TEST_TIMEOUT, pending.get())
        .await
        .expect("poisoned call must not hang");
    assert!(matches!(
        result,
        Err(CallError::Remoting(RemotingError::ChannelClosed))
    ));
    assert!(channel.is_closed());
    mock.await.unwrap();
}

#[tokio::test]
async fn test_garbage_frame_poisons_channel() {
    let (listener, addr) = listener().await;
    let server_key = KeyPair::generate();
    let keypair = KeyPair::generate();

    let mock = tokio::spawn(async move {
        let mut framed = accept_authenticated(&listener, &server_key).await;
        let _call = expect_call(&mut framed).await;
        framed
            .send(Bytes::from_static(b"not a wire message"))
            .await
            .unwrap();
    });

    let channel = client_channel(&addr, &keypair).await;
    let mut pending = channel
        .call_async::<String>(&Command::new("doomed"))
        .await
        .unwrap();

    let result = timeout(TEST_TIMEOUT, pending.get())
        .await
        .expect("poisoned call must not hang");
    assert!(matches!(
        result,
        Err(CallError::Remoting(RemotingError::ChannelClosed))
    ));
    mock.await.unwrap();
}

#[tokio::test]
async fn test_server_identity_exposed_for_pinning() {
    let (listener, addr) = listener().await;
    let server_key = KeyPair::generate();
    let expected = server_key.public_key();
    let keypair = KeyPair::generate();

    let mock = tokio::spawn(async move {
        let _framed = accept_authenticated(&listener, &server_key).await;
        // Hold the connection open until the client is done.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let channel = client_channel(&addr, &keypair).await;

    // Caller-side pinning: compare the proven identity to a known value.
    assert_eq!(channel.server_identity(), &expected);

    channel.close().await;
    mock.await.unwrap();
}
