//! Per-connection lifecycle: handshake, authentication, session loop.
//!
//! Every accepted connection walks three phases:
//!
//! 1. **Handshake** — mandatory Hello/HelloAck version negotiation under the
//!    unauthenticated frame limit.
//! 2. **Authentication** — exactly one `AuthRequest`, verified against the
//!    registered key store. Both phases together run under the
//!    configured deadline so a half-open peer cannot pin a connection slot.
//! 3. **Session** — the frame loop. Calls are resolved against the registry
//!    and executed on spawned tasks so slow operations never block the
//!    loop; upgrade requests flip the capability level; pipe frames are
//!    routed by pipe id.
//!
//! Ending the session — client goodbye, transport loss, or a protocol
//! violation — aborts outstanding call tasks and poisons the connection's
//! pipe endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use conduit_core::ProtocolResult;
use conduit_core::framing::FrameCodec;
use conduit_core::handshake::{
    HandshakeMessage, HelloNack, ServerHandshake, parse_hello, serialize_handshake_message,
};
use conduit_core::identity::PublicKey;
use conduit_core::pipe::{OUTBOUND_QUEUE_DEPTH, Outbound, drive_outbound};
use conduit_core::wire::{
    AuthResponse, CallId, CallOutcome, CapabilityLevel, PipeDirection, UpgradeOutcome,
    WireMessage, decode_message, encode_message,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::auth::KeyRights;
use crate::registry::{CommandContext, ConnectionPipes};
use crate::server::ServerShared;

/// Drive one accepted connection to completion.
///
/// # Errors
///
/// Returns a wire-level error only for faults worth logging at the accept
/// loop; orderly rejections and disconnects complete with `Ok`.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<ServerShared>,
) -> ProtocolResult<()> {
    let mut framed = Framed::new(stream, FrameCodec::new());

    let setup = tokio::time::timeout(
        shared.config.auth_deadline,
        setup_session(&mut framed, &shared),
    )
    .await;
    let (peer, rights) = match setup {
        Ok(Ok(Some(authed))) => authed,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!(%peer_addr, "closing connection: authentication deadline expired");
            return Ok(());
        },
    };

    // Authenticated traffic may carry full-size frames.
    framed.codec_mut().lift_frame_limit();
    info!(%peer_addr, peer = %peer, "session established");

    run_session(framed, peer, rights, &shared).await;
    debug!(%peer_addr, "session ended");
    Ok(())
}

/// Handshake then authentication. `None` means the peer was turned away or
/// left; the connection closes quietly.
async fn setup_session(
    framed: &mut Framed<TcpStream, FrameCodec>,
    shared: &ServerShared,
) -> ProtocolResult<Option<(PublicKey, KeyRights)>> {
    if !perform_handshake(framed, &shared.config.server_info).await? {
        return Ok(None);
    }
    authenticate_peer(framed, shared).await
}

/// Server side of the Hello/HelloAck handshake.
///
/// Returns `true` when the handshake completed and the connection may
/// proceed to authentication.
async fn perform_handshake(
    framed: &mut Framed<TcpStream, FrameCodec>,
    server_info: &str,
) -> ProtocolResult<bool> {
    let mut handshake = ServerHandshake::new(server_info);

    let frame = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(e),
        // Peer closed before sending Hello.
        None => return Ok(false),
    };

    let hello = match parse_hello(&frame) {
        Ok(hello) => hello,
        Err(e) => {
            warn!(error = %e, "invalid Hello");
            let nack = HelloNack::rejected(format!("invalid Hello: {e}"));
            framed
                .send(serialize_handshake_message(&HandshakeMessage::HelloNack(
                    nack,
                ))?)
                .await?;
            return Ok(false);
        },
    };

    let response = handshake.process_hello(&hello)?;
    framed.send(serialize_handshake_message(&response)?).await?;
    Ok(handshake.is_completed())
}

/// Receive and verify the authentication proof.
async fn authenticate_peer(
    framed: &mut Framed<TcpStream, FrameCodec>,
    shared: &ServerShared,
) -> ProtocolResult<Option<(PublicKey, KeyRights)>> {
    let frame = match framed.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return Err(e),
        None => return Ok(None),
    };

    let request = match decode_message(&frame)? {
        WireMessage::AuthRequest(request) => request,
        _ => {
            let reject = WireMessage::AuthResponse(AuthResponse::Rejected {
                reason: "expected authentication proof".to_string(),
            });
            framed.send(encode_message(&reject)?).await?;
            return Ok(None);
        },
    };

    match shared.keys.verify_proof(&request) {
        Ok((identity, rights)) => {
            let accept = WireMessage::AuthResponse(AuthResponse::Accepted {
                server_public_key: shared.keypair.public_key(),
            });
            framed.send(encode_message(&accept)?).await?;
            Ok(Some((identity, rights)))
        },
        Err(reason) => {
            let reject = WireMessage::AuthResponse(AuthResponse::Rejected { reason });
            framed.send(encode_message(&reject)?).await?;
            Ok(None)
        },
    }
}

/// The authenticated frame loop.
async fn run_session(
    framed: Framed<TcpStream, FrameCodec>,
    peer: PublicKey,
    rights: KeyRights,
    shared: &ServerShared,
) {
    let (sink, mut stream) = framed.split();
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let writer = tokio::spawn(drive_outbound(sink, outbound_rx));

    let pipes = Arc::new(ConnectionPipes::new(outbound.clone()));
    let mut capability = CapabilityLevel::Restricted;
    let mut calls: JoinSet<()> = JoinSet::new();

    while let Some(next) = stream.next().await {
        // Reap finished call tasks.
        while calls.try_join_next().is_some() {}

        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "transport error, ending session");
                break;
            },
        };
        let message = match decode_message(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "undecodable frame, ending session");
                break;
            },
        };

        match message {
            WireMessage::CallRequest { call_id, command } => {
                debug!(call_id, op = %command.op, %capability, "dispatching call");
                match shared.registry.resolve(&command.op, capability) {
                    Err(outcome) => send_call_response(&outbound, call_id, outcome).await,
                    Ok(handler) => {
                        let ctx =
                            CommandContext::new(peer.clone(), capability, Arc::clone(&pipes));
                        let outbound = outbound.clone();
                        calls.spawn(async move {
                            let outcome = match handler.handle(ctx, command.args).await {
                                Ok(value) => CallOutcome::Success { value },
                                Err(failure) => CallOutcome::Failure { failure },
                            };
                            send_call_response(&outbound, call_id, outcome).await;
                        });
                    },
                }
            },
            WireMessage::UpgradeRequest { call_id } => {
                let outcome = if capability == CapabilityLevel::Full || rights.operator {
                    if capability != CapabilityLevel::Full {
                        info!(peer = %peer, "channel upgraded to full capability");
                    }
                    capability = CapabilityLevel::Full;
                    UpgradeOutcome::Granted
                } else {
                    debug!(peer = %peer, "upgrade denied");
                    UpgradeOutcome::Denied {
                        reason: "upgrade requires operator rights".to_string(),
                    }
                };
                send_frame(&outbound, &WireMessage::UpgradeResponse { call_id, outcome }).await;
            },
            WireMessage::PipeOpen { pipe_id, direction } => {
                debug!(pipe_id, ?direction, "pipe opened");
                match direction {
                    PipeDirection::LocalToRemote => pipes.open_inbound(pipe_id),
                    PipeDirection::RemoteToLocal => pipes.open_outbound(pipe_id),
                }
            },
            WireMessage::PipeData { pipe_id, bytes } => {
                pipes.table().deliver_data(pipe_id, Bytes::from(bytes)).await;
            },
            WireMessage::PipeClose { pipe_id } => {
                pipes.table().deliver_eof(pipe_id).await;
            },
            WireMessage::Goodbye => {
                debug!(peer = %peer, "client closed the channel");
                break;
            },
            WireMessage::AuthRequest(_)
            | WireMessage::AuthResponse(_)
            | WireMessage::UpgradeResponse { .. }
            | WireMessage::CallResponse { .. } => {
                warn!(peer = %peer, "unexpected message kind, ending session");
                break;
            },
        }
    }

    // Poison event: nothing may be left hanging.
    calls.abort_all();
    pipes.poison();
    let _ = outbound.send(Outbound::Shutdown).await;
    let _ = writer.await;
}

async fn send_call_response(
    outbound: &mpsc::Sender<Outbound>,
    call_id: CallId,
    outcome: CallOutcome,
) {
    send_frame(outbound, &WireMessage::CallResponse { call_id, outcome }).await;
}

async fn send_frame(outbound: &mpsc::Sender<Outbound>, message: &WireMessage) {
    match encode_message(message) {
        Ok(frame) => {
            if outbound.send(Outbound::Frame(frame)).await.is_err() {
                debug!("response dropped: connection writer gone");
            }
        },
        Err(e) => warn!(error = %e, "failed to encode response"),
    }
}
