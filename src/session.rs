//! Client Sessions
//!
//! One task per WebSocket connection reads and decodes client frames into
//! room commands; a companion writer task drains the session's outbox back
//! to the transport and keeps the heartbeat going. Detach is guaranteed on
//! every exit path, so presence and online bookkeeping always converge.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::Hub;
use crate::protocol::{self, ClientFrame, Decoded, ErrorKind, RoomSnapshot, ServerFrame, WarningKind};
use crate::room::outbox::{Outbox, Popped};
use crate::room::{DetachReason, RoomCommand, RoomHandle, SessionHandle};
use crate::store::StoreError;

/// How long a fresh connection may idle before its `hello`.
const HELLO_GRACE: Duration = Duration::from_secs(10);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Drive one client connection to completion. `room_hint` carries the
/// `?room=` query of the document path, letting `hello` omit the key.
pub async fn run_session(hub: Hub, ws: WebSocketStream<TcpStream>, room_hint: Option<String>) {
    let session_id = Uuid::new_v4();
    let (mut sink, mut stream) = ws.split();
    let _gauge = hub.session_gauge();

    let Some((handle, outbox)) = handshake(&hub, session_id, &mut sink, &mut stream, room_hint).await
    else {
        let _ = sink.send(Message::Close(None)).await;
        return;
    };

    // writer: outbox -> transport, plus the server heartbeat
    let writer_outbox = outbox.clone();
    let heartbeat = hub.config.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut ping = interval(heartbeat);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                popped = writer_outbox.pop() => match popped {
                    Popped::Frame(frame) => {
                        let dropped = writer_outbox.take_dropped();
                        if dropped > 0 {
                            let warning = ServerFrame::Warning {
                                kind: WarningKind::DroppedFrames,
                                detail: Some(dropped.to_string()),
                            };
                            if sink.send(protocol::encode_server(&warning)).await.is_err() {
                                break;
                            }
                        }
                        if sink.send(protocol::encode_server(&frame)).await.is_err() {
                            break;
                        }
                    }
                    Popped::Closed(reason) => {
                        if let Some(kind) = reason {
                            let frame = ServerFrame::Error { kind, detail: None };
                            let _ = sink.send(protocol::encode_server(&frame)).await;
                        }
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reason = read_loop(&hub, session_id, &handle, &outbox, &mut stream).await;

    // detach is idempotent and must run on every exit path, even when the
    // actor already closed this session
    if handle
        .send(RoomCommand::Detach { session_id, reason })
        .await
        .is_err()
    {
        debug!("session {}: room actor already gone on detach", session_id);
    }
    outbox.close(None);
    let _ = writer.await;
    debug!("session {}: finished ({:?})", session_id, reason);
}

/// Wait for `hello`, admit the principal, and attach to the room actor.
/// Any failure is reported on the socket and ends the connection.
async fn handshake(
    hub: &Hub,
    session_id: Uuid,
    sink: &mut WsSink,
    stream: &mut WsStream,
    room_hint: Option<String>,
) -> Option<(RoomHandle, Outbox)> {
    let first = match timeout(HELLO_GRACE, next_data_frame(stream)).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return None,
        Err(_) => {
            send_error(sink, ErrorKind::Timeout, Some("expected hello")).await;
            return None;
        }
    };

    let hello = match protocol::decode_client(&first) {
        Ok(Decoded::Frame(frame @ ClientFrame::Hello { .. })) => frame,
        Ok(_) => {
            send_error(sink, ErrorKind::ProtocolError, Some("first frame must be hello")).await;
            return None;
        }
        Err(e) => {
            send_error(sink, ErrorKind::ProtocolError, Some(&e.to_string())).await;
            return None;
        }
    };
    let ClientFrame::Hello { room, token, password, display_name } = hello else {
        unreachable!("matched above");
    };

    let Some(room_param) = room.or(room_hint) else {
        send_error(sink, ErrorKind::RoomNotFound, Some("no room key supplied")).await;
        return None;
    };

    let principal = match hub
        .admission
        .resolve(token.as_deref(), display_name.as_deref())
    {
        Ok(principal) => principal,
        Err(e) => {
            send_error(sink, ErrorKind::Unauthorized, Some(&e.to_string())).await;
            return None;
        }
    };

    let record = match hub.store.lookup_room(&room_param).await {
        Ok(record) => record,
        Err(StoreError::RoomNotFound) => {
            send_error(sink, ErrorKind::RoomNotFound, None).await;
            return None;
        }
        Err(e) => {
            warn!("session {}: room lookup failed: {}", session_id, e);
            send_error(sink, ErrorKind::RoomUnavailable, None).await;
            return None;
        }
    };

    let member = hub
        .store
        .get_member(&record.room_key, principal.id())
        .await
        .unwrap_or(None);
    let online = hub.store.count_online(&record.room_key).await.unwrap_or(0);

    use crate::admission::JoinDecision;
    let role = match hub.admission.authorize_join(
        &record,
        &principal,
        password.as_deref(),
        member.as_ref(),
        online,
    ) {
        JoinDecision::Admitted(role) => role,
        JoinDecision::PasswordRequired => {
            send_error(sink, ErrorKind::PasswordRequired, None).await;
            return None;
        }
        JoinDecision::PasswordInvalid => {
            send_error(sink, ErrorKind::PasswordInvalid, None).await;
            return None;
        }
        JoinDecision::RoomFull => {
            send_error(sink, ErrorKind::RoomFull, None).await;
            return None;
        }
        JoinDecision::Banned => {
            send_error(sink, ErrorKind::Banned, None).await;
            return None;
        }
    };

    let handle = hub.registry.acquire(&record.room_key);
    let outbox = Outbox::new(hub.config.outbox_capacity);
    let (reply_tx, reply_rx) = oneshot::channel();
    let attach = RoomCommand::Attach {
        session: SessionHandle { id: session_id, outbox: outbox.clone() },
        principal: principal.clone(),
        role,
        reply: reply_tx,
    };
    if handle.send(attach).await.is_err() {
        send_error(sink, ErrorKind::RoomUnavailable, Some("room is restarting")).await;
        return None;
    }
    let snapshot = match reply_rx.await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(kind)) => {
            send_error(sink, kind, None).await;
            return None;
        }
        Err(_) => {
            send_error(sink, ErrorKind::RoomUnavailable, None).await;
            return None;
        }
    };

    let ack = ServerFrame::HelloAck {
        room: snapshot.room_key.clone(),
        role_of_client: snapshot.role,
        snapshot: RoomSnapshot {
            language: snapshot.language,
            users_snapshot: snapshot.users,
            document_bytes: snapshot.document,
        },
    };
    if sink.send(protocol::encode_server(&ack)).await.is_err() {
        // client vanished between attach and ack; detach right away
        let _ = handle
            .send(RoomCommand::Detach { session_id, reason: DetachReason::TransportClosed })
            .await;
        return None;
    }

    info!(
        "session {}: {} joined room {}",
        session_id,
        principal.id(),
        snapshot.room_key
    );
    Some((handle, outbox))
}

/// Pump client frames into the room until the connection ends one way or
/// another, enforcing the heartbeat timeout.
async fn read_loop(
    hub: &Hub,
    session_id: Uuid,
    handle: &RoomHandle,
    outbox: &Outbox,
    stream: &mut WsStream,
) -> DetachReason {
    let mut last_frame = Instant::now();
    loop {
        tokio::select! {
            message = stream.next() => {
                let message = match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!("session {}: transport error: {}", session_id, e);
                        return DetachReason::TransportClosed;
                    }
                    None => return DetachReason::TransportClosed,
                };
                last_frame = Instant::now();
                match message {
                    Message::Text(_) | Message::Binary(_) => {
                        match protocol::decode_client(&message) {
                            Ok(Decoded::Frame(frame)) => {
                                match forward_frame(session_id, handle, outbox, frame).await {
                                    Forward::Continue => {}
                                    Forward::Leave => return DetachReason::Left,
                                    Forward::RoomGone => return DetachReason::TransportClosed,
                                }
                            }
                            Ok(Decoded::Unknown(frame_type)) => {
                                outbox.push(ServerFrame::Warning {
                                    kind: WarningKind::UnknownType,
                                    detail: Some(frame_type),
                                });
                            }
                            Err(e) => {
                                debug!("session {}: protocol error: {}", session_id, e);
                                outbox.close(Some(ErrorKind::ProtocolError));
                                return DetachReason::Left;
                            }
                        }
                    }
                    // tungstenite answers pings on the shared transport
                    Message::Ping(_) | Message::Pong(_) => {}
                    Message::Close(_) => return DetachReason::TransportClosed,
                    Message::Frame(_) => {}
                }
            }
            _ = sleep_until(last_frame + hub.config.heartbeat_timeout) => {
                info!("session {}: heartbeat timeout", session_id);
                outbox.close(Some(ErrorKind::Timeout));
                return DetachReason::Timeout;
            }
        }
    }
}

enum Forward {
    Continue,
    Leave,
    RoomGone,
}

async fn forward_frame(
    session_id: Uuid,
    handle: &RoomHandle,
    outbox: &Outbox,
    frame: ClientFrame,
) -> Forward {
    let command = match frame {
        ClientFrame::Hello { .. } => {
            // a second hello is a client bug, not worth killing the session
            outbox.push(ServerFrame::Warning {
                kind: WarningKind::UnknownType,
                detail: Some("duplicate hello".to_string()),
            });
            return Forward::Continue;
        }
        ClientFrame::Leave => return Forward::Leave,
        ClientFrame::Ping => {
            outbox.push(ServerFrame::Pong);
            return Forward::Continue;
        }
        ClientFrame::CrdtUpdate { blob } => RoomCommand::CrdtUpdate { session_id, blob },
        ClientFrame::Cursor { line, col, selection } => RoomCommand::Cursor {
            session_id,
            cursor: crate::presence::CursorPos { line, col },
            selection,
        },
        ClientFrame::Typing { active } => RoomCommand::Typing { session_id, active },
        ClientFrame::LanguageChange { language } => {
            RoomCommand::LanguageChange { session_id, language }
        }
        ClientFrame::Chat { text } => RoomCommand::Chat { session_id, text },
    };
    match handle.send(command).await {
        Ok(()) => Forward::Continue,
        Err(_) => {
            outbox.close(Some(ErrorKind::RoomUnavailable));
            Forward::RoomGone
        }
    }
}

async fn send_error(sink: &mut WsSink, kind: ErrorKind, detail: Option<&str>) {
    let frame = ServerFrame::Error { kind, detail: detail.map(str::to_string) };
    let _ = sink.send(protocol::encode_server(&frame)).await;
}

async fn next_data_frame(stream: &mut WsStream) -> Option<Message> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => return Some(message),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}
