//! End-to-End Tests over Real Sockets
//!
//! Boots the hub on an ephemeral port and drives it with real WebSocket
//! clients: admission flows, snapshot projection, convergence, heartbeat
//! plumbing, and codec tolerance.

#[cfg(test)]
mod server_tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::{SinkExt, StreamExt};
    use kyro_hub::config::HubConfig;
    use kyro_hub::document::{RoomDocument, TEXT_FIELD};
    use kyro_hub::hub::{CreateRoomOptions, Hub};
    use kyro_hub::principal::Principal;
    use kyro_hub::protocol::{self, ClientFrame, ErrorKind, ServerFrame, WarningKind};
    use kyro_hub::server::HubServer;
    use kyro_hub::store::memory::MemoryStore;
    use kyro_hub::store::{DocumentStore, Visibility};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const RECV_DEADLINE: Duration = Duration::from_secs(5);

    async fn boot() -> (Hub, Arc<MemoryStore>, SocketAddr) {
        let config = Arc::new(HubConfig::default());
        let store = Arc::new(MemoryStore::new());
        let store_handle: Arc<dyn DocumentStore> = store.clone();
        let hub = Hub::new(config, store_handle);
        let server = HubServer::new(hub.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.run(listener).await;
        });
        (hub, store, addr)
    }

    async fn create_room(hub: &Hub, password: Option<&str>, capacity: Option<u32>) -> String {
        let owner = Principal::User { id: "owner-1".to_string(), name: "Owner".to_string() };
        let record = hub
            .create_room(
                &owner,
                CreateRoomOptions {
                    name: "e2e".to_string(),
                    visibility: if password.is_some() {
                        Visibility::Private
                    } else {
                        Visibility::Public
                    },
                    password: password.map(str::to_string),
                    capacity,
                    language: Some("rust".to_string()),
                },
            )
            .await
            .unwrap();
        record.room_key
    }

    async fn connect(addr: SocketAddr, path: &str) -> ClientWs {
        let (ws, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
        ws
    }

    async fn send(ws: &mut ClientWs, frame: &ClientFrame) {
        ws.send(protocol::encode_client(frame)).await.unwrap();
    }

    async fn recv(ws: &mut ClientWs) -> ServerFrame {
        loop {
            let message = timeout(RECV_DEADLINE, ws.next())
                .await
                .expect("frame within deadline")
                .expect("connection open")
                .expect("transport ok");
            match message {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => panic!("unexpected close: {:?}", frame),
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    /// Receive until the connection closes, returning the last error frame
    /// seen on the way out (the server reports, then hangs up).
    async fn recv_error_then_close(ws: &mut ClientWs) -> ErrorKind {
        let mut last_error = None;
        loop {
            match timeout(RECV_DEADLINE, ws.next()).await.expect("activity within deadline") {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(ServerFrame::Error { kind, .. }) = serde_json::from_str(&text) {
                        last_error = Some(kind);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return last_error.expect("an error frame precedes the close");
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) => return last_error.expect("an error frame precedes the close"),
            }
        }
    }

    fn hello(room: &str, name: &str, password: Option<&str>) -> ClientFrame {
        ClientFrame::Hello {
            room: Some(room.to_string()),
            token: None,
            password: password.map(str::to_string),
            display_name: Some(name.to_string()),
        }
    }

    fn insert_update(doc: &Doc, at: u32, chunk: &str) -> Vec<u8> {
        let text = doc.get_or_insert_text(TEXT_FIELD);
        let before = doc.transact().state_vector();
        {
            let mut txn = doc.transact_mut();
            text.insert(&mut txn, at, chunk);
        }
        doc.transact().encode_diff_v1(&before)
    }

    fn apply(doc: &Doc, blob: &[u8]) {
        let update = Update::decode_v1(blob).unwrap();
        let mut txn = doc.transact_mut();
        txn.apply_update(update);
    }

    fn project(doc: &Doc) -> String {
        let text = doc.get_or_insert_text(TEXT_FIELD);
        let txn = doc.transact();
        text.get_string(&txn)
    }

    // ============= Convergence =============

    mod convergence {
        use super::*;

        #[tokio::test]
        async fn test_two_clients_converge() {
            let (hub, _store, addr) = boot().await;
            let room = create_room(&hub, None, None).await;

            // A joins over the document path and types "hello"
            let mut a = connect(addr, &format!("/doc?room={}", room)).await;
            send(&mut a, &hello(&room, "A", None)).await;
            let ServerFrame::HelloAck { snapshot, .. } = recv(&mut a).await else {
                panic!("expected hello-ack");
            };
            let a_doc = Doc::new();
            apply(&a_doc, &snapshot.document_bytes);
            send(
                &mut a,
                &ClientFrame::CrdtUpdate { blob: insert_update(&a_doc, 0, "hello") },
            )
            .await;

            // B joins afterwards and sees the projection
            let mut b = connect(addr, &format!("/doc?room={}", room)).await;
            send(&mut b, &hello(&room, "B", None)).await;
            let ServerFrame::HelloAck { snapshot, .. } = recv(&mut b).await else {
                panic!("expected hello-ack");
            };
            let restored = RoomDocument::from_state(&snapshot.document_bytes).unwrap();
            assert_eq!(restored.text(), "hello");

            // B extends the document; A applies the broadcast and converges
            let b_doc = Doc::new();
            apply(&b_doc, &snapshot.document_bytes);
            send(
                &mut b,
                &ClientFrame::CrdtUpdate { blob: insert_update(&b_doc, 5, " world") },
            )
            .await;

            loop {
                if let ServerFrame::CrdtUpdate { blob, origin_principal_id } = recv(&mut a).await {
                    apply(&a_doc, &blob);
                    assert_ne!(origin_principal_id, "");
                    break;
                }
            }
            assert_eq!(project(&a_doc), "hello world");
            assert_eq!(project(&b_doc), "hello world");
        }

        #[tokio::test]
        async fn test_hub_path_works_with_room_in_hello() {
            let (hub, _store, addr) = boot().await;
            let room = create_room(&hub, None, None).await;
            let mut ws = connect(addr, "/hub").await;
            send(&mut ws, &hello(&room, "C", None)).await;
            match recv(&mut ws).await {
                ServerFrame::HelloAck { room: acked, .. } => assert_eq!(acked, room),
                other => panic!("expected hello-ack, got {:?}", other),
            }
        }
    }

    // ============= Admission =============

    mod admission_flows {
        use super::*;

        #[tokio::test]
        async fn test_private_room_password_matrix() {
            let (hub, _store, addr) = boot().await;
            let room = create_room(&hub, Some("s3cret"), None).await;

            let mut no_password = connect(addr, "/hub").await;
            send(&mut no_password, &hello(&room, "X", None)).await;
            assert_eq!(
                recv_error_then_close(&mut no_password).await,
                ErrorKind::PasswordRequired
            );

            let mut wrong = connect(addr, "/hub").await;
            send(&mut wrong, &hello(&room, "X", Some("wrong"))).await;
            assert_eq!(recv_error_then_close(&mut wrong).await, ErrorKind::PasswordInvalid);

            let mut right = connect(addr, "/hub").await;
            send(&mut right, &hello(&room, "X", Some("s3cret"))).await;
            assert!(matches!(recv(&mut right).await, ServerFrame::HelloAck { .. }));
        }

        #[tokio::test]
        async fn test_unknown_room_is_rejected() {
            let (_hub, _store, addr) = boot().await;
            let mut ws = connect(addr, "/hub").await;
            send(&mut ws, &hello("NOSUCH", "X", None)).await;
            assert_eq!(recv_error_then_close(&mut ws).await, ErrorKind::RoomNotFound);
        }

        #[tokio::test]
        async fn test_capacity_over_sockets() {
            let (hub, _store, addr) = boot().await;
            let room = create_room(&hub, None, Some(2)).await;

            let mut first = connect(addr, "/hub").await;
            send(&mut first, &hello(&room, "one", None)).await;
            assert!(matches!(recv(&mut first).await, ServerFrame::HelloAck { .. }));

            let mut second = connect(addr, "/hub").await;
            send(&mut second, &hello(&room, "two", None)).await;
            assert!(matches!(recv(&mut second).await, ServerFrame::HelloAck { .. }));

            let mut third = connect(addr, "/hub").await;
            send(&mut third, &hello(&room, "three", None)).await;
            assert_eq!(recv_error_then_close(&mut third).await, ErrorKind::RoomFull);
        }
    }

    // ============= Codec & Liveness =============

    mod codec_and_liveness {
        use super::*;

        #[tokio::test]
        async fn test_ping_pong() {
            let (hub, _store, addr) = boot().await;
            let room = create_room(&hub, None, None).await;
            let mut ws = connect(addr, "/hub").await;
            send(&mut ws, &hello(&room, "P", None)).await;
            let _ = recv(&mut ws).await; // hello-ack
            send(&mut ws, &ClientFrame::Ping).await;
            loop {
                if matches!(recv(&mut ws).await, ServerFrame::Pong) {
                    break;
                }
            }
        }

        #[tokio::test]
        async fn test_unknown_frame_type_warns_without_closing() {
            let (hub, _store, addr) = boot().await;
            let room = create_room(&hub, None, None).await;
            let mut ws = connect(addr, "/hub").await;
            send(&mut ws, &hello(&room, "U", None)).await;
            let _ = recv(&mut ws).await; // hello-ack
            ws.send(Message::Text("{\"type\":\"telemetry\",\"x\":1}".to_string()))
                .await
                .unwrap();
            match recv(&mut ws).await {
                ServerFrame::Warning { kind: WarningKind::UnknownType, detail } => {
                    assert_eq!(detail.as_deref(), Some("telemetry"));
                }
                other => panic!("expected warning, got {:?}", other),
            }
            // the session is still usable
            send(&mut ws, &ClientFrame::Ping).await;
            loop {
                if matches!(recv(&mut ws).await, ServerFrame::Pong) {
                    break;
                }
            }
        }

        #[tokio::test]
        async fn test_first_frame_must_be_hello() {
            let (hub, _store, addr) = boot().await;
            let _room = create_room(&hub, None, None).await;
            let mut ws = connect(addr, "/hub").await;
            send(&mut ws, &ClientFrame::Ping).await;
            assert_eq!(recv_error_then_close(&mut ws).await, ErrorKind::ProtocolError);
        }

        #[tokio::test]
        async fn test_binary_frame_is_accepted_as_crdt_update() {
            let (hub, _store, addr) = boot().await;
            let room = create_room(&hub, None, None).await;

            let mut a = connect(addr, &format!("/doc?room={}", room)).await;
            send(&mut a, &hello(&room, "A", None)).await;
            let _ = recv(&mut a).await; // hello-ack

            let mut b = connect(addr, &format!("/doc?room={}", room)).await;
            send(&mut b, &hello(&room, "B", None)).await;
            let _ = recv(&mut b).await; // hello-ack

            let doc = Doc::new();
            let update = insert_update(&doc, 0, "binary path");
            a.send(Message::Binary(update)).await.unwrap();

            loop {
                if let ServerFrame::CrdtUpdate { blob, .. } = recv(&mut b).await {
                    let merged = RoomDocument::new();
                    merged.apply_update(&blob).unwrap();
                    assert_eq!(merged.text(), "binary path");
                    break;
                }
            }
        }

        #[tokio::test]
        async fn test_leave_closes_the_session_cleanly() {
            let (hub, store, addr) = boot().await;
            let room = create_room(&hub, None, None).await;
            let mut ws = connect(addr, "/hub").await;
            send(&mut ws, &hello(&room, "L", None)).await;
            let _ = recv(&mut ws).await; // hello-ack
            send(&mut ws, &ClientFrame::Leave).await;
            // the server hangs up on its own
            loop {
                match timeout(RECV_DEADLINE, ws.next()).await.expect("close within deadline") {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(_)) => break,
                }
            }
            // guests leave no member rows behind
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(store.count_online(&room).await.unwrap(), 0);
        }
    }
}
