//! Full gateway flow over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use messaging_engine::bus::memory::InProcessBus;
use messaging_engine::bus::EventBus;
use messaging_engine::cache::TypingCache;
use messaging_engine::config::Config;
use messaging_engine::gateway;
use messaging_engine::services::{ConversationService, ServiceLimits};
use messaging_engine::state::AppState;
use messaging_engine::store::memory::MemoryConversationStore;

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: String,
    service: Arc<ConversationService>,
}

async fn start_server() -> TestServer {
    let bus: Arc<dyn EventBus> = Arc::new(InProcessBus::new());
    let service = Arc::new(ConversationService::new(
        Arc::new(MemoryConversationStore::new()),
        bus.clone(),
        Arc::new(TypingCache::new(Duration::from_secs(10))),
        ServiceLimits::default(),
    ));
    let state = AppState {
        service: service.clone(),
        bus,
        config: Arc::new(Config::test_defaults()),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, gateway::router(state)).await.unwrap();
    });

    TestServer {
        addr: addr.to_string(),
        service,
    }
}

async fn connect(server: &TestServer, user_id: Uuid) -> WsClient {
    let url = format!("ws://{}/ws?user_id={}", server.addr, user_id);
    let (client, _) = connect_async(url).await.unwrap();
    client
}

async fn next_frame(client: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let TungsteniteMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_frame(client: &mut WsClient, frame: Value) {
    client
        .send(TungsteniteMessage::Text(frame.to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn health_endpoint_responds() {
    let server = start_server().await;
    let body = reqwest::get(format!("http://{}/healthz", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn typing_and_messages_flow_between_two_clients() {
    let server = start_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conv = server
        .service
        .find_or_create_direct(alice, bob)
        .await
        .unwrap();

    let mut alice_ws = connect(&server, alice).await;
    let mut bob_ws = connect(&server, bob).await;

    let hello = next_frame(&mut alice_ws).await;
    assert_eq!(hello["type"], "subscribed");
    assert_eq!(hello["count"], 2);
    assert_eq!(next_frame(&mut bob_ws).await["type"], "subscribed");

    // Typing fans out to the peer.
    send_frame(
        &mut alice_ws,
        json!({ "type": "set_typing", "conversation_id": conv.id, "is_typing": true }),
    )
    .await;
    let typing = next_frame(&mut bob_ws).await;
    assert_eq!(typing["type"], "typing_status");
    assert_eq!(typing["user_id"], alice.to_string());
    assert_eq!(typing["is_typing"], true);
    assert_eq!(next_frame(&mut alice_ws).await["type"], "typing_status");
    assert_eq!(next_frame(&mut alice_ws).await["type"], "typing_ack");

    // A sent message reaches both sides, and implicitly stops typing.
    send_frame(
        &mut alice_ws,
        json!({ "type": "send_message", "conversation_id": conv.id, "content": "hello bob" }),
    )
    .await;

    let stopped = next_frame(&mut bob_ws).await;
    assert_eq!(stopped["type"], "typing_status");
    assert_eq!(stopped["is_typing"], false);
    let delivered = next_frame(&mut bob_ws).await;
    assert_eq!(delivered["type"], "new_message");
    assert_eq!(delivered["message"]["content"], "hello bob");
    assert!(delivered["timestamp"].is_string());

    // The sender sees its own fan-out plus the ack.
    let mut saw_ack = false;
    let mut saw_event = false;
    for _ in 0..3 {
        let frame = next_frame(&mut alice_ws).await;
        match frame["type"].as_str() {
            Some("message_sent") => saw_ack = true,
            Some("new_message") => saw_event = true,
            Some("typing_status") => {}
            other => panic!("unexpected frame type: {other:?}"),
        }
    }
    assert!(saw_ack && saw_event);
}

#[tokio::test]
async fn disconnect_synthesizes_stopped_typing() {
    let server = start_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conv = server
        .service
        .find_or_create_direct(alice, bob)
        .await
        .unwrap();

    let mut alice_ws = connect(&server, alice).await;
    let mut bob_ws = connect(&server, bob).await;
    next_frame(&mut alice_ws).await;
    next_frame(&mut bob_ws).await;

    send_frame(
        &mut alice_ws,
        json!({ "type": "set_typing", "conversation_id": conv.id, "is_typing": true }),
    )
    .await;
    assert_eq!(next_frame(&mut bob_ws).await["is_typing"], true);

    // Alice vanishes without clearing her indicator.
    drop(alice_ws);

    let stopped = next_frame(&mut bob_ws).await;
    assert_eq!(stopped["type"], "typing_status");
    assert_eq!(stopped["user_id"], alice.to_string());
    assert_eq!(stopped["is_typing"], false);
}

#[tokio::test]
async fn bad_commands_come_back_as_error_frames() {
    let server = start_server().await;
    let alice = Uuid::new_v4();
    let mut alice_ws = connect(&server, alice).await;
    next_frame(&mut alice_ws).await;

    send_frame(&mut alice_ws, json!({ "type": "teleport" })).await;
    let err = next_frame(&mut alice_ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["kind"], "validation");

    // A command against a conversation the user is not in.
    send_frame(
        &mut alice_ws,
        json!({
            "type": "set_typing",
            "conversation_id": Uuid::new_v4(),
            "is_typing": true,
        }),
    )
    .await;
    let err = next_frame(&mut alice_ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["kind"], "not_found");
}

#[tokio::test]
async fn resubscribe_picks_up_new_conversations() {
    let server = start_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut alice_ws = connect(&server, alice).await;
    let hello = next_frame(&mut alice_ws).await;
    assert_eq!(hello["count"], 1);

    let conv = server
        .service
        .find_or_create_direct(alice, bob)
        .await
        .unwrap();

    send_frame(&mut alice_ws, json!({ "type": "resubscribe" })).await;
    let resub = next_frame(&mut alice_ws).await;
    assert_eq!(resub["type"], "subscribed");
    assert_eq!(resub["count"], 2);

    // Events for the new conversation now arrive.
    server
        .service
        .send_message(
            conv.id,
            bob,
            messaging_engine::services::OutgoingMessage {
                kind: messaging_engine::models::MessageKind::Text,
                content: Some("late joiner".into()),
                metadata: messaging_engine::models::MessageMeta::None,
                attachments: vec![],
                reply_to_id: None,
                forwarded_from_id: None,
                expires_in_secs: None,
            },
        )
        .await
        .unwrap();
    let frame = next_frame(&mut alice_ws).await;
    assert_eq!(frame["type"], "new_message");
    assert_eq!(frame["message"]["content"], "late joiner");
}

#[tokio::test]
async fn history_and_drafts_are_fetchable_over_the_socket() {
    let server = start_server().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let conv = server
        .service
        .find_or_create_direct(alice, bob)
        .await
        .unwrap();

    let mut alice_ws = connect(&server, alice).await;
    next_frame(&mut alice_ws).await;

    send_frame(
        &mut alice_ws,
        json!({ "type": "save_draft", "conversation_id": conv.id, "content": "wip" }),
    )
    .await;
    assert_eq!(next_frame(&mut alice_ws).await["type"], "draft_saved");

    send_frame(
        &mut alice_ws,
        json!({ "type": "fetch_draft", "conversation_id": conv.id }),
    )
    .await;
    let draft = next_frame(&mut alice_ws).await;
    assert_eq!(draft["type"], "draft");
    assert_eq!(draft["draft"]["content"], "wip");

    send_frame(
        &mut alice_ws,
        json!({ "type": "send_message", "conversation_id": conv.id, "content": "one" }),
    )
    .await;
    next_frame(&mut alice_ws).await;
    next_frame(&mut alice_ws).await;

    send_frame(
        &mut alice_ws,
        json!({ "type": "fetch_messages", "conversation_id": conv.id }),
    )
    .await;
    let page = next_frame(&mut alice_ws).await;
    assert_eq!(page["type"], "messages");
    assert_eq!(page["messages"].as_array().unwrap().len(), 1);
    assert_eq!(page["messages"][0]["content"], "one");
}
