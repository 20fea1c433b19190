use std::collections::HashSet;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::gateway::commands::ClientCommand;
use crate::services::OutgoingMessage;
use crate::state::AppState;
use crate::store::MessageQuery;

/// One connected client session. Owns the socket until the client goes
/// away, then synthesizes stopped-typing for anything left hanging.
pub async fn run(socket: WebSocket, state: AppState, user_id: Uuid) {
    info!(%user_id, "session connected");
    let (ws_tx, mut ws_rx) = socket.split();

    // All outbound frames funnel through one writer task so bus events and
    // command replies never interleave mid-frame.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut sink = ws_tx;
        while let Some(frame) = out_rx.recv().await {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders = subscribe_topics(&state, user_id, &out_tx).await;
    let mut typing_in: HashSet<Uuid> = HashSet::new();

    while let Some(Ok(frame)) = ws_rx.next().await {
        match frame {
            WsMessage::Text(text) => {
                match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => {
                        if let ClientCommand::Resubscribe = command {
                            for task in forwarders.drain(..) {
                                task.abort();
                            }
                            forwarders = subscribe_topics(&state, user_id, &out_tx).await;
                            continue;
                        }
                        handle_command(&state, user_id, command, &out_tx, &mut typing_in).await;
                    }
                    Err(e) => {
                        debug!(%user_id, "unparseable command: {e}");
                        send_error_frame(&out_tx, "validation", &format!("bad command: {e}"));
                    }
                }
            }
            WsMessage::Close(_) => break,
            // Reading the stream answers pings at the protocol level.
            _ => {}
        }
    }

    for conversation_id in typing_in {
        if let Err(e) = state.service.set_typing(conversation_id, user_id, false).await {
            warn!(%user_id, "failed to clear typing on disconnect: {e}");
        }
    }
    for task in forwarders {
        task.abort();
    }
    writer.abort();
    info!(%user_id, "session closed");
}

/// Subscribes the session to its user topic plus every active conversation
/// and spawns a forwarder per subscription.
async fn subscribe_topics(
    state: &AppState,
    user_id: Uuid,
    out_tx: &UnboundedSender<String>,
) -> Vec<JoinHandle<()>> {
    let topics = match state.service.subscription_topics(user_id).await {
        Ok(topics) => topics,
        Err(e) => {
            warn!(%user_id, "failed to derive subscriptions: {e}");
            send_error_frame(out_tx, e.kind(), "subscription setup failed");
            return vec![];
        }
    };
    let count = topics.len();
    let mut tasks = Vec::with_capacity(count);
    for topic in topics {
        let mut rx = state.bus.subscribe(topic).await;
        let out = out_tx.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let frame = event.to_broadcast_payload().to_string();
                if out.send(frame).is_err() {
                    break;
                }
            }
        }));
    }
    send_frame(out_tx, json!({ "type": "subscribed", "count": count }));
    tasks
}

async fn handle_command(
    state: &AppState,
    user_id: Uuid,
    command: ClientCommand,
    out_tx: &UnboundedSender<String>,
    typing_in: &mut HashSet<Uuid>,
) {
    let service = &state.service;
    let result = match command {
        ClientCommand::OpenDirect { peer_id } => service
            .find_or_create_direct(user_id, peer_id)
            .await
            .map(|conversation| {
                json!({ "type": "conversation_opened", "conversation": conversation })
            }),
        ClientCommand::CreateGroup {
            name,
            avatar_url,
            member_ids,
        } => service
            .create_group(user_id, name, avatar_url, member_ids)
            .await
            .map(|conversation| {
                json!({ "type": "conversation_opened", "conversation": conversation })
            }),
        ClientCommand::SendMessage {
            conversation_id,
            kind,
            content,
            metadata,
            attachments,
            reply_to_id,
            forwarded_from_id,
            expires_in_secs,
        } => {
            let outgoing = OutgoingMessage {
                kind,
                content,
                metadata: metadata.unwrap_or_default(),
                attachments,
                reply_to_id,
                forwarded_from_id,
                expires_in_secs,
            };
            service
                .send_message(conversation_id, user_id, outgoing)
                .await
                .map(|message| {
                    typing_in.remove(&conversation_id);
                    json!({ "type": "message_sent", "message_id": message.id })
                })
        }
        ClientCommand::MarkRead {
            conversation_id,
            message_ids,
        } => service
            .mark_as_read(conversation_id, user_id, message_ids)
            .await
            .map(|newly_read| json!({ "type": "marked_read", "message_ids": newly_read })),
        ClientCommand::FetchMessages {
            conversation_id,
            limit,
            before_id,
            after_id,
        } => {
            let query = MessageQuery {
                limit: limit.unwrap_or(0),
                before_id,
                after_id,
            };
            service
                .list_messages(conversation_id, user_id, query)
                .await
                .map(|messages| {
                    json!({
                        "type": "messages",
                        "conversation_id": conversation_id,
                        "messages": messages,
                    })
                })
        }
        ClientCommand::ListConversations { include_archived } => service
            .list_conversations(user_id, include_archived)
            .await
            .map(|summaries| {
                let items: Vec<serde_json::Value> = summaries
                    .into_iter()
                    .map(|s| {
                        json!({
                            "conversation": s.conversation,
                            "unread_count": s.unread_count,
                            "is_pinned": s.participant.is_pinned,
                            "is_muted": s.participant.is_muted,
                            "is_archived": s.participant.is_archived,
                            "last_read_message_id": s.participant.last_read_message_id,
                        })
                    })
                    .collect();
                json!({ "type": "conversations", "items": items })
            }),
        ClientCommand::SetTyping {
            conversation_id,
            is_typing,
        } => service
            .set_typing(conversation_id, user_id, is_typing)
            .await
            .map(|_| {
                if is_typing {
                    typing_in.insert(conversation_id);
                } else {
                    typing_in.remove(&conversation_id);
                }
                json!({ "type": "typing_ack" })
            }),
        ClientCommand::ToggleReaction {
            conversation_id,
            message_id,
            symbol,
        } => service
            .toggle_reaction(conversation_id, user_id, message_id, &symbol)
            .await
            .map(|_| json!({ "type": "reaction_ack", "message_id": message_id })),
        ClientCommand::DeleteMessage {
            conversation_id,
            message_id,
            for_everyone,
        } => service
            .delete_message(conversation_id, user_id, message_id, for_everyone)
            .await
            .map(|_| json!({ "type": "message_deleted_ack", "message_id": message_id })),
        ClientCommand::EditMessage {
            conversation_id,
            message_id,
            content,
        } => service
            .edit_message(conversation_id, user_id, message_id, content)
            .await
            .map(|message| {
                json!({ "type": "message_edited_ack", "message_id": message.id })
            }),
        ClientCommand::SaveDraft {
            conversation_id,
            content,
            reply_to_id,
        } => service
            .save_draft(conversation_id, user_id, content, reply_to_id)
            .await
            .map(|_| json!({ "type": "draft_saved", "conversation_id": conversation_id })),
        ClientCommand::FetchDraft { conversation_id } => service
            .draft(conversation_id, user_id)
            .await
            .map(|draft| json!({ "type": "draft", "draft": draft })),
        ClientCommand::TogglePin { conversation_id } => service
            .toggle_pin(conversation_id, user_id)
            .await
            .map(participant_flags_frame),
        ClientCommand::ToggleMute {
            conversation_id,
            duration_hours,
        } => service
            .toggle_mute(conversation_id, user_id, duration_hours)
            .await
            .map(participant_flags_frame),
        ClientCommand::ToggleArchive { conversation_id } => service
            .toggle_archive(conversation_id, user_id)
            .await
            .map(participant_flags_frame),
        ClientCommand::StartCall {
            conversation_id,
            kind,
        } => service
            .start_call(conversation_id, user_id, kind)
            .await
            .map(|call| json!({ "type": "call_started", "call_id": call.id })),
        ClientCommand::UpdateCallStatus {
            conversation_id,
            call_id,
            status,
        } => service
            .update_call_status(conversation_id, user_id, call_id, status)
            .await
            .map(|call| {
                json!({ "type": "call_status_ack", "call_id": call.id, "status": call.status })
            }),
        ClientCommand::Signal {
            conversation_id,
            payload,
        } => service
            .relay_signal(conversation_id, user_id, payload)
            .await
            .map(|_| json!({ "type": "signal_ack" })),
        ClientCommand::Resubscribe => return,
    };

    match result {
        Ok(frame) => send_frame(out_tx, frame),
        Err(e) => {
            debug!(%user_id, kind = e.kind(), "command failed: {e}");
            send_error_frame(out_tx, e.kind(), &client_message(&e));
        }
    }
}

fn participant_flags_frame(p: crate::models::Participant) -> serde_json::Value {
    json!({
        "type": "flags_updated",
        "conversation_id": p.conversation_id,
        "is_pinned": p.is_pinned,
        "is_muted": p.is_muted,
        "is_archived": p.is_archived,
    })
}

/// Internal failures surface as a generic message; client mistakes get the
/// real one.
fn client_message(e: &AppError) -> String {
    match e {
        AppError::Validation(_) | AppError::Authorization | AppError::NotFound(_) | AppError::State(_) => {
            e.to_string()
        }
        _ => "internal error".to_string(),
    }
}

fn send_frame(out_tx: &UnboundedSender<String>, frame: serde_json::Value) {
    let _ = out_tx.send(frame.to_string());
}

fn send_error_frame(out_tx: &UnboundedSender<String>, kind: &str, message: &str) {
    send_frame(
        out_tx,
        json!({ "type": "error", "kind": kind, "message": message }),
    );
}
