use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{ConnId, Identity},
    error::RelayError,
    protocol::{ClientRequest, ServerEvent},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use crate::relay::{self, RelayContext};

/// Per-connection state machine: accept → unauthenticated wait →
/// authenticated event loop → teardown. Teardown runs exactly once on
/// every exit path, including abrupt socket loss.
pub async fn handle_socket(ctx: RelayContext, auth_grace: Duration, socket: WebSocket) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Outbound writer: drains the connection's channel into the socket.
    // A write failure ends it, which surfaces on the read side as a
    // closed socket and drives this session into teardown.
    let writer = tokio::spawn(write_events(sink, rx));

    let Some(identity) = wait_for_authenticate(&mut stream, &tx, auth_grace).await else {
        drop(tx);
        let _ = writer.await;
        return;
    };

    let conn_id = relay::authenticate(&ctx, identity, tx.clone()).await;

    while let Some(Ok(message)) = stream.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => {
                if let Err(error) = dispatch(&ctx, conn_id, request).await {
                    let _ = tx.send(ServerEvent::Error(error));
                }
            }
            Err(error) => {
                let _ = tx.send(ServerEvent::Error(RelayError::invalid_room(format!(
                    "unparseable request: {error}"
                ))));
            }
        }
    }

    relay::disconnect(&ctx, conn_id).await;
    drop(tx);
    let _ = writer.await;
}

async fn dispatch(ctx: &RelayContext, conn_id: ConnId, request: ClientRequest) -> Result<(), RelayError> {
    match request {
        ClientRequest::Authenticate { .. } => {
            // Identity is immutable for the connection's lifetime.
            debug!(conn_id = conn_id.0, "ignoring repeated authenticate");
            Ok(())
        }
        ClientRequest::JoinConversation(room_id) => relay::join_room(ctx, conn_id, room_id).await,
        ClientRequest::LeaveConversation(room_id) => relay::leave_room(ctx, conn_id, room_id).await,
        ClientRequest::SendMessage {
            conversation_id,
            message,
        } => relay::send_message(ctx, conn_id, conversation_id, &message).await,
        ClientRequest::Typing {
            conversation_id,
            is_typing,
        } => relay::set_typing(ctx, conn_id, conversation_id, is_typing).await,
        ClientRequest::MarkAsRead {
            conversation_id,
            message_ids,
        } => relay::mark_read(ctx, conn_id, conversation_id, message_ids).await,
    }
}

/// Holds the connection in the unauthenticated state. Only `authenticate`
/// is honored; anything else is answered with an `Unauthenticated` error
/// event. A connection still silent when the grace period lapses is
/// force-closed.
async fn wait_for_authenticate(
    stream: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    grace: Duration,
) -> Option<Identity> {
    let wait = async {
        while let Some(Ok(message)) = stream.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return None,
                _ => continue,
            };
            match serde_json::from_str::<ClientRequest>(&text) {
                Ok(ClientRequest::Authenticate { id, name, role }) => {
                    return Some(Identity {
                        id,
                        display_name: name,
                        role,
                    });
                }
                Ok(_) => {
                    let _ = tx.send(ServerEvent::Error(RelayError::unauthenticated()));
                }
                Err(error) => {
                    let _ = tx.send(ServerEvent::Error(RelayError::invalid_room(format!(
                        "unparseable request: {error}"
                    ))));
                }
            }
        }
        None
    };

    match tokio::time::timeout(grace, wait).await {
        Ok(identity) => identity,
        Err(_) => {
            warn!(grace_seconds = grace.as_secs(), "authenticate grace period expired, closing connection");
            None
        }
    }
}

async fn write_events(
    mut sink: SplitSink<WebSocket, Message>,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    let mut events = UnboundedReceiverStream::new(rx);
    while let Some(event) = events.next().await {
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(_) => continue,
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
}
