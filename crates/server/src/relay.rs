use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{ConnId, Identity, MessageId, RoomId},
    error::{ErrorCode, RelayError},
    protocol::{MessagePayload, ServerEvent, UserSummary},
};
use storage::{Storage, StoredMessage};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::hub::{EventSender, Hub};

/// Everything the per-connection tasks share: the store, the hub, and the
/// per-room ordering locks that keep persist→fan-out sequences from
/// interleaving across concurrent senders to the same room.
#[derive(Clone)]
pub struct RelayContext {
    pub storage: Storage,
    pub hub: Arc<Hub>,
    pub history_limit: u32,
    send_locks: Arc<Mutex<HashMap<RoomId, Arc<Mutex<()>>>>>,
}

impl RelayContext {
    pub fn new(storage: Storage, hub: Arc<Hub>, history_limit: u32) -> Self {
        Self {
            storage,
            hub,
            history_limit,
            send_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn room_send_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        let mut locks = self.send_locks.lock().await;
        locks.entry(room_id).or_default().clone()
    }

    async fn prune_send_locks(&self, room_ids: &[RoomId]) {
        if room_ids.is_empty() {
            return;
        }
        let mut locks = self.send_locks.lock().await;
        for room_id in room_ids {
            locks.remove(room_id);
        }
    }
}

/// Registers the asserted identity and emits the presence effects: a
/// `user_online` broadcast on the 0→1 edge and a point-in-time
/// `online_users` snapshot to the new connection only. The identity claim
/// is trusted as-is; no credential check happens here.
pub async fn authenticate(ctx: &RelayContext, identity: Identity, tx: EventSender) -> ConnId {
    let registered = ctx.hub.register(identity.clone(), tx).await;
    info!(
        conn_id = registered.conn_id.0,
        user_id = identity.id.0,
        name = %identity.display_name,
        "connection authenticated"
    );

    if registered.came_online {
        ctx.hub
            .broadcast_except(
                registered.conn_id,
                ServerEvent::UserOnline {
                    user_id: identity.id,
                    user_name: identity.display_name.clone(),
                },
            )
            .await;
    }

    let users = registered
        .online
        .into_iter()
        .map(|identity| UserSummary {
            id: identity.id,
            name: identity.display_name,
            role: identity.role,
        })
        .collect();
    ctx.hub
        .send_to(registered.conn_id, ServerEvent::OnlineUsers(users))
        .await;

    registered.conn_id
}

/// Subscribes the connection to a room and replays the most recent bounded
/// history to it, oldest first. Idempotent: a repeated join keeps one
/// membership entry and re-delivers history.
pub async fn join_room(ctx: &RelayContext, conn_id: ConnId, room_id: RoomId) -> Result<(), RelayError> {
    require_room(room_id)?;
    if ctx.hub.join(conn_id, room_id).await.is_none() {
        return Err(RelayError::unauthenticated());
    }

    let recent = ctx
        .storage
        .list_recent_messages(room_id, ctx.history_limit)
        .await
        .map_err(|err| {
            error!(room_id = room_id.0, error = %err, "history read failed");
            RelayError::new(ErrorCode::Internal, "could not load conversation history")
        })?;

    let history = recent.into_iter().map(message_payload).collect();
    ctx.hub
        .send_to(conn_id, ServerEvent::MessageHistory(history))
        .await;
    debug!(conn_id = conn_id.0, room_id = room_id.0, "joined conversation");
    Ok(())
}

pub async fn leave_room(ctx: &RelayContext, conn_id: ConnId, room_id: RoomId) -> Result<(), RelayError> {
    require_room(room_id)?;
    if ctx.hub.leave(conn_id, room_id).await.is_none() {
        return Err(RelayError::unauthenticated());
    }
    debug!(conn_id = conn_id.0, room_id = room_id.0, "left conversation");
    Ok(())
}

/// Persists the message, then fans the stored projection out to every
/// current member of the room, the sender's own connections included.
/// Holding the room's send lock across persist→fan-out keeps delivery
/// order identical to persisted order for concurrent senders.
pub async fn send_message(
    ctx: &RelayContext,
    conn_id: ConnId,
    room_id: RoomId,
    body: &str,
) -> Result<(), RelayError> {
    let identity = ctx
        .hub
        .identity_of(conn_id)
        .await
        .ok_or_else(RelayError::unauthenticated)?;
    require_room(room_id)?;
    if body.trim().is_empty() {
        return Err(RelayError::invalid_room("message body is empty"));
    }

    let lock = ctx.room_send_lock(room_id).await;
    let _ordering = lock.lock().await;

    let stored = ctx
        .storage
        .insert_message(room_id, identity.id, &identity.display_name, body)
        .await
        .map_err(|err| {
            error!(
                conn_id = conn_id.0,
                room_id = room_id.0,
                error = %err,
                "message insert failed, nothing fanned out"
            );
            RelayError::new(ErrorCode::PersistenceFailed, "message could not be stored")
        })?;

    // The message is durable from here on. A failed activity marker must
    // not withhold delivery.
    if let Err(err) = ctx.storage.touch_last_activity(room_id).await {
        warn!(room_id = room_id.0, error = %err, "failed to update last-activity marker");
    }

    let delivered = ctx
        .hub
        .broadcast_room(room_id, ServerEvent::NewMessage(message_payload(stored)), None)
        .await;
    debug!(
        conn_id = conn_id.0,
        room_id = room_id.0,
        delivered,
        "message fanned out"
    );
    Ok(())
}

/// Fire-and-forget typing signal to the room's other members. Not
/// persisted, not acknowledged, not coalesced.
pub async fn set_typing(
    ctx: &RelayContext,
    conn_id: ConnId,
    room_id: RoomId,
    is_typing: bool,
) -> Result<(), RelayError> {
    let identity = ctx
        .hub
        .identity_of(conn_id)
        .await
        .ok_or_else(RelayError::unauthenticated)?;
    require_room(room_id)?;

    ctx.hub
        .broadcast_room(
            room_id,
            ServerEvent::UserTyping {
                user_id: identity.id,
                user_name: identity.display_name,
                is_typing,
            },
            Some(conn_id),
        )
        .await;
    Ok(())
}

/// Commits read-state to the store, then notifies the room's other
/// members. A failed store update suppresses the notice entirely.
pub async fn mark_read(
    ctx: &RelayContext,
    conn_id: ConnId,
    room_id: RoomId,
    message_ids: Vec<MessageId>,
) -> Result<(), RelayError> {
    if ctx.hub.identity_of(conn_id).await.is_none() {
        return Err(RelayError::unauthenticated());
    }
    require_room(room_id)?;
    if message_ids.is_empty() {
        return Err(RelayError::invalid_room("no message ids supplied"));
    }

    ctx.storage
        .mark_messages_read(&message_ids)
        .await
        .map_err(|err| {
            error!(room_id = room_id.0, error = %err, "read-state update failed");
            RelayError::new(ErrorCode::PersistenceFailed, "read state could not be stored")
        })?;

    ctx.hub
        .broadcast_room(
            room_id,
            ServerEvent::MessagesRead {
                conversation_id: room_id,
                message_ids,
            },
            Some(conn_id),
        )
        .await;
    Ok(())
}

/// Teardown: unregister, vacate rooms, and emit `user_offline` on the 1→0
/// edge. Safe to call more than once; only the first call does anything.
pub async fn disconnect(ctx: &RelayContext, conn_id: ConnId) {
    let Some(gone) = ctx.hub.unregister(conn_id).await else {
        return;
    };
    ctx.prune_send_locks(&gone.vacated_rooms).await;

    if gone.went_offline {
        ctx.hub
            .broadcast_except(
                conn_id,
                ServerEvent::UserOffline {
                    user_id: gone.identity.id,
                    user_name: gone.identity.display_name.clone(),
                },
            )
            .await;
    }

    let still_online = ctx.hub.is_online(gone.identity.id).await;
    info!(
        conn_id = conn_id.0,
        user_id = gone.identity.id.0,
        still_online = still_online,
        "connection torn down"
    );
}

fn require_room(room_id: RoomId) -> Result<(), RelayError> {
    if room_id.0 <= 0 {
        return Err(RelayError::invalid_room("conversation id is required"));
    }
    Ok(())
}

fn message_payload(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: stored.message_id,
        conversation_id: stored.conversation_id,
        sender_id: stored.sender_id,
        sender_name: stored.sender_name,
        message: stored.body,
        read: stored.read,
        created_at: stored.created_at,
    }
}

#[cfg(test)]
#[path = "tests/relay_tests.rs"]
mod tests;
