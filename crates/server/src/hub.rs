use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use shared::{
    domain::{ConnId, Identity, RoomId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct ConnEntry {
    identity: Identity,
    tx: EventSender,
}

#[derive(Default)]
struct HubInner {
    conns: HashMap<ConnId, ConnEntry>,
    by_user: HashMap<UserId, HashSet<ConnId>>,
    rooms: HashMap<RoomId, HashSet<ConnId>>,
    joined: HashMap<ConnId, HashSet<RoomId>>,
}

/// Outcome of registering a connection, captured under a single lock so
/// presence edges are never observed twice for the same transition.
pub struct Registered {
    pub conn_id: ConnId,
    /// True only on the identity's 0→1 live-connection transition.
    pub came_online: bool,
    /// Point-in-time snapshot of online identities, one per user, the
    /// registering identity included.
    pub online: Vec<Identity>,
}

pub struct Unregistered {
    pub identity: Identity,
    /// True only on the identity's 1→0 live-connection transition.
    pub went_offline: bool,
    /// Rooms whose membership became empty when this connection left.
    pub vacated_rooms: Vec<RoomId>,
}

/// The only mutable shared state in the relay: identity→connections,
/// room→members, and each connection's outbound channel. All access goes
/// through these operations; fan-out iterates a snapshot taken under the
/// lock and delivers after releasing it, so a teardown can never race a
/// half-updated membership set.
pub struct Hub {
    inner: RwLock<HubInner>,
    next_conn_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HubInner::default()),
            next_conn_id: AtomicU64::new(0),
        }
    }

    pub async fn register(&self, identity: Identity, tx: EventSender) -> Registered {
        let conn_id = ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1);

        let mut inner = self.inner.write().await;
        let user_conns = inner.by_user.entry(identity.id).or_default();
        let came_online = user_conns.is_empty();
        user_conns.insert(conn_id);
        inner.conns.insert(conn_id, ConnEntry { identity, tx });

        let mut online = Vec::with_capacity(inner.by_user.len());
        for conns in inner.by_user.values() {
            let Some(first) = conns.iter().next() else {
                continue;
            };
            if let Some(entry) = inner.conns.get(first) {
                online.push(entry.identity.clone());
            }
        }

        Registered {
            conn_id,
            came_online,
            online,
        }
    }

    /// Removes the connection from the registry and from every joined
    /// room. Idempotent: a second call for the same connection is a no-op
    /// and returns `None`.
    pub async fn unregister(&self, conn_id: ConnId) -> Option<Unregistered> {
        let mut inner = self.inner.write().await;
        let entry = inner.conns.remove(&conn_id)?;
        let user_id = entry.identity.id;

        let went_offline = match inner.by_user.get_mut(&user_id) {
            Some(conns) => {
                conns.remove(&conn_id);
                if conns.is_empty() {
                    inner.by_user.remove(&user_id);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        let mut vacated_rooms = Vec::new();
        for room_id in inner.joined.remove(&conn_id).unwrap_or_default() {
            if let Some(members) = inner.rooms.get_mut(&room_id) {
                members.remove(&conn_id);
                if members.is_empty() {
                    inner.rooms.remove(&room_id);
                    vacated_rooms.push(room_id);
                }
            }
        }

        Some(Unregistered {
            identity: entry.identity,
            went_offline,
            vacated_rooms,
        })
    }

    pub async fn identity_of(&self, conn_id: ConnId) -> Option<Identity> {
        let inner = self.inner.read().await;
        inner.conns.get(&conn_id).map(|entry| entry.identity.clone())
    }

    pub async fn connections_for(&self, user_id: UserId) -> HashSet<ConnId> {
        let inner = self.inner.read().await;
        inner.by_user.get(&user_id).cloned().unwrap_or_default()
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        !self.connections_for(user_id).await.is_empty()
    }

    /// Subscribes a registered connection to a room. Returns `None` for an
    /// unregistered connection, otherwise whether the membership is new.
    pub async fn join(&self, conn_id: ConnId, room_id: RoomId) -> Option<bool> {
        let mut inner = self.inner.write().await;
        if !inner.conns.contains_key(&conn_id) {
            return None;
        }
        let newly_joined = inner.rooms.entry(room_id).or_default().insert(conn_id);
        inner.joined.entry(conn_id).or_default().insert(room_id);
        Some(newly_joined)
    }

    pub async fn leave(&self, conn_id: ConnId, room_id: RoomId) -> Option<bool> {
        let mut inner = self.inner.write().await;
        if !inner.conns.contains_key(&conn_id) {
            return None;
        }
        let was_member = match inner.rooms.get_mut(&room_id) {
            Some(members) => {
                let removed = members.remove(&conn_id);
                if members.is_empty() {
                    inner.rooms.remove(&room_id);
                }
                removed
            }
            None => false,
        };
        if let Some(joined) = inner.joined.get_mut(&conn_id) {
            joined.remove(&room_id);
        }
        Some(was_member)
    }

    pub async fn members_of(&self, room_id: RoomId) -> Vec<ConnId> {
        let inner = self.inner.read().await;
        inner
            .rooms
            .get(&room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Delivers one event to one connection. A closed channel is a
    /// per-recipient transport failure: logged, never propagated.
    pub async fn send_to(&self, conn_id: ConnId, event: ServerEvent) -> bool {
        let tx = {
            let inner = self.inner.read().await;
            inner.conns.get(&conn_id).map(|entry| entry.tx.clone())
        };
        match tx {
            Some(tx) => deliver(conn_id, &tx, event),
            None => false,
        }
    }

    /// Broadcast to every registered connection except `except`.
    pub async fn broadcast_except(&self, except: ConnId, event: ServerEvent) -> usize {
        let targets: Vec<(ConnId, EventSender)> = {
            let inner = self.inner.read().await;
            inner
                .conns
                .iter()
                .filter(|(conn_id, _)| **conn_id != except)
                .map(|(conn_id, entry)| (*conn_id, entry.tx.clone()))
                .collect()
        };
        fan_out(targets, event)
    }

    /// Broadcast to the room's current members, optionally excluding one
    /// connection. The membership snapshot is taken under the lock; the
    /// sends happen after it is released.
    pub async fn broadcast_room(
        &self,
        room_id: RoomId,
        event: ServerEvent,
        except: Option<ConnId>,
    ) -> usize {
        let targets: Vec<(ConnId, EventSender)> = {
            let inner = self.inner.read().await;
            let Some(members) = inner.rooms.get(&room_id) else {
                return 0;
            };
            members
                .iter()
                .filter(|conn_id| Some(**conn_id) != except)
                .filter_map(|conn_id| {
                    inner
                        .conns
                        .get(conn_id)
                        .map(|entry| (*conn_id, entry.tx.clone()))
                })
                .collect()
        };
        fan_out(targets, event)
    }
}

fn fan_out(targets: Vec<(ConnId, EventSender)>, event: ServerEvent) -> usize {
    let mut delivered = 0;
    for (conn_id, tx) in targets {
        if deliver(conn_id, &tx, event.clone()) {
            delivered += 1;
        }
    }
    delivered
}

fn deliver(conn_id: ConnId, tx: &EventSender, event: ServerEvent) -> bool {
    if tx.send(event).is_err() {
        warn!(conn_id = conn_id.0, "recipient channel closed, dropping event");
        return false;
    }
    true
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
