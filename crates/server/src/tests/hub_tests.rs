use super::*;
use shared::domain::Role;

fn identity(id: i64, name: &str) -> Identity {
    Identity {
        id: UserId(id),
        display_name: name.to_string(),
        role: Role::Participant,
    }
}

fn channel() -> (EventSender, mpsc::UnboundedReceiver<ServerEvent>) {
    mpsc::unbounded_channel()
}

#[tokio::test]
async fn first_connection_is_the_online_edge() {
    let hub = Hub::new();

    let (tx, _rx) = channel();
    let first = hub.register(identity(1, "alice"), tx).await;
    assert!(first.came_online);
    assert_eq!(first.online.len(), 1);

    let (tx, _rx) = channel();
    let second_device = hub.register(identity(1, "alice"), tx).await;
    assert!(!second_device.came_online);
    assert_eq!(second_device.online.len(), 1);

    let (tx, _rx) = channel();
    let other_user = hub.register(identity(2, "bob"), tx).await;
    assert!(other_user.came_online);
    assert_eq!(other_user.online.len(), 2);

    assert!(hub.is_online(UserId(1)).await);
    assert_eq!(hub.connections_for(UserId(1)).await.len(), 2);
}

#[tokio::test]
async fn last_unregister_is_the_offline_edge() {
    let hub = Hub::new();
    let (tx, _rx) = channel();
    let first = hub.register(identity(1, "alice"), tx).await;
    let (tx, _rx) = channel();
    let second = hub.register(identity(1, "alice"), tx).await;

    let gone = hub.unregister(first.conn_id).await.expect("registered");
    assert!(!gone.went_offline);
    assert!(hub.is_online(UserId(1)).await);

    let gone = hub.unregister(second.conn_id).await.expect("registered");
    assert!(gone.went_offline);
    assert!(!hub.is_online(UserId(1)).await);

    assert!(hub.unregister(second.conn_id).await.is_none());
}

#[tokio::test]
async fn join_is_idempotent() {
    let hub = Hub::new();
    let (tx, _rx) = channel();
    let conn = hub.register(identity(1, "alice"), tx).await.conn_id;

    assert_eq!(hub.join(conn, RoomId(7)).await, Some(true));
    assert_eq!(hub.join(conn, RoomId(7)).await, Some(false));
    assert_eq!(hub.members_of(RoomId(7)).await.len(), 1);
}

#[tokio::test]
async fn join_and_leave_require_registration() {
    let hub = Hub::new();
    assert!(hub.join(ConnId(999), RoomId(7)).await.is_none());
    assert!(hub.leave(ConnId(999), RoomId(7)).await.is_none());
}

#[tokio::test]
async fn leave_removes_membership() {
    let hub = Hub::new();
    let (tx, _rx) = channel();
    let conn = hub.register(identity(1, "alice"), tx).await.conn_id;

    hub.join(conn, RoomId(7)).await;
    assert_eq!(hub.leave(conn, RoomId(7)).await, Some(true));
    assert!(hub.members_of(RoomId(7)).await.is_empty());
    assert_eq!(hub.leave(conn, RoomId(7)).await, Some(false));
}

#[tokio::test]
async fn unregister_vacates_joined_rooms() {
    let hub = Hub::new();
    let (tx, _rx) = channel();
    let alice = hub.register(identity(1, "alice"), tx).await.conn_id;
    let (tx, _rx) = channel();
    let bob = hub.register(identity(2, "bob"), tx).await.conn_id;

    hub.join(alice, RoomId(1)).await;
    hub.join(alice, RoomId(2)).await;
    hub.join(bob, RoomId(1)).await;

    let gone = hub.unregister(alice).await.expect("registered");
    assert_eq!(gone.vacated_rooms, vec![RoomId(2)]);
    assert_eq!(hub.members_of(RoomId(1)).await, vec![bob]);
    assert!(hub.members_of(RoomId(2)).await.is_empty());
}

#[tokio::test]
async fn broadcast_room_reaches_members_only() {
    let hub = Hub::new();
    let (tx, mut rx_alice) = channel();
    let alice = hub.register(identity(1, "alice"), tx).await.conn_id;
    let (tx, mut rx_bob) = channel();
    let bob = hub.register(identity(2, "bob"), tx).await.conn_id;
    let (tx, mut rx_carol) = channel();
    let _carol = hub.register(identity(3, "carol"), tx).await.conn_id;

    hub.join(alice, RoomId(7)).await;
    hub.join(bob, RoomId(7)).await;

    let delivered = hub
        .broadcast_room(
            RoomId(7),
            ServerEvent::UserTyping {
                user_id: UserId(1),
                user_name: "alice".to_string(),
                is_typing: true,
            },
            Some(alice),
        )
        .await;
    assert_eq!(delivered, 1);

    assert!(matches!(
        rx_bob.try_recv(),
        Ok(ServerEvent::UserTyping { is_typing: true, .. })
    ));
    assert!(rx_alice.try_recv().is_err());
    assert!(rx_carol.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_except_skips_one_connection() {
    let hub = Hub::new();
    let (tx, mut rx_alice) = channel();
    let alice = hub.register(identity(1, "alice"), tx).await.conn_id;
    let (tx, mut rx_bob) = channel();
    let _bob = hub.register(identity(2, "bob"), tx).await.conn_id;

    let delivered = hub
        .broadcast_except(
            alice,
            ServerEvent::UserOnline {
                user_id: UserId(1),
                user_name: "alice".to_string(),
            },
        )
        .await;
    assert_eq!(delivered, 1);
    assert!(rx_alice.try_recv().is_err());
    assert!(matches!(
        rx_bob.try_recv(),
        Ok(ServerEvent::UserOnline { .. })
    ));
}

#[tokio::test]
async fn delivery_to_closed_channel_is_nonfatal() {
    let hub = Hub::new();
    let (tx, rx) = channel();
    let stale = hub.register(identity(1, "alice"), tx).await.conn_id;
    drop(rx);
    let (tx, mut rx_bob) = channel();
    let bob = hub.register(identity(2, "bob"), tx).await.conn_id;

    hub.join(stale, RoomId(7)).await;
    hub.join(bob, RoomId(7)).await;

    let delivered = hub
        .broadcast_room(
            RoomId(7),
            ServerEvent::MessagesRead {
                conversation_id: RoomId(7),
                message_ids: vec![],
            },
            None,
        )
        .await;
    assert_eq!(delivered, 1);
    assert!(matches!(
        rx_bob.try_recv(),
        Ok(ServerEvent::MessagesRead { .. })
    ));

    assert!(!hub.send_to(stale, ServerEvent::OnlineUsers(vec![])).await);
    assert!(!hub.send_to(ConnId(999), ServerEvent::OnlineUsers(vec![])).await);
}
