//! # Hub
//!
//! The authoritative in-memory registry of live connections, grouped by
//! room. A single cooperatively-scheduled task owns the room tables and
//! drains one inbound command channel, a task owning data behind message
//! passing, not a shared lock behind a mutex. Each client gets its own
//! bounded outbound queue; a full queue means the client is forcibly
//! dropped rather than stalling the room for everyone else.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::OutboundFrame;

/// Capacity of the hub's own inbound command channel, distinct from each
/// client's outbound queue, which `ChatConfig::outbound_queue_capacity`
/// controls.
const HUB_COMMAND_CHANNEL_CAPACITY: usize = 1024;

struct ClientHandle {
    user_id: Uuid,
    username: String,
    outbound: mpsc::Sender<OutboundFrame>,
}

/// Commands the Hub's owning task drains, in arrival order. Because a
/// single task processes this channel one message at a time, broadcast
/// order within a room is exactly arrival order at this channel.
enum HubCommand {
    Register {
        room_id: Uuid,
        client_id: Uuid,
        user_id: Uuid,
        username: String,
        outbound: mpsc::Sender<OutboundFrame>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        client_id: Uuid,
    },
    Broadcast {
        room_id: Uuid,
        frame: OutboundFrame,
    },
    BroadcastToOthers {
        room_id: Uuid,
        sender_client_id: Uuid,
        frame: OutboundFrame,
    },
    /// Keeps the Hub the sole enqueuer of every client's outbound queue.
    /// Used for frames addressed to exactly one already-registered client,
    /// e.g. an `error` frame sent only to the client whose command failed
    /// to publish or whose message failed validation.
    SendTo {
        client_id: Uuid,
        frame: OutboundFrame,
    },
    /// Lets the gateway/tests observe current room size without racing the
    /// actor's internal state.
    RoomSize {
        room_id: Uuid,
        reply: oneshot::Sender<usize>,
    },
}

/// Cheap, cloneable capability handle callers use to talk to the Hub task.
/// Never holds a back-reference into the Hub's own tables, so a Client can
/// hold one without creating a reference cycle back to the Hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    /// Registers `client_id` into `room_id`'s member set and emits a
    /// `user_joined` + `user_count_update` pair to the room, including to
    /// the joining client itself. Returns once the registration has taken
    /// effect, so callers know it is safe to rely on subsequent broadcasts
    /// reaching this client.
    pub async fn register(
        &self,
        room_id: Uuid,
        client_id: Uuid,
        user_id: Uuid,
        username: String,
        outbound: mpsc::Sender<OutboundFrame>,
    ) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::Register {
                room_id,
                client_id,
                user_id,
                username,
                outbound,
                ack: ack_tx,
            })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Removes `client_id` from its room (idempotent) and closes its
    /// outbound queue exactly once.
    pub async fn unregister(&self, client_id: Uuid) {
        let _ = self.tx.send(HubCommand::Unregister { client_id }).await;
    }

    /// Delivers `frame` to every currently-registered client of `room_id`.
    pub async fn broadcast(&self, room_id: Uuid, frame: OutboundFrame) {
        let _ = self.tx.send(HubCommand::Broadcast { room_id, frame }).await;
    }

    /// Same as `broadcast`, excluding `sender_client_id`.
    pub async fn broadcast_to_others(&self, room_id: Uuid, sender_client_id: Uuid, frame: OutboundFrame) {
        let _ = self
            .tx
            .send(HubCommand::BroadcastToOthers {
                room_id,
                sender_client_id,
                frame,
            })
            .await;
    }

    /// Delivers `frame` to exactly one registered client, e.g. an `error`
    /// frame addressed only to the client that triggered it.
    pub async fn send_to(&self, client_id: Uuid, frame: OutboundFrame) {
        let _ = self.tx.send(HubCommand::SendTo { client_id, frame }).await;
    }

    /// Current member count of `room_id`, or 0 if the room is empty or
    /// unknown.
    pub async fn room_size(&self, room_id: Uuid) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(HubCommand::RoomSize { room_id, reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }
}

/// Owns the room tables and runs until `shutdown` fires and its command
/// channel drains. Spawn this once at process startup; every other task
/// talks to it only through a cloned `HubHandle`.
pub struct Hub {
    rooms: HashMap<Uuid, HashMap<Uuid, ClientHandle>>,
    client_rooms: HashMap<Uuid, Uuid>,
    rx: mpsc::Receiver<HubCommand>,
}

impl Hub {
    /// Builds a fresh Hub and the handle used to reach it.
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(HUB_COMMAND_CHANNEL_CAPACITY);
        (
            Hub {
                rooms: HashMap::new(),
                client_rooms: HashMap::new(),
                rx,
            },
            HubHandle { tx },
        )
    }

    /// Runs the Hub's actor loop. Returns once `shutdown` has fired and all
    /// commands queued up to that point have drained; nothing queued
    /// after cancellation is serviced.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("hub: shutdown signaled, draining queued commands");
                    self.drain_remaining();
                    break;
                }
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => break,
                    }
                }
            }
        }
        info!("hub: stopped");
    }

    fn drain_remaining(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            self.handle(cmd);
        }
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                room_id,
                client_id,
                user_id,
                username,
                outbound,
                ack,
            } => self.on_register(room_id, client_id, user_id, username, outbound, ack),
            HubCommand::Unregister { client_id } => self.on_unregister(client_id),
            HubCommand::Broadcast { room_id, frame } => self.on_broadcast(room_id, frame, None),
            HubCommand::BroadcastToOthers {
                room_id,
                sender_client_id,
                frame,
            } => self.on_broadcast(room_id, frame, Some(sender_client_id)),
            HubCommand::SendTo { client_id, frame } => self.on_send_to(client_id, frame),
            HubCommand::RoomSize { room_id, reply } => {
                let size = self.rooms.get(&room_id).map(|m| m.len()).unwrap_or(0);
                let _ = reply.send(size);
            }
        }
    }

    fn on_register(
        &mut self,
        room_id: Uuid,
        client_id: Uuid,
        user_id: Uuid,
        username: String,
        outbound: mpsc::Sender<OutboundFrame>,
        ack: oneshot::Sender<()>,
    ) {
        self.rooms.entry(room_id).or_default().insert(
            client_id,
            ClientHandle {
                user_id,
                username: username.clone(),
                outbound,
            },
        );
        self.client_rooms.insert(client_id, room_id);
        let _ = ack.send(());

        // Registration side-effects are observed strictly after the
        // mutation above, including by the joining client.
        let user_count = self.rooms.get(&room_id).map(|m| m.len()).unwrap_or(0);
        info!(%room_id, %client_id, %user_id, "hub: client registered");
        self.on_broadcast(
            room_id,
            OutboundFrame::UserJoined {
                username,
                user_count,
            },
            None,
        );
        self.on_broadcast(room_id, OutboundFrame::UserCountUpdate { user_count }, None);
    }

    fn on_unregister(&mut self, client_id: Uuid) {
        let Some(room_id) = self.client_rooms.remove(&client_id) else {
            // Idempotent: unregistering an unknown/already-removed client
            // is a no-op, never an error.
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(handle) = room.remove(&client_id) else {
            return;
        };
        // Dropping `handle.outbound` here closes the client's outbound
        // queue exactly once. The Hub is its sole owner.
        let username = handle.username.clone();
        drop(handle);

        let user_count = room.len();
        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
        info!(%room_id, %client_id, "hub: client unregistered");

        self.on_broadcast(room_id, OutboundFrame::UserLeft { username, user_count }, None);
        self.on_broadcast(room_id, OutboundFrame::UserCountUpdate { user_count }, None);
    }

    fn on_broadcast(&mut self, room_id: Uuid, frame: OutboundFrame, exclude: Option<Uuid>) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return; // broadcast to an empty/absent room is a no-op
        };

        let mut stuck = Vec::new();
        for (&client_id, handle) in room.iter() {
            if Some(client_id) == exclude {
                continue;
            }
            match handle.outbound.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%room_id, %client_id, "hub: outbound queue full, dropping client");
                    stuck.push(client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(%room_id, %client_id, "hub: outbound queue already closed, pruning");
                    stuck.push(client_id);
                }
            }
        }

        for client_id in stuck {
            room.remove(&client_id);
            self.client_rooms.remove(&client_id);
        }
        if room.is_empty() {
            self.rooms.remove(&room_id);
        }
    }

    fn on_send_to(&mut self, client_id: Uuid, frame: OutboundFrame) {
        let Some(&room_id) = self.client_rooms.get(&client_id) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return;
        };
        let Some(handle) = room.get(&client_id) else {
            return;
        };
        match handle.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(%room_id, %client_id, "hub: direct send failed, pruning client");
                room.remove(&client_id);
                self.client_rooms.remove(&client_id);
                if room.is_empty() {
                    self.rooms.remove(&room_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u32) -> OutboundFrame {
        OutboundFrame::Error {
            message: format!("m{n}"),
        }
    }

    #[tokio::test]
    async fn register_then_broadcast_is_observed_by_joiner() {
        let (hub, handle) = Hub::new();
        let shutdown = CancellationToken::new();
        let hub_task = tokio::spawn(hub.run(shutdown.clone()));

        let room = Uuid::new_v4();
        let client = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        handle
            .register(room, client, Uuid::new_v4(), "alice".into(), tx)
            .await;

        // join notice, then count update, both self-observed
        assert!(matches!(rx.recv().await, Some(OutboundFrame::UserJoined { .. })));
        assert!(matches!(rx.recv().await, Some(OutboundFrame::UserCountUpdate { .. })));

        handle.broadcast(room, frame(1)).await;
        assert!(matches!(rx.recv().await, Some(OutboundFrame::Error { .. })));

        shutdown.cancel();
        hub_task.await.unwrap();
    }

    #[tokio::test]
    async fn broadcast_order_is_preserved_for_surviving_clients() {
        let (hub, handle) = Hub::new();
        let shutdown = CancellationToken::new();
        let hub_task = tokio::spawn(hub.run(shutdown.clone()));

        let room = Uuid::new_v4();
        let client = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        handle
            .register(room, client, Uuid::new_v4(), "alice".into(), tx)
            .await;
        rx.recv().await; // join
        rx.recv().await; // count

        for i in 0..5 {
            handle.broadcast(room, frame(i)).await;
        }
        for i in 0..5 {
            match rx.recv().await {
                Some(OutboundFrame::Error { message }) => assert_eq!(message, format!("m{i}")),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        shutdown.cancel();
        hub_task.await.unwrap();
    }

    #[tokio::test]
    async fn full_queue_drops_client_without_stalling_others() {
        let (hub, handle) = Hub::new();
        let shutdown = CancellationToken::new();
        let hub_task = tokio::spawn(hub.run(shutdown.clone()));

        let room = Uuid::new_v4();
        let slow = Uuid::new_v4();
        let fast = Uuid::new_v4();

        let (slow_tx, slow_rx) = mpsc::channel(2);
        let (fast_tx, mut fast_rx) = mpsc::channel(64);

        handle.register(room, slow, Uuid::new_v4(), "slow".into(), slow_tx).await;
        handle.register(room, fast, Uuid::new_v4(), "fast".into(), fast_tx).await;

        // Drain the join/count-update noise for both.
        for _ in 0..4 {
            let _ = fast_rx.recv().await;
        }
        // `slow_rx` is never drained, so its bounded queue (capacity 2)
        // fills after its own two registration notices.

        for i in 0..10u32 {
            handle.broadcast(room, frame(i)).await;
        }
        // give the actor a beat to process the backlog
        tokio::task::yield_now().await;

        assert_eq!(handle.room_size(room).await, 1, "slow client should have been dropped");
        // The fast client must still have received every broadcast.
        for i in 0..10u32 {
            match fast_rx.recv().await {
                Some(OutboundFrame::Error { message }) => assert_eq!(message, format!("m{i}")),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        drop(slow_rx);

        shutdown.cancel();
        hub_task.await.unwrap();
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_closes_queue_once() {
        let (hub, handle) = Hub::new();
        let shutdown = CancellationToken::new();
        let hub_task = tokio::spawn(hub.run(shutdown.clone()));

        let room = Uuid::new_v4();
        let client = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        handle.register(room, client, Uuid::new_v4(), "alice".into(), tx).await;
        rx.recv().await;
        rx.recv().await;

        handle.unregister(client).await;
        handle.unregister(client).await; // must not panic or double-emit

        tokio::task::yield_now().await;
        assert_eq!(rx.recv().await, None, "outbound queue should be closed");
        assert_eq!(handle.room_size(room).await, 0);

        shutdown.cancel();
        hub_task.await.unwrap();
    }
}
