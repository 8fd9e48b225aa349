//! Connection registry and broadcast fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::Message as WsMessage;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::message::{Control, ControlFrame, Message};

/// An opaque, process-unique handle for a connected socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A live connection's outbound half: the write task reads frames off this
/// channel and pushes them onto the socket. Dropping the channel (or the
/// write task exiting) is how a connection is detected as dead on the next
/// fan-out pass.
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    sender: mpsc::UnboundedSender<WsMessage>,
}

impl Session {
    pub fn new(sender: mpsc::UnboundedSender<WsMessage>) -> Self {
        Session {
            id: SessionId::next(),
            sender,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Best-effort send; a closed channel just means the connection is
    /// already gone and will be pruned on the next fan-out.
    fn send(&self, text: String) -> bool {
        self.sender.send(WsMessage::Text(text.into())).is_ok()
    }

    fn send_raw(&self, message: WsMessage) -> bool {
        self.sender.send(message).is_ok()
    }
}

/// Owns the viewer and upstream-control registries. All mutation happens
/// through its methods so the lock scope never leaks to callers.
#[derive(Default)]
pub struct ConnectionManager {
    viewers: RwLock<HashMap<String, HashMap<SessionId, Session>>>,
    upstreams: RwLock<HashMap<SessionId, Session>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        ConnectionManager::default()
    }

    pub async fn register_viewer(&self, channel: &str, session: Session) -> SessionId {
        let id = session.id();
        self.viewers
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(id, session);
        id
    }

    pub async fn remove_viewer(&self, channel: &str, id: SessionId) {
        let mut viewers = self.viewers.write().await;
        if let Some(sessions) = viewers.get_mut(channel) {
            sessions.remove(&id);
            if sessions.is_empty() {
                viewers.remove(channel);
            }
        }
    }

    pub async fn register_upstream(&self, session: Session) -> SessionId {
        let id = session.id();
        self.upstreams.write().await.insert(id, session);
        id
    }

    pub async fn remove_upstream(&self, id: SessionId) {
        self.upstreams.write().await.remove(&id);
    }

    /// Sends a raw frame directly to one upstream session, e.g. the
    /// malformed-packet error reply on the upstream socket. `Err` means the
    /// session is already gone.
    pub async fn send_to(&self, id: SessionId, message: WsMessage) -> Result<(), ()> {
        match self.upstreams.read().await.get(&id) {
            Some(session) if session.send_raw(message) => Ok(()),
            _ => Err(()),
        }
    }

    pub async fn viewer_count(&self, channel: &str) -> usize {
        self.viewers.read().await.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Fans a danmaku message out to every viewer of `channel`. If `message`
    /// is special, a crown marker is appended to its text before
    /// serialization. Dead sessions (send failed) are
    /// pruned after the snapshot pass so the broadcast never mutates the map
    /// while iterating it.
    pub async fn broadcast_message(&self, channel: &str, mut message: Message) {
        if self.viewer_count(channel).await == 0 {
            return;
        }
        if message.is_special() {
            message.append_crown();
        }
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "failed to serialize danmaku message for broadcast");
                return;
            }
        };
        self.broadcast_to_channel(channel, payload).await;
    }

    /// Fans a control directive out to every viewer of `channel`, wrapped in
    /// the `{"type":"control","control":...}` envelope.
    pub async fn broadcast_control(&self, channel: &str, control: &Control) {
        let payload = match serde_json::to_string(&ControlFrame::new(control)) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "failed to serialize control directive for broadcast");
                return;
            }
        };
        self.broadcast_to_channel(channel, payload).await;
    }

    async fn broadcast_to_channel(&self, channel: &str, payload: String) {
        let snapshot: Vec<(SessionId, Session)> = {
            let viewers = self.viewers.read().await;
            match viewers.get(channel) {
                Some(sessions) => sessions.iter().map(|(id, s)| (*id, s.clone())).collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, session) in &snapshot {
            if !session.send(payload.clone()) {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            let mut viewers = self.viewers.write().await;
            if let Some(sessions) = viewers.get_mut(channel) {
                for id in dead {
                    sessions.remove(&id);
                }
                if sessions.is_empty() {
                    viewers.remove(channel);
                }
            }
        }
    }

    /// Closes every viewer then every upstream, swallowing per-socket send
    /// errors, then drops the registry entries. Idempotent: calling it
    /// twice, or calling it on an already-empty registry, is a no-op.
    pub async fn disconnect_all(&self) {
        let viewers = self.viewers.write().await;
        for sessions in viewers.values() {
            for session in sessions.values() {
                let _ = session.send_raw(WsMessage::Close(None));
            }
        }
        drop(viewers);

        let upstreams = self.upstreams.write().await;
        for session in upstreams.values() {
            let _ = session.send_raw(WsMessage::Close(None));
        }
        drop(upstreams);

        self.viewers.write().await.clear();
        self.upstreams.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::danmaku::message::Position;

    fn make_session() -> (Session, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new(tx), rx)
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_viewers_only() {
        let mgr = ConnectionManager::new();
        let (s1, mut r1) = make_session();
        let (s2, mut r2) = make_session();
        mgr.register_viewer("room1", s1).await;
        mgr.register_viewer("room2", s2).await;

        let msg = Message::Plain {
            text: "hi".into(),
            color: None,
            size: None,
            position: Position::Scroll,
            sender_id: None,
            sender_name: None,
            is_special: false,
        };
        mgr.broadcast_message("room1", msg).await;

        assert!(r1.try_recv().is_ok());
        assert!(r2.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_session_is_pruned_after_broadcast() {
        let mgr = ConnectionManager::new();
        let (s1, r1) = make_session();
        mgr.register_viewer("room1", s1).await;
        drop(r1);

        let msg = Message::Plain {
            text: "hi".into(),
            color: None,
            size: None,
            position: Position::Scroll,
            sender_id: None,
            sender_name: None,
            is_special: false,
        };
        mgr.broadcast_message("room1", msg).await;

        assert_eq!(mgr.viewer_count("room1").await, 0);
    }

    #[tokio::test]
    async fn disconnect_all_is_idempotent() {
        let mgr = ConnectionManager::new();
        let (s1, _r1) = make_session();
        mgr.register_viewer("room1", s1).await;
        mgr.disconnect_all().await;
        mgr.disconnect_all().await;
        assert_eq!(mgr.viewer_count("room1").await, 0);
    }

    #[tokio::test]
    async fn special_message_gets_crown_marker_before_send() {
        let mgr = ConnectionManager::new();
        let (s1, mut r1) = make_session();
        mgr.register_viewer("room1", s1).await;

        let msg = Message::Plain {
            text: "hi".into(),
            color: None,
            size: None,
            position: Position::Scroll,
            sender_id: None,
            sender_name: None,
            is_special: true,
        };
        mgr.broadcast_message("room1", msg).await;

        let WsMessage::Text(payload) = r1.try_recv().unwrap() else {
            panic!("expected a text frame");
        };
        assert!(payload.contains("hi👑"));
    }

    #[tokio::test]
    async fn remove_viewer_drops_empty_channel_entry() {
        let mgr = ConnectionManager::new();
        let (s1, _r1) = make_session();
        let id = mgr.register_viewer("room1", s1).await;
        mgr.remove_viewer("room1", id).await;
        assert_eq!(mgr.viewer_count("room1").await, 0);
    }
}
