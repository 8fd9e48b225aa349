pub mod bilibili;
pub mod blacklist;
pub mod connection;
pub mod dedup;
pub mod filter;
pub mod message;
pub mod parser;
pub mod satori;

use std::time::Duration;

use crate::config::DanmakuConfig;
use blacklist::BlacklistService;
use connection::ConnectionManager;
use dedup::DedupCache;
use filter::Filter;
use message::{Control, Message};

/// Everything the running gateway needs in one place: the connection
/// registry and the filter pipeline that gates every broadcast.
pub struct GatewayState {
    pub connections: ConnectionManager,
    filter: Filter,
}

impl GatewayState {
    pub fn from_config(cfg: &DanmakuConfig) -> Result<Self, blacklist::BlacklistError> {
        let mut blacklist = BlacklistService::load(&cfg.blacklist_file, &cfg.forbidden_users_file)?;
        blacklist.watch()?;
        let dedup = DedupCache::new(
            Duration::from_secs(cfg.dedup_window),
            Duration::from_secs(cfg.blacklist_window),
        );
        Ok(GatewayState {
            connections: ConnectionManager::new(),
            filter: Filter::new(blacklist, dedup),
        })
    }

    /// Short-circuits on an empty channel, runs the filter, then hands off
    /// to the connection manager for crown-marking, serialization, and
    /// fan-out.
    pub async fn broadcast_message(&self, channel: &str, mut message: Message) {
        if self.connections.viewer_count(channel).await == 0 {
            return;
        }
        if self.filter.evaluate(channel, &mut message).await {
            return;
        }
        self.connections.broadcast_message(channel, message).await;
    }

    pub async fn broadcast_control(&self, channel: &str, control: &Control) {
        self.connections.broadcast_control(channel, control).await;
    }

    /// Tears down every connection and the filter's background resources
    /// (the blacklist watcher).
    pub async fn shutdown(&mut self) {
        self.connections.disconnect_all().await;
        self.filter.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message::Position;

    fn test_config() -> DanmakuConfig {
        let dir = std::env::temp_dir().join(format!("nekocast-gateway-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        DanmakuConfig {
            upstream: None,
            satori: None,
            bilibili: None,
            dedup_window: 5,
            blacklist_window: 20,
            blacklist_file: dir.join("blacklist.txt"),
            forbidden_users_file: dir.join("forbidden.txt"),
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_viewers_short_circuits_before_filter() {
        let state = GatewayState::from_config(&test_config()).unwrap();
        let msg = Message::Plain {
            text: "hi".into(),
            color: None,
            size: None,
            position: Position::Scroll,
            sender_id: None,
            sender_name: None,
            is_special: false,
        };
        // No viewers registered anywhere: this must not panic or hang.
        state.broadcast_message("empty-channel", msg).await;
    }
}
