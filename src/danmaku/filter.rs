//! The combined blacklist + dedup filter pipeline.

use std::time::Instant;

use tokio::sync::Mutex;
use tracing::debug;

use super::blacklist::{BlacklistService, Verdict};
use super::dedup::DedupCache;
use super::message::Message;

/// Derives the dedup/decision-cache key for a message, or `None` if the
/// message carries no text (emote, gift) and therefore bypasses dedup
/// entirely.
fn dedup_key(msg: &Message) -> Option<String> {
    let text = msg.text()?;
    if msg.is_monetary() {
        Some(format!("{}\u{0}{}", msg.sender_name().unwrap_or(""), text))
    } else {
        Some(text.to_string())
    }
}

/// Owns the blacklist service and the dedup/decision cache and applies the
/// combined filter decision to an inbound message.
pub struct Filter {
    blacklist: BlacklistService,
    dedup: Mutex<DedupCache>,
}

impl Filter {
    pub fn new(blacklist: BlacklistService, dedup: DedupCache) -> Self {
        Filter {
            blacklist,
            dedup: Mutex::new(dedup),
        }
    }

    pub fn blacklist(&mut self) -> &mut BlacklistService {
        &mut self.blacklist
    }

    /// Runs the full decision for `msg` on `channel`, mutating `sender_name`
    /// in place on a blacklist rewrite. Returns `true` if the message should
    /// be dropped.
    pub async fn evaluate(&self, channel: &str, msg: &mut Message) -> bool {
        let snapshot = self.blacklist.snapshot();

        if snapshot.is_forbidden(msg.sender_id()) {
            return true;
        }

        let Some(key) = dedup_key(msg) else {
            // Non-text variants bypass dedup but still get a live pattern
            // check against sender_name (relevant for monetary gifts).
            return self.apply_verdict(msg, snapshot.decide(msg.is_monetary(), msg.sender_name(), msg.text()));
        };

        let now = Instant::now();
        let mut dedup = self.dedup.lock().await;

        if dedup.check_and_remember(channel, &key, now) {
            debug!(channel, "dropping duplicate message");
            return true;
        }

        let verdict = match dedup.cached_verdict(channel, &key, now) {
            Some(v) => v,
            None => {
                let v = snapshot.decide(msg.is_monetary(), msg.sender_name(), msg.text());
                dedup.remember_verdict(channel, &key, v.clone(), now);
                v
            }
        };
        drop(dedup);

        self.apply_verdict(msg, verdict)
    }

    fn apply_verdict(&self, msg: &mut Message, verdict: Verdict) -> bool {
        match verdict {
            Verdict::Allow => false,
            Verdict::Block => true,
            Verdict::RewriteSenderName(name) => {
                msg.set_sender_name(name);
                false
            }
        }
    }

    pub async fn shutdown(&mut self) {
        self.blacklist.shutdown().await;
    }
}
