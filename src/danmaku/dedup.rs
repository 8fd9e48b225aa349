//! Two-tier per-channel dedup and decision cache.
//!
//! Tier 1 (`dedup_window`) blocks exact duplicate messages arriving in quick
//! succession. Tier 2 (`blacklist_window`) memoizes the blacklist verdict for
//! a piece of text so a storm of near-identical messages doesn't re-run
//! regex matching on every one. A verdict's clock in tier 2 starts when its
//! tier-1 entry would expire, not when it was decided: its total life from
//! the original message is `dedup_window + blacklist_window`.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::blacklist::Verdict;

struct Seen {
    key: String,
    at: Instant,
}

struct Decided {
    key: String,
    verdict: Verdict,
    at: Instant,
}

/// Dedup + decision state for a single channel. Window maintenance is lazy:
/// every `add`/`remember` call first pops expired entries off the front of
/// the queue before doing anything else, so there is no background sweep
/// task.
#[derive(Default)]
struct ChannelState {
    recent: VecDeque<Seen>,
    decisions: VecDeque<Decided>,
}

impl ChannelState {
    fn evict(queue: &mut VecDeque<impl HasInstant>, window: Duration, now: Instant) {
        while let Some(front) = queue.front() {
            if now.duration_since(front.at()) >= window {
                queue.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_duplicate(&mut self, key: &str, window: Duration, now: Instant) -> bool {
        Self::evict(&mut self.recent, window, now);
        self.recent.iter().any(|s| s.key == key)
    }

    fn remember(&mut self, key: String, now: Instant) {
        self.recent.push_back(Seen { key, at: now });
    }

    fn cached_verdict(&mut self, key: &str, window: Duration, now: Instant) -> Option<Verdict> {
        Self::evict(&mut self.decisions, window, now);
        self.decisions.iter().find(|d| d.key == key).map(|d| d.verdict.clone())
    }

    fn remember_decision(&mut self, key: String, verdict: Verdict, now: Instant) {
        self.decisions.push_back(Decided { key, verdict, at: now });
    }
}

trait HasInstant {
    fn at(&self) -> Instant;
}
impl HasInstant for Seen {
    fn at(&self) -> Instant {
        self.at
    }
}
impl HasInstant for Decided {
    fn at(&self) -> Instant {
        self.at
    }
}

/// Owns per-channel dedup/decision state. Not `Send`-shared directly; callers
/// wrap it the same way the rest of the registry is wrapped: a single lock
/// owned by the caller.
#[derive(Default)]
pub struct DedupCache {
    channels: HashMap<String, ChannelState>,
    dedup_window: Duration,
    blacklist_window: Duration,
}

impl DedupCache {
    pub fn new(dedup_window: Duration, blacklist_window: Duration) -> Self {
        DedupCache {
            channels: HashMap::new(),
            dedup_window,
            blacklist_window,
        }
    }

    /// Tier 1: returns `true` if `key` was already seen for `channel` within
    /// `dedup_window`, and records it either way so the window slides.
    pub fn check_and_remember(&mut self, channel: &str, key: &str, now: Instant) -> bool {
        let state = self.channels.entry(channel.to_string()).or_default();
        let duplicate = state.is_duplicate(key, self.dedup_window, now);
        if !duplicate {
            state.remember(key.to_string(), now);
        }
        duplicate
    }

    /// Tier 2: returns a memoized blacklist verdict for `key` on `channel` if
    /// one was recorded within `blacklist_window`.
    pub fn cached_verdict(&mut self, channel: &str, key: &str, now: Instant) -> Option<Verdict> {
        self.channels
            .entry(channel.to_string())
            .or_default()
            .cached_verdict(key, self.blacklist_window, now)
    }

    /// Records `verdict` as if it migrated into tier 2 at the moment its
    /// tier-1 entry expires (`now + dedup_window`), so it lives there for
    /// `blacklist_window` beyond that point rather than from `now`.
    pub fn remember_verdict(&mut self, channel: &str, key: &str, verdict: Verdict, now: Instant) {
        let migrated_at = now + self.dedup_window;
        self.channels
            .entry(channel.to_string())
            .or_default()
            .remember_decision(key.to_string(), verdict, migrated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_identical_message_within_window_is_duplicate() {
        let mut cache = DedupCache::new(Duration::from_secs(5), Duration::from_secs(20));
        let t0 = Instant::now();
        assert!(!cache.check_and_remember("c1", "hello", t0));
        assert!(cache.check_and_remember("c1", "hello", t0));
    }

    #[test]
    fn zero_window_never_dedups() {
        let mut cache = DedupCache::new(Duration::from_secs(0), Duration::from_secs(0));
        let t0 = Instant::now();
        assert!(!cache.check_and_remember("c1", "hello", t0));
        assert!(!cache.check_and_remember("c1", "hello", t0));
    }

    #[test]
    fn expired_entry_is_no_longer_a_duplicate() {
        let mut cache = DedupCache::new(Duration::from_millis(10), Duration::from_secs(20));
        let t0 = Instant::now();
        assert!(!cache.check_and_remember("c1", "hello", t0));
        let t1 = t0 + Duration::from_millis(20);
        assert!(!cache.check_and_remember("c1", "hello", t1));
    }

    #[test]
    fn channels_are_independent() {
        let mut cache = DedupCache::new(Duration::from_secs(5), Duration::from_secs(20));
        let t0 = Instant::now();
        assert!(!cache.check_and_remember("c1", "hello", t0));
        assert!(!cache.check_and_remember("c2", "hello", t0));
    }

    #[test]
    fn decision_cache_stays_alive_through_the_dedup_window_then_expires_after_blacklist_window() {
        let mut cache = DedupCache::new(Duration::from_millis(50), Duration::from_millis(10));
        let t0 = Instant::now();
        assert_eq!(cache.cached_verdict("c1", "spam", t0), None);
        cache.remember_verdict("c1", "spam", Verdict::Block, t0);

        // Still within the tier-1 window: the verdict has migrated but not
        // yet expired out of tier 2.
        let still_alive = t0 + Duration::from_millis(55);
        assert_eq!(cache.cached_verdict("c1", "spam", still_alive), Some(Verdict::Block));

        // Past dedup_window + blacklist_window from the original decision.
        let expired = t0 + Duration::from_millis(65);
        assert_eq!(cache.cached_verdict("c1", "spam", expired), None);
    }
}
