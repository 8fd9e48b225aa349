//! Blacklist service: pattern + forbidden-sender state with hot reload.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("reading blacklist file {0:?}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("starting file watcher: {0}")]
    Watch(#[from] notify::Error),
}

/// What the pattern list decided for a piece of text. The forbidden-sender-id
/// check is a plain set lookup and is not part of this type; it is cheap
/// enough to run on every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Block,
    /// Monetary-message sender name, rewritten with each matched substring
    /// replaced by asterisks of equal length.
    RewriteSenderName(String),
}

/// An immutable, point-in-time view of the compiled ruleset. Cheap to clone
/// (an `Arc` underneath) so callers can run regex matching without holding
/// any lock.
#[derive(Debug, Default)]
pub struct BlacklistSnapshot {
    patterns: Vec<Regex>,
    forbidden_senders: HashSet<String>,
}

fn parse_lines(contents: &str) -> impl Iterator<Item = &str> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
}

impl BlacklistSnapshot {
    fn compile(pattern_lines: &str, forbidden_lines: &str) -> Self {
        let mut patterns = Vec::new();
        for line in parse_lines(pattern_lines) {
            match Regex::new(&format!("(?i){}", line)) {
                Ok(re) => patterns.push(re),
                Err(e) => warn!(pattern = line, error = %e, "skipping invalid blacklist pattern"),
            }
        }
        let forbidden_senders = parse_lines(forbidden_lines).map(str::to_string).collect();
        BlacklistSnapshot {
            patterns,
            forbidden_senders,
        }
    }

    pub fn is_forbidden(&self, sender_id: Option<&str>) -> bool {
        match sender_id {
            Some(id) => self.forbidden_senders.contains(id),
            None => false,
        }
    }

    /// Pattern-based decision for a message that already passed the
    /// forbidden-sender check.
    pub fn decide(&self, is_monetary: bool, sender_name: Option<&str>, text: Option<&str>) -> Verdict {
        if is_monetary {
            if let Some(name) = sender_name {
                if let Some(rewritten) = self.rewrite_if_matched(name) {
                    return Verdict::RewriteSenderName(rewritten);
                }
            }
        }
        if let Some(text) = text {
            if self.patterns.iter().any(|p| p.is_match(text)) {
                return Verdict::Block;
            }
        }
        Verdict::Allow
    }

    fn rewrite_if_matched(&self, sender_name: &str) -> Option<String> {
        let mut out: Option<String> = None;
        for pattern in &self.patterns {
            if pattern.is_match(out.as_deref().unwrap_or(sender_name)) {
                let base = out.clone().unwrap_or_else(|| sender_name.to_string());
                out = Some(
                    pattern
                        .replace_all(&base, |caps: &regex::Captures| "*".repeat(caps[0].chars().count()))
                        .into_owned(),
                );
            }
        }
        out
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// Loads and hot-reloads the blacklist and forbidden-sender files, exposing
/// a lock-free read path via atomic `Arc` swap.
pub struct BlacklistService {
    pattern_path: PathBuf,
    forbidden_path: PathBuf,
    snapshot: Arc<RwLock<Arc<BlacklistSnapshot>>>,
    watcher: Option<RecommendedWatcher>,
    stop: Arc<AtomicBool>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl BlacklistService {
    /// A missing file is treated as empty.
    fn read_file(path: &Path) -> Result<String, BlacklistError> {
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(path).map_err(|e| BlacklistError::Read(path.to_path_buf(), e))
    }

    pub fn load(
        pattern_path: impl Into<PathBuf>,
        forbidden_path: impl Into<PathBuf>,
    ) -> Result<Self, BlacklistError> {
        let pattern_path = pattern_path.into();
        let forbidden_path = forbidden_path.into();
        let snapshot = Self::build_snapshot(&pattern_path, &forbidden_path)?;
        Ok(BlacklistService {
            pattern_path,
            forbidden_path,
            snapshot: Arc::new(RwLock::new(Arc::new(snapshot))),
            watcher: None,
            stop: Arc::new(AtomicBool::new(false)),
            join: None,
        })
    }

    fn build_snapshot(pattern_path: &Path, forbidden_path: &Path) -> Result<BlacklistSnapshot, BlacklistError> {
        let patterns = Self::read_file(pattern_path)?;
        let forbidden = Self::read_file(forbidden_path)?;
        Ok(BlacklistSnapshot::compile(&patterns, &forbidden))
    }

    /// A cheap clone of the current compiled ruleset.
    pub fn snapshot(&self) -> Arc<BlacklistSnapshot> {
        self.snapshot.read().expect("blacklist snapshot lock poisoned").clone()
    }

    fn reload(pattern_path: &Path, forbidden_path: &Path, slot: &RwLock<Arc<BlacklistSnapshot>>) {
        match Self::build_snapshot(pattern_path, forbidden_path) {
            Ok(fresh) => {
                let patterns = fresh.pattern_count();
                let mut guard = slot.write().expect("blacklist snapshot lock poisoned");
                *guard = Arc::new(fresh);
                drop(guard);
                info!(patterns, "reloaded blacklist");
            }
            Err(e) => {
                warn!(error = %e, "failed to reload blacklist, keeping previous snapshot");
            }
        }
    }

    /// Starts watching both files' parent directories for changes, reloading
    /// the snapshot atomically whenever either file changes. Idempotent.
    pub fn watch(&mut self) -> Result<(), BlacklistError> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let pattern_path = self.pattern_path.clone();
        let forbidden_path = self.forbidden_path.clone();
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let stop_cb = self.stop.clone();
        let watched_paths: HashSet<PathBuf> = [pattern_path.clone(), forbidden_path.clone()]
            .into_iter()
            .collect();

        let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            if stop_cb.load(Ordering::Acquire) {
                return;
            }
            let event = match res {
                Ok(e) => e,
                Err(_) => return,
            };
            if !(event.kind.is_modify() || event.kind.is_create()) {
                return;
            }
            if event.paths.iter().any(|p| watched_paths.contains(p)) {
                let _ = tx.send(());
            }
        })?;

        for dir in dedup_parent_dirs(&[&self.pattern_path, &self.forbidden_path]) {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        }

        let slot = self.snapshot.clone();
        let join = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                Self::reload(&pattern_path, &forbidden_path, &slot);
            }
        });

        self.watcher = Some(watcher);
        self.join = Some(join);
        Ok(())
    }

    /// Stops the watcher and waits (with a bounded timeout) for the reload
    /// task to finish.
    pub async fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.watcher.take();
        if let Some(join) = self.join.take() {
            if tokio::time::timeout(Duration::from_secs(1), join).await.is_err() {
                warn!("blacklist watcher task did not stop within the shutdown timeout");
            }
        }
    }
}

fn dedup_parent_dirs(paths: &[&Path]) -> Vec<PathBuf> {
    let mut dirs = HashSet::new();
    for p in paths {
        let dir = p.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        dirs.insert(dir.to_path_buf());
    }
    dirs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_an_empty_ruleset() {
        let svc = BlacklistService::load("/nonexistent/patterns.txt", "/nonexistent/forbidden.txt").unwrap();
        let snap = svc.snapshot();
        assert!(!snap.is_forbidden(Some("42")));
        assert_eq!(snap.decide(false, None, Some("anything")), Verdict::Allow);
    }

    #[test]
    fn forbidden_sender_is_detected() {
        let snap = BlacklistSnapshot::compile("", "42\n# comment\n\n99\n");
        assert!(snap.is_forbidden(Some("42")));
        assert!(snap.is_forbidden(Some("99")));
        assert!(!snap.is_forbidden(Some("7")));
    }

    #[test]
    fn text_match_blocks() {
        let snap = BlacklistSnapshot::compile("spam\n", "");
        assert_eq!(snap.decide(false, None, Some("this is spam")), Verdict::Block);
        assert_eq!(snap.decide(false, None, Some("this is fine")), Verdict::Allow);
    }

    #[test]
    fn monetary_sender_name_match_rewrites_with_asterisks() {
        let snap = BlacklistSnapshot::compile("bad\n", "");
        let verdict = snap.decide(true, Some("badguy"), Some("thanks"));
        assert_eq!(verdict, Verdict::RewriteSenderName("***guy".into()));
    }

    #[test]
    fn non_monetary_sender_name_is_never_checked() {
        let snap = BlacklistSnapshot::compile("bad\n", "");
        let verdict = snap.decide(false, Some("badguy"), Some("fine text"));
        assert_eq!(verdict, Verdict::Allow);
    }

    #[test]
    fn invalid_pattern_is_skipped_not_fatal() {
        let snap = BlacklistSnapshot::compile("(unclosed\nspam\n", "");
        assert_eq!(snap.pattern_count(), 1);
        assert_eq!(snap.decide(false, None, Some("spam here")), Verdict::Block);
    }

    #[tokio::test]
    async fn reload_picks_up_file_changes() {
        let dir = std::env::temp_dir().join(format!(
            "nekocast-blacklist-test-{:?}",
            std::thread::current().id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let pattern_path = dir.join("patterns.txt");
        let forbidden_path = dir.join("forbidden.txt");
        fs::write(&pattern_path, "foo\n").unwrap();
        fs::write(&forbidden_path, "").unwrap();

        let mut svc = BlacklistService::load(&pattern_path, &forbidden_path).unwrap();
        assert_eq!(svc.snapshot().decide(false, None, Some("foo bar")), Verdict::Block);

        svc.watch().unwrap();
        fs::write(&pattern_path, "baz\n").unwrap();

        let mut seen = Verdict::Block;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            seen = svc.snapshot().decide(false, None, Some("baz qux"));
            if seen == Verdict::Block {
                break;
            }
        }
        svc.shutdown().await;
        assert_eq!(seen, Verdict::Block);

        let _ = fs::remove_dir_all(&dir);
    }
}
