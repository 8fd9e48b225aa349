//! TTL+LRU emoji store with concurrency-gated ingest and WebP normalization.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{AnimationDecoder, GenericImageView, ImageFormat};
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};
use webp::{AnimEncoder, AnimFrame, Encoder as WebpEncoder, WebPConfig};

const TTL: Duration = Duration::from_secs(600);
const MAX_ENTRIES: usize = 200;
const PER_USER_CONCURRENCY: usize = 3;
const GLOBAL_CONCURRENCY: usize = 10;
const TARGET_EDGE: u32 = 100;
const WEBP_QUALITY: f32 = 80.0;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("decoding source image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("source image has zero-sized frame")]
    EmptyFrame,
    #[error("encoding webp output")]
    Encode,
}

struct CacheEntry {
    bytes: Arc<Vec<u8>>,
    content_type: &'static str,
    expires_at: Instant,
    last_access: Instant,
}

struct UserSlot {
    semaphore: Arc<Semaphore>,
    last_used: Instant,
}

/// The bounded content-addressed store plus the ingest pipeline that fills
/// it. One instance is shared across the process.
pub struct EmojiCache {
    http: reqwest::Client,
    entries: Mutex<HashMap<String, CacheEntry>>,
    user_slots: Mutex<HashMap<String, UserSlot>>,
    global: Semaphore,
}

impl EmojiCache {
    pub fn new(http: reqwest::Client) -> Self {
        EmojiCache {
            http,
            entries: Mutex::new(HashMap::new()),
            user_slots: Mutex::new(HashMap::new()),
            global: Semaphore::new(GLOBAL_CONCURRENCY),
        }
    }

    /// Miss if absent or expired; on hit, refreshes `last_access` and
    /// extends `expires_at` by the TTL.
    pub async fn get(&self, key: &str) -> Option<(Arc<Vec<u8>>, &'static str)> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let entry = entries.get_mut(key)?;
        if entry.expires_at < now {
            entries.remove(key);
            return None;
        }
        let entry = entries.get_mut(key).expect("just checked presence above");
        entry.last_access = now;
        entry.expires_at = now + TTL;
        Some((entry.bytes.clone(), entry.content_type))
    }

    async fn set(&self, key: String, bytes: Vec<u8>, content_type: &'static str) {
        let now = Instant::now();
        self.entries.lock().await.insert(
            key,
            CacheEntry {
                bytes: Arc::new(bytes),
                content_type,
                expires_at: now + TTL,
                last_access: now,
            },
        );
    }

    async fn user_semaphore(&self, user: &str) -> Arc<Semaphore> {
        let mut slots = self.user_slots.lock().await;
        let now = Instant::now();
        let slot = slots.entry(user.to_string()).or_insert_with(|| UserSlot {
            semaphore: Arc::new(Semaphore::new(PER_USER_CONCURRENCY)),
            last_used: now,
        });
        slot.last_used = now;
        slot.semaphore.clone()
    }

    /// Acquires the global gate before the per-user gate, so one user can
    /// never starve the rest of the global budget.
    /// Downloads, decodes, normalizes to WebP, and inserts by content hash.
    pub async fn load_emoji(&self, url: &str, user: &str) -> Option<String> {
        let _global_permit = self.global.acquire().await.ok()?;
        let semaphore = self.user_semaphore(user).await;
        let _user_permit = semaphore.acquire_owned().await.ok()?;

        let response = match tokio::time::timeout(DOWNLOAD_TIMEOUT, self.http.get(url).send()).await {
            Ok(Ok(resp)) if resp.status().is_success() => resp,
            Ok(Ok(resp)) => {
                debug!(url, status = %resp.status(), "emoji download returned non-200");
                return None;
            }
            Ok(Err(e)) => {
                debug!(url, error = %e, "emoji download failed");
                return None;
            }
            Err(_) => {
                debug!(url, "emoji download timed out");
                return None;
            }
        };

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                debug!(url, error = %e, "failed to read emoji response body");
                return None;
            }
        };

        let (normalized, content_type) = match normalize(&body) {
            Ok(n) => n,
            Err(e) => {
                warn!(url, error = %e, "failed to normalize emoji image");
                return None;
            }
        };

        let key = hex_md5(&normalized);
        if self.get(&key).await.is_some() {
            return Some(key);
        }
        self.set(key.clone(), normalized, content_type).await;
        Some(key)
    }

    /// TTL eviction, then LRU eviction down to `MAX_ENTRIES`, plus lazy
    /// cleanup of per-user semaphore slots that are both unused and idle
    /// past the TTL.
    pub async fn run_maintenance_once(&self) {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock().await;
            entries.retain(|_, e| e.expires_at >= now);
            if entries.len() > MAX_ENTRIES {
                let mut by_access: Vec<(String, Instant)> =
                    entries.iter().map(|(k, v)| (k.clone(), v.last_access)).collect();
                by_access.sort_by_key(|(_, t)| *t);
                let overflow = entries.len() - MAX_ENTRIES;
                for (key, _) in by_access.into_iter().take(overflow) {
                    entries.remove(&key);
                }
            }
        }
        {
            let mut slots = self.user_slots.lock().await;
            slots.retain(|_, slot| {
                let idle = now.duration_since(slot.last_used) < TTL;
                let in_use = Arc::strong_count(&slot.semaphore) > 1;
                idle || in_use
            });
        }
    }

    /// Runs [`run_maintenance_once`] every 30 seconds until cancelled.
    pub async fn run_maintenance_loop(&self) {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            self.run_maintenance_once().await;
        }
    }
}

fn hex_md5(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn scaled_dims(w: u32, h: u32, target: u32) -> (u32, u32) {
    let longest = w.max(h);
    if longest <= target || longest == 0 {
        return (w, h);
    }
    let scale = target as f32 / longest as f32;
    (
        ((w as f32 * scale).round() as u32).max(1),
        ((h as f32 * scale).round() as u32).max(1),
    )
}

fn normalize(bytes: &[u8]) -> Result<(Vec<u8>, &'static str), NormalizeError> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Gif) => normalize_animated_gif(bytes),
        _ => normalize_static(bytes),
    }
}

fn normalize_static(bytes: &[u8]) -> Result<(Vec<u8>, &'static str), NormalizeError> {
    let img = image::load_from_memory(bytes)?;
    let (w, h) = img.dimensions();
    let (tw, th) = scaled_dims(w, h, TARGET_EDGE);
    let resized = if (tw, th) == (w, h) {
        img
    } else {
        img.resize(tw, th, FilterType::Lanczos3)
    };
    let rgba = resized.to_rgba8();
    let encoder = WebpEncoder::from_rgba(&rgba, rgba.width(), rgba.height());
    let encoded = encoder.encode(WEBP_QUALITY);
    Ok((encoded.to_vec(), "image/webp"))
}

fn normalize_animated_gif(bytes: &[u8]) -> Result<(Vec<u8>, &'static str), NormalizeError> {
    let decoder = GifDecoder::new(Cursor::new(bytes))?;
    let frames: Vec<image::Frame> = decoder.into_frames().collect_frames()?;
    let first = frames.first().ok_or(NormalizeError::EmptyFrame)?;
    let (src_w, src_h) = first.buffer().dimensions();
    let (tw, th) = scaled_dims(src_w, src_h, TARGET_EDGE);

    let config = WebPConfig::new().map_err(|_| NormalizeError::Encode)?;
    let mut encoder = AnimEncoder::new(tw, th, &config);
    // The `image` crate's GifDecoder does not expose the source's loop
    // count; emoji GIFs loop forever in practice, so 0 (infinite) matches.
    encoder.set_loop_count(0);

    let mut timestamp_ms: i32 = 0;
    let mut buffers = Vec::with_capacity(frames.len());
    for frame in &frames {
        let (numer, denom) = frame.delay().numer_denom_ms();
        let delay_ms = if denom == 0 { numer } else { numer / denom.max(1) };

        buffers.push((
            image::imageops::resize(frame.buffer(), tw, th, FilterType::Lanczos3),
            timestamp_ms,
        ));
        timestamp_ms += delay_ms as i32;
    }
    for (buffer, ts) in &buffers {
        encoder.add_frame(AnimFrame::from_rgba(buffer, tw, th, *ts));
    }

    let encoded = encoder.encode();
    Ok((encoded.to_vec(), "image/webp"))
}
