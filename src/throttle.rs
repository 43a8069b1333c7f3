//! Sliding-window rate limiting, per source and global.
//!
//! Two independent windows guard admission:
//! - a global one-second window capped at `max_requests_per_second`
//! - a per-source window of `window_ms` capped at `max_requests_per_source`
//!
//! A source that overruns its window is blocked for `block_duration_ms`. While
//! blocked every request is denied without touching the window. When the block
//! lapses the source starts over with an empty window.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ThrottleConfig;

const GLOBAL_WINDOW: Duration = Duration::from_secs(1);

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitReason {
    /// Source is serving a block; `retry_after` is the remaining time.
    SourceBlocked { retry_after: Duration },
    /// Source just overran its window and has been blocked.
    SourceQuotaExceeded { limit: usize },
    /// Aggregate request rate is over the global cap.
    GlobalQuotaExceeded { limit: usize },
}

impl fmt::Display for RateLimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitReason::SourceBlocked { retry_after } => {
                write!(f, "source blocked, retry after {}ms", retry_after.as_millis())
            }
            RateLimitReason::SourceQuotaExceeded { limit } => {
                write!(f, "source exceeded {} requests per window", limit)
            }
            RateLimitReason::GlobalQuotaExceeded { limit } => {
                write!(f, "global limit of {} requests per second reached", limit)
            }
        }
    }
}

#[derive(Debug, Default)]
struct SourceWindow {
    requests: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl SourceWindow {
    fn trim(&mut self, now: Instant, window: Duration) {
        while let Some(&front) = self.requests.front() {
            if now.saturating_duration_since(front) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThrottleStats {
    pub tracked_sources: usize,
    pub blocked_sources: usize,
    pub global_requests_last_second: usize,
    pub allowed: u64,
    pub denied: u64,
}

pub struct ThrottlingManager {
    config: ThrottleConfig,
    sources: DashMap<String, SourceWindow>,
    global: Mutex<VecDeque<Instant>>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

impl ThrottlingManager {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            sources: DashMap::new(),
            global: Mutex::new(VecDeque::new()),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    /// Check whether `source` may make a request right now.
    ///
    /// Overrunning the per-source window places the source in the blocked state.
    /// Does not consume quota; pair with [`record_request`](Self::record_request)
    /// or use [`try_acquire`](Self::try_acquire).
    pub fn is_allowed(&self, source: &str) -> bool {
        self.check(source, Instant::now()).is_ok()
    }

    /// Count one request from `source` against both windows.
    pub fn record_request(&self, source: &str) {
        let now = Instant::now();
        self.global.lock().push_back(now);
        self.sources
            .entry(source.to_string())
            .or_default()
            .requests
            .push_back(now);
    }

    /// Check and record in one step; the per-source entry stays locked across both.
    pub fn try_acquire(&self, source: &str) -> Result<(), RateLimitReason> {
        let now = Instant::now();
        let mut window = self.sources.entry(source.to_string()).or_default();

        let verdict = self.check_window(source, &mut window, now).and_then(|()| {
            let mut global = self.global.lock();
            trim_global(&mut global, now);
            if global.len() >= self.config.max_requests_per_second {
                return Err(RateLimitReason::GlobalQuotaExceeded {
                    limit: self.config.max_requests_per_second,
                });
            }
            global.push_back(now);
            Ok(())
        });

        match verdict {
            Ok(()) => {
                window.requests.push_back(now);
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.denied.fetch_add(1, Ordering::Relaxed);
            }
        }
        verdict
    }

    /// Drop aged-out timestamps, lapsed blocks and idle sources.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let window = self.config.window();
        let before = self.sources.len();

        self.sources.retain(|_, w| {
            if w.blocked_until.is_some_and(|until| now >= until) {
                w.blocked_until = None;
                w.requests.clear();
            }
            w.trim(now, window);
            w.blocked_until.is_some() || !w.requests.is_empty()
        });
        trim_global(&mut self.global.lock(), now);

        let removed = before.saturating_sub(self.sources.len());
        if removed > 0 {
            debug!(removed, tracked = self.sources.len(), "throttle cleanup");
        }
        removed
    }

    pub fn is_blocked(&self, source: &str) -> bool {
        let now = Instant::now();
        self.sources
            .get(source)
            .and_then(|w| w.blocked_until)
            .is_some_and(|until| now < until)
    }

    pub fn stats(&self) -> ThrottleStats {
        let now = Instant::now();
        let blocked_sources = self
            .sources
            .iter()
            .filter(|w| w.blocked_until.is_some_and(|until| now < until))
            .count();
        let global_requests_last_second = {
            let global = self.global.lock();
            global
                .iter()
                .filter(|&&at| now.saturating_duration_since(at) < GLOBAL_WINDOW)
                .count()
        };
        ThrottleStats {
            tracked_sources: self.sources.len(),
            blocked_sources,
            global_requests_last_second,
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }

    /// Background cleanup loop. Abort the handle to stop it.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let throttle = Arc::clone(self);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                throttle.cleanup();
            }
        })
    }

    fn check(&self, source: &str, now: Instant) -> Result<(), RateLimitReason> {
        {
            let mut window = self.sources.entry(source.to_string()).or_default();
            self.check_window(source, &mut window, now)?;
        }
        let mut global = self.global.lock();
        trim_global(&mut global, now);
        if global.len() >= self.config.max_requests_per_second {
            return Err(RateLimitReason::GlobalQuotaExceeded {
                limit: self.config.max_requests_per_second,
            });
        }
        Ok(())
    }

    fn check_window(
        &self,
        source: &str,
        window: &mut SourceWindow,
        now: Instant,
    ) -> Result<(), RateLimitReason> {
        if let Some(until) = window.blocked_until {
            if now < until {
                return Err(RateLimitReason::SourceBlocked {
                    retry_after: until - now,
                });
            }
            window.blocked_until = None;
            window.requests.clear();
            info!(source, "source block lifted");
        }

        window.trim(now, self.config.window());
        if window.requests.len() >= self.config.max_requests_per_source {
            window.blocked_until = Some(now + self.config.block_duration());
            warn!(
                source,
                limit = self.config.max_requests_per_source,
                block_ms = self.config.block_duration_ms,
                "source exceeded request window, blocking"
            );
            return Err(RateLimitReason::SourceQuotaExceeded {
                limit: self.config.max_requests_per_source,
            });
        }
        Ok(())
    }
}

fn trim_global(global: &mut VecDeque<Instant>, now: Instant) {
    while let Some(&front) = global.front() {
        if now.saturating_duration_since(front) >= GLOBAL_WINDOW {
            global.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(per_source: usize, global: usize, block_ms: u64) -> ThrottlingManager {
        ThrottlingManager::new(ThrottleConfig {
            max_requests_per_second: global,
            max_requests_per_source: per_source,
            window_ms: 60_000,
            block_duration_ms: block_ms,
            cleanup_interval_ms: 1_000,
        })
    }

    #[test]
    fn test_fourth_request_denied_then_allowed_after_block() {
        let t = throttle(3, 1_000, 50);

        for i in 0..3 {
            assert!(t.try_acquire("10.0.0.1").is_ok(), "call {} should pass", i + 1);
        }
        assert_eq!(
            t.try_acquire("10.0.0.1"),
            Err(RateLimitReason::SourceQuotaExceeded { limit: 3 })
        );
        assert!(t.is_blocked("10.0.0.1"));
        assert!(matches!(
            t.try_acquire("10.0.0.1"),
            Err(RateLimitReason::SourceBlocked { .. })
        ));

        std::thread::sleep(Duration::from_millis(60));
        assert!(t.try_acquire("10.0.0.1").is_ok());
        assert!(!t.is_blocked("10.0.0.1"));
    }

    #[test]
    fn test_is_allowed_and_record_request() {
        let t = throttle(2, 1_000, 1_000);
        assert!(t.is_allowed("a"));
        t.record_request("a");
        assert!(t.is_allowed("a"));
        t.record_request("a");
        assert!(!t.is_allowed("a"));
        // Blocked: denied regardless of window contents.
        assert!(!t.is_allowed("a"));
    }

    #[test]
    fn test_sources_are_independent() {
        let t = throttle(1, 1_000, 1_000);
        assert!(t.try_acquire("a").is_ok());
        assert!(t.try_acquire("a").is_err());
        assert!(t.try_acquire("b").is_ok());
    }

    #[test]
    fn test_global_limit_denies_without_blocking() {
        let t = throttle(100, 2, 1_000);
        assert!(t.try_acquire("a").is_ok());
        assert!(t.try_acquire("b").is_ok());
        assert_eq!(
            t.try_acquire("c"),
            Err(RateLimitReason::GlobalQuotaExceeded { limit: 2 })
        );
        assert!(!t.is_blocked("c"));

        let stats = t.stats();
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.global_requests_last_second, 2);
    }

    #[test]
    fn test_cleanup_drops_lapsed_blocks() {
        let t = ThrottlingManager::new(ThrottleConfig {
            max_requests_per_second: 1_000,
            max_requests_per_source: 1,
            window_ms: 20,
            block_duration_ms: 20,
            cleanup_interval_ms: 1_000,
        });
        assert!(t.try_acquire("a").is_ok());
        assert!(t.try_acquire("a").is_err());
        assert_eq!(t.stats().blocked_sources, 1);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(t.cleanup(), 1);
        assert_eq!(t.stats().tracked_sources, 0);
    }
}
