//! Sliding-window request limiter keyed by origin (platform)

use super::lock;
use crate::error::DlError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Request budget for one origin: at most `max_requests` per `window_secs`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginRule {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl OriginRule {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub(crate) fn validate(&self, origin: &str) -> Result<(), DlError> {
        if self.max_requests == 0 || self.window_secs == 0 {
            return Err(DlError::InvalidArgument(format!(
                "origin rule for {} must allow at least one request per non-empty window",
                origin
            )));
        }
        Ok(())
    }
}

struct OriginWindow {
    rule: OriginRule,
    requests: Mutex<VecDeque<Instant>>,
}

impl OriginWindow {
    /// Number of recorded requests still inside the window, counted from the back
    fn live(requests: &VecDeque<Instant>, now: Instant, window: Duration) -> usize {
        requests
            .iter()
            .rev()
            .take_while(|at| now.duration_since(**at) < window)
            .count()
    }
}

/// Per-origin sliding-window limiter.
///
/// The set of origins is fixed at construction, so the map itself is never
/// locked; each origin's request log has its own mutex.
pub struct OriginLimiter {
    origins: HashMap<String, OriginWindow>,
}

impl OriginLimiter {
    /// Build a limiter from `(origin, rule)` pairs
    pub fn new<I, K>(rules: I) -> Result<Self, DlError>
    where
        I: IntoIterator<Item = (K, OriginRule)>,
        K: Into<String>,
    {
        let mut origins = HashMap::new();
        for (origin, rule) in rules {
            let origin = origin.into();
            rule.validate(&origin)?;
            origins.insert(
                origin,
                OriginWindow {
                    rule,
                    requests: Mutex::new(VecDeque::new()),
                },
            );
        }
        Ok(Self { origins })
    }

    fn window_for(&self, origin: &str) -> Result<&OriginWindow, DlError> {
        self.origins.get(origin).ok_or_else(|| {
            DlError::Configuration(format!("no rate-limit rule registered for origin '{}'", origin))
        })
    }

    /// Whether a rule exists for `origin`
    pub fn has_rule(&self, origin: &str) -> bool {
        self.origins.contains_key(origin)
    }

    pub fn rule(&self, origin: &str) -> Option<OriginRule> {
        self.origins.get(origin).map(|w| w.rule)
    }

    /// Registered origin keys
    pub fn origins(&self) -> impl Iterator<Item = &str> {
        self.origins.keys().map(String::as_str)
    }

    /// Check whether a request to `origin` is allowed now, recording it if so
    pub fn check(&self, origin: &str) -> Result<bool, DlError> {
        let entry = self.window_for(origin)?;
        let window = entry.rule.window();
        let max = entry.rule.max_requests as usize;

        let mut requests = lock(&entry.requests);
        let now = Instant::now();
        while let Some(oldest) = requests.front() {
            if now.duration_since(*oldest) >= window {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() >= max {
            warn!(
                origin,
                current = requests.len(),
                max,
                window_secs = entry.rule.window_secs,
                "Origin request budget exhausted"
            );
            return Ok(false);
        }

        requests.push_back(now);
        debug!(
            origin,
            current = requests.len(),
            max,
            "Origin request recorded"
        );
        Ok(true)
    }

    /// Time until a request to `origin` would be allowed (zero if under the limit)
    pub fn wait_time(&self, origin: &str) -> Result<Duration, DlError> {
        let entry = self.window_for(origin)?;
        let window = entry.rule.window();
        let max = entry.rule.max_requests as usize;

        let requests = lock(&entry.requests);
        let now = Instant::now();
        let live = OriginWindow::live(&requests, now, window);
        if live < max {
            return Ok(Duration::ZERO);
        }

        // A slot frees once `live - max + 1` of the live requests have aged out
        let expired = requests.len() - live;
        let gating = requests[expired + (live - max)];
        Ok(window.saturating_sub(now.duration_since(gating)))
    }

    /// Wait until a request to `origin` is allowed, then record it
    pub async fn acquire(&self, origin: &str) -> Result<(), DlError> {
        loop {
            if self.check(origin)? {
                return Ok(());
            }
            let wait = self.wait_time(origin)?.max(Duration::from_millis(1));
            debug!(origin, ?wait, "Waiting for origin request budget");
            tokio::time::sleep(wait).await;
        }
    }

    /// Clear recorded requests for one origin, or every origin when `None`
    pub fn reset(&self, origin: Option<&str>) -> Result<(), DlError> {
        match origin {
            Some(origin) => lock(&self.window_for(origin)?.requests).clear(),
            None => {
                for entry in self.origins.values() {
                    lock(&entry.requests).clear();
                }
            }
        }
        Ok(())
    }

    /// Number of requests currently counted against `origin`
    pub fn in_window(&self, origin: &str) -> Result<usize, DlError> {
        let entry = self.window_for(origin)?;
        let requests = lock(&entry.requests);
        Ok(OriginWindow::live(&requests, Instant::now(), entry.rule.window()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter() -> OriginLimiter {
        OriginLimiter::new([
            ("bilibili", OriginRule::new(5, 1)),
            ("twitter", OriginRule::new(2, 10)),
        ])
        .unwrap()
    }

    #[test]
    fn test_invalid_rule_rejected() {
        assert!(matches!(
            OriginLimiter::new([("x", OriginRule::new(0, 1))]),
            Err(DlError::InvalidArgument(_))
        ));
        assert!(OriginLimiter::new([("x", OriginRule::new(1, 0))]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_admits_max_then_rejects() {
        let limiter = limiter();
        for _ in 0..5 {
            assert!(limiter.check("bilibili").unwrap());
        }
        assert!(!limiter.check("bilibili").unwrap());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(limiter.check("bilibili").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_check_is_not_recorded() {
        let limiter = limiter();
        assert!(limiter.check("twitter").unwrap());
        assert!(limiter.check("twitter").unwrap());
        assert!(!limiter.check("twitter").unwrap());
        assert!(!limiter.check("twitter").unwrap());
        assert_eq!(limiter.in_window("twitter").unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_origins_are_isolated() {
        let limiter = limiter();
        assert!(limiter.check("twitter").unwrap());
        assert!(limiter.check("twitter").unwrap());
        assert!(!limiter.check("twitter").unwrap());

        assert!(limiter.check("bilibili").unwrap());
        assert_eq!(limiter.wait_time("bilibili").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_unregistered_origin_is_configuration_error() {
        let limiter = limiter();
        assert!(matches!(
            limiter.check("youtube"),
            Err(DlError::Configuration(msg)) if msg.contains("youtube")
        ));
        assert!(matches!(
            limiter.wait_time("youtube"),
            Err(DlError::Configuration(_))
        ));
        assert!(limiter.reset(Some("youtube")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_tracks_oldest_request() {
        let limiter = limiter();
        assert_eq!(limiter.wait_time("twitter").unwrap(), Duration::ZERO);

        limiter.check("twitter").unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        limiter.check("twitter").unwrap();

        assert_eq!(limiter.wait_time("twitter").unwrap(), Duration::from_secs(7));
        // informational only
        assert_eq!(limiter.in_window("twitter").unwrap(), 2);

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(limiter.wait_time("twitter").unwrap(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_single_and_all() {
        let limiter = limiter();
        limiter.check("twitter").unwrap();
        limiter.check("twitter").unwrap();
        limiter.check("bilibili").unwrap();

        limiter.reset(Some("twitter")).unwrap();
        assert_eq!(limiter.in_window("twitter").unwrap(), 0);
        assert_eq!(limiter.in_window("bilibili").unwrap(), 1);

        limiter.reset(None).unwrap();
        assert_eq!(limiter.in_window("bilibili").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_window() {
        let limiter = limiter();
        limiter.acquire("twitter").await.unwrap();
        limiter.acquire("twitter").await.unwrap();

        let start = Instant::now();
        limiter.acquire("twitter").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_checks_never_oversubscribe() {
        let limiter = Arc::new(limiter());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.check("bilibili").unwrap() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_rule_accessors() {
        let limiter = limiter();
        assert!(limiter.has_rule("twitter"));
        assert!(!limiter.has_rule("youtube"));
        assert_eq!(limiter.rule("bilibili"), Some(OriginRule::new(5, 1)));
        assert_eq!(limiter.origins().count(), 2);
    }
}
