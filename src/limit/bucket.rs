//! Token-bucket speed limiter

use super::lock;
use crate::error::DlError;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default trailing window for throughput telemetry
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Token bucket limiting one data stream to `capacity` bytes per second.
///
/// Callers invoke [`TokenBucket::acquire`] before writing each chunk. A request
/// larger than the bucket is not rejected: the caller reserves the deficit and
/// sleeps once for exactly the time the refill needs to cover it. While a
/// reservation is outstanding `last_refill` sits in the future, so the next
/// caller queues behind it instead of double-spending the same refill.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    window: Duration,
}

struct BucketState {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    /// (completion time, bytes) of recent transfers
    transfers: VecDeque<(Instant, u64)>,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        if now > self.last_refill {
            let elapsed = (now - self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.capacity).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn reset(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
        self.transfers.clear();
    }

    fn record(&mut self, now: Instant, size: u64, window: Duration) {
        self.transfers.push_back((now, size));
        self.prune(now, window);
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.transfers.front() {
            if now.duration_since(*at) > window {
                self.transfers.pop_front();
            } else {
                break;
            }
        }
    }
}

impl TokenBucket {
    /// Create a full bucket refilling at `capacity` bytes per second
    pub fn new(capacity: u64) -> Result<Self, DlError> {
        Self::with_window(capacity, DEFAULT_RATE_WINDOW)
    }

    /// Create a bucket with a custom throughput telemetry window
    pub fn with_window(capacity: u64, window: Duration) -> Result<Self, DlError> {
        validate_capacity(capacity)?;
        if window.is_zero() {
            return Err(DlError::InvalidArgument(
                "rate window must be positive".to_string(),
            ));
        }

        Ok(Self {
            state: Mutex::new(BucketState {
                capacity: capacity as f64,
                tokens: capacity as f64,
                last_refill: Instant::now(),
                transfers: VecDeque::new(),
            }),
            window,
        })
    }

    /// Wait until `size` tokens are available, then debit them
    pub async fn acquire(&self, size: u64) {
        if size == 0 {
            return;
        }

        let wait = {
            let mut state = lock(&self.state);
            let now = Instant::now();
            state.refill(now);

            let needed = size as f64;
            if state.tokens >= needed {
                state.tokens -= needed;
                state.record(now, size, self.window);
                None
            } else {
                let backlog = state.last_refill.saturating_duration_since(now);
                let deficit = Duration::from_secs_f64((needed - state.tokens) / state.capacity);
                let wait = backlog + deficit;
                state.tokens = 0.0;
                state.last_refill = now + wait;
                Some(wait)
            }
        };

        if let Some(wait) = wait {
            debug!(size, ?wait, "Token bucket throttling transfer");
            tokio::time::sleep(wait).await;
            let mut state = lock(&self.state);
            state.record(Instant::now(), size, self.window);
        } else {
            trace!(size, "Token bucket admitted transfer");
        }
    }

    /// Current fill level in tokens, after applying refill
    pub fn available(&self) -> f64 {
        let mut state = lock(&self.state);
        state.refill(Instant::now());
        state.tokens
    }

    /// Configured rate in bytes per second
    pub fn capacity(&self) -> u64 {
        lock(&self.state).capacity as u64
    }

    /// Observed throughput in bytes per second over the trailing window
    pub fn current_rate(&self) -> f64 {
        let mut state = lock(&self.state);
        let now = Instant::now();
        state.prune(now, self.window);

        let Some((first, _)) = state.transfers.front() else {
            return 0.0;
        };

        let total: u64 = state.transfers.iter().map(|(_, size)| size).sum();
        let span = now.duration_since(*first).min(self.window);
        let span = if span.is_zero() { self.window } else { span };

        total as f64 / span.as_secs_f64()
    }

    /// Refill to full and clear the transfer log
    pub fn reset(&self) {
        lock(&self.state).reset(Instant::now());
    }

    /// Change the rate at runtime. The bucket is reset to the new capacity.
    pub fn set_capacity(&self, capacity: u64) -> Result<(), DlError> {
        validate_capacity(capacity)?;
        {
            let mut state = lock(&self.state);
            state.capacity = capacity as f64;
            state.reset(Instant::now());
        }
        debug!(capacity, "Token bucket reconfigured");
        Ok(())
    }
}

fn validate_capacity(capacity: u64) -> Result<(), DlError> {
    if capacity == 0 {
        return Err(DlError::InvalidArgument(
            "token bucket capacity must be positive".to_string(),
        ));
    }
    Ok(())
}
