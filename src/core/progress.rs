//! Progress tracking for running transfers

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Progress snapshot for one task
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    /// Total size in bytes, when the transfer knows it
    pub total_size: Option<u64>,
    /// Bytes transferred so far
    pub downloaded_size: u64,
    /// Percentage (0.0 to 100.0), when the total is known
    pub percent: Option<f64>,
    /// Bytes per second
    pub speed: Option<f64>,
    /// Estimated time remaining
    pub eta: Option<Duration>,
    #[serde(skip)]
    start_time: Instant,
}

impl Progress {
    pub fn new(total_size: Option<u64>) -> Self {
        Self {
            total_size: total_size.filter(|total| *total > 0),
            downloaded_size: 0,
            percent: None,
            speed: None,
            eta: None,
            start_time: Instant::now(),
        }
    }

    /// Record a new byte count. `observed_rate` is the throttled stream's
    /// trailing-window rate when one is available; otherwise the average since
    /// start is used.
    pub fn update(&mut self, downloaded_size: u64, total_size: Option<u64>, observed_rate: Option<f64>) {
        self.downloaded_size = downloaded_size;
        if let Some(total) = total_size.filter(|total| *total > 0) {
            self.total_size = Some(total);
        }

        self.percent = self
            .total_size
            .map(|total| (downloaded_size as f64 / total as f64 * 100.0).min(100.0));

        let elapsed = self.start_time.elapsed();
        self.speed = match observed_rate {
            Some(rate) if rate > 0.0 => Some(rate),
            _ if !elapsed.is_zero() => Some(downloaded_size as f64 / elapsed.as_secs_f64()),
            _ => None,
        };

        self.eta = match (self.total_size, self.speed) {
            (Some(total), Some(speed)) if speed > 0.0 && total > downloaded_size => Some(
                Duration::from_secs_f64((total - downloaded_size) as f64 / speed),
            ),
            (Some(total), _) if downloaded_size >= total => Some(Duration::ZERO),
            _ => None,
        };
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.total_size, Some(total) if self.downloaded_size >= total)
    }

    pub fn speed_string(&self) -> String {
        self.speed
            .map(format_bytes_per_second)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    pub fn eta_string(&self) -> String {
        self.eta
            .map(format_duration)
            .unwrap_or_else(|| "Unknown".to_string())
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f64 = bytes as f64;
    let exp = ((bytes_f64.ln() / THRESHOLD.ln()).floor() as usize).min(UNITS.len() - 1);
    if exp == 0 {
        return format!("{} {}", bytes, UNITS[0]);
    }
    format!("{:.1} {}", bytes_f64 / THRESHOLD.powi(exp as i32), UNITS[exp])
}

/// Format bytes per second as human-readable string
pub fn format_bytes_per_second(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second as u64))
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let (hours, minutes, seconds) = (total_seconds / 3600, (total_seconds % 3600) / 60, total_seconds % 60);

    match (hours, minutes, seconds) {
        (0, 0, s) => format!("{}s", s),
        (0, m, 0) => format!("{}m", m),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, 0, _) => format!("{}h", h),
        (h, m, _) => format!("{}h {}m", h, m),
    }
}
