//! Command line argument parsing

use crate::core::config::OrchestratorConfig;
use crate::core::task::Priority;
use crate::error::DlError;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// dlcore - download several URLs at once with priorities and bandwidth limits
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// URLs to download
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,

    /// Output directory
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    pub output: PathBuf,

    /// Maximum number of simultaneous downloads
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Per-download rate limit (e.g., 2MiB/s, 500KiB/s)
    #[arg(long, value_name = "RATE")]
    pub rate_limit: Option<String>,

    /// Priority for the given URLs (highest, normal, background or 0-2)
    #[arg(short, long, value_name = "PRIORITY", value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// JSON configuration file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// HTTP timeout (e.g., 30s, 1m)
    #[arg(long, value_name = "DURATION", default_value = "30s")]
    pub timeout: humantime::Duration,

    /// HTTP retries for transient errors
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Print the final summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet output (only errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

fn parse_priority(raw: &str) -> Result<Priority, String> {
    raw.parse::<Priority>().map_err(|e| e.to_string())
}

impl Args {
    /// Get HTTP timeout as Duration
    pub fn timeout_duration(&self) -> Duration {
        self.timeout.into()
    }

    /// Parse the rate limit flag to bytes per second
    pub fn parse_rate_limit(&self) -> Result<Option<u64>, DlError> {
        match &self.rate_limit {
            None => Ok(None),
            Some(rate) => parse_rate_limit(rate)
                .map(Some)
                .ok_or_else(|| DlError::InvalidArgument(format!("invalid rate limit: {}", rate))),
        }
    }

    /// Get output verbosity level
    pub fn verbosity_level(&self) -> VerbosityLevel {
        if self.quiet {
            VerbosityLevel::Quiet
        } else if self.verbose {
            VerbosityLevel::Verbose
        } else {
            VerbosityLevel::Normal
        }
    }

    /// Orchestrator configuration: the config file (or defaults) with
    /// command line overrides applied
    pub fn build_config(&self) -> Result<OrchestratorConfig, DlError> {
        let mut config = match &self.config {
            Some(path) => OrchestratorConfig::from_json_file(path)?,
            None => OrchestratorConfig::default(),
        };

        if let Some(concurrency) = self.concurrency {
            config = config.with_max_concurrent(concurrency);
        }
        if let Some(rate) = self.parse_rate_limit()? {
            config = config.with_speed_limit(rate);
        }
        if let Some(priority) = self.priority {
            config = config.with_default_priority(priority);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Output verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbosityLevel {
    /// Quiet (only errors)
    Quiet,
    Normal,
    /// Verbose (debug info)
    Verbose,
}

/// Parse rate limit string to bytes per second
pub fn parse_rate_limit(rate: &str) -> Option<u64> {
    let rate = rate.trim().to_uppercase();
    let rate = rate.trim_end_matches("/S");

    let number_end = rate
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
        .map(|(i, c)| i + c.len_utf8())
        .last()?;

    let number: f64 = rate[..number_end].parse().ok()?;
    if number <= 0.0 {
        return None;
    }

    let multiplier: u64 = match rate[number_end..].trim() {
        "B" | "" => 1,
        "K" | "KB" => 1000,
        "KIB" => 1024,
        "M" | "MB" => 1000 * 1000,
        "MIB" => 1024 * 1024,
        "G" | "GB" => 1000 * 1000 * 1000,
        "GIB" => 1024 * 1024 * 1024,
        _ => return None,
    };

    let bytes = (number * multiplier as f64) as u64;
    (bytes > 0).then_some(bytes)
}
