//! URL utilities for mapping download URLs onto rate-limit origins

use crate::error::DlError;
use std::collections::HashMap;
use url::Url;

/// Parse and check that a URL is an http(s) URL
pub fn parse_http_url(url: &str) -> Result<Url, DlError> {
    let parsed = Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DlError::InvalidArgument(format!(
            "unsupported URL scheme '{}' in {}",
            other, url
        ))),
    }
}

/// Find the origin whose host suffixes match the URL's host.
///
/// A suffix matches the host itself or any subdomain of it, so `youtube.com`
/// matches `www.youtube.com` and `m.youtube.com` but not `notyoutube.com`.
pub fn detect_origin(url: &str, origin_hosts: &HashMap<String, Vec<String>>) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();

    let mut matches: Vec<&String> = origin_hosts
        .iter()
        .filter(|(_, suffixes)| suffixes.iter().any(|suffix| host_matches(&host, suffix)))
        .map(|(origin, _)| origin)
        .collect();

    // HashMap order is unspecified; pick deterministically if mappings overlap
    matches.sort();
    matches.first().map(|origin| origin.to_string())
}

fn host_matches(host: &str, suffix: &str) -> bool {
    let suffix = suffix.trim_start_matches('.').to_lowercase();
    host == suffix
        || host
            .strip_suffix(suffix.as_str())
            .map(|prefix| prefix.ends_with('.'))
            .unwrap_or(false)
}
