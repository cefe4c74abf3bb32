//! Safe filename generation utilities

use std::path::{Path, PathBuf};
use url::Url;

fn is_invalid_char(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
}

/// Convert a name to a safe filename by replacing invalid characters
pub fn to_safe_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if is_invalid_char(c) { '_' } else { c })
        .collect();

    let mut safe = replaced
        .trim_matches(|c: char| c == '.' || c == ' ')
        .to_string();

    // Windows has a 255 char limit, be conservative
    if safe.len() > 200 {
        let mut cut = 200;
        while !safe.is_char_boundary(cut) {
            cut -= 1;
        }
        safe.truncate(cut);
        safe = safe.trim_end().to_string();
    }

    if safe.is_empty() {
        safe = "download".to_string();
    }
    safe
}

/// Derive a local filename from the last path segment of a URL
pub fn filename_from_url(url: &str) -> String {
    let segment = Url::parse(url).ok().and_then(|parsed| {
        parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|s| !s.is_empty())
            .or_else(|| parsed.host_str().map(str::to_string))
    });

    to_safe_filename(segment.as_deref().unwrap_or_default())
}

/// Generate a unique path by appending a number if the file already exists
pub fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let ext = path.extension().and_then(|s| s.to_str());

    let mut counter = 1;
    loop {
        let name = match ext {
            Some(ext) => format!("{} ({}).{}", stem, counter, ext),
            None => format!("{} ({})", stem, counter),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}
