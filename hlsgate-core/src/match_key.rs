//! Path key extraction.
//!
//! The match key is a single path segment used as a coarse resource
//! cluster: the segment immediately after the first `YYYY-MM-DD`
//! segment, or the basename of the parent directory when no date
//! segment exists.

use regex::Regex;
use std::sync::LazyLock;

static DATE_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date segment pattern"));

/// Extract the match key from a request path. Empty string when the
/// path has no usable segment.
pub fn extract_match_key(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    let parts: Vec<&str> = trimmed.split('/').collect();

    if let Some(idx) = parts.iter().position(|p| DATE_SEGMENT.is_match(p))
        && idx + 1 < parts.len()
    {
        return parts[idx + 1].to_string();
    }

    // Fall back to the parent directory's basename
    if parts.len() >= 2 {
        parts[parts.len() - 2].to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_after_date_wins() {
        assert_eq!(extract_match_key("video/2025-08-30/xyz/720p/index.m3u8"), "xyz");
        assert_eq!(extract_match_key("/a/2024-01-05/cluster/seg0.ts"), "cluster");
    }

    #[test]
    fn first_date_segment_is_used() {
        assert_eq!(extract_match_key("2023-12-31/one/2024-01-01/two/x.ts"), "one");
    }

    #[test]
    fn falls_back_to_parent_directory() {
        assert_eq!(extract_match_key("a/b/c.ts"), "b");
        assert_eq!(extract_match_key("/a/b/c.ts"), "b");
    }

    #[test]
    fn trailing_slash_is_ignored() {
        assert_eq!(extract_match_key("a/b/c/"), "b");
    }

    #[test]
    fn bare_filename_has_no_key() {
        assert_eq!(extract_match_key("file.ts"), "");
        assert_eq!(extract_match_key("/file.ts"), "");
        assert_eq!(extract_match_key(""), "");
    }

    #[test]
    fn date_as_last_segment_falls_back() {
        // Nothing after the date segment
        assert_eq!(extract_match_key("a/b/2025-08-30"), "b");
    }

    #[test]
    fn partial_date_does_not_match() {
        assert_eq!(extract_match_key("a/2025-08/b/c.ts"), "b");
        assert_eq!(extract_match_key("a/2025-08-301/b/c.ts"), "b");
    }
}
