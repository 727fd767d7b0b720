//! HTTP Range header parsing (RFC 7233 single-range subset).
//!
//! Accepted forms for a file of size N: `a-b` (0 <= a <= b < N),
//! `a-` (to end of file), `-k` (final k bytes). Anything else,
//! including multi-range, negatives, b >= N, or a > b, is rejected
//! and the caller answers 416 with `Content-Range: bytes */N`.

/// Parse a `Range` header value. `None` means unsatisfiable/malformed.
pub fn parse(header: &str, file_size: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    let (start_str, end_str) = (start_str.trim(), end_str.trim());

    let (start, end) = match (start_str.is_empty(), end_str.is_empty()) {
        (false, false) => (start_str.parse::<u64>().ok()?, end_str.parse::<u64>().ok()?),
        (false, true) => (start_str.parse::<u64>().ok()?, file_size.checked_sub(1)?),
        (true, false) => {
            let suffix = end_str.parse::<u64>().ok()?;
            (file_size.saturating_sub(suffix), file_size.checked_sub(1)?)
        }
        (true, true) => return None,
    };

    if end >= file_size || start > end {
        return None;
    }

    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 3_145_728;

    #[test]
    fn explicit_range() {
        // A mid-file window on a 3 MiB segment
        assert_eq!(parse("bytes=1048576-2097151", SIZE), Some((1_048_576, 2_097_151)));
        assert_eq!(parse("bytes=0-499", 1000), Some((0, 499)));
        assert_eq!(parse("bytes=999-999", 1000), Some((999, 999)));
    }

    #[test]
    fn open_ended_range() {
        assert_eq!(parse("bytes=500-", 1000), Some((500, 999)));
        assert_eq!(parse("bytes=0-", 1000), Some((0, 999)));
    }

    #[test]
    fn suffix_range() {
        assert_eq!(parse("bytes=-500", 1000), Some((500, 999)));
        // Suffix longer than the file clamps to the whole file
        assert_eq!(parse("bytes=-5000", 1000), Some((0, 999)));
    }

    #[test]
    fn content_length_matches_window() {
        let (start, end) = parse("bytes=1048576-2097151", SIZE).unwrap();
        assert_eq!(end - start + 1, 1_048_576);
    }

    #[test]
    fn rejects_out_of_bounds() {
        assert_eq!(parse("bytes=0-1000", 1000), None);
        assert_eq!(parse("bytes=1000-", 1000), None);
        assert_eq!(parse("bytes=900-500", 1000), None);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(parse("bytes=", 1000), None);
        assert_eq!(parse("bytes=-", 1000), None);
        assert_eq!(parse("bytes=abc-def", 1000), None);
        assert_eq!(parse("bytes=-12x", 1000), None);
        assert_eq!(parse("0-499", 1000), None);
        assert_eq!(parse("items=0-499", 1000), None);
    }

    #[test]
    fn rejects_multi_range() {
        assert_eq!(parse("bytes=0-1,5-6", 1000), None);
    }

    #[test]
    fn rejects_negative_start() {
        // "-5-10" splits as suffix "5-10", which is not a number
        assert_eq!(parse("bytes=-5-10", 1000), None);
    }

    #[test]
    fn empty_file_has_no_satisfiable_range() {
        assert_eq!(parse("bytes=0-0", 0), None);
        assert_eq!(parse("bytes=-1", 0), None);
        assert_eq!(parse("bytes=0-", 0), None);
    }

    #[test]
    fn zero_suffix_is_unsatisfiable() {
        assert_eq!(parse("bytes=-0", 1000), None);
    }
}
