//! Dynamic manifest rewriting for key-file protection.
//!
//! Only `#EXT-X-KEY` lines mutate: their `URI` attribute gains `uid`,
//! `expires`, and a per-key `token` derived from the resolved key-file
//! path, so the player's key fetch arrives pre-authorized. Every other
//! line, `#EXT-X-MAP` included, passes through byte-identical.
//!
//! The attribute list is scanned explicitly (quoted with `"` or `'`,
//! or unquoted up to the next comma/whitespace) rather than through
//! layered regexes.

use crate::token;

/// Rewrite `#EXT-X-KEY` URIs in a manifest.
///
/// `m3u8_dir` is the manifest's directory (no trailing slash), used to
/// resolve relative key URIs into full key paths for token derivation.
pub fn rewrite_key_uris(
    content: &str,
    uid: &str,
    expires: &str,
    secret: &[u8],
    m3u8_dir: &str,
) -> String {
    if content.is_empty() {
        return String::new();
    }

    content
        .split('\n')
        .map(|line| {
            if line.starts_with("#EXT-X-KEY:") {
                rewrite_key_line(line, uid, expires, secret, m3u8_dir)
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn rewrite_key_line(line: &str, uid: &str, expires: &str, secret: &[u8], m3u8_dir: &str) -> String {
    let Some(uri_pos) = find_uri_attr(line) else {
        return line.to_string();
    };
    let value_start = uri_pos + "URI=".len();
    let rest = &line[value_start..];

    let (quote, inner, consumed) = match rest.chars().next() {
        Some(q @ ('"' | '\'')) => match rest[1..].find(q) {
            // Unterminated quote: leave the line untouched
            None => return line.to_string(),
            Some(end) => (q, &rest[1..1 + end], end + 2),
        },
        _ => {
            let end = rest
                .find(|c: char| c == ',' || c.is_whitespace())
                .unwrap_or(rest.len());
            // Unquoted URIs are re-emitted double-quoted
            ('"', &rest[..end], end)
        }
    };

    if inner.is_empty() {
        return line.to_string();
    }

    let key_path = resolve_key_path(inner, m3u8_dir);
    let key_token = token::generate(uid, &key_path, expires, secret);
    let separator = if inner.contains('?') { '&' } else { '?' };

    let mut out = String::with_capacity(line.len() + 96);
    out.push_str(&line[..uri_pos]);
    out.push_str("URI=");
    out.push(quote);
    out.push_str(inner);
    out.push(separator);
    out.push_str(&format!("uid={}&expires={}&token={}", uid, expires, key_token));
    out.push(quote);
    out.push_str(&line[value_start + consumed..]);
    out
}

/// Position of the `URI=` attribute on an attribute boundary.
fn find_uri_attr(line: &str) -> Option<usize> {
    let mut search_from = 0;
    while let Some(rel) = line[search_from..].find("URI=") {
        let pos = search_from + rel;
        if pos == 0 || matches!(line.as_bytes()[pos - 1], b':' | b',') {
            return Some(pos);
        }
        search_from = pos + 4;
    }
    None
}

/// Resolve a key URI into the key-file path the token is derived from.
pub fn resolve_key_path(uri: &str, m3u8_dir: &str) -> String {
    if let Some(rest) = uri.strip_prefix("http://").or_else(|| uri.strip_prefix("https://")) {
        // Absolute URL: its path component, without leading slash or query
        let path = rest.find('/').map(|i| &rest[i + 1..]).unwrap_or("");
        return path.split(['?', '#']).next().unwrap_or("").to_string();
    }
    if uri.starts_with('/') {
        return uri.trim_start_matches('/').to_string();
    }
    if m3u8_dir.is_empty() {
        uri.replace('\\', "/")
    } else {
        format!("{}/{}", m3u8_dir.trim_end_matches('/'), uri).replace('\\', "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"unit-test-secret";
    const EXPIRES: &str = "9999999999";

    #[test]
    fn rewrites_quoted_key_uri_with_per_key_token() {
        let manifest = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-KEY:METHOD=AES-128,URI=\"enc.key\",IV=0x00\nseg0.ts\n";
        let out = rewrite_key_uris(manifest, "315", EXPIRES, SECRET, "video/2025-08-30/xyz/720p");

        let expected_token =
            token::generate("315", "video/2025-08-30/xyz/720p/enc.key", EXPIRES, SECRET);
        let expected = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-KEY:METHOD=AES-128,URI=\"enc.key?uid=315&expires={}&token={}\",IV=0x00\nseg0.ts\n",
            EXPIRES, expected_token
        );
        assert_eq!(out, expected);
    }

    #[test]
    fn non_key_lines_are_byte_identical() {
        let manifest = "#EXTM3U\n#EXT-X-MAP:URI=\"init.mp4\"\n#EXTINF:8.0,\nseg0.ts\n#EXT-X-ENDLIST";
        let out = rewrite_key_uris(manifest, "315", EXPIRES, SECRET, "d");
        assert_eq!(out, manifest, "EXT-X-MAP and media lines must not change");
    }

    #[test]
    fn single_quoted_uri_keeps_its_quote_char() {
        let manifest = "#EXT-X-KEY:METHOD=AES-128,URI='enc.key'";
        let out = rewrite_key_uris(manifest, "1", EXPIRES, SECRET, "");
        assert!(out.starts_with("#EXT-X-KEY:METHOD=AES-128,URI='enc.key?uid=1&expires="));
        assert!(out.ends_with('\''));
    }

    #[test]
    fn unquoted_uri_is_requoted() {
        let manifest = "#EXT-X-KEY:METHOD=AES-128,URI=enc.key,IV=0xAB";
        let out = rewrite_key_uris(manifest, "1", EXPIRES, SECRET, "");
        assert!(out.contains("URI=\"enc.key?uid=1&"));
        assert!(out.ends_with(",IV=0xAB"));
    }

    #[test]
    fn existing_query_string_is_extended() {
        let manifest = "#EXT-X-KEY:METHOD=AES-128,URI=\"enc.key?v=2\"";
        let out = rewrite_key_uris(manifest, "1", EXPIRES, SECRET, "");
        assert!(out.contains("URI=\"enc.key?v=2&uid=1&"));
    }

    #[test]
    fn absolute_url_token_uses_url_path() {
        let manifest = "#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/video/a/enc.key\"";
        let out = rewrite_key_uris(manifest, "9", EXPIRES, SECRET, "ignored");
        let expected_token = token::generate("9", "video/a/enc.key", EXPIRES, SECRET);
        assert!(out.contains(&expected_token));
    }

    #[test]
    fn absolute_path_token_strips_leading_slash() {
        let manifest = "#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/enc.key\"";
        let out = rewrite_key_uris(manifest, "9", EXPIRES, SECRET, "video/d");
        let expected_token = token::generate("9", "keys/enc.key", EXPIRES, SECRET);
        assert!(out.contains(&expected_token));
    }

    #[test]
    fn every_key_line_gets_its_own_token() {
        let manifest = "#EXT-X-KEY:METHOD=AES-128,URI=\"a/enc.key\"\nseg0.ts\n#EXT-X-KEY:METHOD=AES-128,URI=\"b/enc.key\"\nseg1.ts";
        let out = rewrite_key_uris(manifest, "5", EXPIRES, SECRET, "dir");
        let token_a = token::generate("5", "dir/a/enc.key", EXPIRES, SECRET);
        let token_b = token::generate("5", "dir/b/enc.key", EXPIRES, SECRET);
        assert!(out.contains(&token_a));
        assert!(out.contains(&token_b));
        assert_ne!(token_a, token_b);
    }

    #[test]
    fn empty_content_stays_empty() {
        assert_eq!(rewrite_key_uris("", "1", EXPIRES, SECRET, ""), "");
    }

    #[test]
    fn key_line_without_uri_attribute_is_untouched() {
        let manifest = "#EXT-X-KEY:METHOD=NONE";
        assert_eq!(rewrite_key_uris(manifest, "1", EXPIRES, SECRET, ""), manifest);
    }

    #[test]
    fn resolve_key_path_forms() {
        assert_eq!(resolve_key_path("enc.key", "video/d"), "video/d/enc.key");
        assert_eq!(resolve_key_path("enc.key", ""), "enc.key");
        assert_eq!(resolve_key_path("/abs/enc.key", "video/d"), "abs/enc.key");
        assert_eq!(
            resolve_key_path("https://h.example.com/p/enc.key?x=1", "d"),
            "p/enc.key"
        );
    }
}
