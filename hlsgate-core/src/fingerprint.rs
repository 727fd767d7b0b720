//! Presentation-stable fingerprint hashes used as storage-key
//! components. These are indices, not security primitives.

use md5::{Digest, Md5};
use std::net::IpAddr;
use std::str::FromStr;

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// First 8 hex chars of MD5 of the User-Agent.
pub fn ua_hash(user_agent: &str) -> String {
    md5_hex(user_agent)[..8].to_string()
}

/// First 8 hex chars of MD5 of the canonicalized IP.
pub fn ip_hash(ip: &str) -> String {
    md5_hex(&canonicalize_ip(ip))[..8].to_string()
}

/// First 12 hex chars of MD5 of the match key.
pub fn match_key_hash(match_key: &str) -> String {
    md5_hex(match_key)[..12].to_string()
}

/// Canonicalize an IP string so every syntactic spelling of the same
/// address produces the same index key. IPv6 collapses to compressed
/// form; IPv4 stays as-is; unparseable input passes through.
pub fn canonicalize_ip(ip: &str) -> String {
    match IpAddr::from_str(ip) {
        Ok(addr) => addr.to_string(),
        Err(_) => ip.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_widths() {
        assert_eq!(ua_hash("Mozilla/5.0").len(), 8);
        assert_eq!(ip_hash("10.0.0.1").len(), 8);
        assert_eq!(match_key_hash("xyz").len(), 12);
    }

    #[test]
    fn hashes_are_stable() {
        assert_eq!(ua_hash("curl/8.0"), ua_hash("curl/8.0"));
        assert_ne!(ua_hash("curl/8.0"), ua_hash("wget/1.21"));
    }

    #[test]
    fn ipv6_spellings_hash_identically() {
        // Equal ip_hash for any two representations of one address
        assert_eq!(
            ip_hash("2001:0db8:0000:0000:0000:0000:0000:0001"),
            ip_hash("2001:db8::1")
        );
        assert_eq!(ip_hash("2001:DB8::1"), ip_hash("2001:db8::1"));
    }

    #[test]
    fn canonicalize_keeps_ipv4_and_garbage() {
        assert_eq!(canonicalize_ip("192.168.1.1"), "192.168.1.1");
        assert_eq!(canonicalize_ip("unknown"), "unknown");
    }

    #[test]
    fn empty_match_key_hash_is_defined() {
        // The wildcard JS-whitelist record hashes the empty string
        assert_eq!(match_key_hash(""), &md5_hex("")[..12]);
    }
}
