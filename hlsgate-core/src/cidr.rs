//! IP/CIDR pattern matching and normalization.
//!
//! Normalization policy: any standalone IPv4 (and any IPv4 CIDR,
//! whatever its prefix) is widened to its /24 supernet so NAT pools
//! cluster under one pattern; IPv6 addresses become /128 and IPv6 CIDRs
//! are kept, both in canonical compressed form.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// True when `s` parses as a plain IPv4/IPv6 address.
pub fn is_ip(s: &str) -> bool {
    IpAddr::from_str(s).is_ok()
}

/// True when `s` is CIDR notation (contains a prefix and parses).
pub fn is_cidr(s: &str) -> bool {
    s.contains('/') && IpNet::from_str(s).is_ok()
}

/// True when `ip` lies inside `cidr`. Unparseable input never matches.
pub fn ip_in_cidr(ip: &str, cidr: &str) -> bool {
    match (IpAddr::from_str(ip), IpNet::from_str(cidr)) {
        (Ok(addr), Ok(net)) => net.contains(&addr),
        _ => false,
    }
}

/// Normalize an IP or CIDR to its stored pattern form.
///
/// Returns the input unchanged when it cannot be parsed; callers are
/// expected to validate with [`is_ip`] / [`is_cidr`] first.
pub fn normalize(ip_or_cidr: &str) -> String {
    if let Some((addr_part, _prefix)) = ip_or_cidr.split_once('/') {
        if let Ok(v4) = Ipv4Addr::from_str(addr_part) {
            return ipv4_slash24(v4);
        }
        if Ipv6Addr::from_str(addr_part).is_ok() {
            if let Ok(net) = Ipv6Net::from_str(ip_or_cidr) {
                return net.trunc().to_string();
            }
            return format!("{}/128", addr_part);
        }
        ip_or_cidr.to_string()
    } else {
        match IpAddr::from_str(ip_or_cidr) {
            Ok(IpAddr::V4(v4)) => ipv4_slash24(v4),
            Ok(IpAddr::V6(v6)) => format!("{}/128", v6),
            Err(_) => ip_or_cidr.to_string(),
        }
    }
}

fn ipv4_slash24(addr: Ipv4Addr) -> String {
    Ipv4Net::new(addr, 24)
        .map(|n| n.trunc().to_string())
        .unwrap_or_else(|_| addr.to_string())
}

/// Match `client_ip` against stored patterns in order.
///
/// CIDR patterns match by containment, anything else by exact string
/// equality. Returns the first matching pattern. An unparseable client
/// IP yields `(false, "")`.
pub fn match_patterns(client_ip: &str, patterns: &[String]) -> (bool, String) {
    if !is_ip(client_ip) {
        return (false, String::new());
    }

    for pattern in patterns {
        if pattern.is_empty() {
            continue;
        }
        if is_cidr(pattern) {
            if ip_in_cidr(client_ip, pattern) {
                return (true, pattern.clone());
            }
        } else if client_ip == pattern {
            return (true, pattern.clone());
        }
    }

    (false, String::new())
}

/// Up to `max` example host addresses inside `cidr`, for debug output.
pub fn examples(cidr: &str, max: usize) -> Vec<String> {
    let Ok(net) = IpNet::from_str(cidr) else {
        return vec![];
    };
    if net.prefix_len() == net.max_prefix_len() {
        return vec![net.network().to_string()];
    }
    net.hosts().take(max).map(|ip| ip.to_string()).collect()
}
