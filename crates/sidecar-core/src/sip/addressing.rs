//! Address validation

use std::net::{IpAddr, Ipv4Addr};

use once_cell::sync::Lazy;
use regex::Regex;

static DOMAIN_OR_HOSTPORT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9.-]+(:\d+)?$").unwrap());

/// True for a hostname or IPv4 address, each optionally followed by `:port`.
pub fn is_valid_domain_or_ip(input: &str) -> bool {
    DOMAIN_OR_HOSTPORT.is_match(input)
}

/// True for a syntactically valid IPv4 or IPv6 address (no port, no brackets).
pub fn is_valid_ip(input: &str) -> bool {
    !input.is_empty() && input.parse::<IpAddr>().is_ok()
}

/// True for a dotted-quad IPv4 address.
pub fn is_ipv4_literal(input: &str) -> bool {
    input.parse::<Ipv4Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_hosts_and_addresses_with_optional_port() {
        for ok in ["10.0.0.1", "10.0.0.1:5060", "sip.example.com", "sip.example.com:5080", "localhost"] {
            assert!(is_valid_domain_or_ip(ok), "{} should be valid", ok);
        }
    }

    #[test]
    fn rejects_garbage_domains() {
        for bad in ["", "sip:example.com", "exa mple.com", "host:port", "a/b", "user@host"] {
            assert!(!is_valid_domain_or_ip(bad), "{} should be invalid", bad);
        }
    }

    #[test]
    fn validates_ip_addresses() {
        for ok in ["192.168.1.1", "0.0.0.0", "255.255.255.255", "::1", "2001:db8::1", "fe80::1"] {
            assert!(is_valid_ip(ok), "{} should be valid", ok);
        }
        for bad in ["", "192.168.1", "256.1.1.1", "1.2.3.4.5", "abc", "10.0.0.1:5060", "gggg::1"] {
            assert!(!is_valid_ip(bad), "{} should be invalid", bad);
        }
    }

    #[test]
    fn ipv4_literal_excludes_hostnames() {
        assert!(is_ipv4_literal("10.1.2.3"));
        assert!(!is_ipv4_literal("sip.carrier.net"));
        assert!(!is_ipv4_literal("::1"));
    }
}
