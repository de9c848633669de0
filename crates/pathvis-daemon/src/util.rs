//! IP helpers and the UTC clock.

use std::net::{IpAddr, UdpSocket};

use once_cell::sync::Lazy;

/// The address family a caller may restrict validation to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// True iff `address` parses as an IP of the requested family
/// (or either family when unspecified).
pub fn valid_ip(address: &str, version: Option<IpVersion>) -> bool {
    match address.parse::<IpAddr>() {
        Ok(ip) => match version {
            None => true,
            Some(IpVersion::V4) => ip.is_ipv4(),
            Some(IpVersion::V6) => ip.is_ipv6(),
        },
        Err(_) => false,
    }
}

/// True iff `host` is an IPv6 address.
pub fn is_ipv6(host: &str) -> bool {
    host.parse::<IpAddr>().map(|ip| ip.is_ipv6()).unwrap_or(false)
}

/// The source address the kernel picks toward a public destination.
///
/// Opens an unconnected UDP socket toward a public address and reads its
/// local binding; connect() on UDP sends no packet. Computed once — the
/// egress interface does not change while the daemon runs.
pub fn local_egress_ip() -> Option<IpAddr> {
    static LOCAL_IP: Lazy<Option<IpAddr>> = Lazy::new(|| {
        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:1").ok()?;
        socket.local_addr().ok().map(|a| a.ip())
    });
    *LOCAL_IP
}

/// Seconds since the epoch, UTC, with sub-second precision.
pub fn utc_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ip_families() {
        assert!(valid_ip("8.8.8.8", None));
        assert!(valid_ip("8.8.8.8", Some(IpVersion::V4)));
        assert!(!valid_ip("8.8.8.8", Some(IpVersion::V6)));
        assert!(valid_ip("2a04:b900::1:0:0:10", None));
        assert!(valid_ip("2a04:b900::1:0:0:10", Some(IpVersion::V6)));
        assert!(!valid_ip("2a04:b900::1:0:0:10", Some(IpVersion::V4)));
        assert!(!valid_ip("not-an-ip", None));
        assert!(!valid_ip("", None));
        assert!(!valid_ip("8.8.8.8:443", None));
    }

    #[test]
    fn ipv6_detection() {
        assert!(is_ipv6("::1"));
        assert!(!is_ipv6("127.0.0.1"));
        assert!(!is_ipv6("example.nl"));
    }

    #[test]
    fn utc_now_is_sane() {
        let now = utc_now();
        // After 2023-01-01 and before 2100.
        assert!(now > 1672531200.0);
        assert!(now < 4102444800.0);
    }
}
