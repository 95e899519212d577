use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr};

/// Leftmost entry of an X-Forwarded-For chain (`client, proxy1, proxy2`).
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

/// Parses the configured trusted proxy list; single addresses become host-sized networks.
pub fn parse_trusted_proxies(entries: &[String]) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                Ok(IpNet::from(ip))
            } else {
                entry.parse::<IpNet>().map_err(|_| {
                    anyhow!("Invalid IP address or CIDR in trusted_proxies: {}", entry)
                })
            }
        })
        .collect()
}

#[must_use]
pub fn is_trusted_proxy(proxy_ip: IpAddr, trusted: &[IpNet]) -> bool {
    trusted.iter().any(|net| net.contains(&proxy_ip))
}

/// Address of the public caller. X-Forwarded-For is honoured only when the
/// direct peer is a trusted proxy.
#[must_use]
pub fn client_ip(peer: SocketAddr, xff_header: Option<&str>, trusted: &[IpNet]) -> String {
    xff_header
        .filter(|_| is_trusted_proxy(peer.ip(), trusted))
        .and_then(parse_original_client_ip)
        .unwrap_or_else(|| peer.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 40000)
    }

    #[test]
    fn leftmost_forwarded_address_wins() {
        assert_eq!(
            parse_original_client_ip(" 203.0.113.7 , 10.0.0.1"),
            Some("203.0.113.7".to_string())
        );
        assert_eq!(parse_original_client_ip(""), None);
    }

    #[test]
    fn parses_addresses_and_networks() {
        let trusted =
            parse_trusted_proxies(&["10.0.0.0/8".to_string(), "::1".to_string()]).unwrap();
        assert!(is_trusted_proxy("10.1.2.3".parse().unwrap(), &trusted));
        assert!(is_trusted_proxy("::1".parse().unwrap(), &trusted));
        assert!(!is_trusted_proxy("192.168.0.1".parse().unwrap(), &trusted));
    }

    #[test]
    fn rejects_garbage_entries() {
        assert!(parse_trusted_proxies(&["proxy.local".to_string()]).is_err());
    }

    #[test]
    fn ignores_forwarded_header_from_untrusted_peer() {
        let trusted = parse_trusted_proxies(&["10.0.0.0/8".to_string()]).unwrap();
        assert_eq!(
            client_ip(peer("198.51.100.2"), Some("203.0.113.7"), &trusted),
            "198.51.100.2"
        );
        assert_eq!(
            client_ip(peer("10.0.0.5"), Some("203.0.113.7, 10.0.0.5"), &trusted),
            "203.0.113.7"
        );
        assert_eq!(client_ip(peer("10.0.0.5"), None, &trusted), "10.0.0.5");
    }
}
