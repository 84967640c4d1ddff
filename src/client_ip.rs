//! Client-IP extraction (`spec.md` §1 "referenced at their interface only").
//!
//! Trusts `X-Forwarded-For`'s first hop when present (the conventional
//! reverse-proxy chain for a container ingestion endpoint sitting behind a
//! load balancer), falling back to the socket's peer address.

use std::net::SocketAddr;

/// Returns the first comma-separated hop of `X-Forwarded-For` if present and
/// non-empty, otherwise the bare IP of `peer`.
pub fn extract_client_ip(forwarded_for: Option<&str>, peer: Option<SocketAddr>) -> String {
    if let Some(header) = forwarded_for {
        if let Some(first) = header.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_forwarded_for_first_hop() {
        let peer: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let ip = extract_client_ip(Some("203.0.113.5, 10.0.0.1"), Some(peer));
        assert_eq!(ip, "203.0.113.5");
    }

    #[test]
    fn falls_back_to_peer_when_header_absent() {
        let peer: SocketAddr = "203.0.113.9:443".parse().unwrap();
        let ip = extract_client_ip(None, Some(peer));
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn falls_back_to_peer_when_header_empty() {
        let peer: SocketAddr = "203.0.113.9:443".parse().unwrap();
        let ip = extract_client_ip(Some(""), Some(peer));
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn empty_string_when_nothing_available() {
        assert_eq!(extract_client_ip(None, None), "");
    }
}
