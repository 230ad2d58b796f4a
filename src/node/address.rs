use crate::node::NodeRecord;
use crate::{AddressError, AddressResult};
use std::net::{IpAddr, SocketAddr};
use url::{Host, Url};

/// Length of an uncompressed secp256k1 public key without its prefix byte
pub const PUBLIC_KEY_LEN: usize = 64;

/// Parses a self-describing peer address into a fresh `NodeRecord`
///
/// Accepted form is `enode://<hex public key>@<ip>:<port>`, optionally followed
/// by a query string (e.g. `?discport=30301`) which is ignored. Hostnames are
/// rejected: a peer endpoint must be a literal IP.
///
/// # Examples
///
/// ```
/// use peer_atlas::node::parse_address;
///
/// let key = "a".repeat(128);
/// let node = parse_address(&format!("enode://{}@10.0.0.1:30303", key)).unwrap();
/// assert_eq!(node.address.port(), 30303);
/// ```
pub fn parse_address(input: &str) -> AddressResult<NodeRecord> {
    let url = Url::parse(input.trim())
        .map_err(|e| AddressError::Parse(format!("{}: {}", input, e)))?;

    if url.scheme() != "enode" {
        return Err(AddressError::InvalidScheme(url.scheme().to_string()));
    }

    let key_hex = url.username();
    if key_hex.is_empty() {
        return Err(AddressError::MissingKey);
    }
    let public_key = hex::decode(key_hex).map_err(|e| AddressError::InvalidKey(e.to_string()))?;
    if public_key.len() != PUBLIC_KEY_LEN {
        return Err(AddressError::InvalidKey(format!(
            "expected {} bytes, got {}",
            PUBLIC_KEY_LEN,
            public_key.len()
        )));
    }

    // enode is not a special scheme, so IPv4 literals come back as opaque hosts
    let ip: IpAddr = match url.host().ok_or(AddressError::MissingHost)? {
        Host::Ipv4(ip) => IpAddr::V4(ip),
        Host::Ipv6(ip) => IpAddr::V6(ip),
        Host::Domain(domain) => domain
            .parse()
            .map_err(|_| AddressError::Parse(format!("host must be an IP literal: {}", domain)))?,
    };

    let port = url.port().ok_or(AddressError::MissingPort)?;

    Ok(NodeRecord::new(public_key, SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_hex() -> String {
        "6f04d3be3ccc7fabc1e216d6f85be945e991ee9948204e2597b29c74ca334993\
         ccf6303e9209ce52d1b73b0b7a168efb9c11284c281c75aa852b1f73895556d8"
            .to_string()
    }

    #[test]
    fn test_parse_ipv4() {
        let node = parse_address(&format!("enode://{}@94.79.55.28:30000", key_hex())).unwrap();
        assert_eq!(node.address, "94.79.55.28:30000".parse().unwrap());
        assert_eq!(node.public_key.len(), PUBLIC_KEY_LEN);
        assert_eq!(node.seq, 0);
    }

    #[test]
    fn test_parse_ignores_query() {
        let node = parse_address(&format!(
            "enode://{}@168.119.18.20:13580?discport=30303",
            key_hex()
        ))
        .unwrap();
        assert_eq!(node.address.port(), 13580);
    }

    #[test]
    fn test_parse_ipv6() {
        let node = parse_address(&format!("enode://{}@[::1]:30303", key_hex())).unwrap();
        assert!(node.address.is_ipv6());
    }

    #[test]
    fn test_url_roundtrip() {
        let input = format!("enode://{}@10.1.2.3:30303", key_hex());
        let node = parse_address(&input).unwrap();
        assert_eq!(node.to_url(), input);
        assert_eq!(parse_address(&node.to_url()).unwrap(), node);
    }

    #[test]
    fn test_invalid_scheme() {
        let result = parse_address(&format!("http://{}@10.0.0.1:30303", key_hex()));
        assert!(matches!(result, Err(AddressError::InvalidScheme(_))));
    }

    #[test]
    fn test_missing_key() {
        let result = parse_address("enode://10.0.0.1:30303");
        assert!(matches!(result, Err(AddressError::MissingKey)));
    }

    #[test]
    fn test_short_key() {
        let result = parse_address("enode://abcd@10.0.0.1:30303");
        assert!(matches!(result, Err(AddressError::InvalidKey(_))));
    }

    #[test]
    fn test_missing_port() {
        let result = parse_address(&format!("enode://{}@10.0.0.1", key_hex()));
        assert!(matches!(result, Err(AddressError::MissingPort)));
    }

    #[test]
    fn test_hostname_rejected() {
        let result = parse_address(&format!("enode://{}@example.com:30303", key_hex()));
        assert!(matches!(result, Err(AddressError::Parse(_))));
    }
}
