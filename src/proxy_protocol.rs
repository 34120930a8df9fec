//! PROXY protocol header emission
//!
//! When a backend enables the PROXY protocol, the proxy writes a v1 or v2
//! header on the upstream connection immediately after it is established,
//! before any forwarded bytes. Wire formats follow the HAProxy
//! proxy-protocol specification.

use std::net::{IpAddr, SocketAddr};

/// v2 signature bytes.
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2, PROXY command.
const V2_VERSION_PROXY: u8 = 0x21;

/// Address family and transport: INET/INET6 + STREAM.
const V2_TCP4: u8 = 0x11;
const V2_TCP6: u8 = 0x21;

/// Encode the header for the configured version (1 or 2). Version 0 means
/// the protocol is disabled and yields nothing.
pub fn encode(version: u8, client: SocketAddr, local: SocketAddr) -> Vec<u8> {
    match version {
        1 => encode_v1(client, local),
        2 => encode_v2(client, local),
        _ => Vec::new(),
    }
}

/// Human-readable v1 header, e.g. `PROXY TCP4 192.0.2.1 192.0.2.2 1234 443`.
pub fn encode_v1(client: SocketAddr, local: SocketAddr) -> Vec<u8> {
    let line = match (client.ip(), local.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            format!(
                "PROXY TCP4 {} {} {} {}\r\n",
                src,
                dst,
                client.port(),
                local.port()
            )
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            format!(
                "PROXY TCP6 {} {} {} {}\r\n",
                src,
                dst,
                client.port(),
                local.port()
            )
        }
        // Mixed families carry no usable endpoint pair.
        _ => "PROXY UNKNOWN\r\n".to_string(),
    };
    line.into_bytes()
}

/// Binary v2 header.
pub fn encode_v2(client: SocketAddr, local: SocketAddr) -> Vec<u8> {
    match (client.ip(), local.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut buf = Vec::with_capacity(16 + 12);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(V2_VERSION_PROXY);
            buf.push(V2_TCP4);
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&src.octets());
            buf.extend_from_slice(&dst.octets());
            buf.extend_from_slice(&client.port().to_be_bytes());
            buf.extend_from_slice(&local.port().to_be_bytes());
            buf
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut buf = Vec::with_capacity(16 + 36);
            buf.extend_from_slice(&V2_SIGNATURE);
            buf.push(V2_VERSION_PROXY);
            buf.push(V2_TCP6);
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&src.octets());
            buf.extend_from_slice(&dst.octets());
            buf.extend_from_slice(&client.port().to_be_bytes());
            buf.extend_from_slice(&local.port().to_be_bytes());
            buf
        }
        (src, dst) => {
            // Mixed families: map both into IPv6 so the upstream still sees
            // the true client address.
            let to6 = |ip: IpAddr| match ip {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            encode_v2(
                SocketAddr::new(IpAddr::V6(to6(src)), client.port()),
                SocketAddr::new(IpAddr::V6(to6(dst)), local.port()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v1_tcp4() {
        let hdr = encode(
            1,
            "192.0.2.1:51234".parse().unwrap(),
            "192.0.2.10:443".parse().unwrap(),
        );
        assert_eq!(hdr, b"PROXY TCP4 192.0.2.1 192.0.2.10 51234 443\r\n");
    }

    #[test]
    fn test_v1_tcp6() {
        let hdr = encode_v1(
            "[2001:db8::1]:1000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        assert_eq!(hdr, b"PROXY TCP6 2001:db8::1 2001:db8::2 1000 443\r\n");
    }

    #[test]
    fn test_v2_tcp4_layout() {
        let client: SocketAddr = "192.0.2.1:51234".parse().unwrap();
        let local: SocketAddr = "192.0.2.10:443".parse().unwrap();
        let hdr = encode(2, client, local);
        assert_eq!(hdr.len(), 28);
        assert_eq!(&hdr[..12], &V2_SIGNATURE);
        assert_eq!(hdr[12], 0x21);
        assert_eq!(hdr[13], 0x11);
        assert_eq!(u16::from_be_bytes([hdr[14], hdr[15]]), 12);
        assert_eq!(&hdr[16..20], &[192, 0, 2, 1]);
        assert_eq!(&hdr[20..24], &[192, 0, 2, 10]);
        assert_eq!(u16::from_be_bytes([hdr[24], hdr[25]]), 51234);
        assert_eq!(u16::from_be_bytes([hdr[26], hdr[27]]), 443);
    }

    #[test]
    fn test_v2_tcp6_layout() {
        let hdr = encode_v2(
            "[2001:db8::1]:1000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        assert_eq!(hdr.len(), 52);
        assert_eq!(hdr[13], 0x21);
        assert_eq!(u16::from_be_bytes([hdr[14], hdr[15]]), 36);
    }

    #[test]
    fn test_v2_mixed_families_mapped() {
        let hdr = encode_v2(
            "192.0.2.1:1000".parse().unwrap(),
            "[2001:db8::2]:443".parse().unwrap(),
        );
        // Mapped into the IPv6 form.
        assert_eq!(hdr.len(), 52);
        assert_eq!(hdr[13], 0x21);
        // ::ffff:192.0.2.1
        assert_eq!(&hdr[26..32], &[0xff, 0xff, 192, 0, 2, 1]);
    }

    #[test]
    fn test_disabled_version_empty() {
        let hdr = encode(
            0,
            "192.0.2.1:1000".parse().unwrap(),
            "192.0.2.2:443".parse().unwrap(),
        );
        assert!(hdr.is_empty());
    }
}
