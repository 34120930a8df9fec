//! TLS ClientHello inspection without termination
//!
//! Used by the passthrough path: the proxy peeks at the first handshake
//! record, extracts SNI and the offered ALPN protocols for routing, and then
//! forwards the untouched bytes to the upstream. Nothing is consumed from
//! the socket and no response is written.

use tokio::net::TcpStream;

/// Fields extracted from a ClientHello.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
    pub alpn: Vec<String>,
}

/// Largest ClientHello we are willing to buffer. One TLS record.
const MAX_RECORD: usize = 5 + 16384;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;

/// Total length of the first TLS record (header included), if the header is
/// available and describes a handshake record.
pub fn record_len(data: &[u8]) -> Option<usize> {
    if data.len() < 5 || data[0] != 0x16 {
        return None;
    }
    let len = u16::from_be_bytes([data[3], data[4]]) as usize;
    Some(5 + len)
}

/// Parse SNI and ALPN out of a raw ClientHello record.
pub fn parse_client_hello(data: &[u8]) -> Option<ClientHelloInfo> {
    // Record header: type (1) + version (2) + length (2); 0x16 = handshake.
    if data.len() < 5 || data[0] != 0x16 {
        return None;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let handshake = data.get(5..5 + record_len)?;

    // Handshake header: type (1) + length (3); 0x01 = ClientHello.
    if handshake.len() < 4 || handshake[0] != 0x01 {
        return None;
    }
    let client_hello = &handshake[4..];
    if client_hello.len() < 38 {
        return None;
    }

    // Version (2) + random (32).
    let mut offset = 34;

    let session_id_len = *client_hello.get(offset)? as usize;
    offset += 1 + session_id_len;

    let cipher_suites_len = read_u16(client_hello, offset)? as usize;
    offset += 2 + cipher_suites_len;

    let compression_len = *client_hello.get(offset)? as usize;
    offset += 1 + compression_len;

    let extensions_len = read_u16(client_hello, offset)? as usize;
    offset += 2;
    let extensions_end = offset.checked_add(extensions_len)?;
    if extensions_end > client_hello.len() {
        return None;
    }

    let mut info = ClientHelloInfo::default();
    while offset + 4 <= extensions_end {
        let ext_type = read_u16(client_hello, offset)?;
        let ext_len = read_u16(client_hello, offset + 2)? as usize;
        offset += 4;
        let ext = client_hello.get(offset..offset + ext_len)?;
        match ext_type {
            EXT_SERVER_NAME => info.server_name = parse_sni_extension(ext),
            EXT_ALPN => info.alpn = parse_alpn_extension(ext),
            _ => {}
        }
        offset += ext_len;
    }
    Some(info)
}

fn parse_sni_extension(ext: &[u8]) -> Option<String> {
    // ServerNameList: list length (2), then entries of
    // type (1) + length (2) + name.
    let mut offset = 2;
    while offset + 3 <= ext.len() {
        let name_type = ext[offset];
        let name_len = read_u16(ext, offset + 1)? as usize;
        offset += 3;
        let name = ext.get(offset..offset + name_len)?;
        if name_type == 0x00 {
            return std::str::from_utf8(name).ok().map(str::to_string);
        }
        offset += name_len;
    }
    None
}

fn parse_alpn_extension(ext: &[u8]) -> Vec<String> {
    // ProtocolNameList: list length (2), then length-prefixed names.
    let mut protos = Vec::new();
    let Some(list_len) = read_u16(ext, 0) else {
        return protos;
    };
    let end = (2 + list_len as usize).min(ext.len());
    let mut offset = 2;
    while offset < end {
        let len = ext[offset] as usize;
        offset += 1;
        let Some(name) = ext.get(offset..offset + len) else {
            break;
        };
        if let Ok(p) = std::str::from_utf8(name) {
            protos.push(p.to_string());
        }
        offset += len;
    }
    protos
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let hi = *data.get(offset)?;
    let lo = *data.get(offset + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

/// Peek the ClientHello off a TCP stream without consuming it. Returns the
/// parsed fields; the stream still holds every byte for the upstream.
pub async fn peek_client_hello(stream: &TcpStream) -> std::io::Result<ClientHelloInfo> {
    let mut buf = vec![0u8; MAX_RECORD];
    let mut have = 0usize;
    loop {
        let n = stream.peek(&mut buf[..]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before ClientHello",
            ));
        }
        if n >= 5 {
            let Some(want) = record_len(&buf[..n]) else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "not a TLS handshake record",
                ));
            };
            if n >= want.min(MAX_RECORD) {
                return parse_client_hello(&buf[..n]).ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed ClientHello")
                });
            }
        }
        if n == have {
            // peek returns without waiting once any bytes are buffered;
            // back off until the rest of the record arrives. The caller's
            // handshake deadline bounds this loop.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        have = n;
    }
}
