//! Minimal RFC 5389 STUN client: binding requests only, enough to learn the
//! reflexive transport address from a public reflector.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::{NatError, NatResult};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112A442;

const STUN_TIMEOUT: Duration = Duration::from_secs(5);

/// Public reflectors tried in order by `public_endpoint`.
pub const DEFAULT_REFLECTORS: &[(&str, u16)] = &[
    ("stun.l.google.com", 19302),
    ("stun1.l.google.com", 19302),
    ("stun2.l.google.com", 19302),
    ("stun.ekiga.net", 3478),
    ("stun.ideasip.com", 3478),
    ("stun.schlund.de", 3478),
];

pub(crate) fn new_transaction_id() -> NatResult<[u8; 12]> {
    let mut txn = [0u8; 12];
    getrandom::getrandom(&mut txn).map_err(|e| NatError::Protocol(e.to_string()))?;
    Ok(txn)
}

/// The 20-byte binding request: type, zero length, magic cookie, 96-bit
/// transaction id. No attributes.
pub fn build_binding_request(transaction_id: &[u8; 12]) -> [u8; 20] {
    let mut request = [0u8; 20];
    request[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // bytes 2..4 stay zero: message length with no attributes
    request[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    request[8..20].copy_from_slice(transaction_id);
    request
}

/// Extract the reflexive IPv4 endpoint from a binding response.
///
/// Walks the attribute TLV stream without reading past the declared message
/// length or the buffer, and prefers XOR-MAPPED-ADDRESS over the plain
/// MAPPED-ADDRESS when both are present. Anything malformed is a protocol
/// fault and the packet is rejected as a whole.
pub fn parse_binding_response(
    data: &[u8],
    expected_txn_id: &[u8; 12],
) -> NatResult<(Ipv4Addr, u16)> {
    if data.len() < 20 {
        return Err(NatError::Protocol("response shorter than header".into()));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(NatError::Protocol(format!("unexpected message type 0x{msg_type:04x}")));
    }
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != MAGIC_COOKIE {
        return Err(NatError::Protocol("bad magic cookie".into()));
    }
    if &data[8..20] != expected_txn_id {
        return Err(NatError::Protocol("transaction id mismatch".into()));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = (20 + msg_len).min(data.len());

    let mut mapped: Option<(Ipv4Addr, u16)> = None;
    let mut xor_mapped: Option<(Ipv4Addr, u16)> = None;

    let mut pos = 20;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > end {
            break;
        }
        let attr = &data[pos..pos + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = parse_address_attr(attr, true),
            ATTR_MAPPED_ADDRESS => mapped = parse_address_attr(attr, false),
            _ => {}
        }

        // Attributes are padded to a 4-byte boundary.
        pos += (attr_len + 3) & !3;
    }

    xor_mapped
        .or(mapped)
        .ok_or_else(|| NatError::Protocol("no mapped address attribute".into()))
}

/// MAPPED-ADDRESS / XOR-MAPPED-ADDRESS value: reserved byte, family, port,
/// address. Only the IPv4 family (0x01) is accepted.
fn parse_address_attr(attr: &[u8], xor: bool) -> Option<(Ipv4Addr, u16)> {
    if attr.len() < 8 || attr[1] != 0x01 {
        return None;
    }
    let mut port = u16::from_be_bytes([attr[2], attr[3]]);
    let mut ip_bytes = [attr[4], attr[5], attr[6], attr[7]];
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        let cookie = MAGIC_COOKIE.to_be_bytes();
        for (b, c) in ip_bytes.iter_mut().zip(cookie) {
            *b ^= c;
        }
    }
    Some((Ipv4Addr::from(ip_bytes), port))
}

async fn resolve(host: &str, port: u16) -> NatResult<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| NatError::Protocol(format!("no IPv4 address for {host}")))
}

/// One binding round trip on an existing socket.
pub async fn binding_request(
    socket: &UdpSocket,
    server: SocketAddr,
) -> NatResult<(Ipv4Addr, u16)> {
    let txn = new_transaction_id()?;
    let request = build_binding_request(&txn);
    socket.send_to(&request, server).await?;
    debug!(%server, "sent STUN binding request");

    let mut buf = [0u8; 576];
    let (len, from) = timeout(STUN_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .map_err(|_| NatError::Timeout("STUN binding request"))??;
    debug!(%from, len, "received STUN response");

    parse_binding_response(&buf[..len], &txn)
}

/// Resolve and query one reflector through a transient socket.
pub async fn query_reflector(host: &str, port: u16) -> NatResult<(Ipv4Addr, u16)> {
    let server = resolve(host, port).await?;
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    binding_request(&socket, server).await
}

/// Query one reflector through the caller's socket, so consecutive queries
/// observe the same NAT mapping.
pub async fn query_reflector_on(
    socket: &UdpSocket,
    host: &str,
    port: u16,
) -> NatResult<(Ipv4Addr, u16)> {
    let server = resolve(host, port).await?;
    binding_request(socket, server).await
}

/// Walk the reflector list and return the first reflexive endpoint found.
pub async fn public_endpoint(reflectors: &[(&str, u16)]) -> NatResult<(Ipv4Addr, u16)> {
    for (host, port) in reflectors {
        match query_reflector(host, *port).await {
            Ok(endpoint) => return Ok(endpoint),
            Err(e) => debug!(host, port, error = %e, "reflector did not answer"),
        }
    }
    Err(NatError::NoReflector)
}
