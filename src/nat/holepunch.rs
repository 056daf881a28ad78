//! Hole-punch engine: a ladder of connection attempts against one target,
//! from a plain loopback probe up to TCP simultaneous open.
//!
//! The rungs use their own short-lived sockets; the node's main RPC socket
//! only participates by echoing `PROBE_ACK` to incoming probe datagrams.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::core::identifier::NodeInfo;

use super::{classify, socket_addr, NatResult, PunchOutcome, SharedConnectionInfo};

// Probe datagram texts. The RPC receive loop recognizes the request probes
// and answers PROBE_ACK so a prober observes a reply from the exact
// endpoint it targeted.
pub(crate) const DIRECT_CONNECT: &[u8] = b"DIRECT_CONNECT";
pub(crate) const LOCAL_CONNECT: &[u8] = b"LOCAL_CONNECT";
pub(crate) const LOCAL_CONNECT_RESPONSE: &[u8] = b"LOCAL_CONNECT_RESPONSE";
pub(crate) const STUN_CONNECT: &[u8] = b"STUN_CONNECT";
pub(crate) const HOLE_PUNCH_RESPONSE: &[u8] = b"HOLE_PUNCH_RESPONSE";
pub(crate) const HOLE_PUNCH_CONFIRM: &[u8] = b"HOLE_PUNCH_CONFIRM";
pub(crate) const PROBE_ACK: &[u8] = b"PROBE_ACK";

const PROBE_WINDOW: Duration = Duration::from_secs(2);
const ROUND_DELAY: Duration = Duration::from_millis(500);
const BURST_INTERVAL: Duration = Duration::from_millis(100);
const PUNCH_ROUNDS: usize = 5;
const PUNCH_BURST: usize = 10;

fn is_local_target(target: IpAddr, local_ip: Option<IpAddr>) -> bool {
    target.is_loopback() || Some(target) == local_ip
}

/// Work the ladder against `target`. Resolves to exactly one outcome.
pub async fn initiate(
    target: NodeInfo,
    info: SharedConnectionInfo,
    reflectors: &[(&str, u16)],
) -> PunchOutcome {
    let target_addr = socket_addr(target.ip_address, target.udp_port);
    let local_ip = info.lock().unwrap().local_ip;

    if is_local_target(target.ip_address, local_ip) {
        info!(%target_addr, "loopback target, skipping NAT traversal");
        return if attempt_local(target_addr).await {
            PunchOutcome::Connected {
                ip: target.ip_address,
                port: target.udp_port,
            }
        } else {
            PunchOutcome::Failed
        };
    }

    if attempt_direct(target_addr).await {
        info!(%target_addr, "direct probe succeeded");
        return PunchOutcome::Connected {
            ip: target.ip_address,
            port: target.udp_port,
        };
    }

    if attempt_udp_punch(target_addr, &info, reflectors).await {
        info!(%target_addr, "UDP hole punch succeeded");
        return PunchOutcome::Connected {
            ip: target.ip_address,
            port: target.udp_port,
        };
    }

    if attempt_tcp_punch(target_addr).await {
        info!(%target_addr, "TCP simultaneous open succeeded");
        return PunchOutcome::Connected {
            ip: target.ip_address,
            port: target.udp_port,
        };
    }

    warn!(%target_addr, "all hole punch rungs exhausted");
    PunchOutcome::Failed
}

/// Loopback shortcut: a short probe loop with no NAT machinery.
async fn attempt_local(target: SocketAddr) -> bool {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    let mut buf = [0u8; 1024];
    for _ in 0..PUNCH_ROUNDS {
        if socket.send_to(LOCAL_CONNECT, target).await.is_err() {
            return false;
        }
        if let Ok(Ok((_, _))) = timeout(ROUND_DELAY, socket.recv_from(&mut buf)).await {
            return true;
        }
        sleep(BURST_INTERVAL).await;
    }
    false
}

/// One probe datagram; success iff something answers from the exact
/// target endpoint within the window.
async fn attempt_direct(target: SocketAddr) -> bool {
    let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
        return false;
    };
    if socket.send_to(DIRECT_CONNECT, target).await.is_err() {
        return false;
    }
    let mut buf = [0u8; 1024];
    match timeout(PROBE_WINDOW, socket.recv_from(&mut buf)).await {
        Ok(Ok((_, from))) => from == target,
        _ => false,
    }
}

/// STUN-assisted UDP punch: advertise our reflexive endpoint in a burst of
/// datagrams, then alternate waiting and re-sending until the target's own
/// burst lands.
async fn attempt_udp_punch(
    target: SocketAddr,
    info: &SharedConnectionInfo,
    reflectors: &[(&str, u16)],
) -> bool {
    let (public_ip, public_port) = match known_public_endpoint(info, reflectors).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            debug!(error = %e, "no reflexive endpoint, skipping UDP punch");
            return false;
        }
    };

    let socket = match bind_mapped_socket(info).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "could not bind punch socket");
            return false;
        }
    };

    let announce = format!(
        "{} {}:{}",
        String::from_utf8_lossy(STUN_CONNECT),
        public_ip,
        public_port
    );
    for _ in 0..PUNCH_BURST {
        let _ = socket.send_to(announce.as_bytes(), target).await;
        sleep(BURST_INTERVAL).await;
    }

    let mut buf = [0u8; 1024];
    for _ in 0..PUNCH_ROUNDS {
        if let Ok(Ok((_, from))) = timeout(PROBE_WINDOW, socket.recv_from(&mut buf)).await {
            if from == target {
                return true;
            }
        }
        let _ = socket.send_to(announce.as_bytes(), target).await;
        sleep(ROUND_DELAY).await;
    }
    false
}

/// TCP simultaneous open: listen on an OS-assigned port while repeatedly
/// dialing the target. Either side completing within a round wins; the
/// accept side matches on address only because the target's NAT may have
/// rewritten the source port.
async fn attempt_tcp_punch(target: SocketAddr) -> bool {
    let Ok(listener) = TcpListener::bind("0.0.0.0:0").await else {
        return false;
    };

    for round in 0..PUNCH_ROUNDS {
        let deadline = sleep(PROBE_WINDOW);
        tokio::pin!(deadline);
        let connect = TcpStream::connect(target);
        tokio::pin!(connect);
        let mut dialing = true;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((_stream, peer)) if peer.ip() == target.ip() => return true,
                        Ok((_, peer)) => debug!(%peer, "ignoring inbound TCP from other host"),
                        Err(e) => debug!(error = %e, "accept failed"),
                    }
                }
                res = &mut connect, if dialing => {
                    match res {
                        Ok(_stream) => return true,
                        Err(e) => {
                            debug!(round, error = %e, "outbound TCP connect failed");
                            dialing = false;
                        }
                    }
                }
                _ = &mut deadline => break,
            }
        }
        sleep(ROUND_DELAY).await;
    }
    false
}

/// Answer an incoming hole-punch request: open our side of the NAT toward
/// the requester and hand it our reflexive endpoint.
pub async fn respond(
    requester: NodeInfo,
    info: SharedConnectionInfo,
    reflectors: &[(&str, u16)],
) {
    let requester_addr = socket_addr(requester.ip_address, requester.udp_port);
    let local_ip = info.lock().unwrap().local_ip;

    if is_local_target(requester.ip_address, local_ip) {
        let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
            return;
        };
        for _ in 0..PUNCH_ROUNDS {
            let _ = socket.send_to(LOCAL_CONNECT_RESPONSE, requester_addr).await;
            sleep(BURST_INTERVAL).await;
        }
        return;
    }

    let (public_ip, public_port) = match known_public_endpoint(&info, reflectors).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(error = %e, "cannot answer hole punch without a reflexive endpoint");
            return;
        }
    };
    let Ok(socket) = bind_mapped_socket(&info).await else {
        return;
    };

    let announce = format!(
        "{} {}:{}",
        String::from_utf8_lossy(HOLE_PUNCH_RESPONSE),
        public_ip,
        public_port
    );
    for _ in 0..PUNCH_BURST {
        let _ = socket.send_to(announce.as_bytes(), requester_addr).await;
        sleep(BURST_INTERVAL).await;
    }

    let mut buf = [0u8; 1024];
    if let Ok(Ok((_, from))) = timeout(PROBE_WINDOW, socket.recv_from(&mut buf)).await {
        if from.ip() == requester.ip_address {
            for _ in 0..3 {
                let _ = socket.send_to(HOLE_PUNCH_CONFIRM, from).await;
                sleep(BURST_INTERVAL).await;
            }
        }
    }
}

async fn known_public_endpoint(
    info: &SharedConnectionInfo,
    reflectors: &[(&str, u16)],
) -> NatResult<(Ipv4Addr, u16)> {
    let known = {
        let conn = info.lock().unwrap();
        conn.public_ip.map(|ip| (ip, conn.public_port))
    };
    match known {
        Some(endpoint) => Ok(endpoint),
        None => classify::refresh_public_endpoint(info, reflectors).await,
    }
}

/// Bind the local port whose NAT mapping we advertised, when one is known;
/// otherwise take an ephemeral port.
async fn bind_mapped_socket(info: &SharedConnectionInfo) -> std::io::Result<UdpSocket> {
    let local_port = info.lock().unwrap().local_port;
    if local_port != 0 {
        if let Ok(socket) = UdpSocket::bind(("0.0.0.0", local_port)).await {
            return Ok(socket);
        }
    }
    UdpSocket::bind("0.0.0.0:0").await
}
