//! Two-reflector NAT classification.
//!
//! Queries two reflectors on different hosts through the same local socket
//! and compares the reflexive endpoints. Without CHANGE-REQUEST support on
//! the reflector this cannot separate address-restricted from
//! port-restricted cones, so a lone successful primary answer is filed as
//! port-restricted.

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{detect_local_ip, stun, NatType, SharedConnectionInfo};

/// The pure decision table over the two reflector answers.
pub fn classify(
    local_ip: Option<IpAddr>,
    primary: Option<(Ipv4Addr, u16)>,
    secondary: Option<(Ipv4Addr, u16)>,
) -> NatType {
    let Some((pub_ip, pub_port)) = primary else {
        return NatType::Unknown;
    };
    if local_ip == Some(IpAddr::V4(pub_ip)) {
        return NatType::Open;
    }
    match secondary {
        Some((ip2, port2)) if ip2 == pub_ip && port2 == pub_port => NatType::FullCone,
        Some(_) => NatType::Symmetric,
        None => NatType::PortRestricted,
    }
}

/// Run the probe and record the verdict plus the observed public endpoint
/// in the shared connection info.
pub async fn detect_nat_type(
    info: &SharedConnectionInfo,
    reflectors: &[(&str, u16)],
) -> NatType {
    let known_local = { info.lock().unwrap().local_ip };
    let local_ip = match known_local {
        Some(ip) => Some(ip),
        None => detect_local_ip().await,
    };

    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "could not bind NAT probe socket");
            return NatType::Unknown;
        }
    };

    let mut primary = None;
    let mut secondary = None;
    let mut answers = reflectors.iter();

    if let Some((host, port)) = answers.next() {
        match stun::query_reflector_on(&socket, host, *port).await {
            Ok(endpoint) => primary = Some(endpoint),
            Err(e) => warn!(host, error = %e, "primary reflector failed"),
        }
    }
    if primary.is_some() {
        if let Some((host, port)) = answers.next() {
            match stun::query_reflector_on(&socket, host, *port).await {
                Ok(endpoint) => secondary = Some(endpoint),
                Err(e) => info!(host, error = %e, "secondary reflector failed"),
            }
        }
    }

    let nat_type = classify(local_ip, primary, secondary);
    info!(%nat_type, "NAT classification complete");

    let mut conn = info.lock().unwrap();
    conn.nat_type = nat_type;
    conn.local_ip = local_ip;
    if let Some((ip, port)) = primary {
        conn.public_ip = Some(ip);
        conn.public_port = port;
        // The mapping belongs to the probe socket's port; the hole puncher
        // re-binds it to reuse the mapping.
        if let Ok(addr) = socket.local_addr() {
            conn.local_port = addr.port();
        }
    }
    conn.observed_at = Some(Instant::now());

    nat_type
}

/// Refresh the reflexive endpoint from the reflector list and record it.
pub async fn refresh_public_endpoint(
    info: &SharedConnectionInfo,
    reflectors: &[(&str, u16)],
) -> super::NatResult<(Ipv4Addr, u16)> {
    let endpoint = stun::public_endpoint(reflectors).await?;
    let mut conn = info.lock().unwrap();
    conn.public_ip = Some(endpoint.0);
    conn.public_port = endpoint.1;
    conn.observed_at = Some(Instant::now());
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUB: (Ipv4Addr, u16) = (Ipv4Addr::new(198, 51, 100, 4), 40001);

    #[test]
    fn open_when_public_matches_local() {
        let local = Some(IpAddr::V4(PUB.0));
        assert_eq!(classify(local, Some(PUB), None), NatType::Open);
    }

    #[test]
    fn full_cone_when_both_reflectors_agree() {
        let local = Some("192.168.1.10".parse().unwrap());
        assert_eq!(classify(local, Some(PUB), Some(PUB)), NatType::FullCone);
    }

    #[test]
    fn symmetric_when_mappings_differ() {
        let local = Some("192.168.1.10".parse().unwrap());
        let other_port = (PUB.0, PUB.1 + 1);
        assert_eq!(classify(local, Some(PUB), Some(other_port)), NatType::Symmetric);

        let other_ip = (Ipv4Addr::new(198, 51, 100, 5), PUB.1);
        assert_eq!(classify(local, Some(PUB), Some(other_ip)), NatType::Symmetric);
    }

    #[test]
    fn port_restricted_when_second_reflector_silent() {
        let local = Some("192.168.1.10".parse().unwrap());
        assert_eq!(classify(local, Some(PUB), None), NatType::PortRestricted);
    }

    #[test]
    fn unknown_when_primary_fails() {
        let local = Some("192.168.1.10".parse().unwrap());
        assert_eq!(classify(local, None, None), NatType::Unknown);
        assert_eq!(classify(None, None, Some(PUB)), NatType::Unknown);
    }
}
