//! Minimal IP header inspection.
//!
//! The multiplexer only needs enough of a packet to key its flow: the
//! transport protocol and the source/destination endpoints. Anything
//! else (options, fragments, extension headers) is not parsed; packets
//! this code cannot key are not routable per-app and fall through to
//! the direct path.

use apptun_track::{SocketTuple, Transport};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Extract the flow tuple of an outbound raw IP packet.
pub fn parse_flow(packet: &[u8]) -> Option<SocketTuple> {
    match packet.first()? >> 4 {
        4 => parse_v4(packet),
        6 => parse_v6(packet),
        _ => None,
    }
}

fn parse_v4(packet: &[u8]) -> Option<SocketTuple> {
    let ihl = (packet.first()? & 0x0f) as usize * 4;
    if ihl < 20 || packet.len() < ihl + 4 {
        return None;
    }
    let transport = transport_of(packet[9])?;

    let src_ip = Ipv4Addr::from(<[u8; 4]>::try_from(&packet[12..16]).ok()?);
    let dst_ip = Ipv4Addr::from(<[u8; 4]>::try_from(&packet[16..20]).ok()?);
    let src_port = u16::from_be_bytes([packet[ihl], packet[ihl + 1]]);
    let dst_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);

    Some(SocketTuple::new(
        transport,
        SocketAddr::new(IpAddr::V4(src_ip), src_port),
        Some(SocketAddr::new(IpAddr::V4(dst_ip), dst_port)),
    ))
}

fn parse_v6(packet: &[u8]) -> Option<SocketTuple> {
    // Fixed header only; packets behind extension headers fall through
    // to the direct path.
    if packet.len() < 44 {
        return None;
    }
    let transport = transport_of(packet[6])?;

    let src_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?);
    let dst_ip = Ipv6Addr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?);
    let src_port = u16::from_be_bytes([packet[40], packet[41]]);
    let dst_port = u16::from_be_bytes([packet[42], packet[43]]);

    Some(SocketTuple::new(
        transport,
        SocketAddr::new(IpAddr::V6(src_ip), src_port),
        Some(SocketAddr::new(IpAddr::V6(dst_ip), dst_port)),
    ))
}

fn transport_of(proto: u8) -> Option<Transport> {
    match proto {
        PROTO_TCP => Some(Transport::Tcp),
        PROTO_UDP => Some(Transport::Udp),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn build_v4_tcp(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    build_v4(PROTO_TCP, src, dst)
}

#[cfg(test)]
pub(crate) fn build_v4_udp(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    build_v4(PROTO_UDP, src, dst)
}

#[cfg(test)]
fn build_v4(proto: u8, src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) = (src.ip(), dst.ip()) else {
        panic!("v4 builder needs v4 addresses");
    };
    let mut packet = vec![0u8; 28];
    packet[0] = 0x45;
    packet[9] = proto;
    packet[12..16].copy_from_slice(&src_ip.octets());
    packet[16..20].copy_from_slice(&dst_ip.octets());
    packet[20..22].copy_from_slice(&src.port().to_be_bytes());
    packet[22..24].copy_from_slice(&dst.port().to_be_bytes());
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_tcp_flow() {
        let packet = build_v4_tcp(
            "10.0.0.2:41000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        );
        let tuple = parse_flow(&packet).unwrap();
        assert_eq!(tuple.transport, Transport::Tcp);
        assert_eq!(tuple.local, "10.0.0.2:41000".parse().unwrap());
        assert_eq!(tuple.remote, Some("93.184.216.34:443".parse().unwrap()));
    }

    #[test]
    fn v4_udp_flow() {
        let packet = build_v4_udp(
            "10.0.0.2:5353".parse().unwrap(),
            "10.0.0.1:53".parse().unwrap(),
        );
        let tuple = parse_flow(&packet).unwrap();
        assert_eq!(tuple.transport, Transport::Udp);
        assert_eq!(tuple.local, "10.0.0.2:5353".parse().unwrap());
        assert_eq!(tuple.remote, Some("10.0.0.1:53".parse().unwrap()));
    }

    #[test]
    fn v4_options_shift_the_transport_header() {
        let mut packet = build_v4_tcp(
            "10.0.0.2:41000".parse().unwrap(),
            "1.2.3.4:80".parse().unwrap(),
        );
        // Grow the header by one 4-byte option word.
        packet[0] = 0x46;
        packet.splice(20..20, [0u8; 4]);
        let tuple = parse_flow(&packet).unwrap();
        assert_eq!(tuple.local.port(), 41000);
    }

    #[test]
    fn v6_udp_flow() {
        let mut packet = vec![0u8; 48];
        packet[0] = 0x60;
        packet[6] = PROTO_UDP;
        packet[8..24].copy_from_slice(&"2001:db8::2".parse::<Ipv6Addr>().unwrap().octets());
        packet[24..40].copy_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        packet[40..42].copy_from_slice(&5353u16.to_be_bytes());
        packet[42..44].copy_from_slice(&53u16.to_be_bytes());

        let tuple = parse_flow(&packet).unwrap();
        assert_eq!(tuple.transport, Transport::Udp);
        assert_eq!(tuple.local, "[2001:db8::2]:5353".parse().unwrap());
    }

    #[test]
    fn unroutable_packets_are_rejected() {
        assert!(parse_flow(&[]).is_none());
        assert!(parse_flow(&[0x45, 0, 0]).is_none());
        // ICMP is not per-app routable.
        let mut packet = build_v4_tcp(
            "10.0.0.2:1".parse().unwrap(),
            "10.0.0.1:2".parse().unwrap(),
        );
        packet[9] = 1;
        assert!(parse_flow(&packet).is_none());
        // Unknown IP version.
        assert!(parse_flow(&[0x70; 48]).is_none());
    }
}
