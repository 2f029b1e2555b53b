//! L2/L3/L4 packet decode (spec.md §4.6 sniffer column; grounded on
//! `original_source/probe/sniff/sniffer.go`'s `DecodeLayers` switch).

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::icmpv6::Icmpv6Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

/// What the sniffer needs out of one frame: enough to grow the address and
/// endpoint topologies and their byte counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_port: Option<String>,
    pub dst_port: Option<String>,
    pub network_bytes: usize,
    pub transport_bytes: usize,
}

/// Decode one Ethernet frame, best-effort: unparseable or unknown layers are
/// simply absent from the result rather than an error (packets are cheap and
/// plentiful; one bad frame must not stall the sniffer).
pub fn decode_ethernet_frame(data: &[u8]) -> Decoded {
    let mut out = Decoded::default();

    let Some(eth) = EthernetPacket::new(data) else {
        return out;
    };

    match eth.get_ethertype() {
        EtherTypes::Ipv4 => decode_ipv4(eth.payload(), &mut out),
        EtherTypes::Ipv6 => decode_ipv6(eth.payload(), &mut out),
        _ => {}
    }

    out
}

fn decode_ipv4(payload: &[u8], out: &mut Decoded) {
    let Some(ip4) = Ipv4Packet::new(payload) else { return };
    out.src_ip = Some(ip4.get_source().to_string());
    out.dst_ip = Some(ip4.get_destination().to_string());
    out.network_bytes += ip4.payload().len();
    decode_transport(ip4.get_next_level_protocol(), ip4.payload(), out);
}

fn decode_ipv6(payload: &[u8], out: &mut Decoded) {
    let Some(ip6) = Ipv6Packet::new(payload) else { return };
    out.src_ip = Some(ip6.get_source().to_string());
    out.dst_ip = Some(ip6.get_destination().to_string());
    out.network_bytes += ip6.payload().len();
    decode_transport(ip6.get_next_header(), ip6.payload(), out);
}

fn decode_transport(
    proto: pnet::packet::ip::IpNextHeaderProtocol,
    payload: &[u8],
    out: &mut Decoded,
) {
    match proto {
        IpNextHeaderProtocols::Tcp => {
            if let Some(tcp) = TcpPacket::new(payload) {
                out.src_port = Some(tcp.get_source().to_string());
                out.dst_port = Some(tcp.get_destination().to_string());
                out.transport_bytes += tcp.payload().len();
            }
        }
        IpNextHeaderProtocols::Udp => {
            if let Some(udp) = UdpPacket::new(payload) {
                out.src_port = Some(udp.get_source().to_string());
                out.dst_port = Some(udp.get_destination().to_string());
                out.transport_bytes += udp.payload().len();
            }
        }
        IpNextHeaderProtocols::Icmp => {
            if let Some(icmp) = IcmpPacket::new(payload) {
                out.network_bytes += icmp.payload().len();
            }
        }
        IpNextHeaderProtocols::Icmpv6 => {
            if let Some(icmp) = Icmpv6Packet::new(payload) {
                out.network_bytes += icmp.payload().len();
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparseable_frame_yields_empty_decode() {
        let decoded = decode_ethernet_frame(&[0u8; 4]);
        assert_eq!(decoded, Decoded::default());
    }
}
