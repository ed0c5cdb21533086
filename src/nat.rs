//! Minimal userspace NAT for tunneled packets.
//!
//! The server receives raw IPv4 packets through the tunnel and has no
//! routing table to hand them to, so it forwards the UDP payload itself:
//! parse the packet, send the payload to the destination from a local
//! socket, wait briefly for one reply datagram, and synthesize a reply
//! packet with the addresses swapped.
//!
//! Only IPv4 carrying UDP is supported. Anything else is rejected with
//! [`Error::PacketParseFailed`] and produces no reply.

use std::{net::SocketAddrV4, time::Duration};

use rand::{Rng, SeedableRng, TryRngCore, rngs::{OsRng, StdRng}};
use tokio::{
    net::UdpSocket,
    time::{Instant, timeout_at},
};
use tracing::debug;

use crate::{
    error::Error,
    specification::{DEFAULT_TTL, IPV4_MIN_HDR_LEN, PROTO_UDP, UDP_HDR_LEN},
};

/// The fields of a tunneled IPv4/UDP packet the forwarder needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedUdpPacket {
    /// Source address and port, used for the synthesized reply.
    pub src: SocketAddrV4,
    /// Destination address and port the payload is forwarded to.
    pub dst: SocketAddrV4,
    /// Time-to-live of the original packet.
    pub ttl: u8,
    /// The UDP payload.
    pub payload: Vec<u8>,
}

/// Parses a raw IPv4 packet carrying UDP.
///
/// # Errors
///
/// Returns [`Error::PacketParseFailed`] for anything that is not a
/// well-formed IPv4/UDP packet: wrong version, options present beyond the
/// buffer, non-UDP protocol, or truncated headers.
pub fn try_parse_udp(packet: &[u8]) -> Result<ParsedUdpPacket, Error> {
    if packet.len() < IPV4_MIN_HDR_LEN {
        return Err(Error::PacketParseFailed);
    }

    let version = packet[0] >> 4;
    if version != 4 {
        return Err(Error::PacketParseFailed);
    }
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HDR_LEN || packet.len() < ihl + UDP_HDR_LEN {
        return Err(Error::PacketParseFailed);
    }
    if packet[9] != PROTO_UDP {
        return Err(Error::PacketParseFailed);
    }

    let ttl = packet[8];
    let src_ip = [packet[12], packet[13], packet[14], packet[15]];
    let dst_ip = [packet[16], packet[17], packet[18], packet[19]];

    let udp = &packet[ihl..];
    let src_port = u16::from_be_bytes([udp[0], udp[1]]);
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
    if udp_len < UDP_HDR_LEN || udp.len() < udp_len {
        return Err(Error::PacketParseFailed);
    }

    Ok(ParsedUdpPacket {
        src: SocketAddrV4::new(src_ip.into(), src_port),
        dst: SocketAddrV4::new(dst_ip.into(), dst_port),
        ttl,
        payload: udp[UDP_HDR_LEN..udp_len].to_vec(),
    })
}

/// Internet checksum over an IPv4 header (ones' complement sum of 16-bit
/// words, carries folded back in).
pub(crate) fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for pair in header.chunks(2) {
        let word = u16::from_be_bytes([pair[0], *pair.get(1).unwrap_or(&0)]);
        sum += u32::from(word);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Builds a raw IPv4/UDP packet carrying `payload` back toward the original
/// sender: addresses and ports swapped relative to `request`.
///
/// The header carries no options, sets the don't-fragment flag, a random
/// identification, and the request's TTL (64 if the request said 0). The
/// UDP checksum is left at 0, which IPv4 permits.
pub fn build_udp_reply(request: &ParsedUdpPacket, payload: &[u8], rng: &mut StdRng) -> Vec<u8> {
    let total_len = IPV4_MIN_HDR_LEN + UDP_HDR_LEN + payload.len();
    let udp_len = UDP_HDR_LEN + payload.len();
    let ttl = if request.ttl == 0 { DEFAULT_TTL } else { request.ttl };

    let mut buf = Vec::with_capacity(total_len);
    buf.push(0x45); // version 4, header length 5 words
    buf.push(0); // DSCP/ECN
    buf.extend_from_slice(&(total_len as u16).to_be_bytes());
    buf.extend_from_slice(&rng.random::<u16>().to_be_bytes());
    buf.extend_from_slice(&0x4000u16.to_be_bytes()); // DF, fragment offset 0
    buf.push(ttl);
    buf.push(PROTO_UDP);
    buf.extend_from_slice(&[0, 0]); // checksum placeholder
    buf.extend_from_slice(&request.dst.ip().octets());
    buf.extend_from_slice(&request.src.ip().octets());

    let checksum = ipv4_checksum(&buf[..IPV4_MIN_HDR_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf.extend_from_slice(&request.dst.port().to_be_bytes());
    buf.extend_from_slice(&request.src.port().to_be_bytes());
    buf.extend_from_slice(&(udp_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // UDP checksum optional over IPv4
    buf.extend_from_slice(payload);
    buf
}

/// Forwards tunneled UDP payloads and synthesizes reply packets.
///
/// One forwarder per connection; it owns a single ephemeral socket, so a
/// destination's replies cannot leak into another connection.
#[derive(Debug)]
pub struct NatForwarder {
    socket: UdpSocket,
    reply_timeout: Duration,
    rng: StdRng,
}

impl NatForwarder {
    /// Binds an ephemeral local socket for forwarding.
    pub async fn bind(reply_timeout: Duration) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(Self {
            socket,
            reply_timeout,
            rng: StdRng::from_seed(seed),
        })
    }

    /// Local address of the forwarding socket.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Forwards one raw IPv4/UDP packet and returns the synthesized reply
    /// packet, or an error if the packet is unparseable or the destination
    /// stays silent.
    ///
    /// # Errors
    ///
    /// [`Error::PacketParseFailed`] for malformed input (no bytes are sent),
    /// [`Error::ReplyTimeout`] when the destination does not answer in time.
    /// Socket errors surface as `io::Error`.
    pub async fn forward(&mut self, ip_packet: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let parsed = try_parse_udp(ip_packet)?;
        debug!(src = %parsed.src, dst = %parsed.dst, len = parsed.payload.len(), "forwarding");

        self.socket.send_to(&parsed.payload, parsed.dst).await?;

        // One deadline for the whole wait: datagrams from other sources are
        // discarded but must not extend it.
        let deadline = Instant::now() + self.reply_timeout;
        let mut reply = vec![0u8; 65_535];
        let len = loop {
            let recv = timeout_at(deadline, self.socket.recv_from(&mut reply))
                .await
                .map_err(|_| Error::ReplyTimeout)?;
            let (len, from) = recv?;
            // A stale datagram from an earlier destination is not this
            // packet's reply.
            if from == std::net::SocketAddr::V4(parsed.dst) {
                break len;
            }
        };

        Ok(build_udp_reply(&parsed, &reply[..len], &mut self.rng))
    }
}
