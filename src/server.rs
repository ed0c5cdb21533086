//! The server side of the tunnel.
//!
//! [`serve`] accepts connections and spawns one session task per client.
//! Every session owns its own [`Reassembler`], response [`SegmentEncoder`]
//! and [`NatForwarder`]; nothing is shared across connections, so one
//! misbehaving client can neither corrupt nor observe another's stream.

use std::io::{self, ErrorKind};

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    envelope,
    nat::NatForwarder,
    pipeline::{self, SegmentEncoder},
    reassembler::Reassembler,
    shutdown::ShutdownToken,
};

/// Accepts tunnel connections until `shutdown` is signalled.
///
/// Accept failures and per-connection failures are logged; neither stops
/// the loop.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    mut shutdown: ShutdownToken,
) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        info!(%peer, "connection accepted");
        let config = config.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            match Session::start(stream, &config).await {
                Ok(session) => {
                    if let Err(e) = session.run(token).await {
                        warn!(%peer, error = %e, "session ended with error");
                    } else {
                        debug!(%peer, "session ended");
                    }
                }
                Err(e) => warn!(%peer, error = %e, "session setup failed"),
            }
        });
    }
}

/// One client's state: strictly sequential read → reassemble → forward →
/// respond.
struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    reassembler: Reassembler,
    encoder: SegmentEncoder,
    forwarder: NatForwarder,
}

impl Session {
    async fn start(stream: TcpStream, config: &Config) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            reassembler: Reassembler::new(),
            encoder: SegmentEncoder::new(config),
            forwarder: NatForwarder::bind(config.nat_reply_timeout).await?,
        })
    }

    async fn run(mut self, mut shutdown: ShutdownToken) -> io::Result<()> {
        loop {
            let body = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                body = pipeline::read_wire_frame(&mut self.reader) => match body {
                    Ok(body) => body,
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            // An undecodable envelope is this unit's problem only.
            let frame = match envelope::decode_frame(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "undecodable envelope dropped");
                    continue;
                }
            };

            for block in self.reassembler.accept(frame.segment_id, frame.payload) {
                self.handle_block(&block).await?;
            }
        }
    }

    async fn handle_block(&mut self, block: &[u8]) -> io::Result<()> {
        // The reassembled byte stream is the connection's ground truth; if
        // an in-order block does not parse, nothing later can be trusted.
        let (meta, frame) = pipeline::decode_block(block)?;

        let reply = match self.forwarder.forward(&frame.payload).await {
            Ok(reply) => reply,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::InvalidData) => {
                debug!(segment = meta.segment_index, error = %e, "no reply for packet");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // The reply goes back as one envelope: the client delivers one
        // payload per envelope and never reassembles, so chunking here
        // would hand the host fragments instead of a packet. The frame and
        // media metadata echo the request's.
        let body = self.encoder.encode_reply(frame.session_id, &meta, &reply)?;
        pipeline::write_wire_frame(&mut self.writer, &body).await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Duration;

    use rand::{SeedableRng, rngs::StdRng};
    use tokio::net::UdpSocket;

    use crate::{
        client::TunnelClient,
        nat::{self, ParsedUdpPacket},
        shutdown,
    };

    fn udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
        let mut rng = StdRng::from_seed([1u8; 32]);
        // A synthesized reply is itself a well-formed request, pre-swapped.
        let seed = ParsedUdpPacket {
            src: dst,
            dst: src,
            ttl: 64,
            payload: Vec::new(),
        };
        nat::build_udp_reply(&seed, payload, &mut rng)
    }

    #[tokio::test]
    async fn tunnel_round_trip_through_udp_echo() {
        // Upstream service the tunneled packets are destined for.
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, from) = echo.recv_from(&mut buf).await.unwrap();
                echo.send_to(&buf[..len], from).await.unwrap();
            }
        });

        let config = Config::default().with_nat_reply_timeout(Duration::from_secs(2));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let (signal, token) = shutdown::channel();
        let server = tokio::spawn(serve(listener, config.clone(), token));

        let mut client = TunnelClient::connect(server_addr, &config).await.unwrap();
        let src = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 50505);
        client
            .send_packet(udp_packet(src, echo_addr, b"hello tunnel"))
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), client.recv_packet())
            .await
            .expect("no tunneled reply")
            .unwrap();
        let parsed = nat::try_parse_udp(&reply).unwrap();
        assert_eq!(parsed.src, echo_addr);
        assert_eq!(parsed.dst, src);
        assert_eq!(parsed.payload, b"hello tunnel");

        client.shutdown().await.unwrap();
        signal.shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn large_reply_arrives_as_one_packet() {
        // The echo answer is far bigger than any fast-start chunk; the
        // reply path must not split it.
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            let (_, from) = echo.recv_from(&mut buf).await.unwrap();
            let big: Vec<u8> = (0..12_000u32).map(|i| (i % 253) as u8).collect();
            echo.send_to(&big, from).await.unwrap();
        });

        let config = Config::default().with_nat_reply_timeout(Duration::from_secs(2));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let (signal, token) = shutdown::channel();
        let server = tokio::spawn(serve(listener, config.clone(), token));

        let mut client = TunnelClient::connect(server_addr, &config).await.unwrap();
        let src = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 50507);
        client
            .send_packet(udp_packet(src, echo_addr, b"gimme"))
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), client.recv_packet())
            .await
            .expect("no tunneled reply")
            .unwrap();
        let parsed = nat::try_parse_udp(&reply).unwrap();
        assert_eq!(parsed.dst, src);
        assert_eq!(parsed.payload.len(), 12_000);
        let expected: Vec<u8> = (0..12_000u32).map(|i| (i % 253) as u8).collect();
        assert_eq!(parsed.payload, expected);

        client.shutdown().await.unwrap();
        signal.shutdown();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_envelope_does_not_kill_the_session() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = match echo.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, from) = echo.recv_from(&mut buf).await.unwrap();
                echo.send_to(&buf[..len], from).await.unwrap();
            }
        });

        let config = Config::default().with_nat_reply_timeout(Duration::from_secs(2));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let (signal, token) = shutdown::channel();
        let server = tokio::spawn(serve(listener, config.clone(), token));

        // One raw connection: a garbage body first, then valid traffic.
        // The session must drop the garbage and still answer the packet.
        let stream = tokio::net::TcpStream::connect(server_addr).await.unwrap();
        let (mut read_half, mut write_half) = stream.into_split();
        pipeline::write_wire_frame(&mut write_half, &[0xEE; 40])
            .await
            .unwrap();

        let src = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 50506);
        let packet = udp_packet(src, echo_addr, b"still alive");
        let mut encoder =
            SegmentEncoder::with_config_and_rng(&config, StdRng::from_seed([7u8; 32]));
        for body in encoder.encode_packet(&packet).unwrap() {
            pipeline::write_wire_frame(&mut write_half, &body)
                .await
                .unwrap();
        }

        let body = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline::read_wire_frame(&mut read_half),
        )
        .await
        .expect("no response after garbage")
        .unwrap();
        let (_, reply) = pipeline::decode_to_payload(&body).unwrap();
        let parsed = nat::try_parse_udp(&reply).unwrap();
        assert_eq!(parsed.payload, b"still alive");

        signal.shutdown();
        server.await.unwrap().unwrap();
    }
}
