//! The encode/decode chains and the loops that drive them.
//!
//! Outbound, a raw packet passes through four layers:
//!
//! ```text
//! raw packet --chunker--> chunk --framer--> mux frame
//!            --media--> media segment --envelope--> envelope body
//! ```
//!
//! Inbound mirrors the chain. Two transports carry envelope bodies:
//!
//! * the stream transport (TCP): each body prefixed with a 4-byte big-endian
//!   length, driven by [`StreamSender`]/[`StreamReceiver`];
//! * the request/response transport: one body per request through a
//!   [`SegmentTransport`], driven by [`PacedSender`]/[`PollReceiver`] with a
//!   randomized inter-send delay so the timing resembles segment downloads.

use std::io::{self, ErrorKind};
use std::time::Duration;

use rand::{
    Rng, SeedableRng, TryRngCore,
    rngs::{OsRng, StdRng},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::sleep,
};
use tracing::{debug, warn};

use crate::{
    chunker::Chunker,
    config::Config,
    envelope::{self, EnvelopeEncoder},
    error::Error,
    framer::{self, MuxFrame},
    media::{self, MediaSegmentMeta},
    shutdown::ShutdownToken,
    specification::WIRE_FRAME_MAX_LEN,
};

/// Backoff after a failed paced send before the loop tries the next unit.
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Synthesized per-segment duration band, in milliseconds. Matches the
/// segment lengths of short-form adaptive streaming.
const SEGMENT_DURATION_MS: core::ops::Range<i32> = 200..400;

/// Runs the full outbound chain for one direction of one connection.
///
/// Owns the segment counter and the running presentation timestamp, so two
/// encoders never interleave identifiers.
#[derive(Debug)]
pub struct SegmentEncoder {
    session_id: u16,
    stream_id: i32,
    next_segment: i32,
    pts_ms: i32,
    chunker: Chunker,
    envelope: EnvelopeEncoder,
    rng: StdRng,
}

impl SegmentEncoder {
    /// Creates an encoder from `config`, seeded from the system entropy
    /// source.
    pub fn new(config: &Config) -> Self {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self::with_config_and_rng(config, StdRng::from_seed(seed))
    }

    /// Creates an encoder with an explicit random source, for deterministic
    /// construction. The chunker and envelope encoder derive their own
    /// sources from it.
    pub fn with_config_and_rng(config: &Config, mut rng: StdRng) -> Self {
        let chunker = Chunker::with_bands_and_rng(
            config.chunk_bands.clone(),
            StdRng::from_seed(rng.random()),
        );
        let envelope = EnvelopeEncoder::with_padding_and_rng(
            config.padding.clone(),
            StdRng::from_seed(rng.random()),
        );
        Self {
            session_id: config.session_id,
            stream_id: config.stream_id,
            next_segment: 0,
            pts_ms: 0,
            chunker,
            envelope,
            rng,
        }
    }

    /// Encodes one raw packet into one or more envelope bodies, ready for a
    /// transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] only if the chunk bands were
    /// reconfigured wider than the frame payload limit; with validated bands
    /// every chunk fits.
    pub fn encode_packet(&mut self, raw: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        let session_id = self.session_id;
        let stream_id = self.stream_id;

        let mut bodies = Vec::new();
        let mut chunks = Vec::new();
        for chunk in self.chunker.chunkify(raw) {
            chunks.push(chunk.data);
        }
        for data in chunks {
            let framed = framer::frame(session_id, data, 0)?;

            let duration_ms = self.rng.random_range(SEGMENT_DURATION_MS);
            let meta = MediaSegmentMeta {
                stream_id,
                segment_index: self.next_segment,
                pts_ms: self.pts_ms,
                duration_ms,
            };
            let segment = media::encode(&meta, &framed);
            bodies.push(self.envelope.encode(self.next_segment, &segment));

            self.next_segment = self.next_segment.wrapping_add(1);
            self.pts_ms = self.pts_ms.wrapping_add(duration_ms);
        }
        Ok(bodies)
    }

    /// Encodes one reply packet as exactly one envelope body.
    ///
    /// Replies are never chunked: the receiving side delivers one payload
    /// per envelope, so a reply must stay whole. The mux frame echoes the
    /// request's `session_id` and the media header echoes the request's
    /// metadata; only the envelope identifier comes from this encoder's
    /// counter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] if `raw` exceeds the frame's
    /// 16-bit payload limit. A synthesized reply packet cannot, since an
    /// IPv4 total length is itself a 16-bit field.
    pub fn encode_reply(
        &mut self,
        session_id: u16,
        request: &MediaSegmentMeta,
        raw: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let framed = framer::frame(session_id, raw, 0)?;
        let segment = media::encode(request, &framed);
        let body = self.envelope.encode(self.next_segment, &segment);
        self.next_segment = self.next_segment.wrapping_add(1);
        Ok(body)
    }
}

/// Decodes one in-order block (an envelope payload released by the
/// reassembler, or taken directly from an ordered transport) down to its
/// media metadata and mux frame.
///
/// # Errors
///
/// Propagates the media and framer decode errors. On a reassembled stream
/// these indicate the byte stream itself is corrupt.
pub fn decode_block(block: &[u8]) -> Result<(MediaSegmentMeta, MuxFrame), Error> {
    let (meta, framed) = media::decode(block)?;
    let frame = framer::try_parse(&framed)?;
    Ok((meta, frame))
}

/// Runs the full inbound chain on one envelope body, for transports that
/// already deliver bodies in order.
pub fn decode_to_payload(body: &[u8]) -> Result<(MediaSegmentMeta, Vec<u8>), Error> {
    let frame = envelope::decode_frame(body)?;
    let (meta, mux) = decode_block(&frame.payload)?;
    Ok((meta, mux.payload))
}

/// Writes one envelope body with its 4-byte big-endian length prefix.
///
/// # Errors
///
/// [`Error::PayloadTooLarge`] if the body exceeds the wire frame cap;
/// otherwise I/O errors from the writer.
pub async fn write_wire_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > WIRE_FRAME_MAX_LEN {
        return Err(Error::PayloadTooLarge { len: body.len() }.into());
    }
    writer.write_all(&(body.len() as i32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    Ok(())
}

/// Reads one length-prefixed envelope body.
///
/// # Errors
///
/// [`Error::Disconnected`] when the peer closes mid-read,
/// [`Error::NegativeLength`] for a zero or negative prefix,
/// [`Error::PayloadTooLarge`] for a prefix beyond the wire frame cap;
/// otherwise I/O errors from the reader.
pub async fn read_wire_frame<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    read_exact_or_disconnected(reader, &mut prefix).await?;

    let declared = i32::from_be_bytes(prefix);
    if declared <= 0 {
        return Err(Error::NegativeLength { received: declared }.into());
    }
    if declared as usize > WIRE_FRAME_MAX_LEN {
        return Err(Error::PayloadTooLarge {
            len: declared as usize,
        }
        .into());
    }

    let mut body = vec![0u8; declared as usize];
    read_exact_or_disconnected(reader, &mut body).await?;
    Ok(body)
}

async fn read_exact_or_disconnected<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::Disconnected.into()),
        Err(e) => Err(e),
    }
}

/// Drains a packet queue into a stream transport.
///
/// Runs until the queue closes, shutdown is signalled, or a write fails.
/// Write failures are fatal for the connection; a broken stream cannot
/// carry later frames.
#[derive(Debug)]
pub struct StreamSender {
    encoder: SegmentEncoder,
    queue: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: ShutdownToken,
}

impl StreamSender {
    /// Pairs an encoder with the queue it drains.
    pub fn new(
        encoder: SegmentEncoder,
        queue: mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            encoder,
            queue,
            shutdown,
        }
    }

    /// Drives the loop until the queue closes, shutdown fires, or a write
    /// fails.
    pub async fn run<W>(mut self, mut writer: W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                packet = self.queue.recv() => match packet {
                    Some(packet) => packet,
                    None => return Ok(()),
                },
            };

            let bodies = match self.encoder.encode_packet(&packet) {
                Ok(bodies) => bodies,
                Err(e) => {
                    warn!(error = %e, len = packet.len(), "packet dropped");
                    continue;
                }
            };
            for body in bodies {
                write_wire_frame(&mut writer, &body).await?;
            }
            writer.flush().await?;
        }
    }
}

/// Reads a stream transport and delivers transported chunks to a channel.
///
/// Per-body decode failures are logged and the body dropped; wire-level
/// failures end the loop. A clean peer close (`Disconnected` at a frame
/// boundary) ends the loop without error.
#[derive(Debug)]
pub struct StreamReceiver {
    delivery: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: ShutdownToken,
}

impl StreamReceiver {
    /// Creates a receiver delivering decoded chunks to `delivery`.
    pub fn new(delivery: mpsc::UnboundedSender<Vec<u8>>, shutdown: ShutdownToken) -> Self {
        Self { delivery, shutdown }
    }

    /// Drives the loop until the peer closes, shutdown fires, or the wire
    /// fails.
    pub async fn run<R>(mut self, mut reader: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let body = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                body = read_wire_frame(&mut reader) => match body {
                    Ok(body) => body,
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                    Err(e) => return Err(e),
                },
            };

            match decode_to_payload(&body) {
                Ok((meta, payload)) => {
                    debug!(segment = meta.segment_index, len = payload.len(), "delivered");
                    if self.delivery.send(payload).is_err() {
                        return Ok(());
                    }
                }
                Err(e) => warn!(error = %e, "undecodable body dropped"),
            }
        }
    }
}

/// One leg of a request/response transport carrying envelope bodies.
///
/// `send` submits one body upstream. `poll` asks for the next downstream
/// body; a response shorter than 4 bytes means nothing is pending yet.
#[allow(async_fn_in_trait)]
pub trait SegmentTransport {
    /// Submits one envelope body upstream.
    async fn send(&mut self, body: &[u8]) -> io::Result<()>;
    /// Fetches the next downstream body, or fewer than 4 bytes if none is
    /// pending.
    async fn poll(&mut self) -> io::Result<Vec<u8>>;
}

/// Drains a packet queue into a [`SegmentTransport`], pacing sends with a
/// randomized delay so the rhythm resembles a player fetching segments.
///
/// Sends are best-effort: a failed send drops that body, backs off briefly,
/// and the loop continues with the next unit.
#[derive(Debug)]
pub struct PacedSender {
    encoder: SegmentEncoder,
    delay_ms: core::ops::Range<u64>,
    queue: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: ShutdownToken,
    rng: StdRng,
}

impl PacedSender {
    /// Pairs an encoder with the queue it drains, pacing per `config`.
    pub fn new(
        encoder: SegmentEncoder,
        config: &Config,
        queue: mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown: ShutdownToken,
    ) -> Self {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self {
            encoder,
            delay_ms: config.pacing_delay_ms.clone(),
            queue,
            shutdown,
            rng: StdRng::from_seed(seed),
        }
    }

    /// Drives the loop until the queue closes or shutdown fires.
    pub async fn run<T>(mut self, mut transport: T)
    where
        T: SegmentTransport,
    {
        loop {
            let packet = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                packet = self.queue.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            };

            let bodies = match self.encoder.encode_packet(&packet) {
                Ok(bodies) => bodies,
                Err(e) => {
                    warn!(error = %e, len = packet.len(), "packet dropped");
                    continue;
                }
            };
            for body in bodies {
                if let Err(e) = transport.send(&body).await {
                    warn!(error = %e, "send failed, body dropped");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = sleep(SEND_RETRY_BACKOFF) => {}
                    }
                    continue;
                }
                let delay = Duration::from_millis(self.rng.random_range(self.delay_ms.clone()));
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

/// Polls a [`SegmentTransport`] for downstream bodies and delivers the
/// transported chunks to a channel, idling between empty polls.
#[derive(Debug)]
pub struct PollReceiver {
    poll_idle: Duration,
    delivery: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: ShutdownToken,
}

impl PollReceiver {
    /// Creates a receiver idling per `config` between empty polls.
    pub fn new(
        config: &Config,
        delivery: mpsc::UnboundedSender<Vec<u8>>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            poll_idle: config.poll_idle,
            delivery,
            shutdown,
        }
    }

    /// Drives the loop until the delivery channel closes or shutdown fires.
    pub async fn run<T>(mut self, mut transport: T)
    where
        T: SegmentTransport,
    {
        loop {
            let body = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                body = transport.poll() => match body {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "poll failed");
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = sleep(SEND_RETRY_BACKOFF) => {}
                        }
                        continue;
                    }
                },
            };

            if body.len() < 4 {
                // Nothing pending upstream.
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = sleep(self.poll_idle) => {}
                }
                continue;
            }

            match decode_to_payload(&body) {
                Ok((_, payload)) => {
                    if self.delivery.send(payload).is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "undecodable body dropped"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{envelope::decode_frame, reassembler::Reassembler, shutdown};

    fn seeded_encoder(seed: u8) -> SegmentEncoder {
        SegmentEncoder::with_config_and_rng(&Config::default(), StdRng::from_seed([seed; 32]))
    }

    #[test]
    fn one_megabyte_survives_reversed_delivery() {
        let mut encoder = seeded_encoder(1);
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

        let mut bodies = encoder.encode_packet(&data).unwrap();
        assert!(bodies.len() > 1);
        bodies.reverse();

        let mut reassembler = Reassembler::new();
        let mut rebuilt = Vec::with_capacity(data.len());
        for body in &bodies {
            let frame = decode_frame(body).unwrap();
            for block in reassembler.accept(frame.segment_id, frame.payload) {
                let (_, mux) = decode_block(&block).unwrap();
                rebuilt.extend_from_slice(&mux.payload);
            }
        }
        assert_eq!(reassembler.pending_segments(), 0);
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn segment_metadata_is_monotonic_across_packets() {
        let mut encoder = seeded_encoder(2);
        let mut last_index = -1;
        let mut last_pts = -1;
        for _ in 0..3 {
            for body in encoder.encode_packet(&[0u8; 200_000]).unwrap() {
                let (meta, _) = decode_to_payload(&body).unwrap();
                assert_eq!(meta.stream_id, 1);
                assert_eq!(meta.segment_index, last_index + 1);
                assert!(meta.pts_ms > last_pts);
                assert!(SEGMENT_DURATION_MS.contains(&meta.duration_ms));
                last_index = meta.segment_index;
                last_pts = meta.pts_ms;
            }
        }
    }

    #[test]
    fn small_packet_fits_one_body() {
        let mut encoder = seeded_encoder(3);
        // An MTU-sized packet is far below the smallest chunk band.
        let packet = vec![0xAB; 1400];
        let bodies = encoder.encode_packet(&packet).unwrap();
        assert_eq!(bodies.len(), 1);

        let (_, payload) = decode_to_payload(&bodies[0]).unwrap();
        assert_eq!(payload, packet);
    }

    #[test]
    fn reply_stays_whole_above_the_chunk_bands() {
        let mut encoder = seeded_encoder(7);
        let request = MediaSegmentMeta {
            stream_id: 3,
            segment_index: 12,
            pts_ms: 3600,
            duration_ms: 250,
        };
        // Larger than any fast-start chunk; must still come out as one body.
        let reply = vec![0x7E; 12_000];

        let body = encoder.encode_reply(42, &request, &reply).unwrap();
        let (meta, payload) = decode_to_payload(&body).unwrap();
        assert_eq!(payload, reply);
        assert_eq!(meta, request);

        let frame = decode_frame(&body).unwrap();
        let (_, mux) = decode_block(&frame.payload).unwrap();
        assert_eq!(mux.session_id, 42);

        // The response counter keeps moving independently of the request ids.
        let next = encoder.encode_reply(42, &request, b"x").unwrap();
        assert_eq!(decode_frame(&next).unwrap().segment_id, frame.segment_id + 1);
    }

    #[tokio::test]
    async fn wire_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 20);
        write_wire_frame(&mut a, b"hello frame").await.unwrap();
        write_wire_frame(&mut a, &[7u8; 100_000]).await.unwrap();

        assert_eq!(read_wire_frame(&mut b).await.unwrap(), b"hello frame");
        assert_eq!(read_wire_frame(&mut b).await.unwrap(), [7u8; 100_000]);
    }

    #[tokio::test]
    async fn wire_frame_rejects_bad_prefixes() {
        let (mut a, mut b) = tokio::io::duplex(64);

        a.write_all(&(-5i32).to_be_bytes()).await.unwrap();
        let err = read_wire_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        a.write_all(&(WIRE_FRAME_MAX_LEN as i32 + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_wire_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn closed_peer_reads_as_disconnected() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let err = read_wire_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn stream_loops_carry_packets_end_to_end() {
        let (client_end, server_end) = tokio::io::duplex(1 << 22);
        let (_signal, token) = shutdown::channel();

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let sender = StreamSender::new(seeded_encoder(4), packet_rx, token.clone());
        let send_task = tokio::spawn(sender.run(client_end));

        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
        let receiver = StreamReceiver::new(delivery_tx, token);
        let recv_task = tokio::spawn(receiver.run(server_end));

        let packets: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; 1000 + i * 37]).collect();
        for packet in &packets {
            packet_tx.send(packet.clone()).unwrap();
        }

        for expected in &packets {
            let got = delivery_rx.recv().await.unwrap();
            assert_eq!(&got, expected);
        }

        drop(packet_tx);
        send_task.await.unwrap().unwrap();
        drop(delivery_rx);
        recv_task.await.unwrap().unwrap();
    }

    /// In-memory transport: sends push into a queue the poll side drains.
    struct LocalTransport {
        inbox: std::collections::VecDeque<Vec<u8>>,
        sent: mpsc::UnboundedSender<Vec<u8>>,
    }

    impl SegmentTransport for LocalTransport {
        async fn send(&mut self, body: &[u8]) -> io::Result<()> {
            self.sent.send(body.to_vec()).map_err(io::Error::other)
        }

        async fn poll(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.inbox.pop_front().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn paced_sender_emits_every_body() {
        let config = Config::default().with_pacing_delay_ms(1..2);
        let (_signal, token) = shutdown::channel();
        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();

        let sender = PacedSender::new(seeded_encoder(5), &config, packet_rx, token);
        let transport = LocalTransport {
            inbox: Default::default(),
            sent: sent_tx,
        };
        let task = tokio::spawn(sender.run(transport));

        let packet = vec![0x5A; 150_000];
        packet_tx.send(packet.clone()).unwrap();
        drop(packet_tx);
        task.await.unwrap();

        let mut rebuilt = Vec::new();
        while let Some(body) = sent_rx.recv().await {
            let (_, chunk) = decode_to_payload(&body).unwrap();
            rebuilt.extend_from_slice(&chunk);
        }
        assert_eq!(rebuilt, packet);
    }

    #[tokio::test]
    async fn poll_receiver_skips_empty_polls_and_delivers() {
        let config = Config::default().with_poll_idle(Duration::from_millis(1));
        let (signal, token) = shutdown::channel();

        let mut encoder = seeded_encoder(6);
        let packet = vec![0xC3; 800];
        let bodies = encoder.encode_packet(&packet).unwrap();

        let mut inbox = std::collections::VecDeque::new();
        inbox.push_back(Vec::new()); // "no data yet"
        inbox.push_back(vec![0u8; 2]); // still short of a body
        for body in bodies {
            inbox.push_back(body);
        }

        let (sent_tx, _sent_rx) = mpsc::unbounded_channel();
        let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel();
        let receiver = PollReceiver::new(&config, delivery_tx, token);
        let task = tokio::spawn(receiver.run(LocalTransport { inbox, sent: sent_tx }));

        assert_eq!(delivery_rx.recv().await.unwrap(), packet);
        signal.shutdown();
        task.await.unwrap();
    }
}
