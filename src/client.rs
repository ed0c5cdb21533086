//! The client side of the tunnel.
//!
//! A [`TunnelClient`] owns one TCP connection to the server and drives it
//! with two independent tasks, one per direction, sharing nothing but the
//! split socket. Packets come from and go to a [`PacketPort`], the boundary
//! to whatever captures raw packets on this host.

use std::io;
use std::net::SocketAddr;

use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    config::Config,
    pipeline::{SegmentEncoder, StreamReceiver, StreamSender},
    shutdown::{self, ShutdownSignal, ShutdownToken},
};

/// A handle to a running tunnel connection.
///
/// Dropping the handle signals shutdown to both direction tasks.
#[derive(Debug)]
pub struct TunnelClient {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    signal: ShutdownSignal,
    sender_task: JoinHandle<io::Result<()>>,
    receiver_task: JoinHandle<io::Result<()>>,
}

impl TunnelClient {
    /// Connects to the server and spawns the two direction loops.
    pub async fn connect(addr: SocketAddr, config: &Config) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!(%addr, "tunnel connected");

        let (read_half, write_half) = stream.into_split();
        let (signal, token) = shutdown::channel();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let sender = StreamSender::new(SegmentEncoder::new(config), outbound_rx, token.clone());
        let sender_task = tokio::spawn(sender.run(write_half));

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let receiver = StreamReceiver::new(inbound_tx, token);
        let receiver_task = tokio::spawn(receiver.run(read_half));

        Ok(Self {
            outbound,
            inbound,
            signal,
            sender_task,
            receiver_task,
        })
    }

    /// Queues one raw packet for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::BrokenPipe`] if the send loop has already
    /// ended.
    pub fn send_packet(&self, packet: Vec<u8>) -> io::Result<()> {
        self.outbound
            .send(packet)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "send loop ended"))
    }

    /// Waits for the next packet reconstructed from the server's responses.
    ///
    /// Returns `None` once the connection has ended and all buffered
    /// packets were taken.
    pub async fn recv_packet(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Signals both loops to stop and waits for them to finish.
    pub async fn shutdown(self) -> io::Result<()> {
        self.signal.shutdown();
        let sent = self.sender_task.await;
        let received = self.receiver_task.await;
        sent.map_err(io::Error::other)??;
        received.map_err(io::Error::other)??;
        Ok(())
    }
}

/// Boundary to the host's packet source and sink, typically a virtual
/// network adapter owned by the embedding application.
#[allow(async_fn_in_trait)]
pub trait PacketPort {
    /// Prepares the port for traffic.
    async fn start(&mut self) -> io::Result<()>;
    /// Releases the port.
    async fn stop(&mut self) -> io::Result<()>;
    /// Waits for the next outbound raw packet. `None` means the port is
    /// exhausted.
    async fn read_packet(&mut self) -> io::Result<Option<Vec<u8>>>;
    /// Hands an inbound raw packet to the host.
    async fn write_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

/// Pumps packets between a [`PacketPort`] and a [`TunnelClient`] until the
/// port is exhausted, the connection ends, or `shutdown` is signalled.
///
/// The port is stopped before returning, also on error paths.
pub async fn run_port<P>(
    mut port: P,
    mut client: TunnelClient,
    mut shutdown: ShutdownToken,
) -> io::Result<()>
where
    P: PacketPort,
{
    port.start().await?;
    let result = pump(&mut port, &mut client, &mut shutdown).await;
    if let Err(e) = port.stop().await {
        warn!(error = %e, "port stop failed");
    }
    let closed = client.shutdown().await;
    result.and(closed)
}

async fn pump<P>(
    port: &mut P,
    client: &mut TunnelClient,
    shutdown: &mut ShutdownToken,
) -> io::Result<()>
where
    P: PacketPort,
{
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            outbound = port.read_packet() => match outbound? {
                Some(packet) => client.send_packet(packet)?,
                None => return Ok(()),
            },
            inbound = client.inbound.recv() => match inbound {
                Some(packet) => port.write_packet(&packet).await?,
                None => return Ok(()),
            },
        }
    }
}
