//! Vidwire is an obfuscation tunnel that carries raw IP packets disguised as
//! adaptive-bitrate video traffic, designed so that deep packet inspection
//! (DPI) middleboxes classify the connection as an ordinary streaming
//! session.
//!
//! ## How the disguise works
//!
//! Every outbound packet passes through four layers before it reaches the
//! wire:
//!
//! 1. The [`Chunker`] splits the packet into pieces whose sizes follow a
//!    video player's fetch pattern: a few small fast-start segments, then
//!    mid-sized steady-state segments with occasional large peaks.
//! 2. Each chunk is wrapped in a multiplexing frame carrying a session
//!    identifier, so several logical sessions can share one connection.
//! 3. The frame is prefixed with media segment metadata (stream id, segment
//!    index, presentation timestamp, duration), which is also what the
//!    receiving side uses to restore ordering.
//! 4. The result is sealed in a mask envelope with a magic signature and a
//!    random amount of random padding, decorrelating wire sizes from
//!    payload sizes.
//!
//! The receiving side reverses the chain; the [`Reassembler`] restores
//! segment order when the transport may deliver out of order.
//!
//! ## Quick start
//!
//! The server forwards tunneled UDP packets to their real destinations and
//! tunnels the replies back:
//!
//! ```no_run
//! use tokio::net::TcpListener;
//! use vidwire::{Config, serve, shutdown};
//!
//! # async fn run() -> std::io::Result<()> {
//! let config = Config::default();
//! let listener = TcpListener::bind(config.listen_addr).await?;
//! let (signal, token) = shutdown::channel();
//! serve(listener, config, token).await?;
//! # drop(signal);
//! # Ok(())
//! # }
//! ```
//!
//! The client side connects and exchanges raw packets:
//!
//! ```no_run
//! use vidwire::{Config, TunnelClient};
//!
//! # async fn run() -> std::io::Result<()> {
//! let config = Config::default();
//! let mut client = TunnelClient::connect("198.51.100.7:5001".parse().unwrap(), &config).await?;
//! client.send_packet(vec![/* raw IPv4/UDP packet */])?;
//! if let Some(reply) = client.recv_packet().await {
//!     /* hand the raw reply packet back to the host */
//! }
//! client.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! All tunables live on [`Config`] and have working defaults: the chunk size
//! bands, the envelope padding band, the pacing delay of the
//! request/response transport, the poll idle interval, the forwarder's
//! reply timeout, and the identifiers stamped into frames and segments.
//! See the [`config`] module for details.
//!
//! ## Scope
//!
//! Vidwire shapes traffic; it does not encrypt it. Run it inside an
//! encrypted transport if confidentiality is required. Packet forwarding
//! supports IPv4 carrying UDP only.
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

pub mod chunker;
pub mod client;
pub mod envelope;
pub mod framer;
pub mod media;
pub mod nat;
pub mod pipeline;
pub mod reassembler;
pub mod server;
pub mod shutdown;

mod specification;

pub use chunker::{Chunk, ChunkBands, Chunker};
pub use client::{PacketPort, TunnelClient, run_port};
pub use config::Config;
pub use error::Error;
pub use reassembler::Reassembler;
pub use server::serve;
