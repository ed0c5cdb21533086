//! Tunnel configuration.
//!
//! Every knob has a working default; construct a [`Config`] with
//! [`Config::default`] and override what you need:
//!
//! ```
//! use vidwire::config::Config;
//!
//! let config = Config::default()
//!     .with_session_id(7)
//!     .with_pacing_delay_ms(60..180);
//! ```

use core::ops::Range;
use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use crate::{
    chunker::ChunkBands,
    specification::{PAD_MAX_LEN, PAD_MIN_LEN},
};

/// Configuration shared by the client and server sides.
#[derive(Clone, Debug)]
pub struct Config {
    /// Size bands for the chunker. See [`ChunkBands`] for the defaults.
    pub chunk_bands: ChunkBands,
    /// Envelope padding lengths are drawn uniformly from this band.
    /// Default `16..128`.
    pub padding: Range<usize>,
    /// Delay between paced sends, drawn uniformly per send, in milliseconds.
    /// Default `40..220`.
    pub pacing_delay_ms: Range<u64>,
    /// How long a poll receiver idles after an empty poll. Default 50 ms.
    pub poll_idle: Duration,
    /// How long the forwarder waits for a reply from the destination before
    /// giving up on that packet. Default 3000 ms.
    pub nat_reply_timeout: Duration,
    /// Address the server listens on. Default `0.0.0.0:5001`.
    pub listen_addr: SocketAddr,
    /// Session identifier stamped into every multiplexing frame. Default 1.
    pub session_id: u16,
    /// Stream identifier stamped into every media segment. Default 1.
    pub stream_id: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_bands: ChunkBands::default(),
            padding: PAD_MIN_LEN..PAD_MAX_LEN,
            pacing_delay_ms: 40..220,
            poll_idle: Duration::from_millis(50),
            nat_reply_timeout: Duration::from_millis(3000),
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5001)),
            session_id: 1,
            stream_id: 1,
        }
    }
}

impl Config {
    /// Replaces the chunker's size bands.
    ///
    /// # Panics
    /// Panics if the bands violate the invariants listed on
    /// [`ChunkBands`](crate::chunker::ChunkBands).
    pub fn with_chunk_bands(mut self, bands: ChunkBands) -> Self {
        bands.validate();
        self.chunk_bands = bands;
        self
    }

    /// Replaces the envelope padding band.
    ///
    /// # Panics
    /// Panics if `padding` is empty.
    pub fn with_padding(mut self, padding: Range<usize>) -> Self {
        assert!(!padding.is_empty(), "padding band must not be empty");
        self.padding = padding;
        self
    }

    /// Replaces the pacing delay band.
    ///
    /// # Panics
    /// Panics if `delay_ms` is empty.
    pub fn with_pacing_delay_ms(mut self, delay_ms: Range<u64>) -> Self {
        assert!(!delay_ms.is_empty(), "pacing band must not be empty");
        self.pacing_delay_ms = delay_ms;
        self
    }

    /// Replaces the poll idle interval.
    pub fn with_poll_idle(mut self, idle: Duration) -> Self {
        self.poll_idle = idle;
        self
    }

    /// Replaces the forwarder's reply timeout.
    pub fn with_nat_reply_timeout(mut self, timeout: Duration) -> Self {
        self.nat_reply_timeout = timeout;
        self
    }

    /// Replaces the server listen address.
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Replaces the multiplexing session identifier.
    pub fn with_session_id(mut self, session_id: u16) -> Self {
        self.session_id = session_id;
        self
    }

    /// Replaces the media stream identifier.
    pub fn with_stream_id(mut self, stream_id: i32) -> Self {
        self.stream_id = stream_id;
        self
    }
}
