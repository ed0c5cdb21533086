//! All possible non-I/O protocol errors.

use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O protocol errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// A payload was handed to a codec whose length field cannot represent it.
    ///
    /// # Suggested error handling strategy
    ///
    /// This error is a caller bug or a configuration problem (e.g. chunk
    /// bands wider than the multiplexing frame allows); the offending unit
    /// cannot be transmitted and should be dropped.
    PayloadTooLarge {
        /// The length of the rejected payload.
        len: usize,
    },

    /// A buffer was shorter than its header demands.
    ///
    /// Raised when a frame header cannot be read in full, or when the
    /// lengths a header declares exceed the bytes actually present.
    ///
    /// # Suggested error handling strategy
    ///
    /// Local decode failure. On the receive path the offending unit is
    /// dropped and the loop continues; the connection itself is unaffected.
    TruncatedFrame {
        /// The number of bytes the header demanded.
        expected: usize,
        /// The number of bytes actually available.
        available: usize,
    },

    /// The first four bytes of an envelope did not match the expected
    /// signature.
    InvalidMagic {
        /// The signature that was received instead.
        received: [u8; 4],
    },

    /// The envelope declared a frame type this implementation does not
    /// understand.
    UnsupportedType {
        /// The received `type` field.
        received: u8,
    },

    /// A declared length field was negative (or, for the stream transport's
    /// length prefix, zero).
    NegativeLength {
        /// The received length field.
        received: i32,
    },

    /// A reconstructed packet could not be parsed as IPv4/UDP.
    ///
    /// # Suggested error handling strategy
    ///
    /// Non-fatal: the forwarder skips the packet and produces no response.
    PacketParseFailed,

    /// No reply arrived from the forwarded destination within the configured
    /// timeout.
    ///
    /// # Suggested error handling strategy
    ///
    /// Non-fatal: the caller simply produces no response for that frame.
    ReplyTimeout,

    /// The peer closed the stream mid-read.
    ///
    /// # Suggested error handling strategy
    ///
    /// Ends the affected connection's task; other connections and the
    /// accept loop are unaffected.
    Disconnected,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::PayloadTooLarge { len } => {
                write!(f, "PayloadTooLarge: {} bytes", len)
            }
            Error::TruncatedFrame {
                expected,
                available,
            } => write!(
                f,
                "TruncatedFrame: expected {} bytes, {} available",
                expected, available
            ),
            Error::InvalidMagic { received } => {
                write!(f, "InvalidMagic: received {:02x?}", received)
            }
            Error::UnsupportedType { received } => {
                write!(f, "UnsupportedType: received {:#04x}", received)
            }
            Error::NegativeLength { received } => {
                write!(f, "NegativeLength: received {}", received)
            }
            Error::PacketParseFailed => write!(f, "PacketParseFailed"),
            Error::ReplyTimeout => write!(f, "ReplyTimeout"),
            Error::Disconnected => write!(f, "Disconnected"),
        }
    }
}

impl error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Disconnected => io::Error::new(ErrorKind::UnexpectedEof, e),
            Error::ReplyTimeout => io::Error::new(ErrorKind::TimedOut, e),
            _ => io::Error::new(ErrorKind::InvalidData, e),
        }
    }
}
