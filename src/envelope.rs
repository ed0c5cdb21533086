//! The mask envelope: the outermost disguise layer.
//!
//! Every media segment travels inside an envelope that starts with a fixed
//! magic signature and declares its payload and padding lengths explicitly.
//! The padding length is drawn uniformly from a configured band and the
//! padding bytes are random, so the envelope length does not correlate with
//! the payload length. The decoder validates the structure and never
//! interprets the padding.
//!
//! A second, structurally unrelated envelope exists for short textual status
//! messages. It has its own magic signature and is not on the data path.

use core::ops::Range;

use rand::{
    Rng, SeedableRng, TryRngCore,
    rngs::{OsRng, StdRng},
};

use crate::{
    error::Error,
    specification::{
        ENVELOPE_HDR_LEN, FRAME_TYPE_DATA, MAGIC, PAD_MAX_LEN, PAD_MIN_LEN, RESPONSE_HDR_LEN,
        RESPONSE_MAGIC,
    },
};

/// A decoded data envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DecodedFrame {
    /// The segment identifier carried by the envelope.
    pub segment_id: i32,
    /// The enclosed media segment payload. Padding is never returned.
    pub payload: Vec<u8>,
}

/// Encoder for data envelopes.
///
/// Owns the random source used for padding so that envelope sizes are
/// reproducible when constructed with [`with_padding_and_rng`].
///
/// [`with_padding_and_rng`]: EnvelopeEncoder::with_padding_and_rng
#[derive(Debug)]
pub struct EnvelopeEncoder {
    padding: Range<usize>,
    rng: StdRng,
}

impl Default for EnvelopeEncoder {
    fn default() -> Self {
        Self::new(PAD_MIN_LEN..PAD_MAX_LEN)
    }
}

impl EnvelopeEncoder {
    /// Creates an encoder drawing padding lengths from `padding`, seeded
    /// from the system entropy source.
    ///
    /// # Panics
    /// Panics if `padding` is empty.
    pub fn new(padding: Range<usize>) -> Self {
        let mut seed = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut seed)
            .expect("system random source failure");
        Self::with_padding_and_rng(padding, StdRng::from_seed(seed))
    }

    /// Creates an encoder with an explicit random source, for deterministic
    /// construction.
    ///
    /// # Panics
    /// Panics if `padding` is empty.
    pub fn with_padding_and_rng(padding: Range<usize>, rng: StdRng) -> Self {
        assert!(!padding.is_empty(), "padding band must not be empty");
        Self { padding, rng }
    }

    /// Wraps `payload` into a data envelope.
    ///
    /// Layout: `magic(4) | type(1) | segment_id(4, LE) | payload_len(4, LE) |
    /// padding_len(4, LE) | payload | padding`.
    pub fn encode(&mut self, segment_id: i32, payload: &[u8]) -> Vec<u8> {
        let padding_len = self.rng.random_range(self.padding.clone());

        let mut buf = Vec::with_capacity(ENVELOPE_HDR_LEN + payload.len() + padding_len);
        buf.extend_from_slice(&MAGIC);
        buf.push(FRAME_TYPE_DATA);
        buf.extend_from_slice(&segment_id.to_le_bytes());
        buf.extend_from_slice(&(payload.len() as i32).to_le_bytes());
        buf.extend_from_slice(&(padding_len as i32).to_le_bytes());
        buf.extend_from_slice(payload);

        let pad_at = buf.len();
        buf.resize(pad_at + padding_len, 0);
        self.rng.fill(&mut buf[pad_at..]);
        buf
    }
}

/// Validates and unwraps a data envelope.
///
/// Padding bytes are skipped, never inspected. The declared payload and
/// padding sizes must account for the buffer exactly; the envelope is the
/// outermost layer and is always delivered whole.
///
/// # Errors
///
/// * [`Error::TruncatedFrame`] — shorter than the 17-byte header, or the
///   declared payload/padding sizes do not match the buffer.
/// * [`Error::InvalidMagic`] — the signature does not match.
/// * [`Error::UnsupportedType`] — the frame type is not the data type.
/// * [`Error::NegativeLength`] — a declared length is negative.
pub fn decode_frame(data: &[u8]) -> Result<DecodedFrame, Error> {
    if data.len() < ENVELOPE_HDR_LEN {
        return Err(Error::TruncatedFrame {
            expected: ENVELOPE_HDR_LEN,
            available: data.len(),
        });
    }

    if data[0..4] != MAGIC {
        return Err(Error::InvalidMagic {
            received: data[0..4].try_into().unwrap(),
        });
    }

    let frame_type = data[4];
    if frame_type != FRAME_TYPE_DATA {
        return Err(Error::UnsupportedType {
            received: frame_type,
        });
    }

    let segment_id = i32::from_le_bytes(data[5..9].try_into().unwrap());
    let payload_len = i32::from_le_bytes(data[9..13].try_into().unwrap());
    let padding_len = i32::from_le_bytes(data[13..17].try_into().unwrap());
    if payload_len < 0 {
        return Err(Error::NegativeLength {
            received: payload_len,
        });
    }
    if padding_len < 0 {
        return Err(Error::NegativeLength {
            received: padding_len,
        });
    }

    let expected = ENVELOPE_HDR_LEN + payload_len as usize + padding_len as usize;
    if data.len() != expected {
        return Err(Error::TruncatedFrame {
            expected,
            available: data.len(),
        });
    }

    Ok(DecodedFrame {
        segment_id,
        payload: data[ENVELOPE_HDR_LEN..ENVELOPE_HDR_LEN + payload_len as usize].to_vec(),
    })
}

/// A decoded response envelope.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseFrame {
    /// The segment identifier the response refers to.
    pub segment_id: i32,
    /// The textual status message.
    pub message: String,
}

/// Encodes a short textual status message.
///
/// Layout: `magic(4) | segment_id(4, LE) | msg_len(4, LE) | utf8 message`.
pub fn encode_response(segment_id: i32, message: &str) -> Vec<u8> {
    let msg = message.as_bytes();
    let mut buf = Vec::with_capacity(RESPONSE_HDR_LEN + msg.len());
    buf.extend_from_slice(&RESPONSE_MAGIC);
    buf.extend_from_slice(&segment_id.to_le_bytes());
    buf.extend_from_slice(&(msg.len() as i32).to_le_bytes());
    buf.extend_from_slice(msg);
    buf
}

/// Validates and unwraps a response envelope.
///
/// Malformed UTF-8 in the message is substituted rather than rejected.
/// Like the data envelope, the declared length must account for the buffer
/// exactly.
///
/// # Errors
///
/// [`Error::TruncatedFrame`], [`Error::InvalidMagic`], or
/// [`Error::NegativeLength`], analogous to [`decode_frame`].
pub fn decode_response(data: &[u8]) -> Result<ResponseFrame, Error> {
    if data.len() < RESPONSE_HDR_LEN {
        return Err(Error::TruncatedFrame {
            expected: RESPONSE_HDR_LEN,
            available: data.len(),
        });
    }

    if data[0..4] != RESPONSE_MAGIC {
        return Err(Error::InvalidMagic {
            received: data[0..4].try_into().unwrap(),
        });
    }

    let segment_id = i32::from_le_bytes(data[4..8].try_into().unwrap());
    let msg_len = i32::from_le_bytes(data[8..12].try_into().unwrap());
    if msg_len < 0 {
        return Err(Error::NegativeLength { received: msg_len });
    }

    let expected = RESPONSE_HDR_LEN + msg_len as usize;
    if data.len() != expected {
        return Err(Error::TruncatedFrame {
            expected,
            available: data.len(),
        });
    }

    let message =
        String::from_utf8_lossy(&data[RESPONSE_HDR_LEN..RESPONSE_HDR_LEN + msg_len as usize])
            .into_owned();
    Ok(ResponseFrame {
        segment_id,
        message,
    })
}
