//! The multiplexing frame: one chunk plus session routing information.
//!
//! This is the innermost layer of the disguise stack. It carries a 16-bit
//! session identifier and a flags byte so several logical sessions can share
//! one connection.

use crate::{
    error::Error,
    specification::{MUX_HDR_LEN, MUX_PAYLOAD_MAX_LEN},
};

/// A parsed multiplexing frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MuxFrame {
    /// Identifier of the logical session this payload belongs to.
    pub session_id: u16,
    /// Per-frame flags. No flags are currently assigned.
    pub flags: u8,
    /// The transported chunk.
    pub payload: Vec<u8>,
}

/// Wraps one chunk into a multiplexing frame.
///
/// Layout: `length(2, BE) | flags(1) | session_id(2, BE) | payload`.
///
/// # Errors
///
/// Returns [`Error::PayloadTooLarge`] if the payload length cannot be
/// represented in the 16-bit length field.
pub fn frame(session_id: u16, payload: &[u8], flags: u8) -> Result<Vec<u8>, Error> {
    if payload.len() > MUX_PAYLOAD_MAX_LEN {
        return Err(Error::PayloadTooLarge { len: payload.len() });
    }

    let mut buf = Vec::with_capacity(MUX_HDR_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.push(flags);
    buf.extend_from_slice(&session_id.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parses a multiplexing frame from the front of `data`.
///
/// Bytes past `MUX_HDR_LEN + length` are ignored, so a frame embedded in a
/// larger, padded buffer parses cleanly.
///
/// # Errors
///
/// Returns [`Error::TruncatedFrame`] if `data` is shorter than the 5-byte
/// header or shorter than the length the header declares.
pub fn try_parse(data: &[u8]) -> Result<MuxFrame, Error> {
    if data.len() < MUX_HDR_LEN {
        return Err(Error::TruncatedFrame {
            expected: MUX_HDR_LEN,
            available: data.len(),
        });
    }

    let length = u16::from_be_bytes([data[0], data[1]]) as usize;
    let flags = data[2];
    let session_id = u16::from_be_bytes([data[3], data[4]]);

    if data.len() - MUX_HDR_LEN < length {
        return Err(Error::TruncatedFrame {
            expected: MUX_HDR_LEN + length,
            available: data.len(),
        });
    }

    Ok(MuxFrame {
        session_id,
        flags,
        payload: data[MUX_HDR_LEN..MUX_HDR_LEN + length].to_vec(),
    })
}
