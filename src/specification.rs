//! The informal specification of the vidwire disguise protocol.

// Mask envelope (data frame), the outermost disguise layer:
// ```text
// | magic | type | segment_id | payload_len | padding_len | payload  | padding  |
// |  4B   |  1B  |   4B LE    |    4B LE    |    4B LE    | variable | variable |
// |                      <- header ->                     |      <- body ->     |
// ```
// `padding` is random bytes, never interpreted by the decoder. Its length is
// sampled uniformly from [PAD_MIN_LEN, PAD_MAX_LEN) so the envelope length
// does not correlate with the payload length.
pub(crate) const MAGIC: [u8; 4] = [0xF1, 0x0F, 0xAA, 0x55];
pub(crate) const FRAME_TYPE_DATA: u8 = 0x01;
pub(crate) const ENVELOPE_HDR_LEN: usize = 4 + 1 + 4 + 4 + 4; // 17
pub(crate) const PAD_MIN_LEN: usize = 16;
pub(crate) const PAD_MAX_LEN: usize = 128; // exclusive

// Response envelope, a short textual status frame with its own signature.
// Not on the data path.
// ```text
// | magic | segment_id | msg_len | message      |
// |  4B   |   4B LE    |  4B LE  | msg_len utf8 |
// ```
pub(crate) const RESPONSE_MAGIC: [u8; 4] = [0xA1, 0xC2, 0xB3, 0xD4];
pub(crate) const RESPONSE_HDR_LEN: usize = 4 + 4 + 4; // 12

// Multiplexing frame, one chunk inside a logical connection:
// ```text
// | length | flags | session_id | payload      |
// | 2B BE  |  1B   |   2B BE    | length bytes |
// ```
// Trailing bytes past `MUX_HDR_LEN + length` are ignored so the frame can be
// embedded in larger, padded buffers.
pub(crate) const MUX_HDR_LEN: usize = 5;
pub(crate) const MUX_PAYLOAD_MAX_LEN: usize = u16::MAX as usize;

// Media segment header, ordering/timing metadata in front of a mux frame:
// ```text
// | stream_id | segment_index | pts_ms | duration_ms | raw data |
// |   4B LE   |     4B LE     | 4B LE  |    4B LE    | variable |
// ```
pub(crate) const MEDIA_HDR_LEN: usize = 16;

// Stream transport: each envelope is written with a 4-byte big-endian length
// prefix. A declared length outside (0, WIRE_FRAME_MAX_LEN] is grounds for
// disconnecting the peer.
pub(crate) const WIRE_FRAME_MAX_LEN: usize = 10_000_000;

// IPv4/UDP layout used by the NAT forwarder.
pub(crate) const IPV4_MIN_HDR_LEN: usize = 20;
pub(crate) const UDP_HDR_LEN: usize = 8;
pub(crate) const PROTO_UDP: u8 = 17;
pub(crate) const DEFAULT_TTL: u8 = 64;
