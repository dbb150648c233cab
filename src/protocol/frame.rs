//! Frame prefixes, response kinds, and the builders and parsers for every
//! message envelope on the wire.
// (c) 2025 Ross Younger

use static_assertions::const_assert;

use crate::protocol::pack::bits_to_bytes;
use crate::protocol::{BitRead, Codec, Context, Reader, Writer};
use crate::{Error, Result};

/// Every frame leads with one of these 16-octet literals.
pub type Prefix = [u8; PREFIX_SIZE];

/// Length of a frame prefix in octets.
pub const PREFIX_SIZE: usize = 16;

/// Client → server RPC request.
pub const REQUEST_PREFIX: Prefix = *b"\x00\x00\x00\x00\x00scg-request";
/// Server → client RPC response.
pub const RESPONSE_PREFIX: Prefix = *b"\x00\x00\x00\x00scg-response";
/// A request travelling over an established stream, either direction.
pub const STREAM_MESSAGE_PREFIX: Prefix = *b"\x00\x00scg-stream-msg";
/// A response to a stream message, either direction.
pub const STREAM_RESPONSE_PREFIX: Prefix = *b"\x00scg-stream-resp";
/// Cooperative stream shutdown, either direction.
pub const STREAM_CLOSE_PREFIX: Prefix = *b"scg-stream-close";

/// responseKind octet: the body is an error message string.
pub const ERROR_RESPONSE: u8 = 0x01;
/// responseKind octet: the body is the encoded response composite.
pub const MESSAGE_RESPONSE: u8 = 0x02;

const fn prefixes_differ(a: &Prefix, b: &Prefix) -> bool {
    let mut i = 0;
    while i < PREFIX_SIZE {
        if a[i] != b[i] {
            return true;
        }
        i += 1;
    }
    false
}

// §8 prefix disjointness, enforced at compile time. Fixed equal lengths mean
// none can be a proper prefix of another.
const_assert!(prefixes_differ(&REQUEST_PREFIX, &RESPONSE_PREFIX));
const_assert!(prefixes_differ(&REQUEST_PREFIX, &STREAM_MESSAGE_PREFIX));
const_assert!(prefixes_differ(&REQUEST_PREFIX, &STREAM_RESPONSE_PREFIX));
const_assert!(prefixes_differ(&REQUEST_PREFIX, &STREAM_CLOSE_PREFIX));
const_assert!(prefixes_differ(&RESPONSE_PREFIX, &STREAM_MESSAGE_PREFIX));
const_assert!(prefixes_differ(&RESPONSE_PREFIX, &STREAM_RESPONSE_PREFIX));
const_assert!(prefixes_differ(&RESPONSE_PREFIX, &STREAM_CLOSE_PREFIX));
const_assert!(prefixes_differ(&STREAM_MESSAGE_PREFIX, &STREAM_RESPONSE_PREFIX));
const_assert!(prefixes_differ(&STREAM_MESSAGE_PREFIX, &STREAM_CLOSE_PREFIX));
const_assert!(prefixes_differ(&STREAM_RESPONSE_PREFIX, &STREAM_CLOSE_PREFIX));

/// Read a 16-octet prefix from the head of a frame.
pub fn read_prefix<R: BitRead + ?Sized>(reader: &mut R) -> Result<Prefix> {
    <Prefix as Codec>::deserialize(reader)
}

/// Build a request frame:
/// prefix ‖ context ‖ requestID ‖ serviceID ‖ methodID ‖ payload.
pub fn encode_request<T: Codec>(
    ctx: &Context,
    request_id: u64,
    service_id: u64,
    method_id: u64,
    msg: &T,
) -> Vec<u8> {
    let bits = REQUEST_PREFIX.bit_size()
        + ctx.bit_size()
        + request_id.bit_size()
        + service_id.bit_size()
        + method_id.bit_size()
        + msg.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    REQUEST_PREFIX.serialize(&mut writer);
    ctx.serialize(&mut writer);
    request_id.serialize(&mut writer);
    service_id.serialize(&mut writer);
    method_id.serialize(&mut writer);
    msg.serialize(&mut writer);
    writer.into_bytes()
}

/// Build a successful response frame for `request_id`.
pub fn respond_with_message<T: Codec>(request_id: u64, msg: &T) -> Vec<u8> {
    let bits = RESPONSE_PREFIX.bit_size()
        + request_id.bit_size()
        + MESSAGE_RESPONSE.bit_size()
        + msg.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    RESPONSE_PREFIX.serialize(&mut writer);
    request_id.serialize(&mut writer);
    MESSAGE_RESPONSE.serialize(&mut writer);
    msg.serialize(&mut writer);
    writer.into_bytes()
}

/// Build an error response frame for `request_id`.
pub fn respond_with_error(request_id: u64, err: &Error) -> Vec<u8> {
    let msg = error_text(err);
    let bits = RESPONSE_PREFIX.bit_size()
        + request_id.bit_size()
        + ERROR_RESPONSE.bit_size()
        + msg.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    RESPONSE_PREFIX.serialize(&mut writer);
    request_id.serialize(&mut writer);
    ERROR_RESPONSE.serialize(&mut writer);
    msg.serialize(&mut writer);
    writer.into_bytes()
}

/// Build a stream message frame:
/// prefix ‖ streamID ‖ requestID ‖ methodID ‖ payload.
pub fn encode_stream_message<T: Codec>(
    stream_id: u64,
    request_id: u64,
    method_id: u64,
    msg: &T,
) -> Vec<u8> {
    let bits = STREAM_MESSAGE_PREFIX.bit_size()
        + stream_id.bit_size()
        + request_id.bit_size()
        + method_id.bit_size()
        + msg.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    STREAM_MESSAGE_PREFIX.serialize(&mut writer);
    stream_id.serialize(&mut writer);
    request_id.serialize(&mut writer);
    method_id.serialize(&mut writer);
    msg.serialize(&mut writer);
    writer.into_bytes()
}

/// Build a successful stream response frame.
pub fn stream_respond_with_message<T: Codec>(stream_id: u64, request_id: u64, msg: &T) -> Vec<u8> {
    let bits = STREAM_RESPONSE_PREFIX.bit_size()
        + stream_id.bit_size()
        + request_id.bit_size()
        + MESSAGE_RESPONSE.bit_size()
        + msg.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    STREAM_RESPONSE_PREFIX.serialize(&mut writer);
    stream_id.serialize(&mut writer);
    request_id.serialize(&mut writer);
    MESSAGE_RESPONSE.serialize(&mut writer);
    msg.serialize(&mut writer);
    writer.into_bytes()
}

/// Build an error stream response frame.
pub fn stream_respond_with_error(stream_id: u64, request_id: u64, err: &Error) -> Vec<u8> {
    let msg = error_text(err);
    let bits = STREAM_RESPONSE_PREFIX.bit_size()
        + stream_id.bit_size()
        + request_id.bit_size()
        + ERROR_RESPONSE.bit_size()
        + msg.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    STREAM_RESPONSE_PREFIX.serialize(&mut writer);
    stream_id.serialize(&mut writer);
    request_id.serialize(&mut writer);
    ERROR_RESPONSE.serialize(&mut writer);
    msg.serialize(&mut writer);
    writer.into_bytes()
}

/// Build a stream close frame: prefix ‖ streamID.
#[must_use]
pub fn encode_stream_close(stream_id: u64) -> Vec<u8> {
    let bits = STREAM_CLOSE_PREFIX.bit_size() + stream_id.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    STREAM_CLOSE_PREFIX.serialize(&mut writer);
    stream_id.serialize(&mut writer);
    writer.into_bytes()
}

/// The response body delivered to local waiters when a request is completed
/// by the client itself (connection loss, stream close): responseKind ‖
/// message, with no prefix or IDs since it never touches the wire.
pub(crate) fn encode_error_body(err: &Error) -> Vec<u8> {
    let msg = error_text(err);
    let bits = ERROR_RESPONSE.bit_size() + msg.bit_size();
    let mut writer = Writer::with_capacity(bits_to_bytes(bits));
    ERROR_RESPONSE.serialize(&mut writer);
    msg.serialize(&mut writer);
    writer.into_bytes()
}

fn error_text(err: &Error) -> String {
    let msg = err.to_string();
    if msg.is_empty() {
        "Unknown error".to_string()
    } else {
        msg
    }
}

/// Interpret a response body: consume the responseKind octet, returning the
/// reader positioned at the payload for MESSAGE, the rehydrated error for
/// ERROR, and `InvalidEncoding` for anything else.
pub fn read_response(mut reader: Reader) -> Result<Reader> {
    let kind = u8::deserialize(&mut reader)?;
    match kind {
        MESSAGE_RESPONSE => Ok(reader),
        ERROR_RESPONSE => {
            let msg = String::deserialize(&mut reader)?;
            Err(Error::Remote(if msg.is_empty() {
                "Unknown error".to_string()
            } else {
                msg
            }))
        }
        other => Err(Error::InvalidEncoding(format!(
            "unknown response kind {other}"
        ))),
    }
}
