// (c) 2025 Ross Younger

//! The wire protocol: bit-packed value encoding and message framing.
//!
//! # On-wire encoding
//!
//! Values are encoded at bit granularity with no padding between fields:
//!
//! * Booleans are one bit.
//! * `u8`/`i8` are one raw octet.
//! * Wider integers use a variable-length coding of up to 2/4/8 payload
//!   octets: each octet is preceded by a continuation bit, octets travel
//!   LSB-first, and the sequence ends with a continuation-0 bit unless the
//!   full width was used. Signed types lead with a sign bit and zigzag-fold
//!   negative values only.
//! * Floats are IEEE-754, big-endian, fixed width.
//! * Strings and containers carry a u32 length, then their elements.
//! * A composite is the concatenation of its fields in declared order.
//!
//! A consequence of bit packing is that a value's octets rarely line up with
//! the buffer's; the [`Writer`]/[`Reader`] pair takes aligned fast paths when
//! they do and shifted two-octet merges when they do not.
//!
//! # Framing
//!
//! Every message starts with one of five fixed 16-octet prefixes
//! ([`frame::REQUEST_PREFIX`] and friends) followed by the envelope fields
//! for that kind. Framing below that (length prefixes, fragmentation) is
//! the transport's concern; the core always sees whole messages.

pub mod context;
pub mod frame;
pub mod pack;
pub mod reader;
pub mod types;
pub mod writer;

mod encoding;

pub use context::Context;
pub use encoding::{Codec, Message};
pub use reader::{BitRead, Reader, ReaderView, StreamReader};
pub use writer::{BitWrite, Writer, WriterView};
