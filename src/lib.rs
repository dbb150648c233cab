// (c) 2025 Ross Younger

//! Cross-language RPC over a bit-packed binary wire format.
//!
//! ## Overview
//!
//! Two subsystems make up this crate:
//!
//! * **The codec** ([`protocol`]): values are encoded at bit granularity:
//!   one bit for a boolean, a continuation-coded variable-length form for
//!   integers, no padding between the fields of a composite. Size compute,
//!   serialize and deserialize agree exactly, so frames are assembled into
//!   pre-sized buffers with no reallocation.
//! * **The RPC core** ([`client`], [`server`], [`stream`]): a framed
//!   request/response and bidirectional streaming protocol over any
//!   message-oriented [`transport`], with concurrent in-flight requests
//!   correlated by 64-bit request IDs.
//!
//! ## A round trip
//!
//! On the way out, a call encodes its request composite, wraps it in a
//! request frame (prefix ‖ context ‖ requestID ‖ serviceID ‖ methodID ‖
//! payload) and hands the octets to the transport. On the way in, frames are
//! switched on their 16-octet prefix: responses complete the matching
//! pending request, stream frames route to their stream, anything else kills
//! the connection.
//!
//! Service and method IDs are stable 64-bit values assigned by the IDL
//! compiler; the generated code builds on [`Client::call`](client::Client),
//! [`Server::register_service`](server::Server) and the
//! [`middleware`] chain.
//!
//! ## Concurrency model
//!
//! Plain threads and locks, no async runtime. Transports deliver whole
//! messages from an I/O thread per connection; the client demultiplexes on
//! that thread while callers block on one-shot channels; the server runs
//! handlers from one background loop. See the type docs for what each lock
//! protects.

pub mod client;
pub mod middleware;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod transport;

mod error;
mod util;

pub use client::{Client, ClientConfig, ConnectionStatus};
pub use error::{Error, Result};
pub use protocol::{Codec, Context, Message, Reader, Writer};
pub use server::{Server, ServerConfig};
pub use stream::{Stream, StreamHandler};
