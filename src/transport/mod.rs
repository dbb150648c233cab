// (c) 2025 Ross Younger

//! The transport abstraction the RPC cores are written against, plus the
//! bundled stream-socket implementations.
//!
//! A transport delivers **whole messages**: the cores never see transport
//! framing. Inbound messages, failures and orderly closes arrive through
//! callbacks invoked from the transport's I/O worker thread; exactly one of
//! the fail/close callbacks fires for any disconnect.

use std::sync::Arc;

use bytes::Bytes;

use crate::Result;

mod framed;
pub mod tcp;
#[cfg(unix)]
pub mod unix;

/// Callback for an inbound message.
pub type MessageHandler = Box<dyn Fn(Bytes) + Send + Sync>;
/// Callback for a transport-level failure.
pub type FailHandler = Box<dyn Fn(crate::Error) + Send + Sync>;
/// Callback for an orderly close.
pub type CloseHandler = Box<dyn Fn() + Send + Sync>;

/// One established, message-oriented, bidirectional link.
pub trait Connection: Send + Sync {
    /// Transmit one message. The octets are owned by the caller until this
    /// returns; transports may copy them into an internal send queue.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Install the inbound-message callback. Messages that arrived before a
    /// handler was installed are delivered immediately, in order.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Install the failure callback.
    fn set_fail_handler(&self, handler: FailHandler);

    /// Install the orderly-close callback.
    fn set_close_handler(&self, handler: CloseHandler);

    /// Close the connection. The close callback fires (the fail callback
    /// will not).
    fn close(&self) -> Result<()>;
}

/// Client-side connection factory.
pub trait ClientTransport: Send + Sync {
    /// Establish a connection to the configured peer.
    fn connect(&self) -> Result<Arc<dyn Connection>>;

    /// Tear down the transport and any connections it produced.
    fn shutdown(&self);
}

/// Server-side listener.
pub trait ServerTransport: Send + Sync {
    /// Start listening.
    fn listen(&self) -> Result<()>;

    /// Take one pending connection, if any. Non-blocking; `Ok(None)` means
    /// nothing is waiting.
    fn accept(&self) -> Result<Option<Arc<dyn Connection>>>;

    /// Non-blocking drive for transports that need polling. The bundled
    /// stream-socket transports run a thread per connection and need none.
    fn poll(&self);

    /// Stop listening and release the listener.
    fn close(&self) -> Result<()>;
}
