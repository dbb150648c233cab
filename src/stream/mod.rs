// (c) 2025 Ross Younger

//! Bidirectional logical channels multiplexed over one connection.
//!
//! A [`Stream`] is opened by calling a stream-open method as a normal RPC;
//! the response payload carries the server-assigned stream ID that all
//! subsequent frames quote. Both ends hold the same structure: a table of
//! requests this end initiated, and an optional [`StreamHandler`] answering
//! requests initiated by the peer.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::protocol::{frame, Codec, Context, Reader};
use crate::transport::Connection;
use crate::util::{lock, panic_text};
use crate::{Error, Result};

/// Answers peer-initiated messages on a stream.
///
/// Generated code implements this: it decodes the method's request composite
/// from `reader`, invokes the user method, and returns a complete
/// stream-response frame (see
/// [`stream_respond_with_message`](frame::stream_respond_with_message)).
pub trait StreamHandler: Send + Sync {
    /// Handle one inbound stream message and produce the response frame.
    fn handle(&self, stream: &Arc<Stream>, request_id: u64, method_id: u64, reader: Reader)
        -> Vec<u8>;
}

struct StreamState {
    closed: bool,
    next_request_id: u64,
    requests: HashMap<u64, SyncSender<Reader>>,
}

/// One end of a bidirectional logical channel.
pub struct Stream {
    id: u64,
    connection: Arc<dyn Connection>,
    state: Mutex<StreamState>,
    closed_signal: Condvar,
    handler: Mutex<Option<Arc<dyn StreamHandler>>>,
}

impl Stream {
    /// A stream speaking `id` over `connection`. Both the client core (after
    /// a stream-open call) and the server core (in stream-open dispatch)
    /// construct these; user code receives them ready-made.
    #[must_use]
    pub fn new(id: u64, connection: Arc<dyn Connection>) -> Arc<Self> {
        Arc::new(Self {
            id,
            connection,
            state: Mutex::new(StreamState {
                closed: false,
                next_request_id: rand::thread_rng().gen(),
                requests: HashMap::new(),
            }),
            closed_signal: Condvar::new(),
            handler: Mutex::new(None),
        })
    }

    /// The wire identifier this stream's frames carry.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Install the handler for peer-initiated messages.
    pub fn set_handler(&self, handler: Arc<dyn StreamHandler>) {
        *lock(&self.handler) = Some(handler);
    }

    /// Send one message on the stream and wait for the peer's response,
    /// bounded by the context deadline if one is set.
    pub fn send_message<T: Codec>(
        &self,
        ctx: &Context,
        method_id: u64,
        msg: &T,
    ) -> Result<Reader> {
        let (rx, request_id) = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(Error::StreamClosed);
            }
            let request_id = state.next_request_id;
            state.next_request_id = state.next_request_id.wrapping_add(1);

            let data = frame::encode_stream_message(self.id, request_id, method_id, msg);
            let (tx, rx) = mpsc::sync_channel(1);
            let _ = state.requests.insert(request_id, tx);
            if let Err(e) = self.connection.send(&data) {
                let _ = state.requests.remove(&request_id);
                return Err(e);
            }
            (rx, request_id)
        };

        let reader = self.wait_response(ctx, request_id, &rx)?;
        frame::read_response(reader)
    }

    fn wait_response(
        &self,
        ctx: &Context,
        request_id: u64,
        rx: &Receiver<Reader>,
    ) -> Result<Reader> {
        match ctx.deadline() {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(timeout) {
                    Ok(reader) => Ok(reader),
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = lock(&self.state).requests.remove(&request_id);
                        Err(Error::DeadlineExceeded)
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(Error::StreamClosed),
                }
            }
            None => rx.recv().map_err(|_| Error::StreamClosed),
        }
    }

    /// Deliver a stream-response frame's remainder to the matching waiter.
    /// Responses for unknown request IDs (e.g. after a deadline expiry) are
    /// dropped.
    pub(crate) fn handle_response(&self, request_id: u64, reader: Reader) {
        let sender = lock(&self.state).requests.remove(&request_id);
        match sender {
            Some(tx) => {
                let _ = tx.try_send(reader);
            }
            None => trace!(
                "stream {}: dropping response for unknown request {request_id}",
                self.id
            ),
        }
    }

    /// Dispatch a peer-initiated message to the handler and send its
    /// response. Handler panics are caught here and turned into an error
    /// response, keeping the stream usable.
    pub(crate) fn dispatch_inbound(
        stream: &Arc<Self>,
        request_id: u64,
        method_id: u64,
        reader: Reader,
    ) {
        let handler = lock(&stream.handler).clone();
        let response = match handler {
            Some(handler) => {
                let on_stream = Arc::clone(stream);
                catch_unwind(AssertUnwindSafe(move || {
                    handler.handle(&on_stream, request_id, method_id, reader)
                }))
                .unwrap_or_else(|panic| {
                    warn!("stream {} handler panicked", stream.id);
                    frame::stream_respond_with_error(
                        stream.id,
                        request_id,
                        &Error::Remote(panic_text(&panic)),
                    )
                })
            }
            None => {
                warn!("stream {}: message with no handler installed", stream.id);
                frame::stream_respond_with_error(
                    stream.id,
                    request_id,
                    &Error::Remote("No handler registered for stream message".into()),
                )
            }
        };
        if let Err(e) = stream.connection.send(&response) {
            debug!("stream {}: response send failed: {e}", stream.id);
        }
    }

    /// Close the stream, notifying the peer. Outstanding requests complete
    /// with [`StreamClosed`](Error::StreamClosed). Idempotent.
    pub fn close(&self) -> Result<()> {
        let Some(senders) = self.mark_closed() else {
            return Ok(());
        };
        let result = self.connection.send(&frame::encode_stream_close(self.id));
        fail_all(senders, &Error::StreamClosed);
        result
    }

    /// The peer closed the stream (or the connection under it went away).
    pub(crate) fn handle_close(&self, reason: &Error) {
        if let Some(senders) = self.mark_closed() {
            debug!("stream {} closed: {reason}", self.id);
            fail_all(senders, reason);
        }
    }

    // Returns the outstanding request sinks if this call did the closing.
    fn mark_closed(&self) -> Option<Vec<SyncSender<Reader>>> {
        let mut state = lock(&self.state);
        if state.closed {
            return None;
        }
        state.closed = true;
        let senders = state.requests.drain().map(|(_, tx)| tx).collect();
        drop(state);
        self.closed_signal.notify_all();
        Some(senders)
    }

    /// Whether the stream has been closed by either side.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Block until the stream closes.
    pub fn wait_closed(&self) {
        let mut state = lock(&self.state);
        while !state.closed {
            state = self
                .closed_signal
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn fail_all(senders: Vec<SyncSender<Reader>>, err: &Error) {
    if senders.is_empty() {
        return;
    }
    let body: Bytes = frame::encode_error_body(err).into();
    for tx in senders {
        let _ = tx.try_send(Reader::new(body.clone()));
    }
}
