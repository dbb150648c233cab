// (c) 2025 Ross Younger

//! The client core: concurrent in-flight requests over one connection,
//! response demultiplexing, stream bookkeeping and deadline handling.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::middleware::Middleware;
use crate::protocol::{frame, Codec, Context, Reader};
use crate::stream::Stream;
use crate::transport::{ClientTransport, Connection};
use crate::util::lock;
use crate::{Error, Result};

/// Where the client stands with respect to its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// No connection; the next call will establish one.
    NotConnected,
    /// A connection is up.
    Connected,
    /// The transport failed; the next call will retry from scratch.
    Failed,
}

/// Client construction parameters.
pub struct ClientConfig {
    /// The transport used to reach the server.
    pub transport: Arc<dyn ClientTransport>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig").finish_non_exhaustive()
    }
}

struct ClientState {
    status: ConnectionStatus,
    connection: Option<Arc<dyn Connection>>,
    middleware: Vec<Middleware>,
    next_request_id: u64,
    requests: HashMap<u64, SyncSender<Reader>>,
    streams: HashMap<u64, Arc<Stream>>,
}

struct ClientShared {
    transport: Arc<dyn ClientTransport>,
    state: Mutex<ClientState>,
}

/// An RPC client multiplexing concurrent calls over one connection.
///
/// Cheap to share: all state lives behind one mutex. Connecting is lazy:
/// the first call (or an explicit [`connect`](Client::connect)) establishes
/// the link, and a failed client reconnects on its next call.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// A client over the given transport. Request IDs are seeded with a
    /// random value so that IDs from successive processes don't collide.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                transport: config.transport,
                state: Mutex::new(ClientState {
                    status: ConnectionStatus::NotConnected,
                    connection: None,
                    middleware: Vec::new(),
                    next_request_id: rand::thread_rng().gen(),
                    requests: HashMap::new(),
                    streams: HashMap::new(),
                }),
            }),
        }
    }

    /// Establish the connection now. Idempotent while connected.
    pub fn connect(&self) -> Result<()> {
        let mut state = lock(&self.shared.state);
        connect_locked(&self.shared, &mut state)
    }

    /// Close the connection. Pending requests complete with
    /// [`ConnectionClosed`](Error::ConnectionClosed) and open streams close.
    pub fn disconnect(&self) -> Result<()> {
        let connection = {
            let mut state = lock(&self.shared.state);
            fail_pending_locked(&mut state, &Error::ConnectionClosed);
            close_streams_locked(&mut state, &Error::StreamClosed);
            state.status = ConnectionStatus::NotConnected;
            state.connection.take()
        };
        // The close callback re-enters our state lock; close outside it.
        match connection {
            Some(conn) => conn.close(),
            None => Ok(()),
        }
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        lock(&self.shared.state).status
    }

    /// Append an interceptor to the client's middleware list. Generated
    /// stubs apply the list, outermost first, around each call.
    pub fn add_middleware(&self, middleware: Middleware) {
        lock(&self.shared.state).middleware.push(middleware);
    }

    /// A snapshot of the middleware list.
    #[must_use]
    pub fn middleware(&self) -> Vec<Middleware> {
        lock(&self.shared.state).middleware.clone()
    }

    /// Invoke `methodID` on `serviceID` with `msg`, waiting for the response
    /// (bounded by the context deadline if set). On success the returned
    /// reader is positioned at the response composite.
    pub fn call<T: Codec>(
        &self,
        ctx: &Context,
        service_id: u64,
        method_id: u64,
        msg: &T,
    ) -> Result<Reader> {
        let (rx, request_id) = self.send_message(ctx, service_id, method_id, msg)?;
        let reader = self.wait_response(ctx, request_id, &rx)?;
        frame::read_response(reader)
    }

    /// Open a bidirectional stream by invoking a stream-open method. The
    /// response payload carries the server-assigned stream ID.
    pub fn open_stream<T: Codec>(
        &self,
        ctx: &Context,
        service_id: u64,
        method_id: u64,
        msg: &T,
    ) -> Result<Arc<Stream>> {
        let mut reader = self.call(ctx, service_id, method_id, msg)?;
        let stream_id = u64::deserialize(&mut reader)?;

        let mut state = lock(&self.shared.state);
        let connection = state.connection.clone().ok_or(Error::NotConnected)?;
        let stream = Stream::new(stream_id, connection);
        let _ = state.streams.insert(stream_id, Arc::clone(&stream));
        debug!("opened stream {stream_id}");
        Ok(stream)
    }

    fn send_message<T: Codec>(
        &self,
        ctx: &Context,
        service_id: u64,
        method_id: u64,
        msg: &T,
    ) -> Result<(Receiver<Reader>, u64)> {
        let mut state = lock(&self.shared.state);
        connect_locked(&self.shared, &mut state)?;

        let request_id = state.next_request_id;
        state.next_request_id = state.next_request_id.wrapping_add(1);

        let data = frame::encode_request(ctx, request_id, service_id, method_id, msg);
        let (tx, rx) = mpsc::sync_channel(1);
        let _ = state.requests.insert(request_id, tx);

        let connection = state.connection.clone().ok_or(Error::NotConnected)?;
        if let Err(e) = connection.send(&data) {
            let _ = state.requests.remove(&request_id);
            return Err(e);
        }
        trace!("request {request_id} -> service {service_id:#x} method {method_id}");
        Ok((rx, request_id))
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
                        // Forget the request; if its response turns up later
                        // the demux path drops it.
                        let _ = lock(&self.shared.state).requests.remove(&request_id);
                        Err(Error::DeadlineExceeded)
                    }
                    Err(RecvTimeoutError::Disconnected) => Err(Error::ConnectionClosed),
                }
            }
            None => rx.recv().map_err(|_| Error::ConnectionClosed),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.disconnect();
        self.shared.transport.shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn connect_locked(shared: &Arc<ClientShared>, state: &mut ClientState) -> Result<()> {
    if state.status == ConnectionStatus::Connected {
        return Ok(());
    }

    let connection = shared.transport.connect().inspect_err(|_| {
        state.status = ConnectionStatus::Failed;
    })?;

    let weak = Arc::downgrade(shared);
    connection.set_fail_handler(Box::new({
        let weak = Weak::clone(&weak);
        move |err| {
            if let Some(shared) = weak.upgrade() {
                on_transport_fail(&shared, &err);
            }
        }
    }));
    connection.set_close_handler(Box::new({
        let weak = Weak::clone(&weak);
        move || {
            if let Some(shared) = weak.upgrade() {
                on_transport_close(&shared);
            }
        }
    }));
    connection.set_message_handler(Box::new(move |data| {
        if let Some(shared) = weak.upgrade() {
            on_message(&shared, data);
        }
    }));

    state.connection = Some(connection);
    state.status = ConnectionStatus::Connected;
    debug!("connected");
    Ok(())
}

fn on_transport_fail(shared: &Arc<ClientShared>, err: &Error) {
    let mut state = lock(&shared.state);
    state.status = ConnectionStatus::Failed;
    state.connection = None;
    fail_pending_locked(&mut state, err);
    close_streams_locked(&mut state, err);
}

fn on_transport_close(shared: &Arc<ClientShared>) {
    let mut state = lock(&shared.state);
    state.status = ConnectionStatus::NotConnected;
    state.connection = None;
    fail_pending_locked(&mut state, &Error::ConnectionClosed);
    close_streams_locked(&mut state, &Error::StreamClosed);
}

// Complete every pending request with an ERROR body carrying `err`.
fn fail_pending_locked(state: &mut ClientState, err: &Error) {
    if state.requests.is_empty() {
        return;
    }
    debug!("failing {} pending request(s): {err}", state.requests.len());
    let body: Bytes = frame::encode_error_body(err).into();
    for (_, tx) in state.requests.drain() {
        let _ = tx.try_send(Reader::new(body.clone()));
    }
}

fn close_streams_locked(state: &mut ClientState, err: &Error) {
    for (_, stream) in state.streams.drain() {
        stream.handle_close(err);
    }
}

// Transport callback: demultiplex one inbound frame by its prefix.
fn on_message(shared: &Arc<ClientShared>, data: Bytes) {
    let mut reader = Reader::new(data);
    let Ok(prefix) = frame::read_prefix(&mut reader) else {
        protocol_violation(shared, "truncated frame prefix");
        return;
    };
    let result = match prefix {
        frame::RESPONSE_PREFIX => handle_response(shared, reader),
        frame::STREAM_RESPONSE_PREFIX => handle_stream_response(shared, reader),
        frame::STREAM_MESSAGE_PREFIX => handle_stream_message(shared, reader),
        frame::STREAM_CLOSE_PREFIX => handle_stream_close(shared, reader),
        _ => Err(Error::InvalidPrefix),
    };
    if let Err(e) = result {
        protocol_violation(shared, &e.to_string());
    }
}

fn handle_response(shared: &Arc<ClientShared>, mut reader: Reader) -> Result<()> {
    let request_id = u64::deserialize(&mut reader)?;
    let sender = lock(&shared.state).requests.remove(&request_id);
    match sender {
        Some(tx) => {
            let _ = tx.try_send(reader);
        }
        // Deadline expiry removes entries; a late response is dropped and
        // the connection kept alive.
        None => warn!("dropping response for unknown request {request_id}"),
    }
    Ok(())
}

fn handle_stream_response(shared: &Arc<ClientShared>, mut reader: Reader) -> Result<()> {
    let stream_id = u64::deserialize(&mut reader)?;
    let request_id = u64::deserialize(&mut reader)?;
    let stream = lock(&shared.state).streams.get(&stream_id).cloned();
    match stream {
        Some(stream) => stream.handle_response(request_id, reader),
        None => warn!("dropping response on unknown stream {stream_id}"),
    }
    Ok(())
}

fn handle_stream_message(shared: &Arc<ClientShared>, mut reader: Reader) -> Result<()> {
    let stream_id = u64::deserialize(&mut reader)?;
    let request_id = u64::deserialize(&mut reader)?;
    let method_id = u64::deserialize(&mut reader)?;
    let stream = lock(&shared.state).streams.get(&stream_id).cloned();
    match stream {
        Some(stream) => Stream::dispatch_inbound(&stream, request_id, method_id, reader),
        None => warn!("dropping message on unknown stream {stream_id}"),
    }
    Ok(())
}

fn handle_stream_close(shared: &Arc<ClientShared>, mut reader: Reader) -> Result<()> {
    let stream_id = u64::deserialize(&mut reader)?;
    let stream = lock(&shared.state).streams.remove(&stream_id);
    if let Some(stream) = stream {
        stream.handle_close(&Error::StreamClosed);
    }
    Ok(())
}

// A malformed frame means the connection's framing can't be trusted.
fn protocol_violation(shared: &Arc<ClientShared>, what: &str) {
    warn!("protocol violation, dropping connection: {what}");
    let connection = {
        let mut state = lock(&shared.state);
        fail_pending_locked(&mut state, &Error::ConnectionClosed);
        close_streams_locked(&mut state, &Error::StreamClosed);
        state.status = ConnectionStatus::NotConnected;
        state.connection.take()
    };
    if let Some(conn) = connection {
        let _ = conn.close();
    }
}
