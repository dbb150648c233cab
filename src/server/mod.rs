// (c) 2025 Ross Younger

//! The server core: accept loop, message queue, service registry and
//! dispatch.
//!
//! [`Server::run`] drives everything from one background thread: poll the
//! transport, accept pending connections, drain the message queue (handlers
//! run on this thread), prune closed connections, sleep a millisecond.
//! Transport callbacks do no work beyond queueing: they capture only a
//! connection ID and look the connection up under the server lock, so a
//! connection that has been pruned simply stops receiving deliveries.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tracing::{debug, info, trace, warn};

use crate::middleware::Middleware;
use crate::protocol::{frame, Codec, Context, Reader};
use crate::stream::Stream;
use crate::transport::ServerTransport;
use crate::util::{lock, panic_text};
use crate::{Error, Result};

mod connection;
mod group;

use connection::ServerConnection;
pub use group::{ServiceHandler, StreamOpenHandler};
use group::{RegisteredService, ServiceRegistry};

/// Server construction parameters.
pub struct ServerConfig {
    /// The transport to listen on.
    pub transport: Arc<dyn ServerTransport>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig").finish_non_exhaustive()
    }
}

struct ServerState {
    connections: HashMap<u64, Arc<ServerConnection>>,
    next_connection_id: u64,
    next_stream_id: u64,
    queue: VecDeque<PendingMessage>,
    registry: ServiceRegistry,
}

struct PendingMessage {
    connection_id: u64,
    data: Bytes,
}

struct ServerShared {
    transport: Arc<dyn ServerTransport>,
    running: AtomicBool,
    state: Mutex<ServerState>,
}

/// An RPC server: a registry of services dispatched from a background loop.
pub struct Server {
    shared: Arc<ServerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// A server over the given transport. Call
    /// [`register_service`](Self::register_service) /
    /// [`register_stream_service`](Self::register_stream_service) before
    /// [`run`](Self::run).
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                transport: config.transport,
                running: AtomicBool::new(false),
                state: Mutex::new(ServerState {
                    connections: HashMap::new(),
                    next_connection_id: 1,
                    next_stream_id: rand::thread_rng().gen(),
                    queue: VecDeque::new(),
                    registry: ServiceRegistry::new(),
                }),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Bind a unary service handler to `service_id` within the active group.
    pub fn register_service(
        &self,
        service_id: u64,
        name: &str,
        handler: ServiceHandler,
    ) -> Result<()> {
        debug!("registering service {name} ({service_id:#x})");
        lock(&self.shared.state)
            .registry
            .register(service_id, RegisteredService::Unary(handler))
    }

    /// Bind a stream-open handler to `service_id` within the active group.
    pub fn register_stream_service(
        &self,
        service_id: u64,
        name: &str,
        handler: StreamOpenHandler,
    ) -> Result<()> {
        debug!("registering stream service {name} ({service_id:#x})");
        lock(&self.shared.state)
            .registry
            .register(service_id, RegisteredService::StreamOpen(handler))
    }

    /// Append an interceptor to the active group's middleware list.
    pub fn add_middleware(&self, middleware: Middleware) {
        lock(&self.shared.state).registry.add_middleware(middleware);
    }

    /// Run `f` with a fresh child group active: services and middleware it
    /// registers belong to the child, and the child inherits this group's
    /// middleware, outermost first.
    pub fn group(&self, f: impl FnOnce(&Self)) {
        lock(&self.shared.state).registry.enter_group();
        f(self);
        lock(&self.shared.state).registry.exit_group();
    }

    /// Start listening and spawn the background loop. Non-blocking.
    pub fn run(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::ConnectionFailed("server is already running".into()));
        }
        if let Err(e) = self.shared.transport.listen() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("bitrpc-server".into())
            .spawn(move || {
                info!("server loop started");
                while shared.running.load(Ordering::SeqCst) {
                    shared.transport.poll();
                    accept_new(&shared);
                    process_messages(&shared);
                    prune_closed(&shared);
                    thread::sleep(Duration::from_millis(1));
                }
                info!("server loop stopped");
            })?;
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    /// Whether the background loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop the loop, close the listener, then close every connection.
    /// Handlers already dispatched run to completion first.
    pub fn shutdown(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            let _ = self.shared.transport.close();
        }
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }

        // Close connections outside the lock: their close callbacks re-enter
        // server state.
        let connections: Vec<_> = {
            let mut state = lock(&self.shared.state);
            state.queue.clear();
            state.connections.drain().map(|(_, conn)| conn).collect()
        };
        for conn in connections {
            conn.close(&Error::ConnectionClosed);
        }
        debug!("server shutdown complete");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn accept_new(shared: &Arc<ServerShared>) {
    loop {
        let connection = match shared.transport.accept() {
            Ok(Some(conn)) => conn,
            Ok(None) => return,
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        };

        let id = {
            let mut state = lock(&shared.state);
            let id = state.next_connection_id;
            state.next_connection_id += 1;
            let _ = state
                .connections
                .insert(id, Arc::new(ServerConnection::new(id, Arc::clone(&connection))));
            id
        };

        // Callbacks carry only the connection ID; a pruned connection just
        // stops receiving deliveries.
        let weak = Arc::downgrade(shared);
        connection.set_close_handler(Box::new({
            let weak = Weak::clone(&weak);
            move || {
                if let Some(shared) = weak.upgrade() {
                    on_connection_gone(&shared, id, &Error::ConnectionClosed);
                }
            }
        }));
        connection.set_fail_handler(Box::new({
            let weak = Weak::clone(&weak);
            move |err| {
                if let Some(shared) = weak.upgrade() {
                    warn!("connection {id} failed: {err}");
                    on_connection_gone(&shared, id, &err);
                }
            }
        }));
        connection.set_message_handler(Box::new(move |data| {
            if let Some(shared) = weak.upgrade() {
                if shared.running.load(Ordering::SeqCst) {
                    lock(&shared.state)
                        .queue
                        .push_back(PendingMessage {
                            connection_id: id,
                            data,
                        });
                }
            }
        }));

        info!("client connected (id {id})");
    }
}

fn on_connection_gone(shared: &Arc<ServerShared>, id: u64, reason: &Error) {
    let conn = lock(&shared.state).connections.get(&id).cloned();
    if let Some(conn) = conn {
        conn.close(reason);
        info!("client disconnected (id {id})");
    }
}

fn process_messages(shared: &Arc<ServerShared>) {
    loop {
        let (conn, data) = {
            let mut state = lock(&shared.state);
            let Some(msg) = state.queue.pop_front() else {
                return;
            };
            // The connection may have been pruned since the message was
            // queued; skip delivery in that case.
            let Some(conn) = state.connections.get(&msg.connection_id).cloned() else {
                continue;
            };
            (conn, msg.data)
        };
        handle_message(shared, &conn, data);
    }
}

fn prune_closed(shared: &Arc<ServerShared>) {
    lock(&shared.state)
        .connections
        .retain(|_, conn| !conn.is_closed());
}

fn handle_message(shared: &Arc<ServerShared>, conn: &Arc<ServerConnection>, data: Bytes) {
    let mut reader = Reader::new(data);
    let Ok(prefix) = frame::read_prefix(&mut reader) else {
        warn!("connection {}: truncated frame, dropping connection", conn.id());
        conn.close(&Error::InsufficientData);
        return;
    };
    let result = match prefix {
        frame::REQUEST_PREFIX => handle_request(shared, conn, reader),
        frame::STREAM_MESSAGE_PREFIX => handle_stream_message(conn, reader),
        frame::STREAM_RESPONSE_PREFIX => handle_stream_response(conn, reader),
        frame::STREAM_CLOSE_PREFIX => handle_stream_close(conn, reader),
        _ => Err(Error::InvalidPrefix),
    };
    if let Err(e) = result {
        // Broken framing; the connection can't be trusted any further.
        warn!("connection {}: {e}, dropping connection", conn.id());
        conn.close(&e);
    }
}

fn handle_request(
    shared: &Arc<ServerShared>,
    conn: &Arc<ServerConnection>,
    mut reader: Reader,
) -> Result<()> {
    let ctx = Context::deserialize(&mut reader)?;
    let request_id = u64::deserialize(&mut reader)?;
    let service_id = u64::deserialize(&mut reader)?;
    trace!(
        "connection {}: request {request_id} for service {service_id:#x}",
        conn.id()
    );

    let lookup = lock(&shared.state).registry.lookup(service_id);
    let Some((service, middleware)) = lookup else {
        debug!("service {service_id:#x} not found");
        let _ = conn.send(&frame::respond_with_error(request_id, &Error::ServiceNotFound));
        return Ok(());
    };

    match service {
        RegisteredService::Unary(handler) => {
            let response = catch_unwind(AssertUnwindSafe(|| {
                handler(ctx, &middleware, request_id, reader)
            }))
            .unwrap_or_else(|panic| {
                warn!("handler for service {service_id:#x} panicked");
                frame::respond_with_error(request_id, &Error::Remote(panic_text(&panic)))
            });
            let _ = conn.send(&response);
        }
        RegisteredService::StreamOpen(open) => {
            let stream_id = {
                let mut state = lock(&shared.state);
                let id = state.next_stream_id;
                state.next_stream_id = state.next_stream_id.wrapping_add(1);
                id
            };
            let stream = Stream::new(stream_id, conn.raw());
            let opened = catch_unwind(AssertUnwindSafe(|| open(&ctx, &stream, &mut reader)))
                .unwrap_or_else(|panic| {
                    warn!("stream-open handler for service {service_id:#x} panicked");
                    Err(Error::Remote(panic_text(&panic)))
                });
            match opened {
                Ok(handler) => {
                    stream.set_handler(handler);
                    conn.register_stream(stream);
                    debug!("connection {}: stream {stream_id} opened", conn.id());
                    let _ = conn.send(&frame::respond_with_message(request_id, &stream_id));
                }
                Err(e) => {
                    let _ = conn.send(&frame::respond_with_error(request_id, &e));
                }
            }
        }
    }
    Ok(())
}

fn handle_stream_message(conn: &Arc<ServerConnection>, mut reader: Reader) -> Result<()> {
    let stream_id = u64::deserialize(&mut reader)?;
    let request_id = u64::deserialize(&mut reader)?;
    let method_id = u64::deserialize(&mut reader)?;
    match conn.stream(stream_id) {
        Some(stream) => Stream::dispatch_inbound(&stream, request_id, method_id, reader),
        None => warn!(
            "connection {}: message on unknown stream {stream_id}",
            conn.id()
        ),
    }
    Ok(())
}

fn handle_stream_response(conn: &Arc<ServerConnection>, mut reader: Reader) -> Result<()> {
    let stream_id = u64::deserialize(&mut reader)?;
    let request_id = u64::deserialize(&mut reader)?;
    match conn.stream(stream_id) {
        Some(stream) => stream.handle_response(request_id, reader),
        None => warn!(
            "connection {}: response on unknown stream {stream_id}",
            conn.id()
        ),
    }
    Ok(())
}

fn handle_stream_close(conn: &Arc<ServerConnection>, mut reader: Reader) -> Result<()> {
    let stream_id = u64::deserialize(&mut reader)?;
    if let Some(stream) = conn.remove_stream(stream_id) {
        stream.handle_close(&Error::StreamClosed);
    }
    Ok(())
}
