//! Shared machinery for the stream-socket transports: 4-octet big-endian
//! length framing, a blocking reader thread per connection, and a
//! mutex-serialized write path.
// (c) 2025 Ross Younger

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::transport::{CloseHandler, Connection, FailHandler, MessageHandler};
use crate::util::lock;
use crate::{Error, Result};

/// Largest message we will accept from the wire. Guards allocation against
/// garbage or hostile length prefixes.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Default)]
struct Handlers {
    // Arc so deliveries can run without holding this lock.
    message: Option<Arc<MessageHandler>>,
    fail: Option<FailHandler>,
    close: Option<CloseHandler>,
    // Inbound messages that raced ahead of set_message_handler.
    pending: VecDeque<Bytes>,
}

/// A message-framed connection over any byte stream.
///
/// The read half is consumed by a spawned reader thread; the write half is
/// serialized through a mutex. `shutdown` must unblock the reader thread
/// (e.g. `TcpStream::shutdown`), which is how `close` takes effect.
pub(crate) struct FramedConnection<W> {
    peer: String,
    writer: Mutex<W>,
    shutdown: Box<dyn Fn() -> io::Result<()> + Send + Sync>,
    handlers: Mutex<Handlers>,
    closed: AtomicBool,
    hung_up: AtomicBool,
}

impl<W: Write + Send + 'static> FramedConnection<W> {
    pub(crate) fn spawn<R>(
        read: R,
        write: W,
        shutdown: impl Fn() -> io::Result<()> + Send + Sync + 'static,
        peer: String,
    ) -> Arc<Self>
    where
        R: Read + Send + 'static,
    {
        let conn = Arc::new(Self {
            peer,
            writer: Mutex::new(write),
            shutdown: Box::new(shutdown),
            handlers: Mutex::new(Handlers::default()),
            closed: AtomicBool::new(false),
            hung_up: AtomicBool::new(false),
        });

        let reader_conn = Arc::clone(&conn);
        let _ = thread::Builder::new()
            .name(format!("bitrpc-io {}", reader_conn.peer))
            .spawn(move || reader_conn.read_loop(read));

        conn
    }

    fn read_loop(&self, mut read: impl Read) {
        debug!("connection to {} up", self.peer);
        loop {
            let mut header = [0u8; 4];
            if let Err(e) = read.read_exact(&mut header) {
                // EOF at a frame boundary is the peer closing in an orderly
                // fashion; anything else is a failure.
                let orderly = e.kind() == io::ErrorKind::UnexpectedEof;
                self.hang_up(if orderly { None } else { Some(e) });
                return;
            }
            let len = u32::from_be_bytes(header);
            if len > MAX_MESSAGE_SIZE {
                self.hang_up(Some(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("inbound message of {len} bytes exceeds limit"),
                )));
                return;
            }
            let mut body = vec![0u8; len as usize];
            if let Err(e) = read.read_exact(&mut body) {
                self.hang_up(Some(e));
                return;
            }
            trace!("{} bytes in from {}", len, self.peer);
            self.deliver(Bytes::from(body));
        }
    }

    // The handler runs outside the handlers lock so it may freely take its
    // own locks (the client and server cores do).
    fn deliver(&self, data: Bytes) {
        let handler = lock(&self.handlers).message.clone();
        match handler {
            Some(handler) => handler(data),
            None => {
                let mut handlers = lock(&self.handlers);
                // Re-check: the handler may have landed in the meantime.
                if let Some(handler) = handlers.message.clone() {
                    drop(handlers);
                    handler(data);
                } else {
                    handlers.pending.push_back(data);
                }
            }
        }
    }

    // Fire exactly one of the close/fail callbacks, exactly once.
    fn hang_up(&self, error: Option<io::Error>) {
        if self.hung_up.swap(true, Ordering::SeqCst) {
            return;
        }
        let locally_closed = self.closed.load(Ordering::SeqCst);
        let (fail, close) = {
            let mut handlers = lock(&self.handlers);
            (handlers.fail.take(), handlers.close.take())
        };
        match error {
            Some(e) if !locally_closed => {
                warn!("connection to {} failed: {e}", self.peer);
                if let Some(handler) = fail {
                    handler(Error::ConnectionFailed(e.to_string()));
                }
            }
            _ => {
                debug!("connection to {} closed", self.peer);
                if let Some(handler) = close {
                    handler();
                }
            }
        }
    }
}

impl<W: Write + Send + 'static> Connection for FramedConnection<W> {
    fn send(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let len = u32::try_from(data.len())
            .map_err(|_| Error::InvalidEncoding("message too large to frame".into()))?;
        let mut writer = lock(&self.writer);
        writer.write_all(&len.to_be_bytes())?;
        writer.write_all(data)?;
        writer.flush()?;
        trace!("{} bytes out to {}", len, self.peer);
        Ok(())
    }

    fn set_message_handler(&self, handler: MessageHandler) {
        let handler = Arc::new(handler);
        let pending = {
            let mut handlers = lock(&self.handlers);
            handlers.message = Some(Arc::clone(&handler));
            std::mem::take(&mut handlers.pending)
        };
        for data in pending {
            handler(data);
        }
    }

    fn set_fail_handler(&self, handler: FailHandler) {
        lock(&self.handlers).fail = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        lock(&self.handlers).close = Some(handler);
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let res = (self.shutdown)();
        // Fire the close callback promptly rather than waiting for the
        // reader thread to notice the socket going away.
        self.hang_up(None);
        match res {
            Ok(()) => Ok(()),
            // The peer may have beaten us to it; that's still a close.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<W> std::fmt::Debug for FramedConnection<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedConnection")
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
