//! Per-connection server state: the transport link, a closed flag, and the
//! streams opened over it.
// (c) 2025 Ross Younger

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::stream::Stream;
use crate::transport::Connection;
use crate::util::lock;
use crate::{Error, Result};

pub(crate) struct ServerConnection {
    id: u64,
    connection: Arc<dyn Connection>,
    closed: Mutex<bool>,
    streams: Mutex<HashMap<u64, Arc<Stream>>>,
}

impl ServerConnection {
    pub(crate) fn new(id: u64, connection: Arc<dyn Connection>) -> Self {
        Self {
            id,
            connection,
            closed: Mutex::new(false),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn send(&self, data: &[u8]) -> Result<()> {
        if *lock(&self.closed) {
            return Err(Error::ConnectionClosed);
        }
        self.connection.send(data)
    }

    /// The raw transport connection, for streams that outlive this call.
    pub(crate) fn raw(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.connection)
    }

    pub(crate) fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    /// Mark closed and shut everything down. Streams on the connection are
    /// closed with the given reason. Idempotent.
    pub(crate) fn close(&self, reason: &Error) {
        {
            let mut closed = lock(&self.closed);
            if *closed {
                return;
            }
            *closed = true;
        }
        let streams: Vec<_> = lock(&self.streams).drain().map(|(_, s)| s).collect();
        for stream in streams {
            stream.handle_close(reason);
        }
        let _ = self.connection.close();
    }

    pub(crate) fn register_stream(&self, stream: Arc<Stream>) {
        let _ = lock(&self.streams).insert(stream.id(), stream);
    }

    pub(crate) fn stream(&self, stream_id: u64) -> Option<Arc<Stream>> {
        lock(&self.streams).get(&stream_id).cloned()
    }

    pub(crate) fn remove_stream(&self, stream_id: u64) -> Option<Arc<Stream>> {
        lock(&self.streams).remove(&stream_id)
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
