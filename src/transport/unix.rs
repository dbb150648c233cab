//! Unix-domain stream-socket transport.
// (c) 2025 Ross Younger

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::transport::framed::FramedConnection;
use crate::transport::{ClientTransport, Connection, ServerTransport};
use crate::util::lock;
use crate::{Error, Result};

fn wrap_stream(stream: UnixStream, peer: String) -> Result<Arc<dyn Connection>> {
    let write_half = stream.try_clone()?;
    let shutdown_half = stream.try_clone()?;
    Ok(FramedConnection::spawn(
        stream,
        write_half,
        move || shutdown_half.shutdown(std::net::Shutdown::Both),
        peer,
    ))
}

/// Connects to one Unix-domain socket.
#[derive(Debug)]
pub struct UnixClientTransport {
    path: PathBuf,
    connections: Mutex<Vec<Weak<dyn Connection>>>,
}

impl UnixClientTransport {
    /// A transport that will connect to the socket at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl ClientTransport for UnixClientTransport {
    fn connect(&self) -> Result<Arc<dyn Connection>> {
        let stream = UnixStream::connect(&self.path)
            .map_err(|e| Error::ConnectionFailed(format!("{}: {e}", self.path.display())))?;
        let conn = wrap_stream(stream, self.path.display().to_string())?;
        lock(&self.connections).push(Arc::downgrade(&conn));
        Ok(conn)
    }

    fn shutdown(&self) {
        for conn in lock(&self.connections).drain(..) {
            if let Some(conn) = conn.upgrade() {
                let _ = conn.close();
            }
        }
    }
}

/// Listens on one Unix-domain socket, removing the socket file on close.
#[derive(Debug)]
pub struct UnixServerTransport {
    path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
}

impl UnixServerTransport {
    /// A transport that will listen on the socket at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            listener: Mutex::new(None),
        }
    }
}

impl ServerTransport for UnixServerTransport {
    fn listen(&self) -> Result<()> {
        let mut guard = lock(&self.listener);
        if guard.is_some() {
            return Err(Error::ConnectionFailed("already listening".into()));
        }
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        listener.set_nonblocking(true)?;
        debug!("listening on {}", self.path.display());
        *guard = Some(listener);
        Ok(())
    }

    fn accept(&self) -> Result<Option<Arc<dyn Connection>>> {
        let guard = lock(&self.listener);
        let Some(listener) = guard.as_ref() else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(wrap_stream(
                    stream,
                    self.path.display().to_string(),
                )?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&self) {}

    fn close(&self) -> Result<()> {
        let _ = lock(&self.listener).take();
        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}
