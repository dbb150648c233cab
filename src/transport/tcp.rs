//! TCP stream-socket transport.
// (c) 2025 Ross Younger

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::transport::framed::FramedConnection;
use crate::transport::{ClientTransport, Connection, ServerTransport};
use crate::util::lock;
use crate::{Error, Result};

fn wrap_stream(stream: TcpStream, peer: String) -> Result<Arc<dyn Connection>> {
    stream.set_nodelay(true)?;
    let write_half = stream.try_clone()?;
    let shutdown_half = stream.try_clone()?;
    Ok(FramedConnection::spawn(
        stream,
        write_half,
        move || shutdown_half.shutdown(std::net::Shutdown::Both),
        peer,
    ))
}

/// Connects to one TCP endpoint.
#[derive(Debug)]
pub struct TcpClientTransport {
    addr: String,
    connections: Mutex<Vec<Weak<dyn Connection>>>,
}

impl TcpClientTransport {
    /// A transport that will connect to `addr` (any `host:port` form).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl ClientTransport for TcpClientTransport {
    fn connect(&self) -> Result<Arc<dyn Connection>> {
        let stream = TcpStream::connect(&self.addr)
            .map_err(|e| Error::ConnectionFailed(format!("{}: {e}", self.addr)))?;
        let conn = wrap_stream(stream, self.addr.clone())?;
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

/// Listens on one TCP endpoint.
#[derive(Debug)]
pub struct TcpServerTransport {
    addr: String,
    listener: Mutex<Option<TcpListener>>,
}

impl TcpServerTransport {
    /// A transport that will listen on `addr`. Use port 0 for an ephemeral
    /// port and recover it with [`local_addr`](Self::local_addr).
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            listener: Mutex::new(None),
        }
    }

    /// The bound address, once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.listener)
            .as_ref()
            .and_then(|l| l.local_addr().ok())
    }
}

impl ServerTransport for TcpServerTransport {
    fn listen(&self) -> Result<()> {
        let mut guard = lock(&self.listener);
        if guard.is_some() {
            return Err(Error::ConnectionFailed("already listening".into()));
        }
        let addr = self
            .addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::ConnectionFailed(format!("cannot resolve {}", self.addr)))?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        debug!("listening on {:?}", listener.local_addr());
        *guard = Some(listener);
        Ok(())
    }

    fn accept(&self) -> Result<Option<Arc<dyn Connection>>> {
        let guard = lock(&self.listener);
        let Some(listener) = guard.as_ref() else {
            return Ok(None);
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                Ok(Some(wrap_stream(stream, peer.to_string())?))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn poll(&self) {}

    fn close(&self) -> Result<()> {
        let _ = lock(&self.listener).take();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{TcpClientTransport, TcpServerTransport};
    use crate::transport::{ClientTransport, ServerTransport};
    use bytes::Bytes;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn messages_pass_whole_in_both_directions() {
        let server = TcpServerTransport::new("127.0.0.1:0");
        server.listen().unwrap();
        let addr = server.local_addr().unwrap();

        let client = TcpClientTransport::new(addr.to_string());
        let conn = client.connect().unwrap();
        let (tx, rx) = mpsc::channel::<Bytes>();
        conn.set_message_handler(Box::new(move |m| {
            let _ = tx.send(m);
        }));

        // The listener is non-blocking; spin briefly for the connection.
        let accepted = loop {
            if let Some(c) = server.accept().unwrap() {
                break c;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        let (stx, srx) = mpsc::channel::<Bytes>();
        accepted.set_message_handler(Box::new(move |m| {
            let _ = stx.send(m);
        }));

        conn.send(b"marco").unwrap();
        let got = srx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&got[..], b"marco");

        accepted.send(b"polo").unwrap();
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&got[..], b"polo");

        client.shutdown();
        server.close().unwrap();
    }

    #[test]
    fn orderly_close_fires_close_handler_once() {
        let server = TcpServerTransport::new("127.0.0.1:0");
        server.listen().unwrap();
        let addr = server.local_addr().unwrap();

        let client = TcpClientTransport::new(addr.to_string());
        let conn = client.connect().unwrap();
        let accepted = loop {
            if let Some(c) = server.accept().unwrap() {
                break c;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let (ctx_send, ctx_recv) = mpsc::channel::<&'static str>();
        let closed = ctx_send.clone();
        accepted.set_close_handler(Box::new(move || {
            let _ = closed.send("close");
        }));
        accepted.set_fail_handler(Box::new(move |_| {
            let _ = ctx_send.send("fail");
        }));

        conn.close().unwrap();
        assert_eq!(
            ctx_recv.recv_timeout(Duration::from_secs(2)).unwrap(),
            "close"
        );
        assert!(ctx_recv.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
