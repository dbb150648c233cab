//! End-to-end request/response over the TCP transport.
// (c) 2025 Ross Younger

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bitrpc::transport::tcp::{TcpClientTransport, TcpServerTransport};
use bitrpc::{
    Client, ClientConfig, ConnectionStatus, Context, Error, Server, ServerConfig,
};
use common::{
    init_tracing, register_ping_pong_server, PingPongClient, PingPongService, PingRequest,
    PongResponse,
};
use pretty_assertions::assert_eq;

/// Echo service: responds with count + 1, optionally slow, and records any
/// `note` context key it sees.
struct EchoService {
    delay: Duration,
    calls: AtomicU32,
    notes: Mutex<Vec<String>>,
}

impl EchoService {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicU32::new(0),
            notes: Mutex::new(Vec::new()),
        })
    }
}

impl PingPongService for EchoService {
    fn ping(&self, ctx: &Context, req: PingRequest) -> Result<PongResponse, Error> {
        let _ = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(note) = ctx.get::<String>("note") {
            self.notes.lock().unwrap().push(note);
        }
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        Ok(PongResponse {
            count: req.count + 1,
        })
    }
}

struct Fixture {
    server: Server,
    client: Arc<Client>,
}

fn start(service: Arc<dyn PingPongService>) -> Fixture {
    init_tracing();
    let transport = Arc::new(TcpServerTransport::new("127.0.0.1:0"));
    let server = Server::new(ServerConfig {
        transport: Arc::clone(&transport) as _,
    });
    register_ping_pong_server(&server, service).unwrap();
    server.run().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Arc::new(Client::new(ClientConfig {
        transport: Arc::new(TcpClientTransport::new(addr.to_string())),
    }));
    Fixture { server, client }
}

#[test]
fn ping_increments() -> anyhow::Result<()> {
    let fixture = start(EchoService::new(Duration::ZERO));
    let stub = PingPongClient::new(Arc::clone(&fixture.client));

    let resp = stub.ping(&Context::background(), &PingRequest { count: 7 })?;
    assert_eq!(resp.count, 8);

    fixture.server.shutdown();
    Ok(())
}

#[test]
fn context_values_reach_the_handler() -> anyhow::Result<()> {
    let service = EchoService::new(Duration::ZERO);
    let fixture = start(service.clone());
    let stub = PingPongClient::new(Arc::clone(&fixture.client));

    let mut ctx = Context::background();
    ctx.put_str("note", "from the client");
    let _ = stub.ping(&ctx, &PingRequest { count: 1 })?;

    assert_eq!(
        *service.notes.lock().unwrap(),
        vec!["from the client".to_string()]
    );
    fixture.server.shutdown();
    Ok(())
}

#[test]
fn deadline_expires_and_connection_survives() {
    let fixture = start(EchoService::new(Duration::from_millis(200)));
    let stub = PingPongClient::new(Arc::clone(&fixture.client));

    let mut ctx = Context::background();
    ctx.set_deadline(Instant::now() + Duration::from_millis(50));
    let started = Instant::now();
    let err = stub.ping(&ctx, &PingRequest { count: 7 }).unwrap_err();
    assert_eq!(err, Error::DeadlineExceeded);
    assert!(started.elapsed() < Duration::from_millis(150));

    // The late response must not corrupt a subsequent call.
    thread::sleep(Duration::from_millis(250));
    assert_eq!(fixture.client.status(), ConnectionStatus::Connected);
    let resp = stub
        .ping(&Context::background(), &PingRequest { count: 41 })
        .unwrap();
    assert_eq!(resp.count, 42);

    fixture.server.shutdown();
}

#[test]
fn concurrent_clients_see_their_own_responses() {
    let fixture = start(EchoService::new(Duration::ZERO));

    const THREADS: u32 = 8;
    const REQUESTS: u32 = 25;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let client = Arc::clone(&fixture.client);
        handles.push(thread::spawn(move || {
            let stub = PingPongClient::new(client);
            for k in 0..REQUESTS {
                let count = t * 1000 + k;
                let resp = stub
                    .ping(&Context::background(), &PingRequest { count })
                    .unwrap();
                assert_eq!(resp.count, count + 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    fixture.server.shutdown();
}

#[test]
fn unknown_service_is_reported_not_fatal() {
    let fixture = start(EchoService::new(Duration::ZERO));

    let err = fixture
        .client
        .call(&Context::background(), 0xDEAD, 1, &PingRequest { count: 0 })
        .unwrap_err();
    assert_eq!(err, Error::Remote("Service not found".into()));

    // The connection is still good.
    let stub = PingPongClient::new(Arc::clone(&fixture.client));
    let resp = stub
        .ping(&Context::background(), &PingRequest { count: 1 })
        .unwrap();
    assert_eq!(resp.count, 2);

    fixture.server.shutdown();
}

struct FailingService;

impl PingPongService for FailingService {
    fn ping(&self, _ctx: &Context, req: PingRequest) -> Result<PongResponse, Error> {
        match req.count {
            0 => Err(Error::Remote("no zeros today".into())),
            1 => panic!("handler exploded"),
            n => Ok(PongResponse { count: n + 1 }),
        }
    }
}

#[test]
fn handler_errors_and_panics_become_error_responses() {
    let fixture = start(Arc::new(FailingService));
    let stub = PingPongClient::new(Arc::clone(&fixture.client));

    let err = stub
        .ping(&Context::background(), &PingRequest { count: 0 })
        .unwrap_err();
    assert_eq!(err, Error::Remote("no zeros today".into()));

    let err = stub
        .ping(&Context::background(), &PingRequest { count: 1 })
        .unwrap_err();
    assert_eq!(err, Error::Remote("handler exploded".into()));

    // The server is still dispatching.
    let resp = stub
        .ping(&Context::background(), &PingRequest { count: 5 })
        .unwrap();
    assert_eq!(resp.count, 6);

    fixture.server.shutdown();
}

#[test]
fn middleware_runs_outermost_first_on_both_sides() {
    init_tracing();
    let log: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let trace = |label: &'static str, log: &Arc<Mutex<Vec<String>>>| -> bitrpc::middleware::Middleware {
        let log = Arc::clone(log);
        Arc::new(move |ctx, req, next| {
            log.lock().unwrap().push(label.to_string());
            next(ctx, req)
        })
    };

    let transport = Arc::new(TcpServerTransport::new("127.0.0.1:0"));
    let server = Server::new(ServerConfig {
        transport: Arc::clone(&transport) as _,
    });
    server.add_middleware(trace("server-root", &log));
    server.group(|s| {
        s.add_middleware(trace("server-group", &log));
        register_ping_pong_server(s, EchoService::new(Duration::ZERO)).unwrap();
    });
    server.run().unwrap();
    let addr = transport.local_addr().unwrap();

    let client = Arc::new(Client::new(ClientConfig {
        transport: Arc::new(TcpClientTransport::new(addr.to_string())),
    }));
    client.add_middleware(trace("client", &log));

    let stub = PingPongClient::new(Arc::clone(&client));
    let resp = stub
        .ping(&Context::background(), &PingRequest { count: 9 })
        .unwrap();
    assert_eq!(resp.count, 10);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "client".to_string(),
            "server-root".to_string(),
            "server-group".to_string()
        ]
    );

    server.shutdown();
}

#[test]
fn duplicate_registration_fails() {
    let transport = Arc::new(TcpServerTransport::new("127.0.0.1:0"));
    let server = Server::new(ServerConfig { transport });
    register_ping_pong_server(&server, EchoService::new(Duration::ZERO)).unwrap();
    let err =
        register_ping_pong_server(&server, EchoService::new(Duration::ZERO)).unwrap_err();
    assert_eq!(err, Error::DuplicateService(common::PING_PONG_SERVICE_ID));
}

#[test]
fn graceful_shutdown_completes_waiters_and_stops_accepting() {
    let fixture = start(EchoService::new(Duration::ZERO));
    let stub = PingPongClient::new(Arc::clone(&fixture.client));

    // Prove the connection is up, then take the server down.
    let _ = stub
        .ping(&Context::background(), &PingRequest { count: 1 })
        .unwrap();
    assert!(fixture.server.is_running());
    fixture.server.shutdown();
    assert!(!fixture.server.is_running());

    // The client observes an orderly close; a new call attempts to
    // reconnect and finds nobody listening.
    thread::sleep(Duration::from_millis(100));
    let err = stub
        .ping(&Context::background(), &PingRequest { count: 1 })
        .unwrap_err();
    assert!(
        matches!(
            err,
            Error::ConnectionFailed(_) | Error::ConnectionClosed | Error::Io(_)
        ),
        "{err:?}"
    );
}

#[test]
fn shutdown_mid_call_lets_the_handler_finish_or_fails_the_waiter() {
    let fixture = start(EchoService::new(Duration::from_millis(500)));
    let client = Arc::clone(&fixture.client);

    // Make sure the request is in flight before shutting down.
    let call = thread::spawn(move || {
        let stub = PingPongClient::new(client);
        stub.ping(&Context::background(), &PingRequest { count: 1 })
    });
    thread::sleep(Duration::from_millis(100));
    fixture.server.shutdown();

    // Shutdown lets dispatched handlers run to completion, so the waiter
    // either gets its answer or a connection error, never a hang.
    match call.join().unwrap() {
        Ok(resp) => assert_eq!(resp.count, 2),
        Err(err) => assert!(
            matches!(
                err,
                Error::ConnectionClosed | Error::ConnectionFailed(_) | Error::Remote(_)
            ),
            "{err:?}"
        ),
    }
}
