//! Shared test fixtures: hand-written versions of what the service code
//! generator would emit for a unary PingPong service and a streaming Chat
//! service, plus small helpers.
// (c) 2025 Ross Younger

#![allow(dead_code)]

use std::sync::Arc;

use bitrpc::middleware::{apply_chain, MiddlewareResult};
use bitrpc::protocol::frame;
use bitrpc::{impl_codec, Client, Codec, Context, Error, Message, Server, Stream, StreamHandler};

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// PingPong service (unary)

pub const PING_PONG_SERVICE_ID: u64 = 0x1001;
pub const PING_METHOD_ID: u64 = 1;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PingRequest {
    pub count: u32,
}
impl_codec!(PingRequest { count });

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PongResponse {
    pub count: u32,
}
impl_codec!(PongResponse { count });

pub trait PingPongService: Send + Sync {
    fn ping(&self, ctx: &Context, req: PingRequest) -> Result<PongResponse, Error>;
}

/// Server-side registration glue for PingPong.
pub fn register_ping_pong_server(
    server: &Server,
    service: Arc<dyn PingPongService>,
) -> Result<(), Error> {
    server.register_service(
        PING_PONG_SERVICE_ID,
        "PingPong",
        Arc::new(move |ctx, middleware, request_id, mut reader| {
            let method_id = match u64::deserialize(&mut reader) {
                Ok(m) => m,
                Err(e) => return frame::respond_with_error(request_id, &e),
            };
            match method_id {
                PING_METHOD_ID => {
                    let req = match PingRequest::deserialize(&mut reader) {
                        Ok(r) => r,
                        Err(e) => return frame::respond_with_error(request_id, &e),
                    };
                    let service = Arc::clone(&service);
                    let terminal = move |ctx: &mut Context, req: &dyn Message| -> MiddlewareResult {
                        let req = req
                            .as_any()
                            .downcast_ref::<PingRequest>()
                            .expect("request type");
                        service
                            .ping(ctx, req.clone())
                            .map(|resp| Box::new(resp) as Box<dyn Message>)
                    };
                    let mut ctx = ctx;
                    match apply_chain(&mut ctx, &req, middleware, &terminal) {
                        Ok(resp) => match resp.as_any().downcast_ref::<PongResponse>() {
                            Some(resp) => frame::respond_with_message(request_id, resp),
                            None => frame::respond_with_error(
                                request_id,
                                &Error::InvalidEncoding("unexpected response type".into()),
                            ),
                        },
                        Err(e) => frame::respond_with_error(request_id, &e),
                    }
                }
                other => frame::respond_with_error(
                    request_id,
                    &Error::Remote(format!("Method {other} not found")),
                ),
            }
        }),
    )
}

/// Client-side stub for PingPong.
pub struct PingPongClient {
    client: Arc<Client>,
}

impl PingPongClient {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    pub fn ping(&self, ctx: &Context, req: &PingRequest) -> Result<PongResponse, Error> {
        let middleware = self.client.middleware();
        let client = Arc::clone(&self.client);
        let terminal = move |ctx: &mut Context, req: &dyn Message| -> MiddlewareResult {
            let req = req
                .as_any()
                .downcast_ref::<PingRequest>()
                .expect("request type");
            let mut reader = client.call(ctx, PING_PONG_SERVICE_ID, PING_METHOD_ID, req)?;
            Ok(Box::new(PongResponse::deserialize(&mut reader)?))
        };
        let mut ctx = ctx.clone();
        let resp = apply_chain(&mut ctx, req, &middleware, &terminal)?;
        resp.as_any()
            .downcast_ref::<PongResponse>()
            .cloned()
            .ok_or_else(|| Error::InvalidEncoding("unexpected response type".into()))
    }
}

// ---------------------------------------------------------------------------
// Chat service (streaming)

pub const CHAT_SERVICE_ID: u64 = 0x2001;
pub const OPEN_CHAT_METHOD_ID: u64 = 1;
pub const SEND_MESSAGE_METHOD_ID: u64 = 2;
pub const NOTIFY_METHOD_ID: u64 = 3;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Empty {}
impl_codec!(Empty {});

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatMessage {
    pub text: String,
}
impl_codec!(ChatMessage { text });

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatResponse {
    pub status: String,
    pub message_id: u32,
}
impl_codec!(ChatResponse { status, message_id });

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ServerNotification {
    pub message: String,
    pub kind: String,
}
impl_codec!(ServerNotification { message, kind });

/// Server-side chat: the user implements stream acceptance plus the
/// per-message callback.
pub trait ChatService: Send + Sync {
    fn open_chat(
        &self,
        ctx: &Context,
        stream: &Arc<Stream>,
    ) -> Result<Arc<dyn ChatStreamServerHandler>, Error>;
}

pub trait ChatStreamServerHandler: Send + Sync {
    fn handle_send_message(
        &self,
        stream: &Arc<Stream>,
        req: ChatMessage,
    ) -> Result<ChatResponse, Error>;
}

struct ChatStreamGlue {
    inner: Arc<dyn ChatStreamServerHandler>,
}

impl StreamHandler for ChatStreamGlue {
    fn handle(
        &self,
        stream: &Arc<Stream>,
        request_id: u64,
        method_id: u64,
        mut reader: bitrpc::Reader,
    ) -> Vec<u8> {
        match method_id {
            SEND_MESSAGE_METHOD_ID => {
                let req = match ChatMessage::deserialize(&mut reader) {
                    Ok(r) => r,
                    Err(e) => {
                        return frame::stream_respond_with_error(stream.id(), request_id, &e)
                    }
                };
                match self.inner.handle_send_message(stream, req) {
                    Ok(resp) => {
                        frame::stream_respond_with_message(stream.id(), request_id, &resp)
                    }
                    Err(e) => frame::stream_respond_with_error(stream.id(), request_id, &e),
                }
            }
            other => frame::stream_respond_with_error(
                stream.id(),
                request_id,
                &Error::Remote(format!("Method {other} not found")),
            ),
        }
    }
}

/// Server-side registration glue for Chat.
pub fn register_chat_server(server: &Server, service: Arc<dyn ChatService>) -> Result<(), Error> {
    server.register_stream_service(
        CHAT_SERVICE_ID,
        "Chat",
        Arc::new(move |ctx, stream, reader| {
            let method_id = u64::deserialize(reader)?;
            if method_id != OPEN_CHAT_METHOD_ID {
                return Err(Error::Remote(format!("Method {method_id} not found")));
            }
            let _ = Empty::deserialize(reader)?;
            let handler = service.open_chat(ctx, stream)?;
            Ok(Arc::new(ChatStreamGlue { inner: handler }) as Arc<dyn StreamHandler>)
        }),
    )
}

/// Sends a notification to the peer over an established chat stream and
/// waits for its acknowledgement. Usable from either end that holds the
/// stream (in practice, the server).
pub fn send_notification(
    stream: &Arc<Stream>,
    ctx: &Context,
    notification: &ServerNotification,
) -> Result<Empty, Error> {
    let mut reader = stream.send_message(ctx, NOTIFY_METHOD_ID, notification)?;
    Empty::deserialize(&mut reader)
}

/// Client-side chat stub: send messages, record inbound notifications.
pub struct ChatStreamClient {
    stream: Arc<Stream>,
    notifications: Arc<std::sync::Mutex<Vec<ServerNotification>>>,
}

struct ChatClientGlue {
    notifications: Arc<std::sync::Mutex<Vec<ServerNotification>>>,
}

impl StreamHandler for ChatClientGlue {
    fn handle(
        &self,
        stream: &Arc<Stream>,
        request_id: u64,
        method_id: u64,
        mut reader: bitrpc::Reader,
    ) -> Vec<u8> {
        match method_id {
            NOTIFY_METHOD_ID => {
                let req = match ServerNotification::deserialize(&mut reader) {
                    Ok(r) => r,
                    Err(e) => {
                        return frame::stream_respond_with_error(stream.id(), request_id, &e)
                    }
                };
                self.notifications.lock().unwrap().push(req);
                frame::stream_respond_with_message(stream.id(), request_id, &Empty {})
            }
            other => frame::stream_respond_with_error(
                stream.id(),
                request_id,
                &Error::Remote(format!("Method {other} not found")),
            ),
        }
    }
}

impl ChatStreamClient {
    pub fn open(client: &Client, ctx: &Context) -> Result<Self, Error> {
        let stream = client.open_stream(ctx, CHAT_SERVICE_ID, OPEN_CHAT_METHOD_ID, &Empty {})?;
        let notifications = Arc::new(std::sync::Mutex::new(Vec::new()));
        stream.set_handler(Arc::new(ChatClientGlue {
            notifications: Arc::clone(&notifications),
        }));
        Ok(Self {
            stream,
            notifications,
        })
    }

    pub fn send_message(&self, ctx: &Context, text: &str) -> Result<ChatResponse, Error> {
        let mut reader = self.stream.send_message(
            ctx,
            SEND_MESSAGE_METHOD_ID,
            &ChatMessage {
                text: text.to_string(),
            },
        )?;
        ChatResponse::deserialize(&mut reader)
    }

    pub fn notifications(&self) -> Vec<ServerNotification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    pub fn close(&self) -> Result<(), Error> {
        self.stream.close()
    }
}
