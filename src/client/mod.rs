//! Client adapter - the gRPC call surface over the tunnel
//!
//! [`Client::invoke`] drives a unary exchange end to end; [`Client::new_stream`]
//! opens a [`ClientStream`] for the streaming shapes. Messages are typed
//! through [`prost::Name`] and travel as the opaque `Any` carrier the mux
//! speaks; per-call middleware runs at that level.

use crate::metadata::Metadata;
use crate::middleware::{
    chain, chain_stream_transport, Context, Handler, Matcher, Middleware, StreamTransportHandler,
    StreamTransportMiddleware,
};
use crate::mux::{StreamManager, VirtualStream};
use crate::tunnel::Tunnel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tonic::Status;
use tracing::debug;

/// Client configuration.
#[derive(Clone)]
pub struct ClientOptions {
    endpoint: String,
    timeout: Option<Duration>,
    stream_timeout: Option<Duration>,
    middleware: Vec<Middleware>,
    stream_transport_middleware: Vec<StreamTransportMiddleware>,
    matcher: Matcher,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientOptions {
    /// Defaults: a 2 second unary deadline, no streaming deadline, no
    /// middleware.
    pub fn new() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Some(Duration::from_millis(2000)),
            stream_timeout: None,
            middleware: Vec::new(),
            stream_transport_middleware: Vec::new(),
            matcher: Matcher::new(),
        }
    }

    /// Diagnostic endpoint label attached to call contexts.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Per-unary-call deadline. Zero disables.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Streaming handshake deadline. Zero disables.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Ordered chain wrapping every unary invoke.
    pub fn middleware(mut self, middleware: Vec<Middleware>) -> Self {
        self.middleware = middleware;
        self
    }

    /// Ordered chain wrapping the streaming handshake.
    pub fn stream_transport_middleware(
        mut self,
        middleware: Vec<StreamTransportMiddleware>,
    ) -> Self {
        self.stream_transport_middleware = middleware;
        self
    }

    /// Per-message middleware for streams whose method matches `selector`
    /// (a literal method or a `prefix*` pattern).
    pub fn stream_message_middleware(
        mut self,
        selector: &str,
        middleware: Vec<Middleware>,
    ) -> Self {
        self.matcher.add(selector, middleware);
        self
    }
}

/// gRPC client over one tunnel to the hub.
#[derive(Clone)]
pub struct Client {
    manager: StreamManager,
    options: Arc<ClientOptions>,
}

impl Client {
    /// Build a client over a connected tunnel and spawn its receive loop.
    pub fn new(tunnel: Arc<dyn Tunnel>, options: ClientOptions) -> Self {
        let manager = StreamManager::client(tunnel);
        {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run().await });
        }
        Self::from_manager(manager, options)
    }

    /// Build a client over an externally driven manager.
    pub fn from_manager(manager: StreamManager, options: ClientOptions) -> Self {
        Self {
            manager,
            options: Arc::new(options),
        }
    }

    /// Close the client and terminate every in-flight call.
    pub fn close(&self) {
        self.manager.close();
    }

    /// Unary call without extra metadata.
    pub async fn invoke<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, Status>
    where
        Req: prost::Name,
        Resp: prost::Name + Default,
    {
        self.invoke_with(method, request, Metadata::new()).await
    }

    /// Unary call: open a session, HELLO, headers, one request payload, one
    /// reply, close. The configured middleware chain wraps the exchange and
    /// the timeout bounds it.
    pub async fn invoke_with<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        metadata: Metadata,
    ) -> Result<Resp, Status>
    where
        Req: prost::Name,
        Resp: prost::Name + Default,
    {
        let request = encode_any(request)?;
        let ctx = Context::new(method, &self.options.endpoint, metadata);
        let stream = self.manager.open(method);

        let inner: Handler = {
            let stream = stream.clone();
            Arc::new(move |ctx: Context, request: prost_types::Any| {
                let stream = stream.clone();
                Box::pin(async move {
                    stream.send_hello().await.map_err(Status::from)?;
                    if !ctx.metadata().is_empty() {
                        stream
                            .send_header(ctx.metadata().clone())
                            .await
                            .map_err(Status::from)?;
                    }
                    stream.send_payload(request).await.map_err(Status::from)?;
                    match stream.recv().await {
                        Ok(Some(reply)) => Ok(reply),
                        Ok(None) => Err(Status::unavailable("stream closed before reply")),
                        Err(status) => Err(status),
                    }
                })
            })
        };

        let handler = chain(&self.options.middleware, inner);
        let call = handler(ctx, request);

        let result = match self.options.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, call).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(method, "unary call deadline exceeded");
                    Err(Status::deadline_exceeded("call timed out"))
                }
            },
            None => call.await,
        };
        stream.close().await;

        decode_any(&result?)
    }

    /// Open a streaming call without extra metadata.
    pub async fn new_stream(&self, method: &str) -> Result<ClientStream, Status> {
        self.new_stream_with(method, Metadata::new()).await
    }

    /// Open a streaming call: the stream-transport chain wraps the
    /// handshake, the handshake deadline bounds it.
    pub async fn new_stream_with(
        &self,
        method: &str,
        metadata: Metadata,
    ) -> Result<ClientStream, Status> {
        let ctx = Context::new(method, &self.options.endpoint, metadata);
        let stream = self.manager.open(method);

        let inner: StreamTransportHandler = {
            let stream = stream.clone();
            Arc::new(move |ctx: Context| {
                let stream = stream.clone();
                Box::pin(async move {
                    stream.send_hello().await.map_err(Status::from)?;
                    if !ctx.metadata().is_empty() {
                        stream
                            .send_header(ctx.metadata().clone())
                            .await
                            .map_err(Status::from)?;
                    }
                    Ok(())
                })
            })
        };

        let handler = chain_stream_transport(&self.options.stream_transport_middleware, inner);
        let handshake = handler(ctx.clone());

        let result = match self.options.stream_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, handshake).await {
                Ok(result) => result,
                Err(_) => Err(Status::deadline_exceeded("stream handshake timed out")),
            },
            None => handshake.await,
        };
        if let Err(status) = result {
            stream.close().await;
            return Err(status);
        }

        Ok(ClientStream {
            middleware: self.options.matcher.matches(method),
            ctx,
            stream,
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.options.endpoint)
            .field("manager", &self.manager)
            .finish()
    }
}

/// One open streaming call.
pub struct ClientStream {
    middleware: Vec<Middleware>,
    ctx: Context,
    stream: Arc<VirtualStream>,
}

impl ClientStream {
    /// Send one typed message.
    pub async fn send_msg<T: prost::Name>(&self, message: &T) -> Result<(), Status> {
        self.send_any(encode_any(message)?).await
    }

    /// Send one message in its opaque carrier form; per-message middleware
    /// wraps the send.
    pub async fn send_any(&self, message: prost_types::Any) -> Result<(), Status> {
        let inner: Handler = {
            let stream = self.stream.clone();
            Arc::new(move |_ctx, message: prost_types::Any| {
                let stream = stream.clone();
                Box::pin(async move {
                    stream
                        .send_payload(message.clone())
                        .await
                        .map_err(Status::from)?;
                    Ok(message)
                })
            })
        };
        let handler = chain(&self.middleware, inner);
        handler(self.ctx.clone(), message).await.map(|_| ())
    }

    /// Receive the next typed message; `Ok(None)` at end of stream.
    pub async fn recv_msg<T: prost::Name + Default>(&self) -> Result<Option<T>, Status> {
        match self.recv_any().await? {
            Some(any) => decode_any(&any).map(Some),
            None => Ok(None),
        }
    }

    /// Receive the next message in carrier form; per-message middleware
    /// wraps the receive.
    pub async fn recv_any(&self) -> Result<Option<prost_types::Any>, Status> {
        let eof = Arc::new(AtomicBool::new(false));
        let inner: Handler = {
            let stream = self.stream.clone();
            let eof = eof.clone();
            Arc::new(move |_ctx, _unused| {
                let stream = stream.clone();
                let eof = eof.clone();
                Box::pin(async move {
                    match stream.recv().await {
                        Ok(Some(any)) => Ok(any),
                        Ok(None) => {
                            eof.store(true, Ordering::Release);
                            Ok(prost_types::Any::default())
                        }
                        Err(status) => Err(status),
                    }
                })
            })
        };
        let handler = chain(&self.middleware, inner);
        let any = handler(self.ctx.clone(), prost_types::Any::default()).await?;
        if eof.load(Ordering::Acquire) {
            Ok(None)
        } else {
            Ok(Some(any))
        }
    }

    /// Half-close the send side: no more requests.
    pub async fn close_send(&self) -> Result<(), Status> {
        self.stream.send_close().await.map_err(Status::from)
    }

    /// Headers received from the server so far.
    pub fn header(&self) -> Metadata {
        self.stream.header()
    }

    /// Trailers received from the server; complete once the stream has
    /// terminated.
    pub fn trailer(&self) -> Metadata {
        self.stream.trailer()
    }

    pub fn method(&self) -> String {
        self.stream.method()
    }

    /// Close the call and release its session.
    pub async fn close(&self) {
        self.stream.close().await;
    }
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream")
            .field("method", &self.stream.method())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

pub(crate) fn encode_any<T: prost::Name>(message: &T) -> Result<prost_types::Any, Status> {
    prost_types::Any::from_msg(message)
        .map_err(|e| Status::internal(format!("encode {}: {e}", T::full_name())))
}

pub(crate) fn decode_any<T: prost::Name + Default>(any: &prost_types::Any) -> Result<T, Status> {
    any.to_msg()
        .map_err(|e| Status::internal(format!("decode {}: {e}", T::full_name())))
}
