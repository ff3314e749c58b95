//! Server adapter - accepts virtual streams and dispatches to services
//!
//! [`Server::serve`] drains the manager's accept channel. Each inbound
//! stream waits for its HELLO, has its `/service/method` parsed and looked
//! up in the registry, and runs through either the unary or the streaming
//! dispatch path. Admission control is the worker pool: when it refuses a
//! stream, the caller gets `RESOURCE_EXHAUSTED` and the session closes.

mod service;

pub use service::{
    implements, stream_handler, unary_handler, MethodDesc, MethodInfo, ServiceDesc, ServiceImpl,
    ServiceInfo, StreamDesc, StreamHandler, UnaryHandler,
};

use crate::metadata::Metadata;
use crate::middleware::{
    chain, chain_stream_transport, Context, Handler, Matcher, Middleware, StreamTransportHandler,
    StreamTransportMiddleware,
};
use crate::mux::{StreamManager, VirtualStream};
use crate::sync::{SafeCloser, WorkerPool};
use crate::tunnel::Tunnel;
use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tonic::Status;
use tracing::{debug, error};

const DEFAULT_MAX_WORKER: usize = 100;

/// Server configuration.
#[derive(Clone)]
pub struct ServerOptions {
    endpoint: String,
    timeout: Option<Duration>,
    stream_timeout: Option<Duration>,
    middleware: Vec<Middleware>,
    stream_transport_middleware: Vec<StreamTransportMiddleware>,
    matcher: Matcher,
    max_worker: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerOptions {
    /// Defaults: a 2 second unary deadline, no streaming deadline, a
    /// 100-worker admission pool.
    pub fn new() -> Self {
        Self {
            endpoint: String::new(),
            timeout: Some(Duration::from_millis(2000)),
            stream_timeout: None,
            middleware: Vec::new(),
            stream_transport_middleware: Vec::new(),
            matcher: Matcher::new(),
            max_worker: DEFAULT_MAX_WORKER,
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

    /// Per-stream-handler deadline. Zero disables.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Ordered chain wrapping every unary handler.
    pub fn middleware(mut self, middleware: Vec<Middleware>) -> Self {
        self.middleware = middleware;
        self
    }

    /// Ordered chain wrapping every stream handler run.
    pub fn stream_transport_middleware(
        mut self,
        middleware: Vec<StreamTransportMiddleware>,
    ) -> Self {
        self.stream_transport_middleware = middleware;
        self
    }

    /// Per-message middleware for streams whose method matches `selector`.
    pub fn stream_message_middleware(
        mut self,
        selector: &str,
        middleware: Vec<Middleware>,
    ) -> Self {
        self.matcher.add(selector, middleware);
        self
    }

    /// Admission-control pool size. Zero means unbounded: every accepted
    /// stream gets its own task.
    pub fn max_worker(mut self, max_worker: usize) -> Self {
        self.max_worker = max_worker;
        self
    }
}

struct ServiceEntry {
    implementation: ServiceImpl,
    methods: HashMap<&'static str, MethodDesc>,
    streams: HashMap<&'static str, StreamDesc>,
    metadata: &'static str,
}

struct ServerInner {
    options: ServerOptions,
    services: RwLock<HashMap<&'static str, Arc<ServiceEntry>>>,
    info_cache: ArcSwapOption<HashMap<&'static str, ServiceInfo>>,
    info_dirty: AtomicBool,
    closer: SafeCloser,
}

/// gRPC server over one tunnel to the hub. Cheap to clone.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                options,
                services: RwLock::new(HashMap::new()),
                info_cache: ArcSwapOption::const_empty(),
                info_dirty: AtomicBool::new(false),
                closer: SafeCloser::new(),
            }),
        }
    }

    /// Register a service implementation under its descriptor.
    ///
    /// # Panics
    ///
    /// Panics when the implementation does not satisfy the descriptor's
    /// handler type, or on a duplicate service name. Both are fatal
    /// configuration errors.
    pub fn register_service(&self, desc: ServiceDesc, implementation: ServiceImpl) {
        if !(desc.handler_check)(implementation.as_ref()) {
            panic!(
                "grpcmux: register_service: implementation does not satisfy the handler type of {}",
                desc.name
            );
        }

        let mut services = self.inner.services.write();
        if services.contains_key(desc.name) {
            panic!(
                "grpcmux: register_service: duplicate registration for {:?}",
                desc.name
            );
        }

        let entry = ServiceEntry {
            implementation,
            methods: desc.methods.into_iter().map(|m| (m.name, m)).collect(),
            streams: desc.streams.into_iter().map(|s| (s.name, s)).collect(),
            metadata: desc.metadata,
        };
        services.insert(desc.name, Arc::new(entry));
        self.inner.info_dirty.store(true, Ordering::Release);
    }

    /// Snapshot of the registered services. Read-mostly: rebuilt only after
    /// a registration dirtied the cache, returned from the cache otherwise.
    pub fn service_info(&self) -> Arc<HashMap<&'static str, ServiceInfo>> {
        if !self.inner.info_dirty.load(Ordering::Acquire) {
            if let Some(cached) = self.inner.info_cache.load_full() {
                return cached;
            }
        }

        let services = self.inner.services.read();
        let mut info = HashMap::with_capacity(services.len());
        for (name, entry) in services.iter() {
            let mut methods = Vec::with_capacity(entry.methods.len() + entry.streams.len());
            for name in entry.methods.keys().copied() {
                methods.push(MethodInfo {
                    name,
                    is_client_stream: false,
                    is_server_stream: false,
                });
            }
            for stream in entry.streams.values() {
                methods.push(MethodInfo {
                    name: stream.name,
                    is_client_stream: stream.client_streams,
                    is_server_stream: stream.server_streams,
                });
            }
            info.insert(
                *name,
                ServiceInfo {
                    methods,
                    metadata: entry.metadata,
                },
            );
        }
        drop(services);

        let info = Arc::new(info);
        self.inner.info_cache.store(Some(info.clone()));
        self.inner.info_dirty.store(false, Ordering::Release);
        info
    }

    /// Serve over a connected tunnel until the tunnel ends or
    /// [`close`](Self::close) is called.
    pub async fn serve(&self, tunnel: Arc<dyn Tunnel>) -> crate::Result<()> {
        let (manager, accept) = StreamManager::server(tunnel);
        {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run().await });
        }
        let result = self.serve_accept(accept).await;
        manager.close();
        result
    }

    /// Serve from an externally managed accept channel.
    pub async fn serve_accept(
        &self,
        mut accept: mpsc::Receiver<Arc<VirtualStream>>,
    ) -> crate::Result<()> {
        let pool = if self.inner.options.max_worker > 0 {
            let inner = self.inner.clone();
            Some(WorkerPool::new(
                self.inner.options.max_worker,
                move |stream: Arc<VirtualStream>| {
                    let inner = inner.clone();
                    Box::pin(async move { handle(inner, stream).await })
                },
            ))
        } else {
            None
        };
        let tasks = TaskTracker::new();

        let result = loop {
            let accepted = tokio::select! {
                _ = self.inner.closer.closed() => break Ok(()),
                accepted = accept.recv() => accepted,
            };
            let stream = match accepted {
                Some(stream) => stream,
                None => break Err(crate::Error::AcceptClosed),
            };

            match &pool {
                Some(pool) => {
                    if !pool.submit(stream.clone()) {
                        // Saturated: the sole backpressure mechanism.
                        tasks.spawn(reply_busy(stream));
                    }
                }
                None => {
                    let inner = self.inner.clone();
                    tasks.spawn(handle(inner, stream));
                }
            }
        };

        if let Some(pool) = pool {
            pool.close().await;
        }
        tasks.close();
        tasks.wait().await;
        result
    }

    /// Stop serving and refuse further streams. Idempotent.
    pub fn close(&self) {
        self.inner.closer.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &self.inner.options.endpoint)
            .field("services", &self.inner.services.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Saturated-pool reply: complete the handshake, then refuse.
async fn reply_busy(stream: Arc<VirtualStream>) {
    if stream.wait_handshake().await {
        let _ = stream
            .send_error(Status::resource_exhausted("too many requests"))
            .await;
    }
    stream.close().await;
}

/// Per-session dispatch: handshake, route, run, terminate.
async fn handle(inner: Arc<ServerInner>, stream: Arc<VirtualStream>) {
    if !stream.wait_handshake().await {
        return;
    }
    let method = stream.method();

    let result = route(&inner, &stream, &method).await;
    if let Err(status) = result {
        debug!(method, code = ?status.code(), "call failed");
        if let Err(err) = stream.send_error(status).await {
            error!(method, error = %err, "failed to write status");
        }
    }
    stream.close().await;
}

async fn route(
    inner: &Arc<ServerInner>,
    stream: &Arc<VirtualStream>,
    full_method: &str,
) -> Result<(), Status> {
    let (service, method) = parse_full_method(full_method)
        .ok_or_else(|| Status::unimplemented(format!("malformed method name: {full_method:?}")))?;

    let entry = inner.services.read().get(service).cloned();
    let entry =
        entry.ok_or_else(|| Status::unimplemented(format!("unknown service {service}")))?;

    if let Some(desc) = entry.methods.get(method) {
        return process_unary(inner, stream, &entry, desc, full_method).await;
    }
    if let Some(desc) = entry.streams.get(method) {
        return process_streaming(inner, stream, &entry, desc, full_method).await;
    }
    Err(Status::unimplemented(format!(
        "unknown method {method} for service {service}"
    )))
}

async fn process_unary(
    inner: &Arc<ServerInner>,
    stream: &Arc<VirtualStream>,
    entry: &Arc<ServiceEntry>,
    desc: &MethodDesc,
    full_method: &str,
) -> Result<(), Status> {
    // One request message; in-session ordering puts any HEADER before it,
    // so the context below sees the request headers.
    let request = match stream.recv().await {
        Ok(Some(request)) => request,
        Ok(None) => return Err(Status::internal("missing request message")),
        Err(status) => return Err(status),
    };
    let ctx = Context::new(full_method, &inner.options.endpoint, stream.header());

    let handler: Handler = {
        let implementation = entry.implementation.clone();
        let unary = desc.handler.clone();
        Arc::new(move |ctx, request| unary(implementation.clone(), ctx, request))
    };
    let handler = chain(&inner.options.middleware, handler);
    let call = handler(ctx, request);

    let reply = match inner.options.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(reply) => reply?,
            Err(_) => return Err(Status::deadline_exceeded("handler timed out")),
        },
        None => call.await?,
    };

    stream.send_payload(reply).await.map_err(Status::from)?;
    stream.send_close().await.map_err(Status::from)?;
    Ok(())
}

async fn process_streaming(
    inner: &Arc<ServerInner>,
    stream: &Arc<VirtualStream>,
    entry: &Arc<ServiceEntry>,
    desc: &StreamDesc,
    full_method: &str,
) -> Result<(), Status> {
    let ctx = Context::new(full_method, &inner.options.endpoint, stream.header());
    let server_stream = ServerStream {
        middleware: inner.options.matcher.matches(full_method),
        ctx: ctx.clone(),
        stream: stream.clone(),
    };

    let handler: StreamTransportHandler = {
        let implementation = entry.implementation.clone();
        let streaming = desc.handler.clone();
        Arc::new(move |_ctx| streaming(implementation.clone(), server_stream.clone()))
    };
    let handler = chain_stream_transport(&inner.options.stream_transport_middleware, handler);
    let call = handler(ctx);

    match inner.options.stream_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(result) => result?,
            Err(_) => return Err(Status::deadline_exceeded("stream handler timed out")),
        },
        None => call.await?,
    }

    stream.send_close().await.map_err(Status::from)?;
    Ok(())
}

fn parse_full_method(full: &str) -> Option<(&str, &str)> {
    let full = full.strip_prefix('/').unwrap_or(full);
    let (service, method) = full.rsplit_once('/')?;
    if service.is_empty() || method.is_empty() {
        return None;
    }
    Some((service, method))
}

/// The stream handle a streaming service handler drives.
#[derive(Clone)]
pub struct ServerStream {
    middleware: Vec<Middleware>,
    ctx: Context,
    stream: Arc<VirtualStream>,
}

impl ServerStream {
    /// Send one typed message.
    pub async fn send_msg<T: prost::Name>(&self, message: &T) -> Result<(), Status> {
        self.send_any(crate::client::encode_any(message)?).await
    }

    /// Send one message in carrier form; per-message middleware wraps the
    /// send.
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

    /// Receive the next typed message; `Ok(None)` once the client finished
    /// sending.
    pub async fn recv_msg<T: prost::Name + Default>(&self) -> Result<Option<T>, Status> {
        match self.recv_any().await? {
            Some(any) => crate::client::decode_any(&any).map(Some),
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

    /// Headers the client sent. Populated once the client's HEADER frame
    /// has been processed; for unary-style reads, any headers precede the
    /// first payload.
    pub fn request_metadata(&self) -> Metadata {
        self.stream.header()
    }

    /// Stage response headers; flushed automatically ahead of the next
    /// message.
    pub fn set_header(&self, metadata: Metadata) {
        self.stream.merge_outbound_metadata(metadata);
    }

    /// Stage trailing metadata; flushed automatically ahead of the terminal
    /// frame.
    pub fn set_trailer(&self, metadata: Metadata) {
        self.stream.merge_outbound_trailers(metadata);
    }

    /// Fully-qualified method of this call.
    pub fn method(&self) -> String {
        self.stream.method()
    }

    /// Per-call context snapshot.
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream")
            .field("method", &self.stream.method())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_method() {
        assert_eq!(
            parse_full_method("/test.EchoService/Echo"),
            Some(("test.EchoService", "Echo"))
        );
        assert_eq!(
            parse_full_method("test.EchoService/Echo"),
            Some(("test.EchoService", "Echo"))
        );
        assert_eq!(parse_full_method("no-slash"), None);
        assert_eq!(parse_full_method("/service-only/"), None);
        assert_eq!(parse_full_method("//Method"), None);
    }

    #[test]
    fn test_service_info_cache_reuse() {
        let server = Server::new(ServerOptions::new());
        server.register_service(test_desc(), Arc::new(TestImpl));

        let first = server.service_info();
        let second = server.service_info();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first["test.Svc"].methods.len(), 1);
    }

    #[test]
    #[should_panic(expected = "duplicate registration")]
    fn test_duplicate_registration_panics() {
        let server = Server::new(ServerOptions::new());
        server.register_service(test_desc(), Arc::new(TestImpl));
        server.register_service(test_desc(), Arc::new(TestImpl));
    }

    #[test]
    #[should_panic(expected = "does not satisfy the handler type")]
    fn test_wrong_implementation_panics() {
        let server = Server::new(ServerOptions::new());
        server.register_service(test_desc(), Arc::new(42_u32));
    }

    struct TestImpl;

    fn test_desc() -> ServiceDesc {
        ServiceDesc {
            name: "test.Svc",
            handler_check: implements::<TestImpl>,
            methods: Vec::new(),
            streams: vec![StreamDesc {
                name: "Watch",
                client_streams: false,
                server_streams: true,
                handler: Arc::new(|_svc, _stream| Box::pin(async { Ok(()) })),
            }],
            metadata: "test.proto",
        }
    }
}
