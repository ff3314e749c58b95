//! Service descriptors and the registrar model
//!
//! A [`ServiceDesc`] declares a service's name, its unary and streaming
//! methods, and a capability check the registrar runs against the supplied
//! implementation. Handlers are type-erased over the wire `Any` carrier;
//! [`unary_handler`] and [`stream_handler`] build them from typed async
//! functions, downcasting the implementation the way generated glue would.

use super::ServerStream;
use crate::middleware::Context;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use tonic::Status;

/// Type-erased service implementation.
pub type ServiceImpl = Arc<dyn Any + Send + Sync>;

/// Handler for one unary method.
pub type UnaryHandler = Arc<
    dyn Fn(ServiceImpl, Context, prost_types::Any) -> BoxFuture<'static, Result<prost_types::Any, Status>>
        + Send
        + Sync,
>;

/// Handler for one streaming method.
pub type StreamHandler =
    Arc<dyn Fn(ServiceImpl, ServerStream) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

/// One unary method of a service.
#[derive(Clone)]
pub struct MethodDesc {
    pub name: &'static str,
    pub handler: UnaryHandler,
}

/// One streaming method of a service.
#[derive(Clone)]
pub struct StreamDesc {
    pub name: &'static str,
    pub client_streams: bool,
    pub server_streams: bool,
    pub handler: StreamHandler,
}

/// Declaration of a registrable service.
#[derive(Clone)]
pub struct ServiceDesc {
    /// Fully-qualified service name, e.g. `test.EchoService`.
    pub name: &'static str,
    /// Accepts only implementations of the declared handler type.
    pub handler_check: fn(&(dyn Any + Send + Sync)) -> bool,
    pub methods: Vec<MethodDesc>,
    pub streams: Vec<StreamDesc>,
    /// Opaque descriptor metadata, e.g. the proto file name.
    pub metadata: &'static str,
}

impl std::fmt::Debug for ServiceDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDesc")
            .field("name", &self.name)
            .field("methods", &self.methods.len())
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// Capability check for [`ServiceDesc::handler_check`].
pub fn implements<S: 'static>(implementation: &(dyn Any + Send + Sync)) -> bool {
    implementation.is::<S>()
}

/// Build a [`UnaryHandler`] from a typed async function.
pub fn unary_handler<S, Req, Resp, F, Fut>(f: F) -> UnaryHandler
where
    S: Send + Sync + 'static,
    Req: prost::Name + Default,
    Resp: prost::Name,
    F: Fn(Arc<S>, Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    Arc::new(move |service, ctx, request| {
        let service = match service.downcast::<S>() {
            Ok(service) => service,
            Err(_) => return mismatch(),
        };
        let request = match request.to_msg::<Req>() {
            Ok(request) => request,
            Err(e) => {
                let status = Status::internal(format!("decode {}: {e}", Req::full_name()));
                return Box::pin(async move { Err(status) });
            }
        };
        let call = f(service, ctx, request);
        Box::pin(async move {
            let reply = call.await?;
            prost_types::Any::from_msg(&reply)
                .map_err(|e| Status::internal(format!("encode {}: {e}", Resp::full_name())))
        })
    })
}

/// Build a [`StreamHandler`] from a typed async function.
pub fn stream_handler<S, F, Fut>(f: F) -> StreamHandler
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(move |service, stream| {
        let service = match service.downcast::<S>() {
            Ok(service) => service,
            Err(_) => return mismatch(),
        };
        Box::pin(f(service, stream))
    })
}

fn mismatch<T: Send + 'static>() -> BoxFuture<'static, Result<T, Status>> {
    Box::pin(async { Err(Status::internal("service implementation type mismatch")) })
}

/// Read-only view of one registered service, for reflection-style callers.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub methods: Vec<MethodInfo>,
    pub metadata: &'static str,
}

/// Read-only view of one registered method.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: &'static str,
    pub is_client_stream: bool,
    pub is_server_stream: bool,
}
