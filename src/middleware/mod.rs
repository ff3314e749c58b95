//! Composable call middleware
//!
//! Three shapes with distinct scopes:
//!
//! - [`Middleware`] wraps a `(Context, Any) -> Any` handler: once per unary
//!   invoke, or per message on streams selected by the [`Matcher`].
//! - [`StreamTransportMiddleware`] wraps the stream handshake on the client
//!   and the whole stream handler on the server; the place for auth token
//!   injection and span setup.
//! - [`wrap_stream_transport`] adapts plain middleware to the
//!   stream-transport shape.
//!
//! Payloads cross middleware as the opaque [`prost_types::Any`] carrier the
//! wire uses; typed views live at the adapter surface.

mod matcher;

pub use matcher::Matcher;

use crate::metadata::Metadata;
use futures::future::BoxFuture;
use std::sync::Arc;
use tonic::Status;

/// Per-call context visible to middleware: the full method name, the
/// endpoint label, and the call metadata (outgoing on the client, the
/// request headers on the server).
#[derive(Debug, Clone)]
pub struct Context {
    method: String,
    endpoint: String,
    metadata: Metadata,
}

impl Context {
    pub fn new(method: impl Into<String>, endpoint: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            method: method.into(),
            endpoint: endpoint.into(),
            metadata,
        }
    }

    /// Fully-qualified method name, `/service/method`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Diagnostic endpoint label; never used for routing.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

/// The wrapped unit of work: one message in, one message out.
pub type Handler =
    Arc<dyn Fn(Context, prost_types::Any) -> BoxFuture<'static, Result<prost_types::Any, Status>> + Send + Sync>;

/// Unary / per-message middleware.
pub type Middleware = Arc<dyn Fn(Handler) -> Handler + Send + Sync>;

/// The wrapped stream handshake (client) or stream handler run (server).
pub type StreamTransportHandler =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

/// Stream-transport middleware.
pub type StreamTransportMiddleware =
    Arc<dyn Fn(StreamTransportHandler) -> StreamTransportHandler + Send + Sync>;

/// Compose middleware around a handler; the first element is outermost.
pub fn chain(middleware: &[Middleware], handler: Handler) -> Handler {
    middleware.iter().rev().fold(handler, |next, m| m(next))
}

/// Compose stream-transport middleware; the first element is outermost.
pub fn chain_stream_transport(
    middleware: &[StreamTransportMiddleware],
    handler: StreamTransportHandler,
) -> StreamTransportHandler {
    middleware.iter().rev().fold(handler, |next, m| m(next))
}

/// Adapt plain middleware so it can run at the stream-transport position.
/// The payload slot is a placeholder `Any`; only the context is meaningful.
pub fn wrap_stream_transport(middleware: &[Middleware]) -> Vec<StreamTransportMiddleware> {
    middleware
        .iter()
        .cloned()
        .map(|m| {
            let wrapped: StreamTransportMiddleware = Arc::new(move |next: StreamTransportHandler| {
                let inner: Handler = Arc::new(move |ctx, _req| {
                    let next = next.clone();
                    Box::pin(async move {
                        next(ctx).await?;
                        Ok(prost_types::Any::default())
                    })
                });
                let handler = m(inner);
                Arc::new(move |ctx| {
                    let handler = handler.clone();
                    Box::pin(async move {
                        handler(ctx, prost_types::Any::default()).await?;
                        Ok(())
                    }) as BoxFuture<'static, Result<(), Status>>
                })
            });
            wrapped
        })
        .collect()
}
