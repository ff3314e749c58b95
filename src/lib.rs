//! # grpcmux
//!
//! Tunnels ordinary gRPC traffic - unary, client-stream, server-stream, and
//! bidirectional - over a single persistent bidirectional channel to a
//! central hub relay. Two endpoints that cannot reach each other directly
//! each hold one long-lived tunnel to the hub; on top of that one tunnel
//! this crate multiplexes any number of virtual gRPC streams, preserving
//! method names, metadata, payloads, trailers, status codes, and close
//! signals end to end.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │        (service handlers, typed client calls)        │
//! ├─────────────────────────────────────────────────────┤
//! │                   Adapter Layer                      │
//! │    (Client invoke/streams, Server registry+dispatch) │
//! ├─────────────────────────────────────────────────────┤
//! │                 Multiplexing Layer                   │
//! │      (StreamManager loop, VirtualStream per call)    │
//! ├─────────────────────────────────────────────────────┤
//! │                   Envelope Layer                     │
//! │        (session id + HELLO/HEADER/PAYLOAD/...)       │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel Layer                      │
//! │       (one duplex channel: hub bidi or in-memory)    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! The hub itself is an external relay that pairs two tunnels by their
//! `sender_id`/`receiver_id` and forwards envelopes verbatim; this crate
//! only assumes "the tunnel delivers my envelopes to my peer".

pub mod client;
pub mod envelope;
pub mod metadata;
pub mod middleware;
pub mod mux;
pub mod server;
pub mod sync;
pub mod tunnel;

pub use client::{Client, ClientOptions, ClientStream};
pub use envelope::{Envelope, Frame};
pub use metadata::Metadata;
pub use middleware::{Context, Matcher};
pub use mux::{Role, StreamManager, VirtualStream};
pub use server::{Server, ServerOptions, ServerStream, ServiceDesc};
pub use tunnel::{HubClient, Tunnel};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("envelope error: {0}")]
    Envelope(#[from] envelope::EnvelopeError),

    /// The stream has closed; the send-side analogue of end-of-stream.
    #[error("stream closed")]
    Closed,

    #[error("accept channel closed")]
    AcceptClosed,
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Closed => tonic::Status::unavailable("stream closed"),
            Error::Tunnel(e) => tonic::Status::unavailable(format!("tunnel: {e}")),
            Error::Envelope(e) => tonic::Status::internal(format!("envelope: {e}")),
            Error::AcceptClosed => tonic::Status::unavailable("accept channel closed"),
        }
    }
}
