//! Tunnel layer - the one duplex channel to the hub
//!
//! A tunnel sends and receives [`Envelope`]s; everything above it is
//! multiplexing. The single semantic rule implementations must honor:
//! transport-level cancellation is normalized to end-of-stream (`Ok(None)`),
//! so the upper layers treat orderly close and cancellation identically.
//! Any other receive error is fatal to the tunnel.
//!
//! Implementations must also keep sends atomic per envelope: the stream
//! manager funnels every session's writes through one tunnel handle and
//! relies on the tunnel not to interleave envelopes. Both implementations
//! here serialize writers internally.

pub mod hub;
mod mem;

pub use hub::{HubClient, HubTunnel};
pub use mem::{pair, MemoryTunnel};

use crate::envelope::{Envelope, EnvelopeError};
use async_trait::async_trait;
use thiserror::Error;

/// Tunnel layer errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(tonic::Status),

    #[error("hub handshake failed: {0}")]
    Handshake(String),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] EnvelopeError),
}

/// A duplex envelope channel between one endpoint and the hub.
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    /// Send one envelope. Atomic: envelopes never interleave.
    async fn send(&self, envelope: Envelope) -> Result<(), TunnelError>;

    /// Receive the next envelope. `Ok(None)` is end-of-stream, which covers
    /// both orderly close and peer cancellation. `Err` is fatal.
    async fn recv(&self) -> Result<Option<Envelope>, TunnelError>;
}
