//! Stream multiplexing - many virtual gRPC streams over one tunnel
//!
//! The [`StreamManager`] owns the tunnel and runs its single receive loop,
//! demultiplexing inbound envelopes to [`VirtualStream`]s by session id.
//! Each virtual stream is one logical gRPC call: its own handshake, header
//! caches, inbound queue, and once-only close.

mod manager;
mod stream;

pub use manager::StreamManager;
pub use stream::VirtualStream;

/// Which end of a session this side plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Capacity of each stream's bounded inbound queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 16;

/// Capacity of the server-side accept channel.
pub const ACCEPT_QUEUE_CAPACITY: usize = 16;
