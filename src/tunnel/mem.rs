//! In-memory tunnel pair
//!
//! Two directly connected endpoints over bounded channels; what the
//! integration tests and local wiring use in place of a hub connection.
//! Dropping one side surfaces end-of-stream on the other.

use super::{Tunnel, TunnelError};
use crate::envelope::Envelope;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

const CHANNEL_CAPACITY: usize = 64;

/// One side of an in-memory tunnel.
pub struct MemoryTunnel {
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
}

/// Create a connected tunnel pair.
pub fn pair() -> (MemoryTunnel, MemoryTunnel) {
    let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        MemoryTunnel {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        },
        MemoryTunnel {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        },
    )
}

#[async_trait]
impl Tunnel for MemoryTunnel {
    async fn send(&self, envelope: Envelope) -> Result<(), TunnelError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    async fn recv(&self) -> Result<Option<Envelope>, TunnelError> {
        Ok(self.rx.lock().await.recv().await)
    }
}

impl std::fmt::Debug for MemoryTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTunnel").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Frame;

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (a, b) = pair();

        a.send(Envelope::new("sid", Frame::Close)).await.unwrap();
        let env = b.recv().await.unwrap().unwrap();

        assert_eq!(env.session_id, "sid");
        assert!(matches!(env.frame, Frame::Close));
    }

    #[tokio::test]
    async fn test_dropped_peer_is_eof() {
        let (a, b) = pair();
        drop(a);

        assert!(b.recv().await.unwrap().is_none());
        assert!(matches!(
            b.send(Envelope::new("sid", Frame::Close)).await,
            Err(TunnelError::Closed)
        ));
    }
}
