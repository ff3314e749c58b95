//! Stream manager - demultiplexes the tunnel onto virtual streams
//!
//! Owns the tunnel and the live session map and runs the single receive
//! loop. Inbound envelopes route to their stream by session id; unknown
//! sessions are dropped on the client side and, on the server side, minted
//! into new streams handed to the accept channel when the first frame is a
//! HELLO. End-of-stream or any receive error ends the loop and closes every
//! live session, which each observes as EOF on its inbound queue.

use super::stream::SendHook;
use super::{Role, VirtualStream, ACCEPT_QUEUE_CAPACITY};
use crate::envelope::{Envelope, Frame};
use crate::sync::SafeCloser;
use crate::tunnel::Tunnel;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

/// Demultiplexer for one tunnel. Cheap to clone.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    role: Role,
    tunnel: Arc<dyn Tunnel>,
    sessions: DashMap<String, Arc<VirtualStream>>,
    accept_tx: Option<mpsc::Sender<Arc<VirtualStream>>>,
    closer: SafeCloser,
}

impl StreamManager {
    /// Client-side manager: sessions are only ever opened locally.
    pub fn client(tunnel: Arc<dyn Tunnel>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                role: Role::Client,
                tunnel,
                sessions: DashMap::new(),
                accept_tx: None,
                closer: SafeCloser::new(),
            }),
        }
    }

    /// Server-side manager: inbound HELLOs mint new streams, delivered on
    /// the returned accept channel.
    pub fn server(tunnel: Arc<dyn Tunnel>) -> (Self, mpsc::Receiver<Arc<VirtualStream>>) {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let manager = Self {
            inner: Arc::new(ManagerInner {
                role: Role::Server,
                tunnel,
                sessions: DashMap::new(),
                accept_tx: Some(accept_tx),
                closer: SafeCloser::new(),
            }),
        };
        (manager, accept_rx)
    }

    /// Open a new client session with a fresh id. The caller drives the
    /// handshake.
    pub fn open(&self, method: &str) -> Arc<VirtualStream> {
        self.create_stream(Uuid::new_v4().to_string(), method.to_string(), Role::Client)
    }

    fn create_stream(&self, session_id: String, method: String, role: Role) -> Arc<VirtualStream> {
        let hook: SendHook = {
            let tunnel = self.inner.tunnel.clone();
            let session_id = session_id.clone();
            Arc::new(move |frame: Frame| {
                let tunnel = tunnel.clone();
                let envelope = Envelope::new(session_id.clone(), frame);
                Box::pin(async move { tunnel.send(envelope).await })
            })
        };

        let stream = VirtualStream::new(session_id.clone(), method, role, hook);

        // Deregistration is a weak callback so stream lifetime never pins
        // the manager.
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let sid = session_id.clone();
        stream.closer().add_close_callback(move || {
            if let Some(inner) = weak.upgrade() {
                inner.sessions.remove(&sid);
            }
        });

        self.inner.sessions.insert(session_id, stream.clone());
        stream
    }

    /// The single receive loop. Runs until end-of-stream, a transport
    /// error, or [`close`](Self::close); always tears down every live
    /// session on the way out.
    pub async fn run(&self) {
        loop {
            let received = tokio::select! {
                _ = self.inner.closer.closed() => break,
                received = self.inner.tunnel.recv() => received,
            };

            match received {
                Ok(Some(envelope)) => self.dispatch(envelope).await,
                Ok(None) => {
                    debug!("tunnel reached end of stream");
                    break;
                }
                Err(err) => {
                    error!(error = %err, "tunnel receive failed");
                    break;
                }
            }
        }
        self.close();
    }

    async fn dispatch(&self, envelope: Envelope) {
        let Envelope { session_id, frame } = envelope;

        let existing = self
            .inner
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone());
        if let Some(stream) = existing {
            stream.process(frame);
            return;
        }

        match self.inner.role {
            // No server-initiated sessions: stale frames are dropped.
            Role::Client => {
                debug!(session_id, kind = ?frame.kind(), "dropping frame for unknown session");
            }
            Role::Server => match frame {
                Frame::Hello { .. } => {
                    let stream =
                        self.create_stream(session_id.clone(), String::new(), Role::Server);
                    if let Some(accept_tx) = &self.inner.accept_tx {
                        if accept_tx.send(stream.clone()).await.is_err() {
                            debug!(session_id, "accept channel gone, refusing session");
                            stream.shutdown();
                            return;
                        }
                    }
                    stream.process(frame);
                }
                _ => {
                    // A session must start with HELLO; anything else for an
                    // unknown id is a straggler from a closed session.
                    debug!(session_id, kind = ?frame.kind(), "dropping frame for unknown session");
                }
            },
        }
    }

    /// Close the manager and every live session. Each pending `recv`
    /// observes EOF. Idempotent.
    pub fn close(&self) {
        if self.inner.closer.is_closed() {
            return;
        }
        self.inner.closer.close();

        let streams: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for stream in streams {
            stream.shutdown();
        }
        self.inner.sessions.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
    }

    /// Resolves when the manager has closed.
    pub async fn closed(&self) {
        self.inner.closer.closed().await
    }

    /// Number of live sessions; diagnostics only.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("role", &self.inner.role)
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
