//! Virtual stream state machine
//!
//! One logical call multiplexed over the tunnel. The send path owns the
//! cached outbound headers and trailers and flushes them automatically:
//! before the first PAYLOAD/TRAILER/ERROR/CLOSE after the cache changed
//! (tracked by content hash), a HEADER frame goes out first; trailers flush
//! the same way ahead of a terminal frame. The receive path is fed by the
//! manager's loop through [`VirtualStream::process`] and drained by the
//! adapters through [`VirtualStream::recv`].

use super::{Role, INBOUND_QUEUE_CAPACITY};
use crate::envelope::pb::FrameKind;
use crate::envelope::Frame;
use crate::metadata::Metadata;
use crate::sync::SafeCloser;
use crate::tunnel::TunnelError;
use crate::{Error, Result};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// How a stream puts frames on the wire; the manager wires this to the
/// tunnel with the session id attached.
pub(crate) type SendHook =
    Arc<dyn Fn(Frame) -> BoxFuture<'static, std::result::Result<(), TunnelError>> + Send + Sync>;

/// An item the receive loop hands the application: a payload, end-of-stream,
/// or a terminal status.
type InboundItem = std::result::Result<Option<prost_types::Any>, tonic::Status>;

struct HeaderCache {
    metadata: Metadata,
    last_sent_hash: u64,
    changed: bool,
}

impl HeaderCache {
    fn new() -> Self {
        let metadata = Metadata::new();
        Self {
            last_sent_hash: metadata.content_hash(),
            metadata,
            changed: false,
        }
    }

    fn merge(&mut self, other: Metadata) {
        self.metadata.extend(other);
        if self.metadata.content_hash() != self.last_sent_hash {
            self.changed = true;
        }
    }

    /// Metadata to flush, if the cache changed since the last send.
    fn take_pending(&mut self) -> Option<Metadata> {
        if !self.changed {
            return None;
        }
        self.changed = false;
        self.last_sent_hash = self.metadata.content_hash();
        Some(self.metadata.clone())
    }
}

/// One multiplexed gRPC call.
pub struct VirtualStream {
    session_id: String,
    role: Role,
    method: RwLock<String>,

    send_hook: SendHook,
    /// Serializes this stream's sends so an auto-flushed HEADER is
    /// immediately followed by the frame that triggered it.
    send_lock: tokio::sync::Mutex<()>,
    outbound_headers: Mutex<HeaderCache>,
    outbound_trailers: Mutex<HeaderCache>,
    hello_sent: AtomicBool,
    terminal_sent: AtomicBool,
    /// Peer already ended its direction; a local close need not answer.
    remote_terminal: AtomicBool,

    received_headers: Mutex<Metadata>,
    received_trailers: Mutex<Metadata>,
    handshaken: AtomicBool,
    hello_notify: Notify,

    queue_tx: Mutex<Option<mpsc::Sender<InboundItem>>>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<InboundItem>>,

    closer: SafeCloser,
}

impl VirtualStream {
    pub(crate) fn new(
        session_id: String,
        method: String,
        role: Role,
        send_hook: SendHook,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        Arc::new(Self {
            session_id,
            role,
            method: RwLock::new(method),
            send_hook,
            send_lock: tokio::sync::Mutex::new(()),
            outbound_headers: Mutex::new(HeaderCache::new()),
            outbound_trailers: Mutex::new(HeaderCache::new()),
            hello_sent: AtomicBool::new(false),
            terminal_sent: AtomicBool::new(false),
            remote_terminal: AtomicBool::new(false),
            received_headers: Mutex::new(Metadata::new()),
            received_trailers: Mutex::new(Metadata::new()),
            handshaken: AtomicBool::new(false),
            hello_notify: Notify::new(),
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            closer: SafeCloser::new(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Fully-qualified method name. Empty on a server stream until the
    /// handshake completes.
    pub fn method(&self) -> String {
        self.method.read().clone()
    }

    /// Snapshot of the headers received so far.
    pub fn header(&self) -> Metadata {
        self.received_headers.lock().clone()
    }

    /// Snapshot of the trailers received so far.
    pub fn trailer(&self) -> Metadata {
        self.received_trailers.lock().clone()
    }

    pub(crate) fn closer(&self) -> &SafeCloser {
        &self.closer
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    /// Resolves when the stream has closed.
    pub async fn closed(&self) {
        self.closer.closed().await
    }

    // --- receive path, driven by the manager loop ---

    /// Feed one inbound frame into the stream.
    pub(crate) fn process(&self, frame: Frame) {
        match frame {
            Frame::Hello { method } => {
                *self.method.write() = method;
                self.handshaken.store(true, Ordering::Release);
                self.hello_notify.notify_waiters();
            }
            Frame::Header(md) => self.received_headers.lock().extend(md),
            Frame::Trailer(md) => self.received_trailers.lock().extend(md),
            Frame::Payload(any) => self.enqueue(Ok(Some(any))),
            Frame::Error(status) => {
                self.remote_terminal.store(true, Ordering::Release);
                self.enqueue(Err(status));
                self.close_queue();
            }
            Frame::Close => {
                self.remote_terminal.store(true, Ordering::Release);
                self.enqueue(Ok(None));
                self.close_queue();
            }
        }
    }

    fn enqueue(&self, item: InboundItem) {
        let closed = self.closer.read();
        if *closed {
            debug!(session_id = %self.session_id, "discarding frame for closed stream");
            return;
        }
        let tx = self.queue_tx.lock().clone();
        match tx {
            Some(tx) => match tx.try_send(item) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %self.session_id, "inbound queue full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            },
            None => {
                debug!(session_id = %self.session_id, "discarding frame after end of stream");
            }
        }
    }

    fn close_queue(&self) {
        self.queue_tx.lock().take();
    }

    /// Next inbound item: `Ok(Some(payload))`, `Ok(None)` at end of stream,
    /// or the terminal status the peer sent.
    pub async fn recv(&self) -> std::result::Result<Option<prost_types::Any>, tonic::Status> {
        let mut rx = self.queue_rx.lock().await;
        match rx.recv().await {
            Some(item) => item,
            None => Ok(None),
        }
    }

    /// Server side: wait for the peer's HELLO. Returns `false` if the stream
    /// closed first.
    pub async fn wait_handshake(&self) -> bool {
        loop {
            if self.handshaken.load(Ordering::Acquire) {
                return true;
            }
            let notified = self.hello_notify.notified();
            if self.handshaken.load(Ordering::Acquire) {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.closer.closed() => return false,
            }
        }
    }

    // --- send path ---

    /// Merge metadata into the cached outbound headers; flushed with the
    /// next frame if the content changed.
    pub fn merge_outbound_metadata(&self, metadata: Metadata) {
        self.outbound_headers.lock().merge(metadata);
    }

    /// Merge metadata into the cached outbound trailers; flushed ahead of
    /// the terminal frame.
    pub fn merge_outbound_trailers(&self, metadata: Metadata) {
        self.outbound_trailers.lock().merge(metadata);
    }

    /// Open the session. Emitted exactly once; later calls are no-ops.
    pub async fn send_hello(&self) -> Result<()> {
        if self.hello_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let method = self.method();
        self.send_frame(Frame::Hello { method }).await
    }

    /// Merge and flush headers now.
    pub async fn send_header(&self, metadata: Metadata) -> Result<()> {
        self.merge_outbound_metadata(metadata);
        if self.closer.is_closed() {
            return Err(Error::Closed);
        }
        let _guard = self.send_lock.lock().await;
        self.flush_cache(&self.outbound_headers, false).await
    }

    pub async fn send_payload(&self, payload: prost_types::Any) -> Result<()> {
        self.send_frame(Frame::Payload(payload)).await
    }

    /// Terminate the call with a failure status. At most one terminal frame
    /// goes out per stream; after the first this is a no-op.
    pub async fn send_error(&self, status: tonic::Status) -> Result<()> {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send_frame(Frame::Error(status)).await
    }

    /// Half-close: no more messages from this side. At most one terminal
    /// frame goes out per stream; after the first this is a no-op.
    pub async fn send_close(&self) -> Result<()> {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.send_frame(Frame::Close).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.closer.is_closed() {
            return Err(Error::Closed);
        }
        let _guard = self.send_lock.lock().await;
        if self.closer.is_closed() {
            return Err(Error::Closed);
        }

        let kind = frame.kind();
        if matches!(
            kind,
            FrameKind::Payload | FrameKind::Trailer | FrameKind::Error | FrameKind::Close
        ) {
            self.flush_cache(&self.outbound_headers, false).await?;
        }
        if matches!(kind, FrameKind::Error | FrameKind::Close) {
            self.flush_cache(&self.outbound_trailers, true).await?;
        }

        (self.send_hook)(frame).await.map_err(Error::Tunnel)
    }

    /// Emit the cached metadata as a HEADER (or TRAILER) frame if it changed
    /// since the last flush. Caller holds the send lock.
    async fn flush_cache(&self, cache: &Mutex<HeaderCache>, as_trailer: bool) -> Result<()> {
        let pending = cache.lock().take_pending();
        if let Some(metadata) = pending {
            let frame = if as_trailer {
                Frame::Trailer(metadata)
            } else {
                Frame::Header(metadata)
            };
            (self.send_hook)(frame).await.map_err(Error::Tunnel)?;
        }
        Ok(())
    }

    // --- close ---

    /// Close the stream: best-effort CLOSE frame unless a terminal frame
    /// already went out in either direction, then tear down. Idempotent.
    pub async fn close(&self) {
        if self.closer.is_closed() {
            return;
        }
        if !self.remote_terminal.load(Ordering::Acquire) {
            let _ = self.send_close().await;
        }
        self.shutdown();
    }

    /// Synchronous teardown: runs the close callbacks (deregistration), then
    /// closes the inbound queue and wakes any handshake waiter. Used
    /// directly by the manager when the tunnel is already gone.
    pub(crate) fn shutdown(&self) {
        self.closer.close();
        self.close_queue();
        self.hello_notify.notify_waiters();
    }
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("method", &self.method())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::pb::FrameKind;
    use tonic::{Code, Status};

    fn recording_stream(role: Role) -> (Arc<VirtualStream>, Arc<Mutex<Vec<Frame>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let hook: SendHook = {
            let sent = sent.clone();
            Arc::new(move |frame| {
                sent.lock().push(frame.clone());
                Box::pin(async { Ok(()) })
            })
        };
        let stream = VirtualStream::new(
            "sid-test".to_string(),
            "/test.EchoService/Echo".to_string(),
            role,
            hook,
        );
        (stream, sent)
    }

    fn any_payload() -> prost_types::Any {
        prost_types::Any {
            type_url: "/test.Msg".to_string(),
            value: vec![1, 2, 3],
        }
    }

    fn kinds(sent: &Mutex<Vec<Frame>>) -> Vec<FrameKind> {
        sent.lock().iter().map(Frame::kind).collect()
    }

    #[tokio::test]
    async fn test_hello_sent_exactly_once() {
        let (stream, sent) = recording_stream(Role::Client);

        stream.send_hello().await.unwrap();
        stream.send_hello().await.unwrap();

        assert_eq!(kinds(&sent), vec![FrameKind::Hello]);
    }

    #[tokio::test]
    async fn test_changed_headers_flush_before_payload() {
        let (stream, sent) = recording_stream(Role::Client);

        stream.merge_outbound_metadata(Metadata::from_pairs([("k", "v")]));
        stream.send_payload(any_payload()).await.unwrap();
        // Unchanged cache: no second HEADER.
        stream.send_payload(any_payload()).await.unwrap();

        assert_eq!(
            kinds(&sent),
            vec![FrameKind::Header, FrameKind::Payload, FrameKind::Payload]
        );
    }

    #[tokio::test]
    async fn test_mutated_headers_flush_again() {
        let (stream, sent) = recording_stream(Role::Client);

        stream.merge_outbound_metadata(Metadata::from_pairs([("k", "1")]));
        stream.send_payload(any_payload()).await.unwrap();
        stream.merge_outbound_metadata(Metadata::from_pairs([("k", "2")]));
        stream.send_payload(any_payload()).await.unwrap();

        assert_eq!(
            kinds(&sent),
            vec![
                FrameKind::Header,
                FrameKind::Payload,
                FrameKind::Header,
                FrameKind::Payload
            ]
        );
    }

    #[tokio::test]
    async fn test_trailers_flush_before_terminal() {
        let (stream, sent) = recording_stream(Role::Server);

        stream.merge_outbound_trailers(Metadata::from_pairs([("t", "v")]));
        stream.send_close().await.unwrap();

        assert_eq!(kinds(&sent), vec![FrameKind::Trailer, FrameKind::Close]);
    }

    #[tokio::test]
    async fn test_single_terminal_frame() {
        let (stream, sent) = recording_stream(Role::Server);

        stream
            .send_error(Status::new(Code::NotFound, "gone"))
            .await
            .unwrap();
        stream.send_close().await.unwrap();
        stream.close().await;

        assert_eq!(kinds(&sent), vec![FrameKind::Error]);
    }

    #[tokio::test]
    async fn test_close_emits_close_frame_once() {
        let (stream, sent) = recording_stream(Role::Client);

        stream.close().await;
        stream.close().await;

        assert_eq!(kinds(&sent), vec![FrameKind::Close]);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (stream, _sent) = recording_stream(Role::Client);
        stream.close().await;

        assert!(matches!(
            stream.send_payload(any_payload()).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_inbound_close_yields_eof() {
        let (stream, _sent) = recording_stream(Role::Client);

        stream.process(Frame::Payload(any_payload()));
        stream.process(Frame::Close);

        assert!(stream.recv().await.unwrap().is_some());
        assert!(stream.recv().await.unwrap().is_none());
        // EOF is sticky.
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inbound_error_surfaces_status() {
        let (stream, _sent) = recording_stream(Role::Client);

        stream.process(Frame::Error(Status::new(Code::NotFound, "Not found: X")));

        let err = stream.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "Not found: X");
    }

    #[tokio::test]
    async fn test_no_reply_close_after_remote_terminal() {
        let (stream, sent) = recording_stream(Role::Client);

        stream.process(Frame::Close);
        stream.close().await;

        assert!(kinds(&sent).is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_frames() {
        let (stream, _sent) = recording_stream(Role::Client);

        for _ in 0..(INBOUND_QUEUE_CAPACITY + 4) {
            stream.process(Frame::Payload(any_payload()));
        }

        let mut received = 0;
        stream.process(Frame::Close);
        while stream.recv().await.unwrap().is_some() {
            received += 1;
        }
        assert_eq!(received, INBOUND_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_handshake_wakes_waiter() {
        let (stream, _sent) = recording_stream(Role::Server);

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.wait_handshake().await })
        };

        stream.process(Frame::Hello {
            method: "/test.EchoService/Echo".to_string(),
        });

        assert!(waiter.await.unwrap());
        assert_eq!(stream.method(), "/test.EchoService/Echo");
    }

    #[tokio::test]
    async fn test_handshake_aborts_on_close() {
        let (stream, _sent) = recording_stream(Role::Server);

        let waiter = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.wait_handshake().await })
        };

        stream.shutdown();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_received_metadata_merges() {
        let (stream, _sent) = recording_stream(Role::Server);

        stream.process(Frame::Header(Metadata::from_pairs([("a", "1")])));
        stream.process(Frame::Header(Metadata::from_pairs([("a", "2")])));
        stream.process(Frame::Trailer(Metadata::from_pairs([("t", "x")])));

        assert_eq!(stream.header().get_all("a"), &["1", "2"]);
        assert_eq!(stream.trailer().get("t"), Some("x"));
    }
}
