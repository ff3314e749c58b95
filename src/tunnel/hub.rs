//! Hub tunnel adapter
//!
//! Wraps one `channel.v1.ChannelService/Channel` bidi gRPC call into a
//! [`Tunnel`]. The hub pairs two endpoints whose `sender_id`/`receiver_id`
//! request metadata are reciprocal and forwards envelopes verbatim; this
//! adapter only speaks the wire schema and normalizes errors.
//!
//! TLS, credentials, and compression belong to the caller: connect the
//! [`tonic::transport::Channel`] however the deployment requires and hand it
//! to [`HubClient`].

use super::{Tunnel, TunnelError};
use crate::envelope::{pb, Envelope, Frame};
use crate::mux::Role;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataValue;
use tonic::{Code, Status, Streaming};
use tracing::warn;

const CHANNEL_METHOD: &str = "/channel.v1.ChannelService/Channel";
const OUTBOUND_CAPACITY: usize = 64;

/// A [`Tunnel`] over an established hub bidi stream.
pub struct HubTunnel {
    tx: mpsc::Sender<pb::Envelope>,
    rx: Mutex<Streaming<pb::Envelope>>,
}

impl HubTunnel {
    /// Wrap an already-open bidi call: the outbound message sender and the
    /// inbound message stream.
    pub fn new(tx: mpsc::Sender<pb::Envelope>, rx: Streaming<pb::Envelope>) -> Self {
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Tunnel for HubTunnel {
    async fn send(&self, envelope: Envelope) -> Result<(), TunnelError> {
        self.tx
            .send(envelope.into_wire())
            .await
            .map_err(|_| TunnelError::Closed)
    }

    async fn recv(&self) -> Result<Option<Envelope>, TunnelError> {
        let mut rx = self.rx.lock().await;
        loop {
            return match rx.message().await {
                Ok(Some(raw)) => {
                    let session_id = raw.session_id.clone();
                    match Envelope::from_wire(raw) {
                        Ok(envelope) => Ok(Some(envelope)),
                        Err(err) if session_id.is_empty() => {
                            // Unaddressable garbage; skip it.
                            warn!(error = %err, "dropping malformed envelope");
                            continue;
                        }
                        Err(err) => {
                            // A malformed frame poisons only its session:
                            // surface it there as INTERNAL.
                            warn!(session_id, error = %err, "malformed frame");
                            Ok(Some(Envelope::new(
                                session_id,
                                Frame::Error(Status::internal(format!(
                                    "unexpected message type: {err}"
                                ))),
                            )))
                        }
                    }
                }
                Ok(None) => Ok(None),
                // Peer or context cancellation reads as orderly close.
                Err(status) if status.code() == Code::Cancelled => Ok(None),
                Err(status) => Err(TunnelError::Transport(status)),
            };
        }
    }
}

impl std::fmt::Debug for HubTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubTunnel").finish_non_exhaustive()
    }
}

/// Opens tunnels to a hub relay on behalf of one endpoint identity.
#[derive(Debug, Clone)]
pub struct HubClient {
    channel: tonic::transport::Channel,
    sender_id: String,
    receiver_id: String,
}

impl HubClient {
    pub fn new(
        channel: tonic::transport::Channel,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
        }
    }

    /// Identity under the pairing convention for a logical service `name`:
    /// the server side is `name-ser` talking to `name-cli`, the client side
    /// the reverse.
    pub fn for_service(channel: tonic::transport::Channel, name: &str, role: Role) -> Self {
        match role {
            Role::Server => Self::new(channel, format!("{name}-ser"), format!("{name}-cli")),
            Role::Client => Self::new(channel, format!("{name}-cli"), format!("{name}-ser")),
        }
    }

    /// Open one tunnel: starts the bidi call with the identity pair as
    /// request metadata and returns the wrapped duplex stream.
    pub async fn connect(&self) -> Result<HubTunnel, TunnelError> {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let outbound = ReceiverStream::new(rx);

        let mut request = tonic::Request::new(outbound);
        let metadata = request.metadata_mut();
        metadata.insert("sender_id", ascii_value(&self.sender_id, "sender_id")?);
        metadata.insert("receiver_id", ascii_value(&self.receiver_id, "receiver_id")?);

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| TunnelError::Handshake(format!("hub not ready: {e}")))?;

        let codec: tonic::codec::ProstCodec<pb::Envelope, pb::Envelope> =
            tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static(CHANNEL_METHOD);
        let response = grpc
            .streaming(request, path, codec)
            .await
            .map_err(TunnelError::Transport)?;

        Ok(HubTunnel::new(tx, response.into_inner()))
    }
}

fn ascii_value(value: &str, what: &str) -> Result<MetadataValue<tonic::metadata::Ascii>, TunnelError> {
    MetadataValue::try_from(value)
        .map_err(|_| TunnelError::Handshake(format!("{what} is not valid metadata: {value:?}")))
}
