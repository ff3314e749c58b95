//! Wire records for the `channel.v1` envelope schema
//!
//! Hand-written prost messages matching the schema the hub relay speaks.
//! The hub routes `Envelope` records verbatim by the tunnel-level
//! sender/receiver pairing; only the endpoints interpret the inner frame.

/// One `(key, values)` metadata entry on a HEADER or TRAILER frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetadataEntry {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, repeated, tag = "2")]
    pub values: Vec<String>,
}

/// Frame discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameKind {
    Unknown = 0,
    Hello = 1,
    Header = 2,
    Payload = 3,
    Trailer = 4,
    Close = 5,
    Error = 6,
}

/// The inner per-session frame.
///
/// `method` is populated on HELLO. `metadata` is populated on HEADER and
/// TRAILER. `payload` carries the application message on PAYLOAD and a
/// serialized [`RpcStatus`] on ERROR.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(enumeration = "FrameKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(message, repeated, tag = "3")]
    pub metadata: Vec<MetadataEntry>,
    #[prost(message, optional, tag = "4")]
    pub payload: Option<::prost_types::Any>,
}

/// The outer record on the tunnel: one frame addressed to one session.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub session_id: String,
    #[prost(message, optional, tag = "2")]
    pub frame: Option<Frame>,
}

/// `google.rpc.Status`, carried on ERROR frames.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<::prost_types::Any>,
}

impl ::prost::Name for RpcStatus {
    const NAME: &'static str = "Status";
    const PACKAGE: &'static str = "google.rpc";

    fn full_name() -> String {
        "google.rpc.Status".to_string()
    }

    fn type_url() -> String {
        "type.googleapis.com/google.rpc.Status".to_string()
    }
}
