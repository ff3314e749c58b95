//! Envelope model: the frames a session speaks and their wire form
//!
//! A session exchanges a small vocabulary of frames: HELLO opens the call
//! and names the method, HEADER/TRAILER carry metadata, PAYLOAD carries one
//! opaque application message, ERROR carries a terminal status, and CLOSE is
//! the half-close marker. [`Envelope`] pairs a frame with its session id;
//! that is the one record the tunnel transports.

pub mod pb;

use crate::metadata::Metadata;
use prost::Message;
use thiserror::Error;
use tonic::{Code, Status};

/// Envelope codec errors.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("unknown frame kind: {0}")]
    UnknownKind(i32),

    #[error("envelope has no frame body")]
    MissingFrame,

    #[error("missing payload on {0} frame")]
    MissingPayload(&'static str),

    #[error("status decode failed: {0}")]
    StatusDecode(#[from] prost::DecodeError),
}

/// One per-session frame, decoded.
#[derive(Debug, Clone)]
pub enum Frame {
    /// First frame of a session; carries the fully-qualified method name.
    Hello { method: String },
    /// Initial metadata.
    Header(Metadata),
    /// One application message as an opaque type-url + bytes carrier.
    Payload(prost_types::Any),
    /// Trailing metadata.
    Trailer(Metadata),
    /// Terminal failure status.
    Error(Status),
    /// Half-close marker.
    Close,
}

impl Frame {
    /// Wire discriminator for this frame.
    pub fn kind(&self) -> pb::FrameKind {
        match self {
            Frame::Hello { .. } => pb::FrameKind::Hello,
            Frame::Header(_) => pb::FrameKind::Header,
            Frame::Payload(_) => pb::FrameKind::Payload,
            Frame::Trailer(_) => pb::FrameKind::Trailer,
            Frame::Error(_) => pb::FrameKind::Error,
            Frame::Close => pb::FrameKind::Close,
        }
    }

    /// True for the frames that terminate a direction (CLOSE or ERROR).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Close | Frame::Error(_))
    }

    pub fn into_wire(self) -> pb::Frame {
        match self {
            Frame::Hello { method } => pb::Frame {
                kind: pb::FrameKind::Hello as i32,
                method,
                ..Default::default()
            },
            Frame::Header(md) => pb::Frame {
                kind: pb::FrameKind::Header as i32,
                metadata: metadata_to_entries(&md),
                ..Default::default()
            },
            Frame::Payload(any) => pb::Frame {
                kind: pb::FrameKind::Payload as i32,
                payload: Some(any),
                ..Default::default()
            },
            Frame::Trailer(md) => pb::Frame {
                kind: pb::FrameKind::Trailer as i32,
                metadata: metadata_to_entries(&md),
                ..Default::default()
            },
            Frame::Error(status) => pb::Frame {
                kind: pb::FrameKind::Error as i32,
                payload: Some(status_to_any(&status)),
                ..Default::default()
            },
            Frame::Close => pb::Frame {
                kind: pb::FrameKind::Close as i32,
                ..Default::default()
            },
        }
    }

    pub fn from_wire(raw: pb::Frame) -> Result<Frame, EnvelopeError> {
        let kind = pb::FrameKind::try_from(raw.kind)
            .map_err(|_| EnvelopeError::UnknownKind(raw.kind))?;
        match kind {
            pb::FrameKind::Unknown => Err(EnvelopeError::UnknownKind(raw.kind)),
            pb::FrameKind::Hello => Ok(Frame::Hello { method: raw.method }),
            pb::FrameKind::Header => Ok(Frame::Header(entries_to_metadata(raw.metadata))),
            pb::FrameKind::Trailer => Ok(Frame::Trailer(entries_to_metadata(raw.metadata))),
            pb::FrameKind::Payload => raw
                .payload
                .map(Frame::Payload)
                .ok_or(EnvelopeError::MissingPayload("PAYLOAD")),
            pb::FrameKind::Error => {
                let any = raw
                    .payload
                    .ok_or(EnvelopeError::MissingPayload("ERROR"))?;
                Ok(Frame::Error(status_from_any(&any)?))
            }
            pb::FrameKind::Close => Ok(Frame::Close),
        }
    }
}

/// The outer record on the tunnel.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub session_id: String,
    pub frame: Frame,
}

impl Envelope {
    pub fn new(session_id: impl Into<String>, frame: Frame) -> Self {
        Self {
            session_id: session_id.into(),
            frame,
        }
    }

    pub fn into_wire(self) -> pb::Envelope {
        pb::Envelope {
            session_id: self.session_id,
            frame: Some(self.frame.into_wire()),
        }
    }

    pub fn from_wire(raw: pb::Envelope) -> Result<Envelope, EnvelopeError> {
        let frame = raw.frame.ok_or(EnvelopeError::MissingFrame)?;
        Ok(Envelope {
            session_id: raw.session_id,
            frame: Frame::from_wire(frame)?,
        })
    }
}

pub(crate) fn metadata_to_entries(md: &Metadata) -> Vec<pb::MetadataEntry> {
    md.iter()
        .map(|(key, values)| pb::MetadataEntry {
            key: key.to_string(),
            values: values.to_vec(),
        })
        .collect()
}

pub(crate) fn entries_to_metadata(entries: Vec<pb::MetadataEntry>) -> Metadata {
    let mut md = Metadata::new();
    for entry in entries {
        for value in entry.values {
            md.append(&entry.key, value);
        }
    }
    md
}

fn status_to_any(status: &Status) -> prost_types::Any {
    let raw = pb::RpcStatus {
        code: status.code() as i32,
        message: status.message().to_string(),
        details: Vec::new(),
    };
    prost_types::Any {
        type_url: <pb::RpcStatus as prost::Name>::type_url(),
        value: raw.encode_to_vec(),
    }
}

fn status_from_any(any: &prost_types::Any) -> Result<Status, EnvelopeError> {
    let raw = pb::RpcStatus::decode(any.value.as_slice())?;
    Ok(Status::new(Code::from(raw.code), raw.message))
}
