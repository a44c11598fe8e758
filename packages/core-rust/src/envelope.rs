//! Outbound and inbound message envelopes for the real-time channel.
//!
//! Mirrors the WebSocket frame model without depending on any particular
//! WebSocket implementation, so gateway layers and inner handlers can be
//! tested against plain channels.

use bytes::Bytes;

/// Classifies an envelope as application data or transport bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Application payload (text or binary).
    Data,
    /// Transport bookkeeping (ping, pong, close).
    Control,
}

/// Close frame payload: a status code and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// Normal closure (1000).
    pub const NORMAL: u16 = 1000;
    /// Server is going away (1001).
    pub const GOING_AWAY: u16 = 1001;
    /// Application-defined: connection is not authenticated.
    pub const UNAUTHENTICATED: u16 = 4401;
    /// Application-defined: authenticated but not permitted.
    pub const FORBIDDEN: u16 = 4403;

    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// A single message on the real-time channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
    /// Ping control frame.
    Ping(Bytes),
    /// Pong control frame.
    Pong(Bytes),
    /// Close control frame with an optional reason.
    Close(Option<CloseReason>),
}

impl Envelope {
    /// Builds a text envelope.
    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text(body.into())
    }

    /// Builds a text envelope holding the serialized JSON value.
    #[must_use]
    pub fn json(value: &serde_json::Value) -> Self {
        Self::Text(value.to_string())
    }

    /// Builds a close envelope with a code and reason.
    #[must_use]
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseReason::new(code, reason)))
    }

    /// Returns whether this envelope carries application data.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Text(_) | Self::Binary(_) => FrameKind::Data,
            Self::Ping(_) | Self::Pong(_) | Self::Close(_) => FrameKind::Control,
        }
    }

    /// Returns the text body, if this is a text frame.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(body) => Some(body),
            _ => None,
        }
    }
}
