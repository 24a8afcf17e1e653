//! Event Envelopes
//!
//! The wire-level unit of a response stream. Every other component either
//! produces envelopes (the generator) or consumes them (the frame encoder,
//! the state tracker, clients).
//!
//! # Wire Shape
//!
//! ```text
//! {"type":"stage-started","payload":{"stage":"retrieval","status":"started","detail":0},"emitted_at":1760000000000}
//! {"type":"token","payload":{"text":"Hel"},"emitted_at":1760000000001}
//! {"type":"done","payload":{},"emitted_at":1760000000002}
//! ```
//!
//! The set of kinds is closed. Adding one is a protocol change and must bump
//! [`PROTOCOL_VERSION`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Version of the envelope protocol spoken by this crate
pub const PROTOCOL_VERSION: u32 = 1;

/// Current wall-clock time as Unix milliseconds
#[must_use]
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

// ============================================================================
// Stages
// ============================================================================

/// A phase of the upstream content pipeline
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StageName {
    /// Document retrieval
    Retrieval,
    /// Reranking of retrieved documents
    Reranking,
    /// Token generation
    Generation,
    /// Any other stage a pipeline chooses to report
    Other(String),
}

impl StageName {
    /// The name as it appears on the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Retrieval => "retrieval",
            Self::Reranking => "reranking",
            Self::Generation => "generation",
            Self::Other(name) => name,
        }
    }

    /// Fold an `Other` that spells a known stage into its variant
    ///
    /// `Other("retrieval")` and `Retrieval` look the same on the wire, so
    /// envelopes only ever carry the variant.
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Other(name) => Self::from(name),
            known => known,
        }
    }
}

impl From<String> for StageName {
    fn from(name: String) -> Self {
        match name.as_str() {
            "retrieval" => Self::Retrieval,
            "reranking" => Self::Reranking,
            "generation" => Self::Generation,
            _ => Self::Other(name),
        }
    }
}

impl From<&str> for StageName {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<StageName> for String {
    fn from(stage: StageName) -> Self {
        match stage {
            StageName::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress status carried by stage envelopes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage began
    Started,
    /// The stage finished
    Completed,
}

/// Payload of `stage-started` and `stage-completed` envelopes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePayload {
    /// Which stage this is about
    pub stage: StageName,
    /// Started or completed
    pub status: StageStatus,
    /// Stage-specific number (documents retrieved, fragments produced, ...)
    #[serde(default)]
    pub detail: u64,
}

// ============================================================================
// Error codes
// ============================================================================

/// Machine-readable code attached to `error` envelopes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The session exceeded its time ceiling
    Timeout,
    /// The upstream pipeline failed
    UpstreamFailure,
    /// The upstream pipeline broke the stage protocol
    ProtocolViolation,
    /// An envelope could not be serialized
    EncodingFailure,
    /// Anything else
    Internal,
}

impl ErrorCode {
    /// Whether a client may reasonably retry the same request
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::UpstreamFailure)
    }

    /// The code as it appears on the wire
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::UpstreamFailure => "upstream_failure",
            Self::ProtocolViolation => "protocol_violation",
            Self::EncodingFailure => "encoding_failure",
            Self::Internal => "internal",
        }
    }

    /// Client-facing message for this code
    ///
    /// These are the only error texts that ever leave the process.
    #[must_use]
    pub fn public_message(self) -> &'static str {
        match self {
            Self::Timeout => "the response timed out",
            Self::UpstreamFailure => "the response could not be completed",
            Self::ProtocolViolation => "the response pipeline misbehaved",
            Self::EncodingFailure => "an event could not be encoded",
            Self::Internal => "internal error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Kind-specific body of an envelope
///
/// Stage payloads repeat their status inside the payload; decoding an
/// [`Envelope`] rejects a payload whose status disagrees with its `type`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EnvelopeEvent {
    /// A pipeline stage began
    StageStarted(StagePayload),
    /// A pipeline stage finished
    StageCompleted(StagePayload),
    /// One generated text fragment
    Token {
        /// The fragment
        text: String,
    },
    /// Stream completed successfully (terminal)
    Done {},
    /// Stream failed (terminal)
    Error {
        /// Sanitized, client-safe description
        message: String,
        /// Machine-readable code
        code: ErrorCode,
    },
    /// Stream was cancelled (terminal)
    Cancelled {},
}

/// Discriminant of an envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// `stage-started`
    StageStarted,
    /// `stage-completed`
    StageCompleted,
    /// `token`
    Token,
    /// `done`
    Done,
    /// `error`
    Error,
    /// `cancelled`
    Cancelled,
}

impl EnvelopeKind {
    /// The wire name of this kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StageStarted => "stage-started",
            Self::StageCompleted => "stage-completed",
            Self::Token => "token",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether envelopes of this kind end a session
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discrete unit of a response stream
///
/// Immutable once built. Emitted once and never stored after transmission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    /// Kind and payload
    #[serde(flatten)]
    pub event: EnvelopeEvent,
    /// Unix milliseconds, non-decreasing within one session
    pub emitted_at: u64,
}

/// Decoding shape of [`Envelope`], checked before it becomes one
#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(flatten)]
    event: EnvelopeEvent,
    emitted_at: u64,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = String;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let (payload, expected) = match &wire.event {
            EnvelopeEvent::StageStarted(payload) => (payload, StageStatus::Started),
            EnvelopeEvent::StageCompleted(payload) => (payload, StageStatus::Completed),
            _ => return Ok(Self::new(wire.event, wire.emitted_at)),
        };
        if payload.status != expected {
            return Err(format!(
                "stage status {:?} does not match envelope type",
                payload.status
            ));
        }
        Ok(Self::new(wire.event, wire.emitted_at))
    }
}

impl Envelope {
    /// Build an envelope with an explicit timestamp
    #[must_use]
    pub fn new(event: EnvelopeEvent, emitted_at: u64) -> Self {
        Self { event, emitted_at }
    }

    /// `stage-started` envelope
    #[must_use]
    pub fn stage_started(stage: StageName, detail: u64, emitted_at: u64) -> Self {
        Self::new(
            EnvelopeEvent::StageStarted(StagePayload {
                stage: stage.normalized(),
                status: StageStatus::Started,
                detail,
            }),
            emitted_at,
        )
    }

    /// `stage-completed` envelope
    #[must_use]
    pub fn stage_completed(stage: StageName, detail: u64, emitted_at: u64) -> Self {
        Self::new(
            EnvelopeEvent::StageCompleted(StagePayload {
                stage: stage.normalized(),
                status: StageStatus::Completed,
                detail,
            }),
            emitted_at,
        )
    }

    /// `token` envelope
    #[must_use]
    pub fn token(text: impl Into<String>, emitted_at: u64) -> Self {
        Self::new(EnvelopeEvent::Token { text: text.into() }, emitted_at)
    }

    /// `done` envelope
    #[must_use]
    pub fn done(emitted_at: u64) -> Self {
        Self::new(EnvelopeEvent::Done {}, emitted_at)
    }

    /// `cancelled` envelope
    #[must_use]
    pub fn cancelled(emitted_at: u64) -> Self {
        Self::new(EnvelopeEvent::Cancelled {}, emitted_at)
    }

    /// `error` envelope with the public message for `code`
    #[must_use]
    pub fn error(code: ErrorCode, emitted_at: u64) -> Self {
        Self::new(
            EnvelopeEvent::Error {
                message: code.public_message().to_string(),
                code,
            },
            emitted_at,
        )
    }

    /// The envelope's kind
    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        match self.event {
            EnvelopeEvent::StageStarted(_) => EnvelopeKind::StageStarted,
            EnvelopeEvent::StageCompleted(_) => EnvelopeKind::StageCompleted,
            EnvelopeEvent::Token { .. } => EnvelopeKind::Token,
            EnvelopeEvent::Done {} => EnvelopeKind::Done,
            EnvelopeEvent::Error { .. } => EnvelopeKind::Error,
            EnvelopeEvent::Cancelled {} => EnvelopeKind::Cancelled,
        }
    }

    /// Whether this envelope ends its session
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Error code, if this is an `error` envelope
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match &self.event {
            EnvelopeEvent::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Token text, if this is a `token` envelope
    #[must_use]
    pub fn token_text(&self) -> Option<&str> {
        match &self.event {
            EnvelopeEvent::Token { text } => Some(text),
            _ => None,
        }
    }
}
