//! Session State Tracking
//!
//! Per-session, in-memory record of where a stream is. One instance exists
//! per session, owned by that session's generator; nothing else mutates it.
//! It is never persisted and is dropped together with the generator once the
//! terminal envelope has been sent.
//!
//! # Lifecycle
//!
//! ```text
//! active --(done)------> completed  [terminal]
//! active --(cancelled)-> cancelled  [terminal]
//! active --(error)-----> errored    [terminal]
//! ```
//!
//! There are no transitions out of a terminal status.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::envelope::{Envelope, EnvelopeEvent, ErrorCode, StageName};

/// Status of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Streaming
    Active,
    /// Finished with `done`
    Completed,
    /// Finished with `cancelled`
    Cancelled,
    /// Finished with `error`
    Errored,
}

impl SessionStatus {
    /// Whether no further envelopes may follow
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Why a session errored
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Code sent to the client
    pub code: ErrorCode,
    /// Message sent to the client
    pub message: String,
}

/// An envelope that the current state does not allow
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum StateError {
    /// The session already ended
    #[error("session already ended with status {0:?}")]
    AlreadyTerminal(SessionStatus),

    /// A stage was started while already open
    #[error("stage {0} started twice")]
    StageAlreadyOpen(StageName),

    /// A stage was completed without a matching start
    #[error("stage {completed} completed while {open:?} was the innermost open stage")]
    StageNotOpen {
        /// Stage named by the completion
        completed: StageName,
        /// Innermost open stage, if any
        open: Option<StageName>,
    },
}

/// Live state of one streaming session
#[derive(Clone, Debug)]
pub struct SessionState {
    session_id: String,
    status: SessionStatus,
    /// Open stages, innermost last
    open_stages: Vec<StageName>,
    token_count: u64,
    error_detail: Option<ErrorDetail>,
    envelopes_emitted: u64,
    started_at: Instant,
}

impl SessionState {
    /// Fresh state for a session that is about to start streaming
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Active,
            open_stages: Vec::new(),
            token_count: 0,
            error_detail: None,
            envelopes_emitted: 0,
            started_at: Instant::now(),
        }
    }

    /// Conversation session id from the request
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Innermost open stage, `None` before the first stage starts
    #[must_use]
    pub fn current_stage(&self) -> Option<&StageName> {
        self.open_stages.last()
    }

    /// Number of `token` envelopes emitted so far
    #[must_use]
    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    /// Present only when the status is `Errored`
    #[must_use]
    pub fn error_detail(&self) -> Option<&ErrorDetail> {
        self.error_detail.as_ref()
    }

    /// Number of envelopes applied, terminal included
    #[must_use]
    pub fn envelopes_emitted(&self) -> u64 {
        self.envelopes_emitted
    }

    /// Time since the session started
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Check an envelope against the current state without applying it
    ///
    /// # Errors
    ///
    /// Same as [`apply`](Self::apply).
    pub fn check(&self, envelope: &Envelope) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::AlreadyTerminal(self.status));
        }

        match &envelope.event {
            EnvelopeEvent::StageStarted(payload) => {
                if self.open_stages.contains(&payload.stage) {
                    return Err(StateError::StageAlreadyOpen(payload.stage.clone()));
                }
            }
            EnvelopeEvent::StageCompleted(payload) => {
                if self.open_stages.last() != Some(&payload.stage) {
                    return Err(StateError::StageNotOpen {
                        completed: payload.stage.clone(),
                        open: self.open_stages.last().cloned(),
                    });
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Record an envelope that is about to be emitted
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the state untouched, if the envelope would
    /// follow a terminal envelope or break stage nesting.
    pub fn apply(&mut self, envelope: &Envelope) -> Result<(), StateError> {
        self.check(envelope)?;

        match &envelope.event {
            EnvelopeEvent::StageStarted(payload) => {
                self.open_stages.push(payload.stage.clone());
            }
            EnvelopeEvent::StageCompleted(_) => {
                self.open_stages.pop();
            }
            EnvelopeEvent::Token { .. } => {
                self.token_count += 1;
            }
            EnvelopeEvent::Done {} => {
                self.status = SessionStatus::Completed;
            }
            EnvelopeEvent::Cancelled {} => {
                self.status = SessionStatus::Cancelled;
            }
            EnvelopeEvent::Error { message, code } => {
                self.status = SessionStatus::Errored;
                self.error_detail = Some(ErrorDetail {
                    code: *code,
                    message: message.clone(),
                });
            }
        }

        self.envelopes_emitted += 1;
        Ok(())
    }

    /// Read-only snapshot for logging and metrics
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            current_stage: self.current_stage().cloned(),
            token_count: self.token_count,
            envelopes_emitted: self.envelopes_emitted,
            error_code: self.error_detail.as_ref().map(|d| d.code),
            elapsed: self.elapsed(),
        }
    }
}

/// Snapshot of a session, safe to hand to observers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    /// Conversation session id
    pub session_id: String,
    /// Status at snapshot time
    pub status: SessionStatus,
    /// Innermost open stage
    pub current_stage: Option<StageName>,
    /// Tokens emitted
    pub token_count: u64,
    /// Envelopes emitted
    pub envelopes_emitted: u64,
    /// Error code if errored
    pub error_code: Option<ErrorCode>,
    /// Session age
    pub elapsed: Duration,
}
