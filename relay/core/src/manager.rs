//! Stream Manager
//!
//! Entry point for starting sessions. Validates requests, enforces admission
//! (one stream per conversation, bounded concurrency), wires a pipeline to a
//! generator and hands the caller a [`SessionHandle`].
//!
//! ```text
//!  StreamRequest ──validate──▶ admit ──▶ pipeline.start ──▶ SessionHandle
//!        │                       │                            │
//!        ▼                       ▼                            ▼
//!    Rejection            SessionBusy /              envelopes until terminal
//!                      CapacityExhausted
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::envelope::Envelope;
use crate::generator::EventStream;
use crate::request::{Rejection, RejectionCode, RequestError, RequestLimits, StreamRequest};
use crate::source::{PipelineEvent, PipelineRequest, StagePipeline, StageSource};
use crate::state::SessionState;
use crate::supervisor::{cancel_pair, CancelHandle, CancelReason, Supervisor, DEFAULT_SESSION_TIMEOUT};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the stream manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamManagerConfig {
    /// Ceiling on one session, measured from its start
    pub session_timeout: Duration,
    /// Maximum number of sessions streaming at once
    pub max_concurrent_sessions: usize,
    /// Inbound request limits
    pub limits: RequestLimits,
}

impl Default for StreamManagerConfig {
    fn default() -> Self {
        Self {
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            max_concurrent_sessions: 16,
            limits: RequestLimits::default(),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Why a stream could not be started
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    /// The request failed validation
    #[error(transparent)]
    Invalid(#[from] RequestError),

    /// The conversation already has a stream in flight
    #[error("session {0} already has an active stream")]
    SessionBusy(String),

    /// All session slots are in use
    #[error("maximum concurrent sessions reached ({0})")]
    CapacityExhausted(usize),

    /// The manager is shutting down
    #[error("relay is shutting down")]
    ShuttingDown,
}

impl From<&StartError> for Rejection {
    fn from(error: &StartError) -> Self {
        match error {
            StartError::Invalid(e) => Rejection::from(e),
            StartError::SessionBusy(_) => Rejection::new(RejectionCode::SessionBusy, error.to_string()),
            StartError::CapacityExhausted(_) => {
                Rejection::new(RejectionCode::CapacityExhausted, error.to_string())
            }
            StartError::ShuttingDown => Rejection::new(RejectionCode::Unavailable, error.to_string()),
        }
    }
}

// ============================================================================
// Admission registry
// ============================================================================

#[derive(Debug)]
struct ActiveSession {
    stream_id: String,
    cancel: CancelHandle,
}

#[derive(Debug, Default)]
struct Registry {
    sessions: DashMap<String, ActiveSession>,
    active: AtomicUsize,
}

/// Holds one admission slot; releasing it frees the slot and the session id
#[derive(Debug)]
struct SlotGuard {
    registry: Arc<Registry>,
    session_id: String,
    stream_id: String,
    counted: bool,
}

impl SlotGuard {
    fn reserve_slot(&mut self, max: usize) -> bool {
        let reserved = self
            .registry
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .is_ok();
        self.counted = reserved;
        reserved
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.registry
            .sessions
            .remove_if(&self.session_id, |_, s| s.stream_id == self.stream_id);
        if self.counted {
            self.registry.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Stream Manager
// ============================================================================

/// Starts and tracks streaming sessions
pub struct StreamManager {
    pipeline: Arc<dyn StagePipeline>,
    config: StreamManagerConfig,
    registry: Arc<Registry>,
    shutting_down: AtomicBool,
    total_sessions_started: AtomicU64,
}

impl StreamManager {
    /// Create a manager serving sessions from `pipeline`
    #[must_use]
    pub fn new(pipeline: Arc<dyn StagePipeline>, config: StreamManagerConfig) -> Self {
        Self {
            pipeline,
            config,
            registry: Arc::new(Registry::default()),
            shutting_down: AtomicBool::new(false),
            total_sessions_started: AtomicU64::new(0),
        }
    }

    /// Get the current configuration
    #[must_use]
    pub fn config(&self) -> &StreamManagerConfig {
        &self.config
    }

    /// Name of the hosted pipeline
    #[must_use]
    pub fn pipeline_name(&self) -> &str {
        self.pipeline.name()
    }

    /// Number of sessions currently holding a slot
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.registry.active.load(Ordering::SeqCst)
    }

    /// Whether a conversation has a stream in flight
    #[must_use]
    pub fn has_session(&self, session_id: &str) -> bool {
        self.registry.sessions.contains_key(session_id)
    }

    /// Sessions started since creation
    #[must_use]
    pub fn total_sessions_started(&self) -> u64 {
        self.total_sessions_started.load(Ordering::Relaxed)
    }

    /// Start streaming a response to `request`
    ///
    /// If the pipeline fails to start, the session still opens and ends with
    /// an `upstream_failure` error envelope.
    ///
    /// # Errors
    ///
    /// Returns an error, before any envelope exists, if the request is
    /// invalid, the conversation already has a stream, every slot is taken,
    /// or the manager is shutting down.
    pub async fn start_stream(&self, request: StreamRequest) -> Result<SessionHandle, StartError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(StartError::ShuttingDown);
        }
        if let Err(e) = request.validate(&self.config.limits) {
            warn!(session_id = %request.session_id, error = %e, "Rejected invalid request");
            return Err(e.into());
        }

        let stream_id = uuid::Uuid::new_v4().to_string();
        let (cancel, signal) = cancel_pair();
        let slot = self.admit(&request.session_id, &stream_id, &cancel)?;

        let supervisor = Supervisor::new(signal, self.config.session_timeout);
        let state = SessionState::new(request.session_id.clone());
        let (upstream, upstream_signal) = cancel_pair();
        let pipeline_request = PipelineRequest {
            content: request.content,
            session_id: request.session_id,
            stream_id: stream_id.clone(),
        };

        let receiver = match self.pipeline.start(&pipeline_request, upstream_signal).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(
                    session_id = %pipeline_request.session_id,
                    pipeline = self.pipeline.name(),
                    error = %format!("{e:#}"),
                    "Pipeline failed to start"
                );
                failed_channel(format!("{e:#}"))
            }
        };

        self.total_sessions_started.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %pipeline_request.session_id,
            stream_id = %stream_id,
            pipeline = self.pipeline.name(),
            active = self.active_count(),
            "Session started"
        );

        let source = StageSource::new(receiver, upstream);
        Ok(SessionHandle {
            stream: EventStream::new(stream_id, state, source, supervisor),
            cancel,
            slot: Some(slot),
        })
    }

    /// Deliver an explicit stop signal to a conversation's stream
    ///
    /// Returns `false` if the conversation has no stream in flight.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.registry.sessions.get(session_id) {
            Some(session) => {
                session.cancel.cancel(CancelReason::Requested);
                true
            }
            None => false,
        }
    }

    /// Refuse new sessions and cancel every active one
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let mut cancelled = 0usize;
        for session in self.registry.sessions.iter() {
            session.cancel.cancel(CancelReason::Shutdown);
            cancelled += 1;
        }
        info!(cancelled, "Stream manager shut down");
    }

    fn admit(
        &self,
        session_id: &str,
        stream_id: &str,
        cancel: &CancelHandle,
    ) -> Result<SlotGuard, StartError> {
        match self.registry.sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => {
                warn!(session_id, "Rejected second stream for busy session");
                return Err(StartError::SessionBusy(session_id.to_string()));
            }
            Entry::Vacant(entry) => {
                entry.insert(ActiveSession {
                    stream_id: stream_id.to_string(),
                    cancel: cancel.clone(),
                });
            }
        }

        let mut slot = SlotGuard {
            registry: Arc::clone(&self.registry),
            session_id: session_id.to_string(),
            stream_id: stream_id.to_string(),
            counted: false,
        };
        let max = self.config.max_concurrent_sessions;
        if !slot.reserve_slot(max) {
            warn!(session_id, max, "Rejected stream at capacity");
            return Err(StartError::CapacityExhausted(max));
        }
        Ok(slot)
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("pipeline", &self.pipeline.name())
            .field("config", &self.config)
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

/// A receiver that yields a single failure
fn failed_channel(detail: String) -> mpsc::Receiver<PipelineEvent> {
    let (tx, rx) = mpsc::channel(1);
    // Capacity 1 and a fresh channel: cannot be full or closed
    let _ = tx.try_send(PipelineEvent::Failed(detail));
    rx
}

// ============================================================================
// Session Handle
// ============================================================================

/// Caller-side handle on one running session
///
/// Dropping the handle cancels upstream work and frees the admission slot.
/// The slot is also freed as soon as the terminal envelope is produced.
#[derive(Debug)]
pub struct SessionHandle {
    stream: EventStream,
    cancel: CancelHandle,
    slot: Option<SlotGuard>,
}

impl SessionHandle {
    /// Produce the next envelope, or `None` after the terminal one
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        let envelope = self.stream.next_envelope().await;
        if self.stream.is_finished() {
            self.slot = None;
        }
        envelope
    }

    /// Handle the transport uses to signal disconnects
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Read-only view of the session state
    #[must_use]
    pub fn state(&self) -> &SessionState {
        self.stream.state()
    }

    /// Unique id of this stream
    #[must_use]
    pub fn stream_id(&self) -> &str {
        self.stream.stream_id()
    }

    /// Items pulled from upstream so far
    #[must_use]
    pub fn upstream_pulls(&self) -> u64 {
        self.stream.upstream_pulls()
    }

    /// Convert into a `futures::Stream` of envelopes
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        futures::stream::unfold(self, |mut handle| async move {
            handle
                .next_envelope()
                .await
                .map(|envelope| (envelope, handle))
        })
    }
}
