//! Event Stream Generator
//!
//! Turns one running pipeline into a lazy, finite, non-restartable sequence
//! of envelopes. Each call to [`EventStream::next_envelope`] performs at most
//! one upstream pull:
//!
//! ```text
//!             ┌──────────────┐  stop?  ┌────────────┐
//!  next() ───▶│  Supervisor  │────────▶│ cancelled/ │──▶ terminal
//!             └──────┬───────┘   yes   │  timeout   │
//!                    │ no              └────────────┘
//!                    ▼
//!             ┌──────────────┐ (raced against Supervisor::stopped)
//!             │ StageSource  │──▶ progress ──▶ SessionState ──▶ envelope
//!             └──────────────┘──▶ exhausted ─▶ done      (terminal)
//!                              ─▶ fault ─────▶ error     (terminal)
//! ```
//!
//! Envelopes leave in exactly the order upstream produced them; nothing is
//! batched or reordered. After the terminal envelope every call returns
//! `None`.

use futures::Stream;
use tracing::{debug, error, info, warn, Instrument};

use crate::envelope::{now_ms, Envelope, ErrorCode};
use crate::source::{ProgressItem, SourceItem, StageSource};
use crate::state::SessionState;
use crate::supervisor::{CancelReason, StopReason, Supervisor};

/// Outcome of racing one pull against the supervisor
enum Pulled {
    Stop(StopReason),
    Item(SourceItem),
}

/// Lazy envelope sequence for one session
pub struct EventStream {
    stream_id: String,
    state: SessionState,
    source: StageSource,
    supervisor: Supervisor,
    last_emitted_at: u64,
    finished: bool,
    span: tracing::Span,
}

impl EventStream {
    /// Assemble a generator from its parts
    #[must_use]
    pub fn new(
        stream_id: impl Into<String>,
        state: SessionState,
        source: StageSource,
        supervisor: Supervisor,
    ) -> Self {
        let stream_id = stream_id.into();
        let span = tracing::info_span!(
            "session",
            session_id = %state.session_id(),
            stream_id = %stream_id
        );
        Self {
            stream_id,
            state,
            source,
            supervisor,
            last_emitted_at: 0,
            finished: false,
            span,
        }
    }

    /// Unique id of this stream
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Read-only view of the session state
    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Items pulled from upstream so far
    #[must_use]
    pub fn upstream_pulls(&self) -> u64 {
        self.source.pulls()
    }

    /// Whether the terminal envelope has been produced
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Produce the next envelope, or `None` once the stream has ended
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        if self.finished {
            return None;
        }
        let span = self.span.clone();
        Some(self.step().instrument(span).await)
    }

    /// Convert into a `futures::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream
                .next_envelope()
                .await
                .map(|envelope| (envelope, stream))
        })
    }

    async fn step(&mut self) -> Envelope {
        if let Some(reason) = self.supervisor.check() {
            return self.stop(reason);
        }

        let pulled = tokio::select! {
            biased;
            reason = self.supervisor.stopped() => Pulled::Stop(reason),
            item = self.source.next_item() => Pulled::Item(item),
        };

        match pulled {
            Pulled::Stop(reason) => self.stop(reason),
            Pulled::Item(SourceItem::Progress(item)) => self.progress(item),
            Pulled::Item(SourceItem::Exhausted) => {
                let envelope = Envelope::done(self.timestamp());
                self.terminate(envelope)
            }
            Pulled::Item(SourceItem::Fault(detail)) => {
                error!(error = %detail, "Upstream pipeline failed");
                let envelope = Envelope::error(ErrorCode::UpstreamFailure, self.timestamp());
                self.terminate(envelope)
            }
        }
    }

    fn progress(&mut self, item: ProgressItem) -> Envelope {
        let emitted_at = self.timestamp();
        let envelope = match item {
            ProgressItem::StageStarted { stage, detail } => {
                Envelope::stage_started(stage, detail, emitted_at)
            }
            ProgressItem::StageCompleted { stage, detail } => {
                Envelope::stage_completed(stage, detail, emitted_at)
            }
            ProgressItem::Fragment(text) => Envelope::token(text, emitted_at),
        };

        match self.state.apply(&envelope) {
            Ok(()) => {
                debug!(kind = %envelope.kind(), tokens = self.state.token_count(), "Envelope");
                envelope
            }
            Err(e) => {
                error!(error = %e, "Upstream broke the stage protocol");
                self.terminate(Envelope::error(ErrorCode::ProtocolViolation, emitted_at))
            }
        }
    }

    fn stop(&mut self, reason: StopReason) -> Envelope {
        match reason {
            StopReason::Cancelled(cause) => {
                info!(reason = %cause, "Session cancelled");
                self.source.close(cause);
                let envelope = Envelope::cancelled(self.timestamp());
                self.terminate(envelope)
            }
            StopReason::TimedOut => {
                warn!(
                    timeout_secs = self.supervisor.timeout().as_secs_f64(),
                    "Session timed out"
                );
                self.source.close(CancelReason::Requested);
                let envelope = Envelope::error(ErrorCode::Timeout, self.timestamp());
                self.terminate(envelope)
            }
        }
    }

    fn terminate(&mut self, envelope: Envelope) -> Envelope {
        if let Err(e) = self.state.apply(&envelope) {
            error!(error = %e, "Terminal envelope rejected by session state");
        }
        self.finished = true;
        if !self.source.is_finished() {
            self.source.close(CancelReason::Requested);
        }

        let summary = self.state.summary();
        info!(
            status = ?summary.status,
            tokens = summary.token_count,
            envelopes = summary.envelopes_emitted,
            upstream_pulls = self.source.pulls(),
            elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            "Session ended"
        );
        envelope
    }

    /// Wall clock, clamped so it never goes backwards within this session
    fn timestamp(&mut self) -> u64 {
        self.last_emitted_at = self.last_emitted_at.max(now_ms());
        self.last_emitted_at
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
