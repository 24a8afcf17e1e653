//! Stage Source Adapter
//!
//! Wraps the external content pipeline (retrieval, reranking, generation)
//! behind one pull-based iteration of progress items. The generator never
//! sees how the pipeline is built; it only pulls [`SourceItem`]s.
//!
//! # Pipeline contract
//!
//! A [`StagePipeline`] starts work for a request and returns a channel of
//! [`PipelineEvent`]s. It must:
//!
//! - send `Finished` after its last item, or `Failed` on error
//! - stop producing once its [`CancelSignal`] fires or a send fails
//!
//! A channel that closes without `Finished` is treated as a fault.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::StageName;
use crate::supervisor::{CancelHandle, CancelReason, CancelSignal};

/// Events a pipeline sends on its channel
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A stage began
    StageStarted {
        /// Stage
        stage: StageName,
        /// Stage-specific number
        detail: u64,
    },
    /// A stage finished
    StageCompleted {
        /// Stage
        stage: StageName,
        /// Stage-specific number
        detail: u64,
    },
    /// A content fragment
    Fragment(String),
    /// No more items
    Finished,
    /// The pipeline failed; the text is internal and never sent to clients
    Failed(String),
}

/// Input handed to a pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineRequest {
    /// User input
    pub content: String,
    /// Conversation the stream continues
    pub session_id: String,
    /// Unique id of this stream
    pub stream_id: String,
}

/// External multi-stage content pipeline
#[async_trait]
pub trait StagePipeline: Send + Sync {
    /// Pipeline name for logs
    fn name(&self) -> &str;

    /// Check if the pipeline's dependencies are reachable
    async fn health_check(&self) -> bool;

    /// Start producing for `request`
    ///
    /// Returns a channel receiver that yields progress as it is produced.
    /// `cancel` fires when the consumer no longer wants output.
    async fn start(
        &self,
        request: &PipelineRequest,
        cancel: CancelSignal,
    ) -> anyhow::Result<mpsc::Receiver<PipelineEvent>>;
}

/// Non-terminal item pulled from a source
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressItem {
    /// Stage boundary: start
    StageStarted {
        /// Stage
        stage: StageName,
        /// Stage-specific number
        detail: u64,
    },
    /// Stage boundary: end
    StageCompleted {
        /// Stage
        stage: StageName,
        /// Stage-specific number
        detail: u64,
    },
    /// Content fragment, never empty
    Fragment(String),
}

/// Result of one pull
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceItem {
    /// Upstream produced something
    Progress(ProgressItem),
    /// Upstream finished normally
    Exhausted,
    /// Upstream failed; internal detail for logs only
    Fault(String),
}

/// Pull-based adapter over a running pipeline
///
/// Dropping the source cancels the pipeline, so no upstream work outlives
/// the session.
#[derive(Debug)]
pub struct StageSource {
    receiver: mpsc::Receiver<PipelineEvent>,
    upstream: CancelHandle,
    pulls: u64,
    finished: bool,
}

impl StageSource {
    /// Wrap a pipeline channel and the handle that cancels the pipeline
    #[must_use]
    pub fn new(receiver: mpsc::Receiver<PipelineEvent>, upstream: CancelHandle) -> Self {
        Self {
            receiver,
            upstream,
            pulls: 0,
            finished: false,
        }
    }

    /// Number of items received from upstream so far
    #[must_use]
    pub fn pulls(&self) -> u64 {
        self.pulls
    }

    /// Whether the source reported exhaustion or a fault, or was closed
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next item from upstream
    ///
    /// Cancel-safe: dropping the returned future before it resolves loses
    /// nothing.
    pub async fn next_item(&mut self) -> SourceItem {
        if self.finished {
            return SourceItem::Exhausted;
        }

        loop {
            let event = self.receiver.recv().await;
            self.pulls += 1;

            let item = match event {
                Some(PipelineEvent::StageStarted { stage, detail }) => {
                    SourceItem::Progress(ProgressItem::StageStarted { stage, detail })
                }
                Some(PipelineEvent::StageCompleted { stage, detail }) => {
                    SourceItem::Progress(ProgressItem::StageCompleted { stage, detail })
                }
                Some(PipelineEvent::Fragment(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    SourceItem::Progress(ProgressItem::Fragment(text))
                }
                Some(PipelineEvent::Finished) => SourceItem::Exhausted,
                Some(PipelineEvent::Failed(detail)) => SourceItem::Fault(detail),
                None => SourceItem::Fault("pipeline channel closed before completion".to_string()),
            };

            if !matches!(item, SourceItem::Progress(_)) {
                self.finished = true;
            }
            return item;
        }
    }

    /// Stop the pipeline and refuse further items
    pub fn close(&mut self, reason: CancelReason) {
        self.upstream.cancel(reason);
        self.receiver.close();
        self.finished = true;
    }
}

impl Drop for StageSource {
    fn drop(&mut self) {
        self.upstream.cancel(CancelReason::Requested);
    }
}
