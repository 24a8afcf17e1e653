//! Scripted pipeline
//!
//! Plays back a fixed list of [`PipelineEvent`]s. Every send respects
//! channel backpressure, so the consumer's pull rate controls how far the
//! script gets. The pipeline records whether it saw its cancel signal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::envelope::StageName;
use crate::source::{PipelineEvent, PipelineRequest, StagePipeline};
use crate::supervisor::CancelSignal;

/// Shared record of what the running scripts observed
#[derive(Debug, Default)]
struct Observations {
    cancelled: AtomicBool,
    notify: Notify,
    starts: AtomicUsize,
    sent: AtomicUsize,
}

impl Observations {
    fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Pipeline that replays a script
#[derive(Clone, Debug)]
pub struct ScriptedPipeline {
    script: Vec<PipelineEvent>,
    step_delay: Duration,
    stall_after: Option<usize>,
    start_failure: Option<String>,
    channel_capacity: usize,
    observations: Arc<Observations>,
}

impl ScriptedPipeline {
    /// Replay `script` as fast as the consumer pulls
    #[must_use]
    pub fn new(script: Vec<PipelineEvent>) -> Self {
        Self {
            script,
            step_delay: Duration::ZERO,
            stall_after: None,
            start_failure: None,
            channel_capacity: 1,
            observations: Arc::new(Observations::default()),
        }
    }

    /// Retrieval, reranking and generation stages around `words` as tokens
    #[must_use]
    pub fn staged(words: &[&str]) -> Self {
        let mut script = vec![
            PipelineEvent::StageStarted {
                stage: StageName::Retrieval,
                detail: 0,
            },
            PipelineEvent::StageCompleted {
                stage: StageName::Retrieval,
                detail: 5,
            },
            PipelineEvent::StageStarted {
                stage: StageName::Reranking,
                detail: 5,
            },
            PipelineEvent::StageCompleted {
                stage: StageName::Reranking,
                detail: 3,
            },
            PipelineEvent::StageStarted {
                stage: StageName::Generation,
                detail: 0,
            },
        ];
        script.extend(words.iter().map(|w| PipelineEvent::Fragment((*w).to_string())));
        script.push(PipelineEvent::StageCompleted {
            stage: StageName::Generation,
            detail: words.len() as u64,
        });
        script.push(PipelineEvent::Finished);
        Self::new(script)
    }

    /// Script served by the daemon's demo mode
    #[must_use]
    pub fn demo() -> Self {
        Self::staged(&[
            "Relay ", "is ", "streaming ", "this ", "answer ", "one ", "fragment ", "at ", "a ",
            "time.",
        ])
        .with_step_delay(Duration::from_millis(80))
    }

    /// Wait this long before each event
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Send the first `count` events, then produce nothing until cancelled
    #[must_use]
    pub fn stall_after(mut self, count: usize) -> Self {
        self.stall_after = Some(count);
        self
    }

    /// Make `start` fail with `message`
    #[must_use]
    pub fn with_start_failure(mut self, message: impl Into<String>) -> Self {
        self.start_failure = Some(message.into());
        self
    }

    /// Channel capacity between script and consumer (default: 1)
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Whether any run of this script saw its cancel signal
    #[must_use]
    pub fn observed_cancel(&self) -> bool {
        self.observations.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until a run of this script sees its cancel signal
    pub async fn cancellation_observed(&self) {
        loop {
            let notified = self.observations.notify.notified();
            if self.observed_cancel() {
                return;
            }
            notified.await;
        }
    }

    /// Number of times `start` succeeded
    #[must_use]
    pub fn starts(&self) -> usize {
        self.observations.starts.load(Ordering::SeqCst)
    }

    /// Events handed to the channel across all runs
    #[must_use]
    pub fn events_sent(&self) -> usize {
        self.observations.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StagePipeline for ScriptedPipeline {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn start(
        &self,
        request: &PipelineRequest,
        mut cancel: CancelSignal,
    ) -> anyhow::Result<mpsc::Receiver<PipelineEvent>> {
        if let Some(ref message) = self.start_failure {
            anyhow::bail!("{message}");
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let script = self.script.clone();
        let step_delay = self.step_delay;
        let stall_after = self.stall_after;
        let observations = Arc::clone(&self.observations);
        observations.starts.fetch_add(1, Ordering::SeqCst);

        tracing::debug!(stream_id = %request.stream_id, steps = script.len(), "Script started");

        tokio::spawn(async move {
            for (index, event) in script.into_iter().enumerate() {
                if stall_after == Some(index) {
                    break;
                }

                if !step_delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            observations.mark_cancelled();
                            return;
                        }
                        () = tokio::time::sleep(step_delay) => {}
                    }
                }

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        observations.mark_cancelled();
                        return;
                    }
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            // Consumer went away without cancelling first
                            observations.mark_cancelled();
                            return;
                        }
                        observations.sent.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }

            if stall_after.is_some() {
                cancel.cancelled().await;
                observations.mark_cancelled();
            }
        });

        Ok(rx)
    }
}
