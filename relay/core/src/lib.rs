//! Relay Core - Streaming Response Sessions
//!
//! Turns the output of a multi-stage content pipeline (retrieval, reranking,
//! generation) into an ordered, cancellable sequence of typed envelopes that
//! a transport can write to a client as they are produced.
//!
//! # Architecture
//!
//! ```text
//!  StreamRequest
//!       │
//!       ▼
//! ┌───────────────┐   start    ┌────────────────┐  PipelineEvent  ┌──────────────┐
//! │ StreamManager │──────────▶│ StagePipeline  │────────────────▶│ StageSource  │
//! │  (admission)  │           │ (Ollama, demo) │◀── cancel ──────│  (adapter)   │
//! └───────┬───────┘           └────────────────┘                 └──────┬───────┘
//!         │ SessionHandle                                               │ pull
//!         ▼                                                             ▼
//! ┌───────────────┐   Envelope   ┌──────────────┐  should-stop?  ┌──────────────┐
//! │   Transport   │◀─────────────│ EventStream  │◀───────────────│  Supervisor  │
//! │ (FrameEncoder)│              │ (generator)  │──── apply ────▶│ SessionState │
//! └───────────────┘              └──────────────┘                └──────────────┘
//! ```
//!
//! Every session ends with exactly one terminal envelope (`done`, `error` or
//! `cancelled`), and nothing follows it.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{pipeline::ScriptedPipeline, StreamManager, StreamManagerConfig, StreamRequest};
//!
//! let manager = StreamManager::new(Arc::new(ScriptedPipeline::demo()), StreamManagerConfig::default());
//! let mut session = manager.start_stream(StreamRequest::new("hello", "conv-1")).await?;
//! while let Some(envelope) = session.next_envelope().await {
//!     write_frame(encoder.encode_envelope(&envelope).as_bytes()).await?;
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`envelope`]: Envelope types and constructors
//! - [`frame`]: Newline-delimited JSON framing
//! - [`request`]: Request validation and rejections
//! - [`state`]: Per-session state tracking
//! - [`supervisor`]: Cancellation and timeout supervision
//! - [`source`]: Pipeline contract and pull adapter
//! - [`generator`]: The envelope sequence itself
//! - [`manager`]: Session admission and start-stream entry point
//! - [`pipeline`]: Concrete pipelines
//! - [`config`]: TOML/env/CLI configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod envelope;
pub mod frame;
pub mod generator;
pub mod manager;
pub mod pipeline;
pub mod request;
pub mod source;
pub mod state;
pub mod supervisor;

pub use envelope::{Envelope, EnvelopeEvent, EnvelopeKind, ErrorCode, StageName, StageStatus};
pub use frame::{EnvelopeFrame, FrameDecoder, FrameEncoder, TransportError, STREAM_HEADERS};
pub use generator::EventStream;
pub use manager::{SessionHandle, StartError, StreamManager, StreamManagerConfig};
pub use request::{Rejection, RejectionCode, RequestError, RequestLimits, StreamRequest};
pub use source::{PipelineEvent, PipelineRequest, StagePipeline, StageSource};
pub use state::{SessionState, SessionStatus, SessionSummary};
pub use supervisor::{
    cancel_pair, CancelHandle, CancelReason, CancelSignal, StopReason, Supervisor,
    DEFAULT_SESSION_TIMEOUT, MAX_SESSION_TIMEOUT,
};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, PipelineKind, RelayConfig, RelayToml,
};
