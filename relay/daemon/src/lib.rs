//! Relay Daemon
//!
//! Serves streaming response sessions over a Unix socket. Each connection
//! sends one request line and receives newline-delimited envelopes until the
//! session's terminal envelope.
//!
//! - [`server`]: socket lifecycle, peer checks, accept loop, shutdown
//! - [`connection`]: the per-connection request/stream protocol

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod connection;
pub mod server;

use std::sync::Arc;

use anyhow::{Context, Result};

use relay_core::pipeline::{OllamaPipeline, ScriptedPipeline};
use relay_core::{PipelineKind, RelayConfig, StagePipeline};

pub use connection::{handle_connection, ConnectionLimits, ConnectionOutcome};
pub use server::{ConnectionId, DaemonServer, ServerConfig};

/// Construct the pipeline named by the configuration
///
/// # Errors
///
/// Fails if the Ollama HTTP client cannot be built.
pub fn build_pipeline(config: &RelayConfig) -> Result<Arc<dyn StagePipeline>> {
    match config.pipeline {
        PipelineKind::Demo => Ok(Arc::new(
            ScriptedPipeline::demo().with_channel_capacity(config.channel_capacity),
        )),
        PipelineKind::Ollama => {
            let pipeline =
                OllamaPipeline::new(config.ollama_host.clone(), config.ollama_port, config.model.clone())
                    .context("Failed to create Ollama pipeline")?
                    .with_channel_capacity(config.channel_capacity);
            Ok(Arc::new(pipeline))
        }
    }
}
