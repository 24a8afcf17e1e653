//! Concrete Stage Pipelines
//!
//! Implementations of [`StagePipeline`](crate::source::StagePipeline) that a
//! relay can host.
//!
//! # Available Pipelines
//!
//! - **Ollama**: single `generation` stage backed by a local Ollama server
//! - **Scripted**: plays back a fixed script; used by tests and demo mode
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::pipeline::OllamaPipeline;
//! use relay_core::source::{PipelineRequest, StagePipeline};
//!
//! let pipeline = OllamaPipeline::new("localhost", 11434, "llama3.2")?;
//! let rx = pipeline.start(&request, cancel_signal).await?;
//! ```

mod ollama;
mod scripted;

pub use ollama::{OllamaPipeline, DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT};
pub use scripted::ScriptedPipeline;
