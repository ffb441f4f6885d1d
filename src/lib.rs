//! # audio-ingest
//!
//! Core of a multi-stream audio ingestion subsystem: supervises one external
//! decoder process (FFmpeg) per source, fans its stdout into two ring
//! buffers (an overlapping analysis window and a time-indexed capture
//! window), and classifies decoder stderr into a restart/circuit-breaker
//! policy.
//!
//! Configuration loading, the CLI, persisted clip storage, and any
//! detection/archival logic are external collaborators; this crate emits
//! PCM bytes and audio-level events on channels and otherwise keeps no
//! state beyond the current fleet of sources.

pub mod buffers;
pub mod classifier;
pub mod config;
pub mod error;
pub mod level;
pub mod manager;
pub mod registry;
pub mod supervisor;
pub mod telemetry;

pub use error::{IngestError, Result};
pub use manager::{AnalysisChunk, Manager};
pub use registry::{SourceId, SourceRegistry, SourceType};
