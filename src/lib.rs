//! # contentflow
//!
//! Orchestrates a multi-stage content generation pipeline: keyword
//! research, content briefs, article writing, social media posts, and
//! YouTube scripts. Each project lives in its own directory with a JSON
//! snapshot as the source of truth; stages run through pluggable
//! executors with dependency gating and live progress fan-out.
//!
//! The [`core`] module holds the library surface; the binary in
//! `main.rs` is a thin CLI over it.

#![forbid(unsafe_code)]

pub mod core;

pub use core::{
    PipelineEngine, ProgressBus, ProjectRecord, ProjectStore, Settings, Stage, StageExecutor,
};

/// Application name used for config paths and logging.
pub const APP_NAME: &str = "contentflow";

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
