//! Core pipeline functionality.

pub mod engine;
pub mod error;
pub mod executor;
pub mod progress;
pub mod project;
pub mod settings;
pub mod stages;
pub mod store;

pub use engine::{
    PipelineEngine, PipelineRunResult, PipelineStatusReport, SetupReport, StageRunResult,
    StageStatusReport,
};
pub use error::{Error, Result};
pub use executor::{FnExecutor, ProgressFn, ScriptExecutor, StageExecutor, StageOutput};
pub use progress::{ProgressBus, ProgressScope, ProgressUpdate, SubscriptionId, ERROR_SENTINEL};
pub use project::{
    ConfigOverrides, InputData, ProjectConfig, ProjectRecord, ProjectSummary, StageState,
    StageStatus,
};
pub use settings::{Credentials, Settings};
pub use stages::{Stage, StageRegistry};
pub use store::{ExportFormat, ProjectStore, StoreStatistics};
