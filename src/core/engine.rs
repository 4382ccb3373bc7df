//! Pipeline engine.
//!
//! Drives stage execution: dependency gating, per-(project, stage) run
//! guards, executor dispatch with panic isolation, output organization,
//! snapshot persistence, and progress publication. Executor failures are
//! reported as structured results rather than errors; errors are
//! reserved for store and registry faults.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::Result;
use super::executor::{ScriptExecutor, StageExecutor, StageOutput};
use super::progress::{ProgressBus, ProgressScope, SubscriptionId, ERROR_SENTINEL};
use super::project::{ProjectRecord, StageState};
use super::settings::{Credentials, Settings};
use super::stages::{Stage, StageRegistry};
use super::store::ProjectStore;

/// Outcome of one stage run.
#[derive(Debug, Clone, Serialize)]
pub struct StageRunResult {
    /// Stage that ran
    pub stage: Stage,
    /// Whether the run finished successfully (or was already complete)
    pub success: bool,
    /// Human-readable outcome
    pub message: String,
    /// Output files recorded for the stage
    pub outputs: Vec<String>,
    /// Captured stdout, when the executor provided it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured stderr, when the executor provided it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl StageRunResult {
    fn failure(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            success: false,
            message: message.into(),
            outputs: Vec::new(),
            stdout: None,
            stderr: None,
        }
    }
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    /// Project the pipeline ran for
    pub project_id: String,
    /// Whether every executed stage succeeded
    pub success: bool,
    /// Per-stage results in execution order, up to the first failure
    pub results: Vec<StageRunResult>,
}

/// Status report for one stage of one project.
#[derive(Debug, Clone, Serialize)]
pub struct StageStatusReport {
    /// Stage the report covers
    pub stage: Stage,
    /// Current execution state
    pub status: StageState,
    /// Completion timestamp, when completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Error from the last failed run
    pub error: Option<String>,
    /// Whether the stage can run now
    pub runnable: bool,
    /// Why the stage cannot run, when it cannot
    pub blocked_reason: Option<String>,
    /// Recorded output files
    pub outputs: Vec<String>,
}

/// Status report across all stages of one project.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatusReport {
    /// Project the report covers
    pub project_id: String,
    /// Completed stages as a share of all stages, in percent
    pub completion_percentage: f64,
    /// Per-stage reports in pipeline order
    pub stages: Vec<StageStatusReport>,
}

/// Result of a pre-flight validation check.
#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    /// Whether the project can run the full pipeline
    pub valid: bool,
    /// Problems found, empty when valid
    pub issues: Vec<String>,
}

/// Orchestrates stage execution for stored projects.
pub struct PipelineEngine {
    store: Arc<ProjectStore>,
    bus: Arc<ProgressBus>,
    registry: StageRegistry,
    executors: HashMap<Stage, Arc<dyn StageExecutor>>,
    running: Mutex<HashSet<(String, Stage)>>,
    credentials: Credentials,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("store", &self.store)
            .field("executors", &self.executors.len())
            .field("running", &self.running.lock().len())
            .finish()
    }
}

impl PipelineEngine {
    /// Build an engine over a store with no executors registered.
    pub fn new(store: Arc<ProjectStore>, credentials: Credentials) -> Self {
        Self {
            store,
            bus: Arc::new(ProgressBus::new()),
            registry: StageRegistry::new(),
            executors: HashMap::new(),
            running: Mutex::new(HashSet::new()),
            credentials,
        }
    }

    /// Build an engine with the script executor registered for every stage.
    pub fn script_defaults(store: Arc<ProjectStore>, settings: &Settings) -> Self {
        let mut engine = Self::new(store, settings.credentials.clone());
        let executor: Arc<dyn StageExecutor> = Arc::new(ScriptExecutor::from_settings(settings));
        for stage in Stage::ALL {
            engine.executors.insert(stage, Arc::clone(&executor));
        }
        engine
    }

    /// Register (or replace) the executor for a stage.
    pub fn register_executor(&mut self, stage: Stage, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(stage, executor);
    }

    /// The store this engine persists through.
    pub fn store(&self) -> &Arc<ProjectStore> {
        &self.store
    }

    /// The progress bus this engine publishes to.
    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.bus
    }

    /// Subscribe to progress updates from this engine's runs.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&super::progress::ProgressUpdate) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    /// Whether a stage's dependencies are satisfied, with the first
    /// unmet dependency named when they are not.
    pub fn can_run(&self, project: &ProjectRecord, stage: Stage) -> (bool, String) {
        for dep in self.registry.dependencies(stage) {
            let status = project.stage_status(*dep);
            if !status.status.is_completed() {
                return (
                    false,
                    format!("Dependency {dep} not completed (status: {})", status.status),
                );
            }
        }
        (true, String::new())
    }

    /// Run a single stage for a project.
    ///
    /// An already-completed stage returns success without re-running
    /// unless `force` is set. Executor failures and panics are reported
    /// in the result; errors are reserved for store faults.
    pub fn run_stage(&self, project_id: &str, stage: Stage, force: bool) -> Result<StageRunResult> {
        let Some(_guard) = RunGuard::acquire(&self.running, project_id, stage) else {
            return Ok(StageRunResult::failure(
                stage,
                format!("Stage {stage} is already running for this project"),
            ));
        };

        let Some(mut project) = self.store.load(project_id)? else {
            return Ok(StageRunResult::failure(
                stage,
                format!("Project {project_id} not found"),
            ));
        };

        if project.stage_status(stage).status.is_completed() && !force {
            return Ok(StageRunResult {
                stage,
                success: true,
                message: format!("Stage {stage} already completed"),
                outputs: project.outputs(stage).to_vec(),
                stdout: None,
                stderr: None,
            });
        }

        let (runnable, reason) = self.can_run(&project, stage);
        if !runnable {
            return Ok(StageRunResult::failure(stage, reason));
        }

        let Some(executor) = self.executors.get(&stage) else {
            return Ok(StageRunResult::failure(
                stage,
                format!("No executor registered for stage {stage}"),
            ));
        };

        info!(project_id, stage = %stage, "starting stage");
        project.update_stage_status(stage, StageState::Running, None);
        self.store.save(&project)?;
        let scope = ProgressScope::Stage(stage);
        self.bus.publish(project_id, scope, 0.0, "Starting stage execution");

        let executor = Arc::clone(executor);
        let bus = Arc::clone(&self.bus);
        let progress_project = project_id.to_string();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            executor.execute(&project, stage, &|percent, message| {
                bus.publish(&progress_project, scope, percent, message);
            })
        }));

        match outcome {
            Ok(Ok(output)) => {
                let outputs = self.organize_outputs(&mut project, stage, &output);
                project.update_stage_status(stage, StageState::Completed, None);
                self.store.save(&project)?;
                self.bus.publish(project_id, scope, 100.0, format!("Stage {stage} completed"));
                info!(project_id, stage = %stage, files = outputs.len(), "stage completed");
                Ok(StageRunResult {
                    stage,
                    success: true,
                    message: format!("Stage {stage} completed"),
                    outputs,
                    stdout: output.stdout,
                    stderr: output.stderr,
                })
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                self.record_failure(&mut project, stage, &message)?;
                Ok(StageRunResult::failure(stage, message))
            }
            Err(panic) => {
                let message = format!("stage executor panicked: {}", panic_message(panic.as_ref()));
                self.record_failure(&mut project, stage, &message)?;
                Ok(StageRunResult::failure(stage, message))
            }
        }
    }

    /// Run stages in pipeline order, stopping at the first failure.
    ///
    /// With `start_stage` set, earlier stages are skipped (their
    /// completion is still enforced by dependency gating).
    pub fn run_pipeline(
        &self,
        project_id: &str,
        start_stage: Option<Stage>,
        force: bool,
    ) -> Result<PipelineRunResult> {
        let stages = match start_stage {
            Some(stage) => self.registry.ordered_from(stage),
            None => self.registry.ordered(),
        };
        let total = self.registry.ordered().len();

        let mut results = Vec::new();
        let mut success = true;
        for &stage in stages {
            let percent = (stage.index() as f32 / total as f32) * 100.0;
            self.bus.publish(
                project_id,
                ProgressScope::Pipeline,
                percent,
                format!("Executing {stage}"),
            );
            let result = self.run_stage(project_id, stage, force)?;
            let failed = !result.success;
            results.push(result);
            if failed {
                success = false;
                break;
            }
        }

        if success {
            self.bus.publish(project_id, ProgressScope::Pipeline, 100.0, "Pipeline completed");
        } else {
            self.bus.publish(
                project_id,
                ProgressScope::Pipeline,
                ERROR_SENTINEL,
                "Pipeline failed",
            );
        }

        Ok(PipelineRunResult { project_id: project_id.to_string(), success, results })
    }

    /// Status report for one stage.
    pub fn status(&self, project_id: &str, stage: Stage) -> Result<Option<StageStatusReport>> {
        let Some(project) = self.store.load(project_id)? else {
            return Ok(None);
        };
        Ok(Some(self.stage_report(&project, stage)))
    }

    /// Status report across all stages.
    pub fn pipeline_status(&self, project_id: &str) -> Result<Option<PipelineStatusReport>> {
        let Some(project) = self.store.load(project_id)? else {
            return Ok(None);
        };
        let stages = self
            .registry
            .ordered()
            .iter()
            .map(|stage| self.stage_report(&project, *stage))
            .collect();
        Ok(Some(PipelineStatusReport {
            project_id: project.id.clone(),
            completion_percentage: project.completion_percentage(),
            stages,
        }))
    }

    /// Pre-flight validation: inputs, executors, and credentials.
    pub fn validate_setup(&self, project_id: &str) -> Result<SetupReport> {
        let Some(project) = self.store.load(project_id)? else {
            return Ok(SetupReport {
                valid: false,
                issues: vec![format!("Project {project_id} not found")],
            });
        };

        let mut issues = Vec::new();
        if project.input_data.seed_keywords.is_empty() {
            issues.push("No seed keywords provided".to_string());
        }
        for stage in Stage::ALL {
            match self.executors.get(&stage) {
                None => issues.push(format!("No executor registered for stage {stage}")),
                Some(executor) => {
                    if let Err(err) = executor.resolve(&project, stage) {
                        issues.push(format!("Stage {stage} cannot run: {err:#}"));
                    }
                }
            }
        }
        if self.credentials.dataforseo_login.is_empty()
            || self.credentials.dataforseo_password.is_empty()
        {
            issues.push("DataForSEO credentials not configured".to_string());
        }
        if project.config.content_generator == "openai" && self.credentials.openai_api_key.is_none()
        {
            issues.push("OpenAI API key not configured".to_string());
        }

        Ok(SetupReport { valid: issues.is_empty(), issues })
    }

    fn stage_report(&self, project: &ProjectRecord, stage: Stage) -> StageStatusReport {
        let status = project.stage_status(stage);
        let (runnable, reason) = self.can_run(project, stage);
        StageStatusReport {
            stage,
            status: status.status,
            completed_at: status.completed_at,
            error: status.error.clone(),
            runnable,
            blocked_reason: if runnable { None } else { Some(reason) },
            outputs: project.outputs(stage).to_vec(),
        }
    }

    /// Move expected outputs the executor left in the project root into
    /// the stage directory, then record the combined manifest.
    fn organize_outputs(
        &self,
        project: &mut ProjectRecord,
        stage: Stage,
        output: &StageOutput,
    ) -> Vec<String> {
        let stage_dir = project.stage_dir(stage);
        if let Err(err) = std::fs::create_dir_all(&stage_dir) {
            warn!(stage = %stage, error = %err, "could not create stage directory");
        }

        for name in stage.expected_outputs() {
            let loose = project.project_path.join(name);
            if loose.is_file() {
                let target = stage_dir.join(name);
                match std::fs::rename(&loose, &target) {
                    Ok(()) => debug!(stage = %stage, file = name, "moved output into stage directory"),
                    Err(err) => {
                        warn!(stage = %stage, file = name, error = %err, "could not move output");
                        continue;
                    }
                }
            }
            if stage_dir.join(name).is_file() {
                project.add_output_file(stage, format!("{}/{name}", stage.dir_name()));
            }
        }
        for file in &output.files {
            project.add_output_file(stage, file.clone());
        }
        project.outputs(stage).to_vec()
    }

    fn record_failure(
        &self,
        project: &mut ProjectRecord,
        stage: Stage,
        message: &str,
    ) -> Result<()> {
        warn!(project_id = %project.id, stage = %stage, error = message, "stage failed");
        project.update_stage_status(stage, StageState::Failed, Some(message.to_string()));
        self.store.save(project)?;
        self.bus
            .publish(&project.id, ProgressScope::Stage(stage), ERROR_SENTINEL, message);
        Ok(())
    }
}

/// Removes its (project, stage) key from the running set on drop.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<(String, Stage)>>,
    key: (String, Stage),
}

impl<'a> RunGuard<'a> {
    fn acquire(
        running: &'a Mutex<HashSet<(String, Stage)>>,
        project_id: &str,
        stage: Stage,
    ) -> Option<Self> {
        let key = (project_id.to_string(), stage);
        if running.lock().insert(key.clone()) {
            Some(Self { running, key })
        } else {
            None
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.key);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
