//! Project record model.
//!
//! The persisted data entity for one unit of pipeline work: identity,
//! configuration, input data, per-stage execution status, and the output
//! file manifest. The on-disk JSON snapshot is the source of truth; this
//! type must round-trip it at the logical level.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{Error, Result};
use super::stages::Stage;

/// Snapshot file name inside a project directory.
pub const SNAPSHOT_FILE: &str = "config.json";

/// Recognized project configuration options with their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Target geographic market for keyword research
    pub target_location: String,

    /// Target content language (ISO 639-1)
    pub target_language: String,

    /// SERP overlap threshold for keyword clustering
    pub serp_overlap_threshold: f64,

    /// Minimum monthly search volume to keep a keyword
    pub min_search_volume: u32,

    /// Maximum keyword competition score to keep a keyword
    pub max_competition: f64,

    /// Content generation backend ("claude" or "openai")
    pub content_generator: String,

    /// Claude model preference ("quality" or "speed")
    pub claude_model_preference: String,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            target_location: "India".to_string(),
            target_language: "en".to_string(),
            serp_overlap_threshold: 0.3,
            min_search_volume: 100,
            max_competition: 0.3,
            content_generator: "claude".to_string(),
            claude_model_preference: "quality".to_string(),
        }
    }
}

impl ProjectConfig {
    /// Merge set override values into this configuration.
    pub fn apply(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref v) = overrides.target_location {
            self.target_location = v.clone();
        }
        if let Some(ref v) = overrides.target_language {
            self.target_language = v.clone();
        }
        if let Some(v) = overrides.serp_overlap_threshold {
            self.serp_overlap_threshold = v;
        }
        if let Some(v) = overrides.min_search_volume {
            self.min_search_volume = v;
        }
        if let Some(v) = overrides.max_competition {
            self.max_competition = v;
        }
        if let Some(ref v) = overrides.content_generator {
            self.content_generator = v.clone();
        }
        if let Some(ref v) = overrides.claude_model_preference {
            self.claude_model_preference = v.clone();
        }
    }
}

/// Partial configuration used to override defaults at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    /// Override for the target location
    pub target_location: Option<String>,
    /// Override for the target language
    pub target_language: Option<String>,
    /// Override for the SERP overlap threshold
    pub serp_overlap_threshold: Option<f64>,
    /// Override for the minimum search volume
    pub min_search_volume: Option<u32>,
    /// Override for the maximum competition score
    pub max_competition: Option<f64>,
    /// Override for the content generator backend
    pub content_generator: Option<String>,
    /// Override for the Claude model preference
    pub claude_model_preference: Option<String>,
}

/// Seed inputs provided by the project owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputData {
    /// Seed keywords driving keyword research (ordered)
    pub seed_keywords: Vec<String>,

    /// Intended audience description
    pub target_audience: String,

    /// Free-form instructions forwarded to content generation
    pub custom_instructions: String,
}

/// Execution state of a single stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet executed
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
}

impl StageState {
    /// Whether the stage finished successfully.
    pub fn is_completed(self) -> bool {
        matches!(self, StageState::Completed)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageState::Pending => "pending",
            StageState::Running => "running",
            StageState::Completed => "completed",
            StageState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status record for one stage of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStatus {
    /// Current state
    pub status: StageState,

    /// When the stage completed (set on the completed transition)
    pub completed_at: Option<DateTime<Utc>>,

    /// Error message from the last failed run
    pub error: Option<String>,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self { status: StageState::Pending, completed_at: None, error: None }
    }
}

/// One unit of pipeline work: configuration, seed inputs, and per-stage
/// execution status, persisted as a JSON snapshot in the project directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Opaque unique identifier, immutable after creation
    #[serde(rename = "project_id")]
    pub id: String,

    /// Display name
    pub name: String,

    /// Display description
    pub description: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Refreshed on every mutation; always >= created_at
    pub updated_at: DateTime<Utc>,

    /// Project configuration options
    pub config: ProjectConfig,

    /// Seed inputs
    pub input_data: InputData,

    /// Per-stage status; always contains exactly the five known stages
    pub execution_status: BTreeMap<Stage, StageStatus>,

    /// Files produced by each stage, relative to the project directory
    pub output_files: BTreeMap<Stage, Vec<String>>,

    /// Filesystem location; assigned once at creation, not serialized
    #[serde(skip)]
    pub project_path: PathBuf,
}

impl ProjectRecord {
    /// Create a fresh record with a generated id and the given defaults.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        config: ProjectConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            created_at: now,
            updated_at: now,
            config,
            input_data: InputData::default(),
            execution_status: Stage::ALL
                .into_iter()
                .map(|stage| (stage, StageStatus::default()))
                .collect(),
            output_files: Stage::ALL.into_iter().map(|stage| (stage, Vec::new())).collect(),
            project_path: PathBuf::new(),
        }
    }

    /// URL-friendly slug derived from the project name.
    pub fn slug(&self) -> String {
        self.name.to_lowercase().replace([' ', '_'], "-")
    }

    /// Directory name derived from the 8-character id prefix and the slug.
    ///
    /// Stable and reproducible from the persisted id + name alone; used
    /// for cache validation against the filesystem.
    pub fn folder_name(&self) -> String {
        let prefix: String = self.id.chars().take(8).collect();
        format!("project-{prefix}-{}", self.slug())
    }

    /// Validate structural invariants: non-empty id and name, and exactly
    /// the five known stage keys in the status map.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidRecord("empty project id".to_string()));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidRecord("empty project name".to_string()));
        }
        for stage in Stage::ALL {
            if !self.execution_status.contains_key(&stage) {
                return Err(Error::InvalidRecord(format!(
                    "execution_status missing stage {stage}"
                )));
            }
        }
        if self.execution_status.len() != Stage::ALL.len() {
            return Err(Error::InvalidRecord(format!(
                "execution_status has {} entries, expected {}",
                self.execution_status.len(),
                Stage::ALL.len()
            )));
        }
        Ok(())
    }

    /// Current status of a stage.
    pub fn stage_status(&self, stage: Stage) -> &StageStatus {
        // Every constructor and load path guarantees the key exists.
        self.execution_status.get(&stage).expect("stage key present")
    }

    /// Transition a stage to a new state and bump `updated_at`.
    ///
    /// `completed_at` is stamped on the completed transition; the error
    /// field is replaced by the given value.
    pub fn update_stage_status(&mut self, stage: Stage, state: StageState, error: Option<String>) {
        let now = Utc::now();
        if let Some(entry) = self.execution_status.get_mut(&stage) {
            entry.status = state;
            if state == StageState::Completed {
                entry.completed_at = Some(now);
            }
            entry.error = error;
        }
        self.updated_at = now;
    }

    /// Register an output file for a stage, deduplicating by path.
    ///
    /// Returns true when the file was newly added.
    pub fn add_output_file(&mut self, stage: Stage, path: impl Into<String>) -> bool {
        let path = path.into();
        let files = self.output_files.entry(stage).or_default();
        if files.contains(&path) {
            return false;
        }
        files.push(path);
        self.updated_at = Utc::now();
        true
    }

    /// Recorded output manifest for a stage.
    pub fn outputs(&self, stage: Stage) -> &[String] {
        self.output_files.get(&stage).map_or(&[], Vec::as_slice)
    }

    /// Files currently present in the stage's directory on disk.
    pub fn stage_files(&self, stage: Stage) -> Vec<PathBuf> {
        let dir = self.stage_dir(stage);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files
    }

    /// Path of the stage's output directory.
    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.project_path.join(stage.dir_name())
    }

    /// Path of the persisted snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.project_path.join(SNAPSHOT_FILE)
    }

    /// Stage names currently in the completed state.
    pub fn completed_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|stage| self.stage_status(*stage).status.is_completed())
            .collect()
    }

    /// Completed stages as a share of all stages, in percent.
    pub fn completion_percentage(&self) -> f64 {
        let completed = self.completed_stages().len();
        (completed as f64 / Stage::ALL.len() as f64) * 100.0
    }

    /// Lightweight status projection for listings and dashboards.
    pub fn status_summary(&self) -> ProjectSummary {
        ProjectSummary {
            project_id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            completion_percentage: self.completion_percentage(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            stages: self
                .execution_status
                .iter()
                .map(|(stage, status)| (*stage, status.status))
                .collect(),
            completed_stage_count: self.completed_stages().len(),
            total_output_files: self.output_files.values().map(Vec::len).sum(),
        }
    }

    /// Clone carrying only identity, timestamps, and execution status;
    /// used by lightweight listings.
    pub(crate) fn projection(&self) -> ProjectRecord {
        ProjectRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            config: ProjectConfig::default(),
            input_data: InputData::default(),
            execution_status: self.execution_status.clone(),
            output_files: Stage::ALL.into_iter().map(|stage| (stage, Vec::new())).collect(),
            project_path: self.project_path.clone(),
        }
    }

    /// Environment variables exported to stage scripts.
    pub fn script_env(&self) -> Vec<(String, String)> {
        vec![
            ("TARGET_LOCATION".to_string(), self.config.target_location.clone()),
            ("TARGET_LANGUAGE".to_string(), self.config.target_language.clone()),
            (
                "SERP_OVERLAP_THRESHOLD".to_string(),
                self.config.serp_overlap_threshold.to_string(),
            ),
            ("MIN_SEARCH_VOLUME".to_string(), self.config.min_search_volume.to_string()),
            ("MAX_COMPETITION".to_string(), self.config.max_competition.to_string()),
            ("CONTENT_GENERATOR".to_string(), self.config.content_generator.clone()),
            (
                "CLAUDE_MODEL_PREFERENCE".to_string(),
                self.config.claude_model_preference.clone(),
            ),
        ]
    }
}

/// Summary projection of a project for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectSummary {
    /// Project id
    pub project_id: String,
    /// Display name
    pub name: String,
    /// Display description
    pub description: String,
    /// Completed stages as a share of all stages, in percent
    pub completion_percentage: f64,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
    /// Current state of each stage
    pub stages: BTreeMap<Stage, StageState>,
    /// Number of completed stages
    pub completed_stage_count: usize,
    /// Total files across all stage manifests
    pub total_output_files: usize,
}

/// Subdirectories created inside every project directory.
pub fn project_subdirs() -> Vec<&'static str> {
    let mut dirs = vec!["inputs"];
    dirs.extend(Stage::ALL.into_iter().map(Stage::dir_name));
    dirs.push("exports");
    dirs
}

/// Parse a snapshot JSON string into a validated record rooted at `path`.
pub fn record_from_snapshot(json: &str, path: &Path) -> Result<ProjectRecord> {
    let mut record: ProjectRecord = serde_json::from_str(json)?;
    record.project_path = path.to_path_buf();
    record.validate()?;
    Ok(record)
}
