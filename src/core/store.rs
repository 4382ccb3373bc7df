//! Project store.
//!
//! Filesystem-backed persistence for project records with an in-memory
//! cache. The on-disk snapshots are the source of truth: the cache is
//! validated against the filesystem on every read path, and a cache
//! entry is committed only after its snapshot has been written.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use super::error::{Error, Result};
use super::project::{
    project_subdirs, record_from_snapshot, ConfigOverrides, ProjectConfig, ProjectRecord,
    SNAPSHOT_FILE,
};
use super::settings::Settings;
use super::stages::Stage;

/// Output format for project list exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Pretty-printed JSON array of summaries
    Json,
    /// Comma-separated values with a header row
    Csv,
}

/// Aggregate statistics across all stored projects.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatistics {
    /// Number of stored projects
    pub total: usize,
    /// Projects with every stage completed
    pub completed: usize,
    /// Projects with some but not all stages completed
    pub in_progress: usize,
    /// Projects with no completed stage
    pub pending: usize,
    /// Projects that finished the article writing stage
    pub articles_written: usize,
    /// Mean completion percentage across all projects
    pub average_completion: f64,
}

/// Filesystem-backed project store with a write-through cache.
pub struct ProjectStore {
    base_dir: PathBuf,
    defaults: ProjectConfig,
    cache: Mutex<HashMap<String, ProjectRecord>>,
}

impl std::fmt::Debug for ProjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectStore")
            .field("base_dir", &self.base_dir)
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl ProjectStore {
    /// Build a store rooted at the settings' projects directory.
    pub fn new(settings: &Settings) -> Self {
        Self::with_base_dir(settings.projects_dir.clone(), settings.project_defaults.clone())
    }

    /// Build a store rooted at an explicit directory.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>, defaults: ProjectConfig) -> Self {
        Self { base_dir: base_dir.into(), defaults, cache: Mutex::new(HashMap::new()) }
    }

    /// Root directory holding all project directories.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a new project: record, directory skeleton, snapshot, and
    /// input side files.
    ///
    /// The directory name is derived once here and never changes, even
    /// if the project is later renamed.
    pub fn create(
        &self,
        name: &str,
        description: &str,
        seed_keywords: Vec<String>,
        overrides: &ConfigOverrides,
    ) -> Result<ProjectRecord> {
        let mut config = self.defaults.clone();
        config.apply(overrides);

        let mut record = ProjectRecord::new(name, description, config);
        record.input_data.seed_keywords = seed_keywords;
        record.validate()?;

        record.project_path = self.base_dir.join(record.folder_name());
        for subdir in project_subdirs() {
            let dir = record.project_path.join(subdir);
            fs::create_dir_all(&dir)
                .map_err(|source| Error::CreateStructure { path: dir, source })?;
        }

        self.write_snapshot(&record)?;
        self.write_input_files(&record)?;

        debug!(project_id = %record.id, path = %record.project_path.display(), "created project");
        self.cache.lock().insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Persist the record's snapshot. The cache is updated only after
    /// the write succeeds.
    pub fn save(&self, record: &ProjectRecord) -> Result<()> {
        record.validate()?;
        self.write_snapshot(record)?;
        self.cache.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    /// Load a project by id, preferring the cache when its backing
    /// directory still exists.
    pub fn load(&self, id: &str) -> Result<Option<ProjectRecord>> {
        {
            let cache = self.cache.lock();
            if let Some(record) = cache.get(id) {
                if record.snapshot_path().exists() {
                    return Ok(Some(record.clone()));
                }
            }
        }
        // Cache miss or stale entry: scan the filesystem.
        let prefix: String = id.chars().take(8).collect();
        for dir in self.project_dirs() {
            let dir_name = dir.file_name().map(|n| n.to_string_lossy().into_owned());
            let looks_like = dir_name.is_some_and(|n| n.contains(&prefix));
            if !looks_like {
                continue;
            }
            match self.read_snapshot(&dir) {
                Ok(record) if record.id == id => {
                    self.cache.lock().insert(record.id.clone(), record.clone());
                    return Ok(Some(record));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "skipping unreadable project");
                }
            }
        }
        self.cache.lock().remove(id);
        Ok(None)
    }

    /// Load a project by name (exact match, ignoring case).
    pub fn load_by_name(&self, name: &str) -> Result<Option<ProjectRecord>> {
        Ok(self.list(true)?.into_iter().find(|r| r.name.eq_ignore_ascii_case(name)))
    }

    /// Re-read a project from disk, bypassing the cache.
    pub fn refresh(&self, id: &str) -> Result<Option<ProjectRecord>> {
        self.cache.lock().remove(id);
        self.load(id)
    }

    /// List all projects, newest first.
    ///
    /// With `include_details` false a lightweight projection is returned
    /// that carries identity, timestamps, and stage status only.
    pub fn list(&self, include_details: bool) -> Result<Vec<ProjectRecord>> {
        self.cleanup_cache();
        let mut records = Vec::new();
        for dir in self.project_dirs() {
            match self.read_snapshot(&dir) {
                Ok(record) => {
                    self.cache.lock().insert(record.id.clone(), record.clone());
                    records.push(if include_details { record } else { record.projection() });
                }
                Err(err) => {
                    warn!(path = %dir.display(), error = %err, "skipping unreadable project");
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// The most recently updated projects, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ProjectRecord>> {
        let mut records = self.list(true)?;
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records.truncate(limit);
        Ok(records)
    }

    /// Case-insensitive search over name, description, and seed keywords.
    pub fn search(&self, query: &str) -> Result<Vec<ProjectRecord>> {
        let query = query.to_lowercase();
        let records = self.list(true)?;
        Ok(records
            .into_iter()
            .filter(|r| {
                r.name.to_lowercase().contains(&query)
                    || r.description.to_lowercase().contains(&query)
                    || r.input_data
                        .seed_keywords
                        .iter()
                        .any(|k| k.to_lowercase().contains(&query))
            })
            .collect())
    }

    /// Delete a project directory and evict it from the cache.
    ///
    /// Returns false when no such project exists; deleting twice is not
    /// an error.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let Some(record) = self.load(id)? else {
            return Ok(false);
        };
        fs::remove_dir_all(&record.project_path).map_err(|source| Error::RemoveStructure {
            path: record.project_path.clone(),
            source,
        })?;
        self.cache.lock().remove(id);
        debug!(project_id = %id, "deleted project");
        Ok(true)
    }

    /// Create a new project copying an existing project's configuration
    /// and inputs. Execution status starts fresh.
    pub fn duplicate(&self, id: &str, new_name: &str) -> Result<ProjectRecord> {
        let source = self.load(id)?.ok_or_else(|| Error::ProjectNotFound(id.to_string()))?;
        let mut record = self.create(
            new_name,
            &format!("Copy of {}", source.name),
            source.input_data.seed_keywords.clone(),
            &ConfigOverrides::default(),
        )?;
        record.config = source.config.clone();
        record.input_data = source.input_data.clone();
        self.write_input_files(&record)?;
        self.save(&record)?;
        Ok(record)
    }

    /// Aggregate statistics over all stored projects.
    pub fn statistics(&self) -> Result<StoreStatistics> {
        let records = self.list(true)?;
        let total = records.len();
        let mut completed = 0;
        let mut in_progress = 0;
        let mut pending = 0;
        let mut articles_written = 0;
        let mut completion_sum = 0.0;
        for record in &records {
            let pct = record.completion_percentage();
            completion_sum += pct;
            if pct >= 100.0 {
                completed += 1;
            } else if pct > 0.0 {
                in_progress += 1;
            } else {
                pending += 1;
            }
            if record.stage_status(Stage::ArticleWriting).status.is_completed() {
                articles_written += 1;
            }
        }
        let average_completion = if total == 0 { 0.0 } else { completion_sum / total as f64 };
        Ok(StoreStatistics {
            total,
            completed,
            in_progress,
            pending,
            articles_written,
            average_completion,
        })
    }

    /// Render the project list in the given export format.
    pub fn export_list(&self, format: ExportFormat) -> Result<String> {
        let summaries: Vec<_> = self.list(true)?.iter().map(ProjectRecord::status_summary).collect();
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&summaries)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "project_id,name,completion_percentage,completed_stages,total_output_files,created_at,updated_at\n",
                );
                for s in &summaries {
                    out.push_str(&format!(
                        "{},{},{:.1},{},{},{},{}\n",
                        s.project_id,
                        csv_field(&s.name),
                        s.completion_percentage,
                        s.completed_stage_count,
                        s.total_output_files,
                        s.created_at.to_rfc3339(),
                        s.updated_at.to_rfc3339(),
                    ));
                }
                Ok(out)
            }
        }
    }

    /// Drop cache entries whose backing directory has disappeared.
    pub fn cleanup_cache(&self) {
        self.cache.lock().retain(|_, record| record.snapshot_path().exists());
    }

    /// Drop every cache entry.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    fn project_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .map(|n| n.to_string_lossy().starts_with("project-"))
                        .unwrap_or(false)
            })
            .collect();
        dirs.sort();
        dirs
    }

    fn read_snapshot(&self, dir: &Path) -> Result<ProjectRecord> {
        let path = dir.join(SNAPSHOT_FILE);
        let json = fs::read_to_string(&path)
            .map_err(|source| Error::Snapshot { path: path.clone(), source })?;
        record_from_snapshot(&json, dir)
    }

    fn write_snapshot(&self, record: &ProjectRecord) -> Result<()> {
        let json = serde_json::to_string_pretty(record)?;
        let path = record.snapshot_path();
        fs::write(&path, json).map_err(|source| Error::Snapshot { path, source })
    }

    fn write_input_files(&self, record: &ProjectRecord) -> Result<()> {
        let inputs = record.project_path.join("inputs");

        let path = inputs.join("seed_keywords.txt");
        let keywords = record.input_data.seed_keywords.join("\n");
        fs::write(&path, keywords).map_err(|source| Error::Snapshot { path, source })?;

        let path = inputs.join("settings.json");
        let json = serde_json::to_string_pretty(&record.config)?;
        fs::write(&path, json).map_err(|source| Error::Snapshot { path, source })?;

        if !record.input_data.custom_instructions.is_empty() {
            let path = inputs.join("custom_instructions.md");
            fs::write(&path, &record.input_data.custom_instructions)
                .map_err(|source| Error::Snapshot { path, source })?;
        }
        Ok(())
    }
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
