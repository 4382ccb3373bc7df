//! Application settings.
//!
//! Layered loading: defaults, then a TOML config file (project-local
//! `contentflow.toml` first, user config directory second), then
//! environment variables on top. A `.env` file in the working directory
//! is read before environment resolution.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::project::ProjectConfig;

/// Runtime settings for the CLI and the pipeline engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory holding all project directories
    pub projects_dir: PathBuf,

    /// Directory holding the per-stage scripts
    pub scripts_dir: PathBuf,

    /// Interpreter used to run stage scripts
    pub interpreter: String,

    /// Maximum runtime for a single stage script, in seconds
    pub script_timeout_secs: u64,

    /// External service credentials
    pub credentials: Credentials,

    /// Default configuration applied to new projects
    pub project_defaults: ProjectConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            projects_dir: PathBuf::from("projects"),
            scripts_dir: PathBuf::from("scripts"),
            interpreter: "python3".to_string(),
            script_timeout_secs: 3600,
            credentials: Credentials::default(),
            project_defaults: ProjectConfig::default(),
        }
    }
}

/// Credentials for external services used by stage scripts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    /// DataForSEO account login
    pub dataforseo_login: String,

    /// DataForSEO account password
    pub dataforseo_password: String,

    /// OpenAI API key, required when the content generator is "openai"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
}

impl Settings {
    /// Load settings from the first config file found, then apply
    /// environment variable overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let local = PathBuf::from("contentflow.toml");
        let mut settings = if local.exists() {
            Self::load_from_file(&local)?
        } else if let Some(global) = Self::config_file() {
            if global.exists() {
                Self::load_from_file(&global)?
            } else {
                Self::default()
            }
        } else {
            Self::default()
        };

        settings.apply_env();
        Ok(settings)
    }

    /// Load settings from a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(settings)
    }

    /// Write settings to the user config directory.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_file().context("could not determine config directory")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(&path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Path of the user-level config file.
    pub fn config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("contentflow").join("config.toml"))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CONTENTFLOW_PROJECTS_DIR") {
            self.projects_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CONTENTFLOW_SCRIPTS_DIR") {
            self.scripts_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DATAFORSEO_LOGIN") {
            self.credentials.dataforseo_login = v;
        }
        if let Ok(v) = std::env::var("DATAFORSEO_PASSWORD") {
            self.credentials.dataforseo_password = v;
        }
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            self.credentials.openai_api_key = Some(v);
        }
        if let Ok(v) = std::env::var("TARGET_LOCATION") {
            self.project_defaults.target_location = v;
        }
        if let Ok(v) = std::env::var("TARGET_LANGUAGE") {
            self.project_defaults.target_language = v;
        }
        if let Ok(v) = std::env::var("CONTENT_GENERATOR") {
            self.project_defaults.content_generator = v;
        }
        if let Ok(v) = std::env::var("CLAUDE_MODEL_PREFERENCE") {
            self.project_defaults.claude_model_preference = v;
        }
        if let Ok(v) = std::env::var("SERP_OVERLAP_THRESHOLD") {
            if let Ok(n) = v.parse() {
                self.project_defaults.serp_overlap_threshold = n;
            }
        }
        if let Ok(v) = std::env::var("MIN_SEARCH_VOLUME") {
            if let Ok(n) = v.parse() {
                self.project_defaults.min_search_volume = n;
            }
        }
        if let Ok(v) = std::env::var("MAX_COMPETITION") {
            if let Ok(n) = v.parse() {
                self.project_defaults.max_competition = n;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.projects_dir, PathBuf::from("projects"));
        assert_eq!(settings.interpreter, "python3");
        assert_eq!(settings.script_timeout_secs, 3600);
        assert!(settings.credentials.dataforseo_login.is_empty());
        assert_eq!(settings.project_defaults.target_location, "India");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
            projects_dir = "/data/projects"
            script_timeout_secs = 120

            [credentials]
            dataforseo_login = "user"
        "#;
        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.projects_dir, PathBuf::from("/data/projects"));
        assert_eq!(settings.script_timeout_secs, 120);
        assert_eq!(settings.credentials.dataforseo_login, "user");
        // Untouched sections keep their defaults
        assert_eq!(settings.interpreter, "python3");
        assert_eq!(settings.project_defaults.content_generator, "claude");
    }

    #[test]
    fn test_serialization_omits_absent_api_key() {
        let settings = Settings::default();
        let toml = toml::to_string_pretty(&settings).unwrap();
        assert!(toml.contains("projects_dir"));
        assert!(!toml.contains("openai_api_key"));
    }
}
