//! Stage executors.
//!
//! The [`StageExecutor`] trait is the seam between the pipeline engine
//! and whatever actually performs a stage. The production implementation
//! is [`ScriptExecutor`], which runs an external script per stage,
//! streams its stdout for progress lines, and enforces a wall-clock
//! timeout.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use super::project::ProjectRecord;
use super::settings::Settings;
use super::stages::Stage;

/// Message attached to a stage run killed by the timeout watchdog.
pub const TIMEOUT_MESSAGE: &str = "execution timed out";

/// Progress callback handed to executors: percentage and message.
pub type ProgressFn<'a> = &'a (dyn Fn(f32, &str) + Send + Sync);

/// What an executor produced.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    /// Files produced, relative to the project directory
    pub files: Vec<String>,
    /// Captured stdout, when available
    pub stdout: Option<String>,
    /// Captured stderr, when available
    pub stderr: Option<String>,
}

/// Performs the work of one stage for one project.
pub trait StageExecutor: Send + Sync {
    /// Run the stage. Progress should be reported via `progress` as the
    /// work advances.
    fn execute(
        &self,
        project: &ProjectRecord,
        stage: Stage,
        progress: ProgressFn,
    ) -> Result<StageOutput>;

    /// Verify the executor can run this stage without running it.
    fn resolve(&self, _project: &ProjectRecord, _stage: Stage) -> Result<()> {
        Ok(())
    }
}

/// Executor backed by a closure, for embedding and tests.
pub struct FnExecutor<F>(pub F);

impl<F> StageExecutor for FnExecutor<F>
where
    F: Fn(&ProjectRecord, Stage, ProgressFn) -> Result<StageOutput> + Send + Sync,
{
    fn execute(
        &self,
        project: &ProjectRecord,
        stage: Stage,
        progress: ProgressFn,
    ) -> Result<StageOutput> {
        (self.0)(project, stage, progress)
    }
}

/// Runs stage scripts as child processes.
///
/// Scripts run with the project directory as their working directory and
/// the project configuration exported as environment variables. Lines of
/// the form `PROGRESS: NN% - message` on stdout are forwarded as progress
/// updates; everything else is captured verbatim.
pub struct ScriptExecutor {
    scripts_dir: PathBuf,
    interpreter: String,
    timeout: Duration,
}

impl ScriptExecutor {
    /// Build from application settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            scripts_dir: settings.scripts_dir.clone(),
            interpreter: settings.interpreter.clone(),
            timeout: Duration::from_secs(settings.script_timeout_secs),
        }
    }

    /// Build with the default one-hour timeout.
    pub fn new(scripts_dir: impl Into<PathBuf>, interpreter: impl Into<String>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            interpreter: interpreter.into(),
            timeout: Duration::from_secs(3600),
        }
    }

    /// Replace the script timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn script_path(&self, project: &ProjectRecord, stage: Stage) -> PathBuf {
        self.scripts_dir.join(stage.script_name(&project.config.content_generator))
    }
}

impl StageExecutor for ScriptExecutor {
    fn execute(
        &self,
        project: &ProjectRecord,
        stage: Stage,
        progress: ProgressFn,
    ) -> Result<StageOutput> {
        let script = self.script_path(project, stage);
        if !script.exists() {
            bail!("stage script not found: {}", script.display());
        }
        let script = script
            .canonicalize()
            .with_context(|| format!("failed to resolve script path: {}", script.display()))?;

        debug!(stage = %stage, script = %script.display(), "spawning stage script");

        let mut child = ProcessCommand::new(&self.interpreter)
            .arg(&script)
            .current_dir(&project.project_path)
            .envs(project.script_env())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {} {}", self.interpreter, script.display()))?;

        let pid = child.id();
        let finished = Arc::new(AtomicBool::new(false));
        let timed_out = Arc::new(AtomicBool::new(false));

        let watchdog = {
            let finished = Arc::clone(&finished);
            let timed_out = Arc::clone(&timed_out);
            let deadline = Instant::now() + self.timeout;
            std::thread::spawn(move || {
                while Instant::now() < deadline {
                    if finished.load(Ordering::SeqCst) {
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                if !finished.load(Ordering::SeqCst) {
                    timed_out.store(true, Ordering::SeqCst);
                    warn!(pid, "stage script exceeded timeout, terminating");
                    terminate(pid);
                }
            })
        };

        let stderr_handle = child.stderr.take();
        let stderr_thread = std::thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr_handle {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let mut stdout_buf = String::new();
        if let Some(stdout) = child.stdout.take() {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if let Some((percent, message)) = parse_progress_line(&line) {
                    progress(percent, message);
                }
                stdout_buf.push_str(&line);
                stdout_buf.push('\n');
            }
        }

        let status = child.wait().context("failed to wait for stage script")?;
        finished.store(true, Ordering::SeqCst);
        let _ = watchdog.join();
        let stderr_buf = stderr_thread.join().unwrap_or_default();

        if timed_out.load(Ordering::SeqCst) {
            bail!("{TIMEOUT_MESSAGE}");
        }
        if !status.success() {
            let code = status.code().map_or_else(|| "signal".to_string(), |c| c.to_string());
            let detail = stderr_buf.trim();
            if detail.is_empty() {
                bail!("stage script exited with status {code}");
            }
            bail!("stage script exited with status {code}: {detail}");
        }

        Ok(StageOutput {
            files: Vec::new(),
            stdout: Some(stdout_buf),
            stderr: Some(stderr_buf),
        })
    }

    fn resolve(&self, project: &ProjectRecord, stage: Stage) -> Result<()> {
        let script = self.script_path(project, stage);
        if !script.exists() {
            bail!("stage script not found: {}", script.display());
        }
        Ok(())
    }
}

/// Parse a `PROGRESS: NN% - message` stdout line.
fn parse_progress_line(line: &str) -> Option<(f32, &str)> {
    let rest = line.trim().strip_prefix("PROGRESS:")?;
    let (percent, message) = rest.split_once('-')?;
    let percent: f32 = percent.trim().trim_end_matches('%').parse().ok()?;
    Some((percent, message.trim()))
}

#[cfg(unix)]
fn terminate(pid: u32) {
    let _ = ProcessCommand::new("kill").arg("-TERM").arg(pid.to_string()).output();
}

#[cfg(windows)]
fn terminate(pid: u32) {
    let _ = ProcessCommand::new("taskkill").arg("/PID").arg(pid.to_string()).arg("/F").output();
}

#[cfg(not(any(unix, windows)))]
fn terminate(_pid: u32) {}
