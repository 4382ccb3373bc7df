//! Pipeline Integration Tests
//!
//! Exercises the store and engine together against a real temporary
//! filesystem, with closure-backed executors standing in for scripts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use contentflow::core::{
    ConfigOverrides, Credentials, FnExecutor, PipelineEngine, ProgressFn, ProgressScope,
    ProjectConfig, ProjectRecord, ProjectStore, Stage, StageExecutor, StageOutput, StageState,
};

fn setup() -> (TempDir, Arc<ProjectStore>, String) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(ProjectStore::with_base_dir(dir.path(), ProjectConfig::default()));
    let project = store
        .create(
            "Demo",
            "integration fixture",
            vec!["a".to_string(), "b".to_string()],
            &ConfigOverrides::default(),
        )
        .unwrap();
    (dir, store, project.id)
}

fn engine_with_executor(
    store: &Arc<ProjectStore>,
    executor: Arc<dyn StageExecutor>,
) -> PipelineEngine {
    let mut engine = PipelineEngine::new(Arc::clone(store), Credentials::default());
    for stage in Stage::ALL {
        engine.register_executor(stage, Arc::clone(&executor));
    }
    engine
}

fn producing_executor() -> Arc<dyn StageExecutor> {
    fn execute(
        project: &ProjectRecord,
        stage: Stage,
        _progress: ProgressFn,
    ) -> anyhow::Result<StageOutput> {
        for name in stage.expected_outputs() {
            std::fs::write(project.stage_dir(stage).join(name), "generated")?;
        }
        Ok(StageOutput::default())
    }
    Arc::new(FnExecutor(execute))
}

// ============================================================================
// End-to-End Scenario
// ============================================================================

#[test]
fn test_create_gate_run_and_unlock() {
    let (_dir, store, id) = setup();
    let engine = engine_with_executor(&store, producing_executor());

    // All five stages start pending.
    let project = store.load(&id).unwrap().unwrap();
    for stage in Stage::ALL {
        assert_eq!(project.stage_status(stage).status, StageState::Pending);
    }

    // Dependent stage is gated on keyword research.
    let blocked = engine.run_stage(&id, Stage::ContentBriefs, false).unwrap();
    assert!(!blocked.success);
    assert!(blocked.message.contains("keyword_research"));

    // First stage runs and records its outputs.
    let result = engine.run_stage(&id, Stage::KeywordResearch, false).unwrap();
    assert!(result.success);
    assert_eq!(result.outputs.len(), 2);

    // Completion unlocks the dependent stage and moves the percentage.
    let project = store.load(&id).unwrap().unwrap();
    assert!((project.completion_percentage() - 20.0).abs() < f64::EPSILON);
    let unblocked = engine.run_stage(&id, Stage::ContentBriefs, false).unwrap();
    assert!(unblocked.success);
}

#[test]
fn test_full_pipeline_persists_everything() {
    let (_dir, store, id) = setup();
    let engine = engine_with_executor(&store, producing_executor());

    let result = engine.run_pipeline(&id, None, false).unwrap();
    assert!(result.success);
    assert_eq!(result.results.len(), 5);

    // A fresh store over the same directory sees the full state.
    let fresh = ProjectStore::with_base_dir(store.base_dir(), ProjectConfig::default());
    let project = fresh.load(&id).unwrap().unwrap();
    assert!((project.completion_percentage() - 100.0).abs() < f64::EPSILON);
    for stage in Stage::ALL {
        assert!(project.stage_status(stage).status.is_completed());
        assert_eq!(project.outputs(stage).len(), 2);
        for file in project.outputs(stage) {
            assert!(project.project_path.join(file).is_file(), "missing {file}");
        }
    }
}

// ============================================================================
// Idempotence & Forcing
// ============================================================================

#[test]
fn test_completed_stage_not_rerun() {
    let (_dir, store, id) = setup();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let executor: Arc<dyn StageExecutor> = Arc::new(FnExecutor(
        move |_: &ProjectRecord, _: Stage, _: ProgressFn| -> anyhow::Result<StageOutput> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StageOutput::default())
        },
    ));
    let engine = engine_with_executor(&store, executor);

    engine.run_stage(&id, Stage::KeywordResearch, false).unwrap();
    let stamped = store
        .load(&id)
        .unwrap()
        .unwrap()
        .stage_status(Stage::KeywordResearch)
        .completed_at;

    let repeat = engine.run_stage(&id, Stage::KeywordResearch, false).unwrap();
    assert!(repeat.success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let unchanged = store
        .load(&id)
        .unwrap()
        .unwrap()
        .stage_status(Stage::KeywordResearch)
        .completed_at;
    assert_eq!(unchanged, stamped);

    engine.run_stage(&id, Stage::KeywordResearch, true).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Failure Handling
// ============================================================================

#[test]
fn test_pipeline_stops_at_failure_and_reports_progress() {
    let (_dir, store, id) = setup();
    let executor: Arc<dyn StageExecutor> = Arc::new(FnExecutor(
        |_: &ProjectRecord, stage: Stage, _: ProgressFn| -> anyhow::Result<StageOutput> {
            if stage == Stage::ArticleWriting {
                anyhow::bail!("generator unavailable");
            }
            Ok(StageOutput::default())
        },
    ));
    let engine = engine_with_executor(&store, executor);

    let result = engine.run_pipeline(&id, None, false).unwrap();
    assert!(!result.success);
    assert_eq!(result.results.len(), 3);
    assert!(result.results[2].message.contains("generator unavailable"));

    // Later stages were never touched.
    let project = store.load(&id).unwrap().unwrap();
    assert_eq!(project.stage_status(Stage::SocialMedia).status, StageState::Pending);
    assert_eq!(project.stage_status(Stage::YoutubeScripts).status, StageState::Pending);

    // Pipeline-scope progress carries the error sentinel.
    let latest = engine.bus().latest(&id, Some(ProgressScope::Pipeline)).unwrap();
    assert!(latest.progress < 0.0);

    // The failure survives a reload from disk.
    store.clear_cache();
    let project = store.load(&id).unwrap().unwrap();
    let status = project.stage_status(Stage::ArticleWriting);
    assert_eq!(status.status, StageState::Failed);
    assert!(status.error.as_deref().unwrap().contains("generator unavailable"));
}

#[test]
fn test_failed_stage_can_be_retried() {
    let (_dir, store, id) = setup();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let executor: Arc<dyn StageExecutor> = Arc::new(FnExecutor(
        move |_: &ProjectRecord, _: Stage, _: ProgressFn| -> anyhow::Result<StageOutput> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(StageOutput::default())
        },
    ));
    let engine = engine_with_executor(&store, executor);

    let first = engine.run_stage(&id, Stage::KeywordResearch, false).unwrap();
    assert!(!first.success);

    let second = engine.run_stage(&id, Stage::KeywordResearch, false).unwrap();
    assert!(second.success);
    let status = store.load(&id).unwrap().unwrap();
    let status = status.stage_status(Stage::KeywordResearch);
    assert!(status.status.is_completed());
    assert!(status.error.is_none());
}

// ============================================================================
// Cache Consistency
// ============================================================================

#[test]
fn test_deleted_project_disappears_from_engine() {
    let (_dir, store, id) = setup();
    let engine = engine_with_executor(&store, producing_executor());

    assert!(store.delete(&id).unwrap());
    let result = engine.run_stage(&id, Stage::KeywordResearch, false).unwrap();
    assert!(!result.success);
    assert!(result.message.contains("not found"));
    assert!(store.list(true).unwrap().is_empty());
}

#[test]
fn test_two_stores_share_the_filesystem() {
    let (_dir, store, id) = setup();
    let other = ProjectStore::with_base_dir(store.base_dir(), ProjectConfig::default());

    let mut record = other.load(&id).unwrap().unwrap();
    record.update_stage_status(Stage::KeywordResearch, StageState::Completed, None);
    other.save(&record).unwrap();

    // The first store sees the update after a refresh.
    let refreshed = store.refresh(&id).unwrap().unwrap();
    assert!(refreshed.stage_status(Stage::KeywordResearch).status.is_completed());
}
