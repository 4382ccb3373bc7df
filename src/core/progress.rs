//! Progress bus.
//!
//! In-memory fan-out of progress updates from running stages to
//! registered subscribers, plus a latest-update cache per project and
//! scope. Subscribers are notified outside the internal lock so a
//! subscriber may call back into the bus.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::stages::Stage;

/// Progress value signalling failure rather than a percentage.
pub const ERROR_SENTINEL: f32 = -1.0;

/// What a progress update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressScope {
    /// A single stage
    Stage(Stage),
    /// The whole pipeline run
    Pipeline,
}

impl std::fmt::Display for ProgressScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressScope::Stage(stage) => stage.fmt(f),
            ProgressScope::Pipeline => f.write_str("pipeline"),
        }
    }
}

/// One progress report from a running stage or pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    /// Project the update belongs to
    pub project_id: String,
    /// Stage or pipeline scope
    pub scope: ProgressScope,
    /// Percentage in [0, 100], or [`ERROR_SENTINEL`] on failure
    pub progress: f32,
    /// Human-readable status message
    pub message: String,
    /// When the update was published
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    /// Whether the update describes work still in flight.
    pub fn is_in_flight(&self) -> bool {
        self.progress >= 0.0 && self.progress < 100.0
    }
}

/// Handle returned by [`ProgressBus::subscribe`], used to unsubscribe.
pub type SubscriptionId = u64;

type Callback = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

struct BusState {
    latest: HashMap<String, HashMap<ProgressScope, ProgressUpdate>>,
    subscribers: Vec<(SubscriptionId, Callback)>,
    next_id: SubscriptionId,
}

/// Thread-safe progress fan-out with a latest-update cache.
pub struct ProgressBus {
    state: Mutex<BusState>,
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ProgressBus")
            .field("projects", &state.latest.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                latest: HashMap::new(),
                subscribers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a subscriber for all published updates.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber. Returns false for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|(sub_id, _)| *sub_id != id);
        state.subscribers.len() != before
    }

    /// Publish an update: store it as the latest for its (project, scope)
    /// slot and notify every subscriber.
    ///
    /// Progress values are clamped to [0, 100]; the exact error sentinel
    /// passes through unchanged. A panicking subscriber is logged and
    /// does not affect other subscribers or the publisher.
    pub fn publish(
        &self,
        project_id: impl Into<String>,
        scope: ProgressScope,
        progress: f32,
        message: impl Into<String>,
    ) {
        let update = ProgressUpdate {
            project_id: project_id.into(),
            scope,
            progress: clamp_progress(progress),
            message: message.into(),
            timestamp: Utc::now(),
        };

        let subscribers: Vec<Callback> = {
            let mut state = self.state.lock();
            state
                .latest
                .entry(update.project_id.clone())
                .or_default()
                .insert(scope, update.clone());
            state.subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        // Lock released: subscribers may re-enter the bus.
        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(&update))).is_err() {
                tracing::warn!(
                    project_id = %update.project_id,
                    scope = %update.scope,
                    "progress subscriber panicked"
                );
            }
        }
    }

    /// Latest update for a project, optionally restricted to one scope.
    ///
    /// Without a scope the most recently published update across all
    /// scopes is returned.
    pub fn latest(&self, project_id: &str, scope: Option<ProgressScope>) -> Option<ProgressUpdate> {
        let state = self.state.lock();
        let scopes = state.latest.get(project_id)?;
        match scope {
            Some(scope) => scopes.get(&scope).cloned(),
            None => scopes.values().max_by_key(|u| u.timestamp).cloned(),
        }
    }

    /// All cached updates for a project.
    pub fn all(&self, project_id: &str) -> Vec<ProgressUpdate> {
        let state = self.state.lock();
        state
            .latest
            .get(project_id)
            .map(|scopes| scopes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Cached updates describing work still in flight, grouped by project
    /// and scope. Projects with nothing in flight are absent.
    pub fn active(&self) -> HashMap<String, HashMap<ProgressScope, ProgressUpdate>> {
        let state = self.state.lock();
        state
            .latest
            .iter()
            .filter_map(|(project, scopes)| {
                let in_flight: HashMap<ProgressScope, ProgressUpdate> = scopes
                    .iter()
                    .filter(|(_, u)| u.is_in_flight())
                    .map(|(scope, u)| (*scope, u.clone()))
                    .collect();
                if in_flight.is_empty() {
                    None
                } else {
                    Some((project.clone(), in_flight))
                }
            })
            .collect()
    }

    /// Drop completed and failed updates older than `max_age`. In-flight
    /// updates are kept regardless of age. Returns the number of evicted
    /// entries.
    pub fn evict_older_than(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut state = self.state.lock();
        let mut evicted = 0;
        state.latest.retain(|_, scopes| {
            scopes.retain(|_, update| {
                let stale = !update.is_in_flight() && update.timestamp < cutoff;
                let keep = !stale;
                if !keep {
                    evicted += 1;
                }
                keep
            });
            !scopes.is_empty()
        });
        evicted
    }

    /// Clear cached updates for a project, optionally one scope only.
    pub fn clear(&self, project_id: &str, scope: Option<ProgressScope>) {
        let mut state = self.state.lock();
        match scope {
            Some(scope) => {
                if let Some(scopes) = state.latest.get_mut(project_id) {
                    scopes.remove(&scope);
                    if scopes.is_empty() {
                        state.latest.remove(project_id);
                    }
                }
            }
            None => {
                state.latest.remove(project_id);
            }
        }
    }
}

fn clamp_progress(value: f32) -> f32 {
    if (value - ERROR_SENTINEL).abs() < f32::EPSILON {
        ERROR_SENTINEL
    } else {
        value.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STAGE_SCOPE: ProgressScope = ProgressScope::Stage(Stage::KeywordResearch);

    #[test]
    fn test_publish_overwrites_latest() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, 10.0, "starting");
        bus.publish("p1", STAGE_SCOPE, 60.0, "halfway");
        let latest = bus.latest("p1", Some(STAGE_SCOPE)).unwrap();
        assert!((latest.progress - 60.0).abs() < f32::EPSILON);
        assert_eq!(latest.message, "halfway");
        assert_eq!(bus.all("p1").len(), 1);
    }

    #[test]
    fn test_progress_clamped_sentinel_preserved() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, 150.0, "over");
        assert!((bus.latest("p1", Some(STAGE_SCOPE)).unwrap().progress - 100.0).abs() < f32::EPSILON);

        bus.publish("p1", STAGE_SCOPE, -5.0, "under");
        assert!((bus.latest("p1", Some(STAGE_SCOPE)).unwrap().progress - 0.0).abs() < f32::EPSILON);

        bus.publish("p1", STAGE_SCOPE, ERROR_SENTINEL, "failed");
        assert!(
            (bus.latest("p1", Some(STAGE_SCOPE)).unwrap().progress - ERROR_SENTINEL).abs()
                < f32::EPSILON
        );
    }

    #[test]
    fn test_latest_without_scope_is_most_recent() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, 100.0, "done");
        std::thread::sleep(std::time::Duration::from_millis(5));
        bus.publish("p1", ProgressScope::Pipeline, 20.0, "running");
        let latest = bus.latest("p1", None).unwrap();
        assert_eq!(latest.scope, ProgressScope::Pipeline);
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let bus = ProgressBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let id = bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("p1", STAGE_SCOPE, 10.0, "a");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        bus.publish("p1", STAGE_SCOPE, 20.0, "b");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(!bus.unsubscribe(id));
    }

    #[test]
    fn test_panicking_subscriber_isolated() {
        let bus = ProgressBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| panic!("bad subscriber"));
        let counter = Arc::clone(&count);
        bus.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("p1", STAGE_SCOPE, 10.0, "a");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.latest("p1", Some(STAGE_SCOPE)).is_some());
    }

    #[test]
    fn test_reentrant_subscriber_does_not_deadlock() {
        let bus = Arc::new(ProgressBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(move |update| {
            // Re-entering the bus from a callback must not deadlock.
            let _ = inner.latest(&update.project_id, Some(update.scope));
        });
        bus.publish("p1", STAGE_SCOPE, 50.0, "halfway");
    }

    #[test]
    fn test_active_filters_finished() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, 40.0, "running");
        bus.publish("p1", ProgressScope::Pipeline, 20.0, "running");
        bus.publish("p2", STAGE_SCOPE, 100.0, "done");
        bus.publish("p3", STAGE_SCOPE, ERROR_SENTINEL, "failed");

        let active = bus.active();
        assert_eq!(active.len(), 1);
        let scopes = active.get("p1").unwrap();
        assert_eq!(scopes.len(), 2);
        assert!(scopes.contains_key(&STAGE_SCOPE));
        assert!(scopes.contains_key(&ProgressScope::Pipeline));
        assert!(!active.contains_key("p2"));
        assert!(!active.contains_key("p3"));
    }

    #[test]
    fn test_evict_spares_in_flight() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, 40.0, "running");
        bus.publish("p2", STAGE_SCOPE, 100.0, "done");
        let evicted = bus.evict_older_than(chrono::Duration::zero());
        assert_eq!(evicted, 1);
        assert!(bus.latest("p1", Some(STAGE_SCOPE)).is_some());
        assert!(bus.latest("p2", Some(STAGE_SCOPE)).is_none());
    }

    #[test]
    fn test_evict_removes_aged_failures() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, ERROR_SENTINEL, "failed");
        // Fresh failures survive a bounded retention window.
        assert_eq!(bus.evict_older_than(chrono::Duration::hours(1)), 0);
        assert!(bus.latest("p1", Some(STAGE_SCOPE)).is_some());
        // Aged ones do not.
        assert_eq!(bus.evict_older_than(chrono::Duration::zero()), 1);
        assert!(bus.latest("p1", Some(STAGE_SCOPE)).is_none());
    }

    #[test]
    fn test_evict_drops_empty_projects() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, 100.0, "done");
        bus.evict_older_than(chrono::Duration::zero());
        assert!(bus.all("p1").is_empty());
    }

    #[test]
    fn test_clear() {
        let bus = ProgressBus::new();
        bus.publish("p1", STAGE_SCOPE, 50.0, "a");
        bus.publish("p1", ProgressScope::Pipeline, 50.0, "b");
        bus.clear("p1", Some(ProgressScope::Pipeline));
        assert_eq!(bus.all("p1").len(), 1);
        bus.clear("p1", None);
        assert!(bus.all("p1").is_empty());
    }
}
