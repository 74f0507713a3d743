use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::machine::{GlobalState, TaskState};
use crate::analyzer::DependencyAnalyzer;
use crate::config::StateConfig;
use crate::error::{ConductorError, Result};
use crate::task::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateSnapshot {
    pub task_id: String,
    pub state: TaskState,
    /// 0..=100.
    pub progress: u8,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Immutable point-in-time copy of all task states plus the derived
/// global state. Retained in a bounded history to support rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tasks: HashMap<String, TaskStateSnapshot>,
    pub global_state: GlobalState,
    pub counts: StateCounts,
}

/// Optional fields accompanying a state update.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub progress: Option<u8>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn output(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

type Listener = Arc<dyn Fn(&ExecutionSnapshot) + Send + Sync>;

struct Inner {
    tasks: HashMap<String, TaskStateSnapshot>,
    history: VecDeque<ExecutionSnapshot>,
    stopped: bool,
}

/// Tracks per-task and global execution state. Every mutation publishes an
/// immutable snapshot into a bounded FIFO history and synchronously fans
/// out to registered listeners; a panicking listener never blocks the
/// others or corrupts tracker state.
pub struct ExecutionStateMachine {
    inner: Mutex<Inner>,
    listeners: Mutex<Vec<Listener>>,
    capacity: usize,
    wait_poll: Duration,
}

impl ExecutionStateMachine {
    pub fn new(config: &StateConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                history: VecDeque::new(),
                stopped: false,
            }),
            listeners: Mutex::new(Vec::new()),
            capacity: config.snapshot_capacity,
            wait_poll: Duration::from_millis(config.wait_poll_ms),
        }
    }

    /// Resets the tracker with a fresh PENDING entry per task, wiring up
    /// dependency and dependent edges.
    pub fn initialize_tasks(&self, tasks: &[Task]) {
        let dependents = DependencyAnalyzer::dependents_index(tasks);

        let snapshot = {
            let mut inner = self.inner.lock();
            inner.tasks = tasks
                .iter()
                .map(|t| {
                    (
                        t.id.clone(),
                        TaskStateSnapshot {
                            task_id: t.id.clone(),
                            state: TaskState::Pending,
                            progress: 0,
                            start_time: None,
                            end_time: None,
                            output: None,
                            error: None,
                            dependencies: t.dependencies.clone(),
                            dependents: dependents.get(&t.id).cloned().unwrap_or_default(),
                        },
                    )
                })
                .collect();
            inner.history.clear();
            inner.stopped = false;
            Self::publish_locked(&mut inner, self.capacity)
        };

        debug!(tasks = tasks.len(), "State machine initialized");
        self.notify(&snapshot);
    }

    pub fn update_task_state(
        &self,
        task_id: &str,
        state: TaskState,
        update: TaskUpdate,
    ) -> Result<TaskStateSnapshot> {
        let (task_snapshot, snapshot) = {
            let mut inner = self.inner.lock();
            let entry = inner
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| ConductorError::UnknownTask(task_id.to_string()))?;

            if !entry.state.can_transition_to(state) {
                return Err(ConductorError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: entry.state.to_string(),
                    to: state.to_string(),
                });
            }

            // start_time is set exactly once, re-asserting RUNNING is a no-op.
            if state == TaskState::Running && entry.start_time.is_none() {
                entry.start_time = Some(Utc::now());
            }
            if state.is_terminal() && entry.end_time.is_none() {
                entry.end_time = Some(Utc::now());
            }

            if state == TaskState::Completed {
                entry.progress = 100;
            } else if let Some(progress) = update.progress {
                entry.progress = progress.min(100);
            }
            if let Some(output) = update.output {
                entry.output = Some(output);
            }
            if let Some(error) = update.error {
                entry.error = Some(error);
            }
            entry.state = state;

            let task_snapshot = entry.clone();
            let snapshot = Self::publish_locked(&mut inner, self.capacity);
            (task_snapshot, snapshot)
        };

        debug!(task_id = %task_id, state = %state, "Task state updated");
        self.notify(&snapshot);
        Ok(task_snapshot)
    }

    pub fn mark_running(&self, task_id: &str) -> Result<TaskStateSnapshot> {
        self.update_task_state(task_id, TaskState::Running, TaskUpdate::default())
    }

    pub fn mark_completed(
        &self,
        task_id: &str,
        output: impl Into<String>,
    ) -> Result<TaskStateSnapshot> {
        self.update_task_state(task_id, TaskState::Completed, TaskUpdate::output(output))
    }

    pub fn mark_failed(
        &self,
        task_id: &str,
        error: impl Into<String>,
    ) -> Result<TaskStateSnapshot> {
        self.update_task_state(task_id, TaskState::Failed, TaskUpdate::error(error))
    }

    /// A task is ready iff PENDING and every dependency maps to a COMPLETED
    /// task. A FAILED or unknown dependency blocks dependents forever.
    pub fn ready_tasks(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ready: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.dependencies.iter().all(|dep| {
                        inner
                            .tasks
                            .get(dep)
                            .is_some_and(|d| d.state == TaskState::Completed)
                    })
            })
            .map(|t| t.task_id.clone())
            .collect();
        ready.sort();
        ready
    }

    pub fn task(&self, task_id: &str) -> Option<TaskStateSnapshot> {
        self.inner.lock().tasks.get(task_id).cloned()
    }

    pub fn global_state(&self) -> GlobalState {
        let inner = self.inner.lock();
        Self::derive_global(&inner.tasks, inner.stopped)
    }

    pub fn counts(&self) -> StateCounts {
        Self::count(&self.inner.lock().tasks)
    }

    /// Builds a snapshot of the current state and appends it to history.
    pub fn create_snapshot(&self) -> ExecutionSnapshot {
        let mut inner = self.inner.lock();
        Self::publish_locked(&mut inner, self.capacity)
    }

    pub fn history(&self) -> Vec<ExecutionSnapshot> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Replaces the live task map wholesale with the snapshot taken at
    /// `timestamp` and truncates history to entries at or before it.
    /// Returns false when no snapshot matches.
    pub fn rollback_to_snapshot(&self, timestamp: DateTime<Utc>) -> bool {
        let snapshot = {
            let mut inner = self.inner.lock();
            let Some(snapshot) = inner
                .history
                .iter()
                .find(|s| s.timestamp == timestamp)
                .cloned()
            else {
                warn!(%timestamp, "Rollback target snapshot not found");
                return false;
            };

            inner.tasks = snapshot.tasks.clone();
            inner.stopped = snapshot.global_state == GlobalState::Stopped;
            inner.history.retain(|s| s.timestamp <= timestamp);
            snapshot
        };

        debug!(%timestamp, "Rolled back to snapshot");
        self.notify(&snapshot);
        true
    }

    /// Forcibly fails every RUNNING and PENDING task. COMPLETED tasks are
    /// untouched.
    pub fn stop_all(&self) {
        let snapshot = {
            let mut inner = self.inner.lock();
            let now = Utc::now();
            for entry in inner.tasks.values_mut() {
                if matches!(entry.state, TaskState::Running | TaskState::Pending) {
                    entry.state = TaskState::Failed;
                    entry.error = Some("stopped by user".into());
                    entry.end_time = Some(now);
                }
            }
            inner.stopped = true;
            Self::publish_locked(&mut inner, self.capacity)
        };

        warn!("All non-terminal tasks marked failed (stopped by user)");
        self.notify(&snapshot);
    }

    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&ExecutionSnapshot) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Arc::new(listener));
    }

    /// Blocks until the task reaches a terminal state, polling at the
    /// configured interval. Resolves with the snapshot on COMPLETED and
    /// errors with the failure reason on FAILED.
    pub async fn wait_for_task(&self, task_id: &str) -> Result<TaskStateSnapshot> {
        loop {
            let current = self
                .task(task_id)
                .ok_or_else(|| ConductorError::UnknownTask(task_id.to_string()))?;

            match current.state {
                TaskState::Completed => return Ok(current),
                TaskState::Failed => {
                    let reason = current.error.unwrap_or_else(|| "unknown failure".into());
                    return Err(ConductorError::Other(format!(
                        "Task {} failed: {}",
                        task_id, reason
                    )));
                }
                _ => tokio::time::sleep(self.wait_poll).await,
            }
        }
    }

    fn publish_locked(inner: &mut Inner, capacity: usize) -> ExecutionSnapshot {
        let snapshot = ExecutionSnapshot {
            timestamp: Utc::now(),
            tasks: inner.tasks.clone(),
            global_state: Self::derive_global(&inner.tasks, inner.stopped),
            counts: Self::count(&inner.tasks),
        };
        inner.history.push_back(snapshot.clone());
        while inner.history.len() > capacity {
            inner.history.pop_front();
        }
        snapshot
    }

    fn derive_global(tasks: &HashMap<String, TaskStateSnapshot>, stopped: bool) -> GlobalState {
        if tasks.is_empty() {
            return GlobalState::Idle;
        }
        if tasks.values().any(|t| t.state == TaskState::Running) {
            return GlobalState::Running;
        }
        if stopped {
            return GlobalState::Stopped;
        }
        let all_terminal = tasks.values().all(|t| t.state.is_terminal());
        if all_terminal && tasks.values().any(|t| t.state == TaskState::Failed) {
            return GlobalState::Failed;
        }
        if tasks.values().all(|t| t.state == TaskState::Completed) {
            return GlobalState::Completed;
        }
        GlobalState::Idle
    }

    fn count(tasks: &HashMap<String, TaskStateSnapshot>) -> StateCounts {
        let mut counts = StateCounts::default();
        for task in tasks.values() {
            match task.state {
                TaskState::Pending => counts.pending += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Listener fan-out happens in registration order, outside the state
    /// lock. Panics are caught per listener.
    fn notify(&self, snapshot: &ExecutionSnapshot) {
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                warn!("State listener panicked; continuing with remaining listeners");
            }
        }
    }
}
