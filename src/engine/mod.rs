//! Bounded-concurrency execution engine: pulls ready tasks from the
//! dependency analysis, acquires resource locks, allocates isolated
//! contexts, and dispatches to pluggable runners.
//!
//! The coordinator loop is the only writer of the lock table and the
//! state machine; spawned task units report back over an mpsc channel.

mod locks;
mod runner;

pub use locks::ResourceLockTable;
pub use runner::{RunnerContext, RunnerRegistry, TaskRunner};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::analyzer::DependencyAnalyzer;
use crate::config::{EngineConfig, ExecutionMode};
use crate::error::{ConductorError, Result};
use crate::isolation::IsolationManager;
use crate::state::{ExecutionStateMachine, StateCounts};
use crate::task::{ExecutionResult, RunnerPayload, Task};

struct TaskOutcome {
    task_id: String,
    outcome: std::result::Result<RunnerPayload, String>,
    duration: Duration,
    isolation_id: Option<String>,
    resources: Vec<String>,
}

pub struct ExecutionEngine {
    config: EngineConfig,
    state: Arc<ExecutionStateMachine>,
    locks: Arc<ResourceLockTable>,
    registry: RwLock<RunnerRegistry>,
    isolation: Option<Arc<IsolationManager>>,
    cancel_tx: watch::Sender<bool>,
    running: AtomicBool,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, state: Arc<ExecutionStateMachine>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            config,
            state,
            locks: Arc::new(ResourceLockTable::new()),
            registry: RwLock::new(RunnerRegistry::new()),
            isolation: None,
            cancel_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Enables per-task branch/worktree isolation. Without a manager,
    /// tasks run directly in the workspace root.
    pub fn with_isolation(mut self, manager: Arc<IsolationManager>) -> Self {
        self.isolation = Some(manager);
        self
    }

    pub fn register_runner(&self, runner: Arc<dyn TaskRunner>) {
        self.registry.write().register(runner);
    }

    pub fn execution_status(&self) -> StateCounts {
        self.state.counts()
    }

    pub fn state_machine(&self) -> &Arc<ExecutionStateMachine> {
        &self.state
    }

    pub fn lock_table(&self) -> &Arc<ResourceLockTable> {
        &self.locks
    }

    /// Cooperative stop: halts new admissions and releases bookkeeping
    /// immediately. In-flight runner calls complete at their own pace
    /// unless they honor the cancellation signal.
    pub fn stop(&self) {
        warn!("Execution stop requested");
        let _ = self.cancel_tx.send(true);
        self.locks.clear();
        self.state.stop_all();
    }

    /// Runs the batch in the configured execution mode.
    pub async fn execute(
        &self,
        tasks: &[Task],
        workspace_root: &Path,
    ) -> Result<Vec<ExecutionResult>> {
        match self.config.mode {
            ExecutionMode::Classic => self.execute_sequential(tasks, workspace_root).await,
            ExecutionMode::Turbo => self.execute_parallel(tasks, workspace_root).await,
        }
    }

    /// Turbo mode: bounded-concurrency scheduling with dependency and
    /// resource safety. Always returns one result per task.
    pub async fn execute_parallel(
        &self,
        tasks: &[Task],
        workspace_root: &Path,
    ) -> Result<Vec<ExecutionResult>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConductorError::AlreadyRunning);
        }
        let result = self.run_parallel(tasks, workspace_root).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Classic mode: strictly sequential, fail-fast. Returns partial
    /// results up to and including the first failing task.
    pub async fn execute_sequential(
        &self,
        tasks: &[Task],
        workspace_root: &Path,
    ) -> Result<Vec<ExecutionResult>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConductorError::AlreadyRunning);
        }
        let result = self.run_sequential(tasks, workspace_root).await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_parallel(
        &self,
        tasks: &[Task],
        workspace_root: &Path,
    ) -> Result<Vec<ExecutionResult>> {
        if self.registry.read().is_empty() {
            return Err(ConductorError::NoRunnerRegistered);
        }
        self.cancel_tx.send_replace(false);
        self.locks.clear();

        let analysis = DependencyAnalyzer::analyze(tasks);
        let cyclic: HashSet<String> = analysis
            .cyclic_task_ids()
            .into_iter()
            .map(String::from)
            .collect();
        let conflict_index = Self::conflict_index(&analysis);

        self.state.initialize_tasks(tasks);
        let checkpoint = self.state.create_snapshot();

        let mut results: Vec<ExecutionResult> = Vec::new();

        // Cyclic tasks are surfaced for manual resolution, never scheduled.
        for task in tasks.iter().filter(|t| cyclic.contains(&t.id)) {
            let error = "part of circular dependency - requires manual resolution";
            let _ = self.state.mark_failed(&task.id, error);
            let mut result = ExecutionResult::failure(&task.id, error);
            result.needs_manual_resolution = true;
            result.resources = task.resources.clone();
            results.push(result);
        }

        let mut queue: Vec<Task> = tasks
            .iter()
            .filter(|t| !cyclic.contains(&t.id))
            .cloned()
            .collect();

        let max_parallel = self.config.effective_parallelism();
        let timeout = Duration::from_secs(self.config.task_timeout_secs);
        let (tx, mut rx) = mpsc::channel::<TaskOutcome>(max_parallel.max(1));
        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut in_flight = 0usize;
        let mut halted = false;

        info!(
            tasks = tasks.len(),
            max_parallel,
            timeout_secs = self.config.task_timeout_secs,
            "Starting parallel execution"
        );

        loop {
            if *cancel_rx.borrow() {
                break;
            }

            if !halted {
                let ready: HashSet<String> = self.state.ready_tasks().into_iter().collect();

                while in_flight < max_parallel {
                    // First structurally-ready task in list order wins the
                    // free slot; resource-contended tasks are simply skipped
                    // this cycle (try_acquire_all is side-effect free on
                    // contention).
                    let position = queue.iter().position(|t| {
                        ready.contains(&t.id)
                            && self.locks.try_acquire_all(&t.id, &t.resources)
                    });
                    let Some(position) = position else { break };
                    let task = queue.remove(position);

                    match self.admit(&task, workspace_root, timeout, &tx).await {
                        Ok(()) => in_flight += 1,
                        Err(e) => {
                            self.locks.release_all(&task.id);
                            let error = e.to_string();
                            let _ = self.state.mark_failed(&task.id, &error);
                            let mut result = ExecutionResult::failure(&task.id, error);
                            result.resources = task.resources.clone();
                            results.push(result);
                        }
                    }
                }
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                outcome = rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    in_flight -= 1;
                    let failed = self.record_outcome(outcome, &conflict_index, &mut results).await;
                    if failed && self.config.halt_on_failure && !halted {
                        warn!("Task failed; halting new admissions (in-flight tasks run to completion)");
                        halted = true;
                    }
                }
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let cancelled = *cancel_rx.borrow();
        self.finish_unfinished(tasks, cancelled, halted, &mut results);

        // A stop leaves the stopped state visible; only plain batch
        // failures roll back.
        if self.config.rollback_batch_on_failure
            && !cancelled
            && results.iter().any(|r| !r.success)
        {
            warn!("Batch failed; rolling state back to pre-batch snapshot");
            self.state.rollback_to_snapshot(checkpoint.timestamp);
        }

        info!(
            total = results.len(),
            succeeded = results.iter().filter(|r| r.success).count(),
            cancelled,
            "Parallel execution finished"
        );

        Ok(results)
    }

    async fn admit(
        &self,
        task: &Task,
        workspace_root: &Path,
        timeout: Duration,
        tx: &mpsc::Sender<TaskOutcome>,
    ) -> Result<()> {
        let runner = self.registry.read().select(&task.description)?;
        self.state.mark_running(&task.id)?;

        // Isolation comes last among the fallible steps: its creation is
        // atomic, so a failed admit never leaves a worktree or branch
        // behind.
        let (working_dir, env, isolation_id) = match &self.isolation {
            Some(manager) => {
                let isolation = manager
                    .create_isolated(&task.id, manager.default_base_ref())
                    .await?;
                (isolation.path.clone(), isolation.env.clone(), Some(isolation.id))
            }
            None => (workspace_root.to_path_buf(), HashMap::new(), None),
        };

        debug!(task_id = %task.id, runner = %runner.name(), dir = %working_dir.display(), "Dispatching task");

        let ctx = RunnerContext {
            working_dir,
            env,
            cancel: self.cancel_tx.subscribe(),
        };
        let task = task.clone();
        let tx = tx.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, runner.run(&task, &ctx)).await {
                Ok(Ok(payload)) => Ok(payload),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("timeout".to_string()),
            };
            // The coordinator may have stopped listening; nothing to do then.
            let _ = tx
                .send(TaskOutcome {
                    task_id: task.id.clone(),
                    outcome,
                    duration: started.elapsed(),
                    isolation_id,
                    resources: task.resources.clone(),
                })
                .await;
        });

        Ok(())
    }

    /// Records a finished task: releases its resources, advances isolation
    /// lifecycle, updates the state machine. Returns true when the task
    /// failed.
    async fn record_outcome(
        &self,
        outcome: TaskOutcome,
        conflict_index: &HashMap<String, Vec<String>>,
        results: &mut Vec<ExecutionResult>,
    ) -> bool {
        self.locks.release_all(&outcome.task_id);

        let conflicts = conflict_index
            .get(&outcome.task_id)
            .cloned()
            .unwrap_or_default();

        let result = match outcome.outcome {
            Ok(payload) if payload.success => {
                let output_text = payload.data.to_string();
                let _ = self.state.mark_completed(&outcome.task_id, output_text);
                ExecutionResult {
                    task_id: outcome.task_id.clone(),
                    success: true,
                    output: payload,
                    error: None,
                    duration: outcome.duration,
                    resources: outcome.resources,
                    conflicts,
                    needs_manual_resolution: false,
                }
            }
            Ok(payload) => {
                let error = payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "runner reported failure".into());
                let _ = self.state.mark_failed(&outcome.task_id, &error);
                self.discard_isolation(&outcome.isolation_id).await;
                ExecutionResult {
                    task_id: outcome.task_id.clone(),
                    success: false,
                    output: payload,
                    error: Some(error),
                    duration: outcome.duration,
                    resources: outcome.resources,
                    conflicts,
                    needs_manual_resolution: false,
                }
            }
            Err(error) => {
                let _ = self.state.mark_failed(&outcome.task_id, &error);
                self.discard_isolation(&outcome.isolation_id).await;
                let mut result = ExecutionResult::failure(&outcome.task_id, error);
                result.duration = outcome.duration;
                result.resources = outcome.resources;
                result.conflicts = conflicts;
                result
            }
        };

        // Successful isolations stay active for reconciliation.
        let failed = !result.success;
        results.push(result);
        failed
    }

    async fn discard_isolation(&self, isolation_id: &Option<String>) {
        let (Some(manager), Some(id)) = (&self.isolation, isolation_id) else {
            return;
        };
        if let Err(e) = manager.destroy(id).await {
            warn!(isolation_id = %id, error = %e, "Failed to destroy isolation for failed task");
        }
    }

    /// Emits failure results for tasks that never finished: blocked by a
    /// failed/unresolved dependency, shut out by the halt policy, or
    /// swept up in a stop (including tasks still in flight at stop time).
    fn finish_unfinished(
        &self,
        tasks: &[Task],
        cancelled: bool,
        halted: bool,
        results: &mut Vec<ExecutionResult>,
    ) {
        let finished: HashSet<String> = results.iter().map(|r| r.task_id.clone()).collect();

        for task in tasks.iter().filter(|t| !finished.contains(t.id.as_str())) {
            let error = if cancelled {
                "stopped by user"
            } else if halted {
                "not started: admissions halted after failure"
            } else {
                "dependencies never satisfied"
            };
            let _ = self.state.mark_failed(&task.id, error);
            let mut result = ExecutionResult::failure(&task.id, error);
            result.resources = task.resources.clone();
            results.push(result);
        }
    }

    async fn run_sequential(
        &self,
        tasks: &[Task],
        workspace_root: &Path,
    ) -> Result<Vec<ExecutionResult>> {
        if self.registry.read().is_empty() {
            return Err(ConductorError::NoRunnerRegistered);
        }
        self.cancel_tx.send_replace(false);
        self.locks.clear();

        let analysis = DependencyAnalyzer::analyze(tasks);
        let cyclic: HashSet<String> = analysis
            .cyclic_task_ids()
            .into_iter()
            .map(String::from)
            .collect();
        let conflict_index = Self::conflict_index(&analysis);

        self.state.initialize_tasks(tasks);
        let checkpoint = self.state.create_snapshot();

        let timeout = Duration::from_secs(self.config.task_timeout_secs);
        let (tx, mut rx) = mpsc::channel::<TaskOutcome>(1);
        let mut results = Vec::new();
        let cancel_rx = self.cancel_tx.subscribe();

        info!(tasks = tasks.len(), "Starting sequential execution");

        // Dependency-safe order: topological levels, flattened. The final
        // cyclic level is excluded from scheduling.
        let ordered: Vec<&Task> = analysis
            .execution_order
            .iter()
            .flatten()
            .filter(|id| !cyclic.contains(*id))
            .filter_map(|id| tasks.iter().find(|t| &t.id == id))
            .collect();

        'tasks: for task in ordered {
            if *cancel_rx.borrow() {
                break;
            }
            if !self.locks.try_acquire_all(&task.id, &task.resources) {
                // Nothing else is running; a held resource here means a
                // stale holder outside this batch.
                let error = format!("resources contended: {:?}", task.resources);
                let _ = self.state.mark_failed(&task.id, &error);
                results.push(ExecutionResult::failure(&task.id, error));
                break;
            }

            if let Err(e) = self.admit(task, workspace_root, timeout, &tx).await {
                self.locks.release_all(&task.id);
                let error = e.to_string();
                let _ = self.state.mark_failed(&task.id, &error);
                results.push(ExecutionResult::failure(&task.id, error));
                break;
            }

            let Some(outcome) = rx.recv().await else { break };
            let failed = self
                .record_outcome(outcome, &conflict_index, &mut results)
                .await;
            if failed {
                info!(task_id = %task.id, "Sequential execution stopping at first failure");
                break 'tasks;
            }
        }

        // Cyclic tasks are reported even in classic mode.
        for task in tasks.iter().filter(|t| cyclic.contains(&t.id)) {
            let error = "part of circular dependency - requires manual resolution";
            let _ = self.state.mark_failed(&task.id, error);
            let mut result = ExecutionResult::failure(&task.id, error);
            result.needs_manual_resolution = true;
            results.push(result);
        }

        if self.config.rollback_batch_on_failure
            && !*cancel_rx.borrow()
            && results.iter().any(|r| !r.success)
        {
            warn!("Batch failed; rolling state back to pre-batch snapshot");
            self.state.rollback_to_snapshot(checkpoint.timestamp);
        }

        Ok(results)
    }

    fn conflict_index(
        analysis: &crate::task::DependencyAnalysis,
    ) -> HashMap<String, Vec<String>> {
        let mut index: HashMap<String, Vec<String>> = HashMap::new();
        for conflict in &analysis.potential_conflicts {
            for task_id in &conflict.tasks {
                index
                    .entry(task_id.clone())
                    .or_default()
                    .push(conflict.subject.clone());
            }
        }
        index
    }
}
