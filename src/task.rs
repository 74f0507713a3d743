use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A unit of work with declared dependencies and touched resources.
/// Immutable once scheduling begins; produced by an external parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Logical or file handles the task touches. Two tasks sharing a
    /// resource never run concurrently.
    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default)]
    pub estimated_duration: Duration,

    #[serde(default)]
    pub priority: i32,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            resources: Vec::new(),
            estimated_duration: Duration::ZERO,
            priority: 0,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_estimated_duration(mut self, duration: Duration) -> Self {
        self.estimated_duration = duration;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Advisory batching hint layered on top of the execution order. The
/// engine's correctness depends only on execution levels and resource
/// locks, never on group risk scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: String,
    pub tasks: Vec<String>,
    pub risk: RiskLevel,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Resource,
    Dependency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub tasks: Vec<String>,
    /// The shared resource name, or a description of the dependency edge.
    pub subject: String,
    pub severity: Severity,
    pub detail: String,
}

/// A dependency id that does not resolve to any task in the set. The
/// referencing task is reported and never becomes ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralIssue {
    pub task_id: String,
    pub missing_dependency: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub total_tasks: usize,
    pub group_count: usize,
    pub cyclic_tasks: usize,
    pub level_count: usize,
    pub analysis_duration: Duration,
}

/// Result of dependency analysis. Immutable once computed. Every task id
/// appears either in a parallel group or in the circular set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    pub parallel_groups: Vec<TaskGroup>,
    /// Each inner list is one cycle; the last element repeats the first.
    pub circular_dependencies: Vec<Vec<String>>,
    /// Topological levels. Cyclic tasks are appended as a final,
    /// explicitly-unsafe level when present.
    pub execution_order: Vec<Vec<String>>,
    pub potential_conflicts: Vec<Conflict>,
    pub unresolved: Vec<StructuralIssue>,
    pub metadata: AnalysisMetadata,
}

impl DependencyAnalysis {
    /// Flat set of all task ids that belong to some detected cycle.
    pub fn cyclic_task_ids(&self) -> std::collections::HashSet<&str> {
        self.circular_dependencies
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerMetrics {
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub retries: u32,
}

/// Fixed-schema result envelope returned by task runners. Consumers can
/// match exhaustively instead of probing an open map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerPayload {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: RunnerMetrics,
}

impl RunnerPayload {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
            metrics: RunnerMetrics::default(),
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: serde_json::Value::Null,
            error: Some(error.into()),
            metrics: RunnerMetrics::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub output: RunnerPayload,
    pub error: Option<String>,
    pub duration: Duration,
    pub resources: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub needs_manual_resolution: bool,
}

impl ExecutionResult {
    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            task_id: task_id.into(),
            success: false,
            output: RunnerPayload::err(error.clone()),
            error: Some(error),
            duration: Duration::ZERO,
            resources: Vec::new(),
            conflicts: Vec::new(),
            needs_manual_resolution: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = Task::new("t1", "Update schema")
            .with_dependencies(vec!["t0".into()])
            .with_resources(vec!["db/schema.sql".into()])
            .with_priority(5);

        assert_eq!(task.id, "t1");
        assert_eq!(task.dependencies, vec!["t0"]);
        assert_eq!(task.resources, vec!["db/schema.sql"]);
        assert_eq!(task.priority, 5);
    }

    #[test]
    fn test_risk_ordering() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_payload_envelope() {
        let ok = RunnerPayload::ok(serde_json::json!({"changed": 2}));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let err = RunnerPayload::err("boom");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
    }
}
