//! Dependency analysis: graph construction, cycle detection, parallel
//! grouping, topological execution levels, and resource-conflict detection.
//!
//! `DependencyAnalyzer::analyze` is a pure function over a task list — no
//! I/O, deterministic for a given input order.

mod graph;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::task::{
    AnalysisMetadata, Conflict, ConflictKind, DependencyAnalysis, RiskLevel, Severity,
    StructuralIssue, Task, TaskGroup,
};

/// Resource-name fragments that escalate a shared-resource conflict to
/// Critical. Touching shared schema/auth/db state concurrently is the
/// classic corruption path.
const SENSITIVE_RESOURCE_TOKENS: &[&str] = &[
    "schema",
    "auth",
    "db",
    "database",
    "migration",
    "credential",
    "secret",
];

pub struct DependencyAnalyzer;

impl DependencyAnalyzer {
    pub fn analyze(tasks: &[Task]) -> DependencyAnalysis {
        let started = Instant::now();

        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let unresolved = Self::find_unresolved(tasks, &by_id);
        if !unresolved.is_empty() {
            warn!(
                count = unresolved.len(),
                "Unresolved dependency ids; affected tasks will never become ready"
            );
        }

        let dep_graph: HashMap<String, Vec<String>> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.clone()))
            .collect();

        let circular_dependencies = graph::detect_cycles(&dep_graph);
        let cyclic: HashSet<&str> = circular_dependencies
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();

        let parallel_groups = Self::build_groups(tasks, &cyclic);
        let execution_order = Self::execution_levels(tasks, &by_id, &cyclic);
        let potential_conflicts = Self::detect_conflicts(tasks);

        let metadata = AnalysisMetadata {
            total_tasks: tasks.len(),
            group_count: parallel_groups.len(),
            cyclic_tasks: cyclic.len(),
            level_count: execution_order.len(),
            analysis_duration: started.elapsed(),
        };

        info!(
            tasks = metadata.total_tasks,
            groups = metadata.group_count,
            levels = metadata.level_count,
            cycles = circular_dependencies.len(),
            conflicts = potential_conflicts.len(),
            "Dependency analysis complete"
        );

        DependencyAnalysis {
            parallel_groups,
            circular_dependencies,
            execution_order,
            potential_conflicts,
            unresolved,
            metadata,
        }
    }

    fn find_unresolved(tasks: &[Task], by_id: &HashMap<&str, &Task>) -> Vec<StructuralIssue> {
        tasks
            .iter()
            .flat_map(|t| {
                t.dependencies
                    .iter()
                    .filter(|dep| !by_id.contains_key(dep.as_str()))
                    .map(|dep| StructuralIssue {
                        task_id: t.id.clone(),
                        missing_dependency: dep.clone(),
                    })
            })
            .collect()
    }

    /// Reverse index: task id -> ids of tasks that depend on it.
    pub fn dependents_index(tasks: &[Task]) -> HashMap<String, Vec<String>> {
        let mut index: HashMap<String, Vec<String>> =
            tasks.iter().map(|t| (t.id.clone(), Vec::new())).collect();
        for task in tasks {
            for dep in &task.dependencies {
                if let Some(dependents) = index.get_mut(dep) {
                    dependents.push(task.id.clone());
                }
            }
        }
        index
    }

    /// Ordered grouping, first match wins: independent tasks, then tasks
    /// sharing an identical sorted dependency set, then singletons. Cyclic
    /// tasks only ever land in high-risk singletons excluded from normal
    /// scheduling.
    fn build_groups(tasks: &[Task], cyclic: &HashSet<&str>) -> Vec<TaskGroup> {
        let mut groups = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();

        let independent: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.dependencies.is_empty() && !cyclic.contains(t.id.as_str()))
            .collect();
        if !independent.is_empty() {
            for t in &independent {
                placed.insert(t.id.as_str());
            }
            groups.push(TaskGroup {
                id: "group-independent".into(),
                tasks: independent.iter().map(|t| t.id.clone()).collect(),
                risk: RiskLevel::Low,
                confidence: 0.95,
                reason: "No dependencies; safe to run in parallel".into(),
            });
        }

        // Bucket the rest by sorted dependency-id set.
        let mut by_pattern: Vec<(Vec<String>, Vec<&Task>)> = Vec::new();
        for task in tasks {
            if placed.contains(task.id.as_str()) || cyclic.contains(task.id.as_str()) {
                continue;
            }
            if task.dependencies.is_empty() {
                continue;
            }
            let mut pattern = task.dependencies.clone();
            pattern.sort();
            pattern.dedup();
            match by_pattern.iter_mut().find(|(p, _)| *p == pattern) {
                Some((_, members)) => members.push(task),
                None => by_pattern.push((pattern, vec![task])),
            }
        }

        let mut group_seq = 0;
        for (pattern, members) in &by_pattern {
            if members.len() < 2 {
                continue;
            }
            group_seq += 1;
            let shares_resource = Self::any_shared_resource(members);
            let (risk, confidence, reason) = if shares_resource {
                (
                    RiskLevel::High,
                    0.5,
                    "Same dependencies but overlapping resources".to_string(),
                )
            } else {
                (
                    RiskLevel::Medium,
                    0.8,
                    format!("Identical dependency set: {}", pattern.join(", ")),
                )
            };
            for member in members {
                placed.insert(member.id.as_str());
            }
            groups.push(TaskGroup {
                id: format!("group-deps-{}", group_seq),
                tasks: members.iter().map(|t| t.id.clone()).collect(),
                risk,
                confidence,
                reason,
            });
        }

        // Everything left: unique dependency pattern, or cyclic.
        for task in tasks {
            if placed.contains(task.id.as_str()) {
                continue;
            }
            let group = if cyclic.contains(task.id.as_str()) {
                TaskGroup {
                    id: format!("group-cyclic-{}", task.id),
                    tasks: vec![task.id.clone()],
                    risk: RiskLevel::High,
                    confidence: 0.2,
                    reason: "Part of circular dependency - requires manual resolution".into(),
                }
            } else {
                TaskGroup {
                    id: format!("group-solo-{}", task.id),
                    tasks: vec![task.id.clone()],
                    risk: RiskLevel::Medium,
                    confidence: 0.7,
                    reason: "Unique dependency pattern".into(),
                }
            };
            placed.insert(task.id.as_str());
            groups.push(group);
        }

        groups
    }

    fn any_shared_resource(members: &[&Task]) -> bool {
        for (i, a) in members.iter().enumerate() {
            for b in &members[i + 1..] {
                if a.resources.iter().any(|r| b.resources.contains(r)) {
                    return true;
                }
            }
        }
        false
    }

    /// Level-by-level topological sort. Repeatedly collects all not-yet-
    /// placed, non-cyclic tasks whose dependencies are all already placed;
    /// stops when no progress is possible. The cyclic task set is appended
    /// as a final, explicitly-unsafe level.
    fn execution_levels(
        tasks: &[Task],
        by_id: &HashMap<&str, &Task>,
        cyclic: &HashSet<&str>,
    ) -> Vec<Vec<String>> {
        let mut levels: Vec<Vec<String>> = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();

        loop {
            let level: Vec<String> = tasks
                .iter()
                .filter(|t| {
                    !placed.contains(t.id.as_str())
                        && !cyclic.contains(t.id.as_str())
                        && t.dependencies.iter().all(|dep| {
                            // An unresolved dependency can never be placed.
                            by_id.contains_key(dep.as_str()) && placed.contains(dep.as_str())
                        })
                })
                .map(|t| t.id.clone())
                .collect();

            if level.is_empty() {
                break;
            }
            for id in &level {
                if let Some(task) = by_id.get(id.as_str()) {
                    placed.insert(task.id.as_str());
                }
            }
            levels.push(level);
        }

        let blocked: Vec<&str> = tasks
            .iter()
            .filter(|t| !placed.contains(t.id.as_str()) && !cyclic.contains(t.id.as_str()))
            .map(|t| t.id.as_str())
            .collect();
        if !blocked.is_empty() {
            debug!(?blocked, "Tasks unplaceable in topological order");
        }

        if !cyclic.is_empty() {
            let cyclic_level: Vec<String> = tasks
                .iter()
                .filter(|t| cyclic.contains(t.id.as_str()))
                .map(|t| t.id.clone())
                .collect();
            levels.push(cyclic_level);
        }

        levels
    }

    fn detect_conflicts(tasks: &[Task]) -> Vec<Conflict> {
        let mut conflicts = Vec::new();

        for (i, a) in tasks.iter().enumerate() {
            for b in &tasks[i + 1..] {
                for resource in &a.resources {
                    if b.resources.contains(resource) {
                        conflicts.push(Conflict {
                            kind: ConflictKind::Resource,
                            tasks: vec![a.id.clone(), b.id.clone()],
                            subject: resource.clone(),
                            severity: Self::resource_severity(resource),
                            detail: format!(
                                "Tasks {} and {} both touch {}",
                                a.id, b.id, resource
                            ),
                        });
                    }
                }

                let mutual = a.dependencies.contains(&b.id) && b.dependencies.contains(&a.id);
                if mutual {
                    conflicts.push(Conflict {
                        kind: ConflictKind::Dependency,
                        tasks: vec![a.id.clone(), b.id.clone()],
                        subject: format!("{} <-> {}", a.id, b.id),
                        severity: Severity::Critical,
                        detail: format!("Tasks {} and {} depend on each other", a.id, b.id),
                    });
                }
            }
        }

        conflicts
    }

    fn resource_severity(resource: &str) -> Severity {
        let lower = resource.to_lowercase();
        if SENSITIVE_RESOURCE_TOKENS.iter().any(|t| lower.contains(t)) {
            Severity::Critical
        } else {
            Severity::Medium
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, format!("task {}", id))
            .with_dependencies(deps.iter().map(|d| d.to_string()).collect())
    }

    #[test]
    fn diamond_execution_order() {
        let tasks = vec![
            task("1", &[]),
            task("2", &["1"]),
            task("3", &["1"]),
            task("4", &["2", "3"]),
        ];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        assert_eq!(
            analysis.execution_order,
            vec![vec!["1"], vec!["2", "3"], vec!["4"]]
        );
        assert!(analysis.circular_dependencies.is_empty());
    }

    #[test]
    fn two_node_cycle_reported_and_excluded() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        assert_eq!(analysis.circular_dependencies, vec![vec!["a", "b", "a"]]);

        // Cyclic tasks appear only in high-risk manual-resolution singletons.
        for group in &analysis.parallel_groups {
            assert_eq!(group.risk, RiskLevel::High);
            assert!(group.reason.contains("manual resolution"));
        }

        // Appended as a final explicitly-unsafe level.
        assert_eq!(analysis.execution_order, vec![vec!["a", "b"]]);

        // Mutual dependency also surfaces as a critical conflict.
        let dep_conflicts: Vec<_> = analysis
            .potential_conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::Dependency)
            .collect();
        assert_eq!(dep_conflicts.len(), 1);
        assert_eq!(dep_conflicts[0].severity, Severity::Critical);
    }

    #[test]
    fn independent_group_has_top_confidence() {
        let tasks = vec![task("a", &[]), task("b", &[]), task("c", &["a"])];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        let independent = analysis
            .parallel_groups
            .iter()
            .find(|g| g.id == "group-independent")
            .expect("independent group");

        assert_eq!(independent.tasks, vec!["a", "b"]);
        assert_eq!(independent.risk, RiskLevel::Low);
        assert!((independent.confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn shared_dependency_set_grouped() {
        let tasks = vec![
            task("base", &[]),
            task("x", &["base"]),
            task("y", &["base"]),
        ];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        let group = analysis
            .parallel_groups
            .iter()
            .find(|g| g.tasks.contains(&"x".to_string()))
            .expect("shared-deps group");

        assert_eq!(group.tasks, vec!["x", "y"]);
        assert_eq!(group.risk, RiskLevel::Medium);
        assert!((group.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn shared_resource_drops_group_confidence() {
        let tasks = vec![
            task("base", &[]),
            task("x", &["base"]).with_resources(vec!["config.json".into()]),
            task("y", &["base"]).with_resources(vec!["config.json".into()]),
        ];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        let group = analysis
            .parallel_groups
            .iter()
            .find(|g| g.tasks.contains(&"x".to_string()))
            .expect("shared-deps group");

        assert_eq!(group.risk, RiskLevel::High);
        assert!((group.confidence - 0.5).abs() < f64::EPSILON);

        // Adding a shared resource never increases confidence.
        assert!(group.confidence < 0.8);
    }

    #[test]
    fn resource_conflict_detected() {
        let tasks = vec![
            task("a", &[]).with_resources(vec!["config.json".into()]),
            task("b", &[]).with_resources(vec!["config.json".into()]),
        ];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        let conflict = analysis
            .potential_conflicts
            .iter()
            .find(|c| c.kind == ConflictKind::Resource)
            .expect("resource conflict");

        assert_eq!(conflict.tasks, vec!["a", "b"]);
        assert_eq!(conflict.subject, "config.json");
        assert_eq!(conflict.severity, Severity::Medium);
    }

    #[test]
    fn sensitive_resource_escalates_to_critical() {
        let tasks = vec![
            task("a", &[]).with_resources(vec!["db/schema.sql".into()]),
            task("b", &[]).with_resources(vec!["db/schema.sql".into()]),
        ];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        assert_eq!(analysis.potential_conflicts[0].severity, Severity::Critical);
    }

    #[test]
    fn unresolved_dependency_reported_not_fatal() {
        let tasks = vec![task("a", &["ghost"]), task("b", &[])];

        let analysis = DependencyAnalyzer::analyze(&tasks);
        assert_eq!(analysis.unresolved.len(), 1);
        assert_eq!(analysis.unresolved[0].task_id, "a");
        assert_eq!(analysis.unresolved[0].missing_dependency, "ghost");

        // "a" never becomes placeable; "b" still gets a level.
        assert_eq!(analysis.execution_order, vec![vec!["b"]]);
    }

    #[test]
    fn dependents_index_reverses_edges() {
        let tasks = vec![task("1", &[]), task("2", &["1"]), task("3", &["1"])];

        let index = DependencyAnalyzer::dependents_index(&tasks);
        assert_eq!(index["1"], vec!["2", "3"]);
        assert!(index["2"].is_empty());
    }

    #[test]
    fn analysis_is_deterministic() {
        let tasks = vec![
            task("1", &[]),
            task("2", &["1"]),
            task("3", &["1"]),
            task("4", &["2", "3"]),
        ];

        let a = DependencyAnalyzer::analyze(&tasks);
        let b = DependencyAnalyzer::analyze(&tasks);
        assert_eq!(a.execution_order, b.execution_order);
        assert_eq!(a.circular_dependencies, b.circular_dependencies);
        assert_eq!(
            a.parallel_groups.iter().map(|g| &g.id).collect::<Vec<_>>(),
            b.parallel_groups.iter().map(|g| &g.id).collect::<Vec<_>>()
        );
    }
}
