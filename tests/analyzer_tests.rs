use std::collections::HashSet;

use conductor::{ConflictKind, DependencyAnalyzer, RiskLevel, Severity, Task};

fn task(id: &str, deps: &[&str]) -> Task {
    Task::new(id, format!("implement {}", id))
        .with_dependencies(deps.iter().map(|d| d.to_string()).collect())
}

/// Every task appears after all of its dependencies' levels.
fn assert_topological(tasks: &[Task], levels: &[Vec<String>]) {
    let mut level_of = std::collections::HashMap::new();
    for (i, level) in levels.iter().enumerate() {
        for id in level {
            level_of.insert(id.clone(), i);
        }
    }
    for t in tasks {
        let own = level_of[&t.id];
        for dep in &t.dependencies {
            assert!(
                level_of[dep] < own,
                "task {} scheduled before dependency {}",
                t.id,
                dep
            );
        }
    }
}

#[test]
fn diamond_levels_match_expected() {
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
    assert_topological(&tasks, &analysis.execution_order);
}

#[test]
fn wide_dag_is_topologically_valid() {
    // Three layers with fan-out and fan-in.
    let tasks = vec![
        task("a", &[]),
        task("b", &[]),
        task("c", &["a"]),
        task("d", &["a", "b"]),
        task("e", &["b"]),
        task("f", &["c", "d"]),
        task("g", &["d", "e"]),
        task("h", &["f", "g"]),
    ];

    let analysis = DependencyAnalyzer::analyze(&tasks);
    assert!(analysis.circular_dependencies.is_empty());
    assert_topological(&tasks, &analysis.execution_order);

    let placed: usize = analysis.execution_order.iter().map(Vec::len).sum();
    assert_eq!(placed, tasks.len());
}

#[test]
fn every_task_in_exactly_one_group() {
    let tasks = vec![
        task("1", &[]),
        task("2", &["1"]),
        task("3", &["1"]),
        task("4", &["2", "3"]),
        task("x", &["y"]),
        task("y", &["x"]),
    ];

    let analysis = DependencyAnalyzer::analyze(&tasks);

    let mut seen = HashSet::new();
    for group in &analysis.parallel_groups {
        for id in &group.tasks {
            assert!(seen.insert(id.clone()), "task {} in two groups", id);
        }
    }
    assert_eq!(seen.len(), tasks.len());
}

#[test]
fn cycle_members_excluded_from_normal_groups() {
    let tasks = vec![task("a", &["b"]), task("b", &["a"]), task("free", &[])];

    let analysis = DependencyAnalyzer::analyze(&tasks);
    let cyclic: HashSet<&str> = analysis.cyclic_task_ids();
    assert_eq!(cyclic, HashSet::from(["a", "b"]));

    for group in &analysis.parallel_groups {
        let has_cyclic = group.tasks.iter().any(|t| cyclic.contains(t.as_str()));
        if has_cyclic {
            assert_eq!(group.tasks.len(), 1);
            assert_eq!(group.risk, RiskLevel::High);
            assert!(group.reason.contains("manual resolution"));
        }
    }
}

#[test]
fn cycle_closed_by_repeating_start() {
    let tasks = vec![task("a", &["b"]), task("b", &["a"])];

    let analysis = DependencyAnalyzer::analyze(&tasks);
    assert_eq!(analysis.circular_dependencies.len(), 1);

    let cycle = &analysis.circular_dependencies[0];
    assert_eq!(cycle.first(), cycle.last());
    assert_eq!(cycle.len(), 3);
}

#[test]
fn group_confidence_is_monotonic() {
    // Same dependency pattern, no shared resources.
    let safe = vec![
        task("base", &[]),
        task("x", &["base"]),
        task("y", &["base"]),
    ];
    // Same shape, but x and y now collide on a resource.
    let risky = vec![
        task("base", &[]),
        task("x", &["base"]).with_resources(vec!["shared.lock".into()]),
        task("y", &["base"]).with_resources(vec!["shared.lock".into()]),
    ];

    let safe_group = DependencyAnalyzer::analyze(&safe)
        .parallel_groups
        .into_iter()
        .find(|g| g.tasks.contains(&"x".to_string()))
        .unwrap();
    let risky_group = DependencyAnalyzer::analyze(&risky)
        .parallel_groups
        .into_iter()
        .find(|g| g.tasks.contains(&"x".to_string()))
        .unwrap();

    assert!(risky_group.confidence < safe_group.confidence);
    assert!(risky_group.risk > safe_group.risk);
}

#[test]
fn resource_conflict_names_both_tasks() {
    let tasks = vec![
        task("1", &[]).with_resources(vec!["config.json".into()]),
        task("2", &[]).with_resources(vec!["config.json".into()]),
    ];

    let analysis = DependencyAnalyzer::analyze(&tasks);
    let conflict = analysis
        .potential_conflicts
        .iter()
        .find(|c| c.kind == ConflictKind::Resource)
        .expect("expected resource conflict");

    assert_eq!(conflict.tasks, vec!["1", "2"]);
    assert_eq!(conflict.subject, "config.json");
}

#[test]
fn sensitive_resources_are_critical() {
    for name in ["db/schema.sql", "auth/tokens.json", "migrations/0001.sql"] {
        let tasks = vec![
            task("1", &[]).with_resources(vec![name.into()]),
            task("2", &[]).with_resources(vec![name.into()]),
        ];
        let analysis = DependencyAnalyzer::analyze(&tasks);
        assert_eq!(
            analysis.potential_conflicts[0].severity,
            Severity::Critical,
            "resource {} should be critical",
            name
        );
    }
}

#[test]
fn metadata_reflects_analysis() {
    let tasks = vec![task("1", &[]), task("2", &["1"]), task("a", &["a"])];

    let analysis = DependencyAnalyzer::analyze(&tasks);
    assert_eq!(analysis.metadata.total_tasks, 3);
    assert_eq!(analysis.metadata.cyclic_tasks, 1);
    assert_eq!(analysis.metadata.level_count, 3);
    assert_eq!(analysis.metadata.group_count, analysis.parallel_groups.len());
}

#[test]
fn empty_task_list_is_empty_analysis() {
    let analysis = DependencyAnalyzer::analyze(&[]);
    assert!(analysis.parallel_groups.is_empty());
    assert!(analysis.execution_order.is_empty());
    assert!(analysis.circular_dependencies.is_empty());
    assert!(analysis.potential_conflicts.is_empty());
}
