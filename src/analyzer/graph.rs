use std::collections::{HashMap, HashSet};

/// Detects all cycles in a dependency graph using DFS with a recursion
/// stack. A detected cycle is the stack suffix from the revisited node to
/// the top, closed by re-appending the start id (so `a -> b -> a` reports
/// `["a", "b", "a"]`). Edges to ids missing from the graph are ignored;
/// the analyzer reports those separately as structural issues.
pub(crate) fn detect_cycles(dependencies: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut visited = HashSet::new();
    let mut cycles = Vec::new();

    // Sorted roots keep the output deterministic across runs.
    let mut roots: Vec<&String> = dependencies.keys().collect();
    roots.sort();

    for node in roots {
        if !visited.contains(node.as_str()) {
            let mut on_stack = HashSet::new();
            let mut path = Vec::new();
            dfs_cycles(
                node,
                dependencies,
                &mut visited,
                &mut on_stack,
                &mut path,
                &mut cycles,
            );
        }
    }

    cycles
}

fn dfs_cycles(
    node: &str,
    graph: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    on_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node.to_string());
    on_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if !graph.contains_key(dep) {
                continue;
            }
            if on_stack.contains(dep) {
                let start = path.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].to_vec();
                cycle.push(dep.clone());
                cycles.push(cycle);
            } else if !visited.contains(dep) {
                dfs_cycles(dep, graph, visited, on_stack, path, cycles);
            }
        }
    }

    on_stack.remove(node);
    path.pop();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn no_cycle() {
        let deps = graph(&[
            ("A", &["B", "C"]),
            ("B", &["D"]),
            ("C", &["D"]),
            ("D", &[]),
        ]);

        assert!(detect_cycles(&deps).is_empty());
    }

    #[test]
    fn two_node_cycle_closed_by_start() {
        let deps = graph(&[("a", &["b"]), ("b", &["a"])]);

        let cycles = detect_cycles(&deps);
        assert_eq!(cycles, vec![vec!["a", "b", "a"]]);
    }

    #[test]
    fn self_cycle() {
        let deps = graph(&[("A", &["A"])]);

        let cycles = detect_cycles(&deps);
        assert_eq!(cycles, vec![vec!["A", "A"]]);
    }

    #[test]
    fn cycle_among_acyclic_neighbors() {
        let deps = graph(&[
            ("A", &[]),
            ("B", &["A", "C"]),
            ("C", &["D"]),
            ("D", &["C"]),
        ]);

        let cycles = detect_cycles(&deps);
        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"C".to_string()));
        assert!(cycle.contains(&"D".to_string()));
        assert!(!cycle.contains(&"A".to_string()));
    }

    #[test]
    fn missing_dependency_is_not_a_cycle() {
        let deps = graph(&[("A", &["ghost"])]);

        assert!(detect_cycles(&deps).is_empty());
    }
}
