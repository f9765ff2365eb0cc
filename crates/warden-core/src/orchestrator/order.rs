//! Stable topological ordering of workflow tasks.
//!
//! Kahn's algorithm with an ordered ready set: among tasks whose
//! dependencies are all scheduled, the one declared earliest in the spec
//! goes first. The same spec therefore always yields the same order.

use std::collections::{BTreeSet, HashMap};

use crate::error::KernelError;
use crate::spec::{TaskSpec, WorkflowSpec};

/// Compute the task execution order.
///
/// Dependencies are visited before their dependents; ties break by task
/// declaration order. Fails with [`KernelError::Dependency`] on unknown
/// references or cycles (both should have been rejected by the workflow
/// checker already).
pub fn topo_order(spec: &WorkflowSpec) -> Result<Vec<&TaskSpec>, KernelError> {
    let n = spec.tasks.len();
    let index: HashMap<&str, usize> = spec
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (task_id, deps) in &spec.dependencies {
        let Some(&task_idx) = index.get(task_id.as_str()) else {
            return Err(KernelError::Dependency {
                task_id: task_id.clone(),
                message: "dependency mapping references unknown task".into(),
            });
        };
        for dep_id in deps {
            let Some(&dep_idx) = index.get(dep_id.as_str()) else {
                return Err(KernelError::Dependency {
                    task_id: task_id.clone(),
                    message: format!("depends on unknown task {dep_id:?}"),
                });
            };
            dependents[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    // Ordered ready set: smallest declaration index first.
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(&next) = ready.iter().next() {
        ready.remove(&next);
        order.push(&spec.tasks[next]);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != n {
        let stuck: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| spec.tasks[i].id.as_str())
            .collect();
        return Err(KernelError::Dependency {
            task_id: stuck.first().copied().unwrap_or("").to_owned(),
            message: format!("dependency cycle among tasks: {}", stuck.join(", ")),
        });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::TaskSpec;
    use std::collections::BTreeMap;

    fn spec_with(ids: &[&str], deps: &[(&str, &[&str])]) -> WorkflowSpec {
        let mut spec = WorkflowSpec::new("wf", "test");
        spec.tasks = ids.iter().map(|id| TaskSpec::new(*id)).collect();
        let mut mapping = BTreeMap::new();
        for (task, ds) in deps {
            mapping.insert(
                (*task).to_owned(),
                ds.iter().map(|d| (*d).to_owned()).collect(),
            );
        }
        spec.dependencies = mapping;
        spec
    }

    fn ids(order: &[&TaskSpec]) -> Vec<String> {
        order.iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn empty_workflow_yields_empty_order() {
        let binding = spec_with(&[], &[]);
        let order = topo_order(&binding).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn independent_tasks_run_in_declaration_order() {
        let binding = spec_with(&["c", "a", "b"], &[]);
        let order = topo_order(&binding).unwrap();
        assert_eq!(ids(&order), vec!["c", "a", "b"]);
    }

    #[test]
    fn dependencies_come_first() {
        let binding = spec_with(
            &["deploy", "build", "test"],
            &[("deploy", &["test"]), ("test", &["build"])],
        );
        let order = topo_order(&binding).unwrap();
        assert_eq!(ids(&order), vec!["build", "test", "deploy"]);
    }

    #[test]
    fn diamond_breaks_ties_by_declaration_order() {
        // a -> {b, c} -> d, with c declared before b.
        let binding = spec_with(
            &["a", "c", "b", "d"],
            &[("c", &["a"]), ("b", &["a"]), ("d", &["b", "c"])],
        );
        let order = topo_order(&binding).unwrap();
        assert_eq!(ids(&order), vec!["a", "c", "b", "d"]);
    }

    #[test]
    fn order_is_deterministic() {
        let spec = spec_with(
            &["e", "d", "c", "b", "a"],
            &[("a", &["b", "c"]), ("b", &["d"]), ("c", &["d"])],
        );
        let first = ids(&topo_order(&spec).unwrap());
        for _ in 0..5 {
            assert_eq!(ids(&topo_order(&spec).unwrap()), first);
        }
    }

    #[test]
    fn cycle_is_reported() {
        let err = topo_order(&spec_with(
            &["a", "b"],
            &[("a", &["b"]), ("b", &["a"])],
        ))
        .unwrap_err();
        assert!(matches!(err, KernelError::Dependency { .. }));
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let err = topo_order(&spec_with(&["a"], &[("a", &["ghost"])])).unwrap_err();
        assert!(matches!(err, KernelError::Dependency { .. }));
    }
}
