//! Wait-for cycle detection.
//!
//! DFS with a three-color scheme over the wait-for graph (an edge points
//! from a waiting agent to a holding agent). O(V+E), idempotent, and
//! deterministic: agents and edges are visited in sorted order, so the
//! same graph always reports the same first cycle.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use super::AgentDependency;

/// A detected wait-for cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadlockDetection {
    /// Agents in cycle order; each waits on the next, the last waits on
    /// the first.
    pub cycle: Vec<String>,
    /// Resources implicated: requested by an agent in the cycle and held
    /// by its successor.
    pub resources: BTreeSet<String>,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Detect the first wait-for cycle in the dependency snapshot.
pub fn detect(deps: &HashMap<String, AgentDependency>) -> Option<DeadlockDetection> {
    let mut agents: Vec<&str> = deps.keys().map(String::as_str).collect();
    agents.sort_unstable();
    let index: HashMap<&str, usize> = agents.iter().enumerate().map(|(i, a)| (*a, i)).collect();

    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); agents.len()];
    for (agent, dep) in deps {
        let from = index[agent.as_str()];
        for target in &dep.waiting_for {
            if let Some(&to) = index.get(target.as_str()) {
                adj[from].push(to);
            }
        }
    }
    for edges in &mut adj {
        edges.sort_unstable();
    }

    let mut colors = vec![Color::White; agents.len()];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..agents.len() {
        if colors[start] != Color::White {
            continue;
        }
        if let Some(cycle_indices) = visit(start, &adj, &mut colors, &mut path) {
            let cycle: Vec<String> = cycle_indices
                .iter()
                .map(|&i| agents[i].to_owned())
                .collect();
            let resources = implicated_resources(&cycle, deps);
            return Some(DeadlockDetection { cycle, resources });
        }
    }

    None
}

fn visit(
    node: usize,
    adj: &[Vec<usize>],
    colors: &mut [Color],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    colors[node] = Color::Gray;
    path.push(node);

    for &next in &adj[node] {
        match colors[next] {
            Color::Gray => {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                return Some(path[start..].to_vec());
            }
            Color::White => {
                if let Some(cycle) = visit(next, adj, colors, path) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }

    path.pop();
    colors[node] = Color::Black;
    None
}

/// Resources requested by each cycle member and held by its successor.
fn implicated_resources(
    cycle: &[String],
    deps: &HashMap<String, AgentDependency>,
) -> BTreeSet<String> {
    let mut resources = BTreeSet::new();
    for (i, agent) in cycle.iter().enumerate() {
        let successor = &cycle[(i + 1) % cycle.len()];
        let (Some(waiting), Some(holding)) = (deps.get(agent), deps.get(successor)) else {
            continue;
        };
        for resource in waiting
            .requested_resources
            .intersection(&holding.held_resources)
        {
            resources.insert(resource.clone());
        }
    }
    resources
}
