//! Epic ordering.
//!
//! Explicit dependencies plus the conservative cross-repo policy feed a
//! topological sort. The policy injects synthetic depends-on edges so epics
//! targeting different repositories never interleave; within one
//! repository, submission order breaks ties. Cycles fail fast.

use std::collections::{HashMap, HashSet};

use crate::errors::CoordinatorError;
use crate::model::Epic;

/// Compute the execution order for a task's epics.
pub fn order_epics(epics: &[Epic]) -> Result<Vec<String>, CoordinatorError> {
    let index: HashMap<&str, usize> = epics
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.as_str(), i))
        .collect();

    // edges[i] holds the indices epic i depends on.
    let mut edges: Vec<HashSet<usize>> = vec![HashSet::new(); epics.len()];

    for (i, epic) in epics.iter().enumerate() {
        for dep in &epic.depends_on {
            match index.get(dep.as_str()) {
                Some(&j) => {
                    edges[i].insert(j);
                }
                None => {
                    return Err(CoordinatorError::UnknownDependency {
                        epic_id: epic.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
    }

    // Conservative policy: with more than one target repository, serialise
    // across repository boundaries by chaining submission order.
    let repo_count = epics
        .iter()
        .map(|e| e.repository.as_str())
        .collect::<HashSet<_>>()
        .len();
    if repo_count > 1 {
        for i in 1..epics.len() {
            if epics[i].repository != epics[i - 1].repository {
                edges[i].insert(i - 1);
            }
        }
    }

    // Kahn's algorithm, deterministic by submission index.
    let mut resolved: Vec<String> = Vec::with_capacity(epics.len());
    let mut done: HashSet<usize> = HashSet::new();
    while done.len() < epics.len() {
        let next = (0..epics.len())
            .find(|i| !done.contains(i) && edges[*i].iter().all(|d| done.contains(d)));
        match next {
            Some(i) => {
                done.insert(i);
                resolved.push(epics[i].id.clone());
            }
            None => {
                // Every remaining epic waits on another remaining epic.
                let stuck = (0..epics.len())
                    .find(|i| !done.contains(i))
                    .map(|i| epics[i].id.clone())
                    .unwrap_or_default();
                return Err(CoordinatorError::DependencyCycle { epic_id: stuck });
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epic(id: &str, repo: &str, deps: Vec<&str>) -> Epic {
        Epic {
            id: id.to_string(),
            name: format!("Epic {id}"),
            repository: repo.to_string(),
            branch_name: format!("epic/{id}"),
            story_ids: vec![],
            depends_on: deps.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn test_single_repo_keeps_submission_order() {
        let epics = vec![
            epic("E1", "api", vec![]),
            epic("E2", "api", vec![]),
            epic("E3", "api", vec![]),
        ];
        assert_eq!(order_epics(&epics).unwrap(), vec!["E1", "E2", "E3"]);
    }

    #[test]
    fn test_explicit_dependencies_reorder() {
        let epics = vec![
            epic("E1", "api", vec!["E2"]),
            epic("E2", "api", vec![]),
        ];
        assert_eq!(order_epics(&epics).unwrap(), vec!["E2", "E1"]);
    }

    #[test]
    fn test_conservative_policy_chains_across_repos() {
        let epics = vec![
            epic("E1", "api", vec![]),
            epic("E2", "web", vec![]),
            epic("E3", "api", vec![]),
        ];
        let order = order_epics(&epics).unwrap();
        // E2 must come after E1, E3 after E2 (repo boundaries chained)
        let pos =
            |id: &str| order.iter().position(|e| e == id).unwrap();
        assert!(pos("E1") < pos("E2"));
        assert!(pos("E2") < pos("E3"));
    }

    #[test]
    fn test_cycle_fails_fast() {
        let epics = vec![
            epic("E1", "api", vec!["E2"]),
            epic("E2", "api", vec!["E1"]),
        ];
        let err = order_epics(&epics).unwrap_err();
        assert!(matches!(err, CoordinatorError::DependencyCycle { .. }));
    }

    #[test]
    fn test_unknown_dependency_fails() {
        let epics = vec![epic("E1", "api", vec!["E9"])];
        let err = order_epics(&epics).unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownDependency { .. }));
    }

    #[test]
    fn test_diamond_resolves_deterministically() {
        let epics = vec![
            epic("E1", "api", vec![]),
            epic("E2", "api", vec!["E1"]),
            epic("E3", "api", vec!["E1"]),
            epic("E4", "api", vec!["E2", "E3"]),
        ];
        assert_eq!(order_epics(&epics).unwrap(), vec!["E1", "E2", "E3", "E4"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(order_epics(&[]).unwrap().is_empty());
    }
}
