//! Immutable dependency graph over template nodes.
//!
//! Built once per deploy call from the parsed template and consumed by a
//! pure topological-sort step; no node is mutated in place. A cycle among
//! dependencies is a template error surfaced before anything is submitted.

use std::collections::BTreeMap;

use crate::template::{ParsedTemplate, TemplateError};

/// Directed dependency graph: an edge `a → b` means `b` depends on `a`.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node name → names of the nodes depending on it.
    dependents: BTreeMap<String, Vec<String>>,
    /// Node name → number of unsatisfied dependencies.
    indegree: BTreeMap<String, usize>,
}

impl DependencyGraph {
    /// Build the graph from a parsed template.
    ///
    /// Dependency references are assumed valid (checked at parse time).
    pub fn build(template: &ParsedTemplate) -> Self {
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut indegree: BTreeMap<String, usize> = BTreeMap::new();

        for name in template.nodes.keys() {
            dependents.entry(name.clone()).or_default();
            indegree.entry(name.clone()).or_insert(0);
        }
        for (name, node) in &template.nodes {
            for dep in &node.depends_on {
                dependents.entry(dep.clone()).or_default().push(name.clone());
                *indegree.entry(name.clone()).or_insert(0) += 1;
            }
        }

        Self {
            dependents,
            indegree,
        }
    }

    /// Direct dependents of a node, in deterministic order.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Kahn's algorithm. Returns node names such that every node appears
    /// after all of its dependencies; ties resolve lexicographically.
    pub fn topological_order(&self) -> Result<Vec<String>, TemplateError> {
        let mut indegree = self.indegree.clone();
        let mut ready: Vec<String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut order = Vec::with_capacity(indegree.len());

        while let Some(name) = ready.first().cloned() {
            ready.remove(0);
            for dependent in self.dependents_of(&name) {
                let Some(d) = indegree.get_mut(dependent) else {
                    continue;
                };
                *d -= 1;
                if *d == 0 {
                    // Keep the ready list sorted for a deterministic order.
                    let pos = ready
                        .binary_search(dependent)
                        .unwrap_or_else(|insert_at| insert_at);
                    ready.insert(pos, dependent.clone());
                }
            }
            order.push(name);
        }

        if order.len() != indegree.len() {
            let stuck = indegree
                .iter()
                .find(|(name, _)| !order.contains(name))
                .map(|(name, _)| name.clone())
                .unwrap_or_default();
            return Err(TemplateError::DependencyCycle(stuck));
        }
        Ok(order)
    }
}
