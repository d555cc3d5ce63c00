//! Validated, topologically ordered stage graph.

use super::StageSpec;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use std::collections::{HashMap, HashSet};

/// A directed acyclic graph of stages.
#[derive(Debug, Clone)]
pub struct StageGraph {
    name: String,
    stages: HashMap<String, StageSpec>,
    execution_order: Vec<String>,
}

impl StageGraph {
    /// Creates a graph from already validated stages.
    pub(crate) fn new(name: String, stages: HashMap<String, StageSpec>, stage_order: &[String]) -> Self {
        let execution_order = topological_sort(&stages, stage_order);
        Self {
            name,
            stages,
            execution_order,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns stage names, dependencies before dependents.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns the named stage.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Returns true if the graph has a stage called `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Iterates over stages in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &StageSpec> {
        self.execution_order.iter().filter_map(|n| self.stages.get(n))
    }

    /// Returns `target` and everything it transitively depends on.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is not in the graph.
    pub fn subgraph(&self, target: &str) -> Result<Self, PipelineValidationError> {
        if !self.contains(target) {
            return Err(PipelineValidationError::new(format!("Unknown stage '{target}'"))
                .with_stages(vec![target.to_string()])
                .with_error_info(ContractErrorInfo::new("CONTRACT-004-UNKNOWN", format!("Stage '{target}' not found"))));
        }

        let mut keep = HashSet::new();
        let mut pending = vec![target.to_string()];
        while let Some(name) = pending.pop() {
            if keep.insert(name.clone()) {
                if let Some(spec) = self.stages.get(&name) {
                    pending.extend(spec.dependencies.iter().cloned());
                }
            }
        }

        let order: Vec<String> = self
            .execution_order
            .iter()
            .filter(|n| keep.contains(*n))
            .cloned()
            .collect();
        let stages = self
            .stages
            .iter()
            .filter(|(n, _)| keep.contains(*n))
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect();

        Ok(Self::new(format!("{}:{target}", self.name), stages, &order))
    }
}

/// Depth-first topological sort, visiting roots in declaration order.
fn topological_sort(stages: &HashMap<String, StageSpec>, stage_order: &[String]) -> Vec<String> {
    fn visit(
        node: &str,
        stages: &HashMap<String, StageSpec>,
        visited: &mut HashSet<String>,
        temp_visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(node) || temp_visited.contains(node) {
            return;
        }
        temp_visited.insert(node.to_string());

        if let Some(spec) = stages.get(node) {
            for dep in &spec.dependencies {
                visit(dep, stages, visited, temp_visited, result);
            }
        }

        temp_visited.remove(node);
        visited.insert(node.to_string());
        result.push(node.to_string());
    }

    let mut result = Vec::new();
    let mut visited = HashSet::new();
    let mut temp_visited = HashSet::new();

    for name in stage_order {
        visit(name, stages, &mut visited, &mut temp_visited, &mut result);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PipelineBuilder, StageAction};
    use pretty_assertions::assert_eq;

    fn stage(name: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(name, StageAction::ConnectCluster).with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let graph = PipelineBuilder::new("t")
            .stage(stage("workload", &["ai-tier", "data-tier"]))
            .unwrap()
            .stage(stage("infra", &[]))
            .unwrap()
            .stage(stage("data-tier", &["infra"]))
            .unwrap()
            .stage(stage("ai-tier", &["infra"]))
            .unwrap()
            .build()
            .unwrap();

        let order = graph.execution_order();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        for spec in graph.iter() {
            for dep in &spec.dependencies {
                assert!(pos(dep) < pos(&spec.name), "{dep} must run before {}", spec.name);
            }
        }
        assert_eq!(order, &["infra", "ai-tier", "data-tier", "workload"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let graph = PipelineBuilder::new("t")
            .stage(stage("b", &[]))
            .unwrap()
            .stage(stage("a", &[]))
            .unwrap()
            .stage(stage("c", &[]))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(graph.execution_order(), &["b", "a", "c"]);
    }

    #[test]
    fn test_subgraph_keeps_transitive_dependencies() {
        let graph = PipelineBuilder::new("deploy")
            .stage(stage("infra", &[]))
            .unwrap()
            .stage(stage("workload", &["infra"]))
            .unwrap()
            .stage(stage("status", &["infra"]))
            .unwrap()
            .stage(stage("load-data", &["workload"]))
            .unwrap()
            .build()
            .unwrap();

        let sub = graph.subgraph("load-data").unwrap();
        assert_eq!(sub.execution_order(), &["infra", "workload", "load-data"]);
        assert_eq!(sub.name(), "deploy:load-data");
        assert!(graph.subgraph("missing").is_err());
    }
}
