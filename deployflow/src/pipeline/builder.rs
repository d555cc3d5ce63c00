//! Pipeline builder with validation.

use super::{StageGraph, StageSpec};
use crate::errors::{ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use std::collections::{HashMap, HashSet};

/// Builder for creating validated stage graphs.
///
/// Stages may be added in any order. [`PipelineBuilder::build`] checks that
/// every dependency exists, that the graph is acyclic, and that each stage
/// only references outputs of its declared dependencies.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: HashMap<String, StageSpec>,
    stage_order: Vec<String>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: HashMap::new(),
            stage_order: Vec::new(),
        }
    }

    /// Adds a stage.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid on its own or its name is taken.
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        self.add_stage_spec(spec)?;
        Ok(self)
    }

    /// Adds a stage in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid on its own or its name is taken.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;

        if self.stages.contains_key(&spec.name) {
            return Err(PipelineValidationError::new(format!("Duplicate stage '{}'", spec.name))
                .with_stages(vec![spec.name.clone()])
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-DUPLICATE", format!("Stage '{}' declared twice", spec.name))
                        .with_fix_hint("Give every stage a unique name."),
                ));
        }

        self.stage_order.push(spec.name.clone());
        self.stages.insert(spec.name.clone(), spec);
        Ok(())
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

    /// Validates the stages and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty pipeline, an unknown dependency, a
    /// cycle, or a reference to a stage that is not a declared dependency.
    pub fn build(self) -> Result<StageGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages").with_error_info(
                ContractErrorInfo::new("CONTRACT-004-EMPTY", "Cannot build an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline before building."),
            ));
        }

        for name in &self.stage_order {
            let Some(spec) = self.stages.get(name) else { continue };
            self.check_dependencies(spec)?;
            Self::check_references(spec)?;
        }
        self.detect_cycles()?;

        Ok(StageGraph::new(self.name, self.stages, &self.stage_order))
    }

    fn check_dependencies(&self, spec: &StageSpec) -> Result<(), PipelineValidationError> {
        for dep in &spec.dependencies {
            if !self.stages.contains_key(dep) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' depends on unknown stage '{dep}'",
                    spec.name
                ))
                .with_stages(vec![spec.name.clone(), dep.clone()])
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-MISSING_DEP", format!("Dependency '{dep}' not found"))
                        .with_fix_hint("Add the dependency stage to the pipeline or remove the dependency."),
                ));
            }
        }
        Ok(())
    }

    fn check_references(spec: &StageSpec) -> Result<(), PipelineValidationError> {
        for reference in spec.references() {
            if !spec.dependencies.contains(&reference.stage) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' references '{}' but does not depend on '{}'",
                    spec.name,
                    reference.placeholder(),
                    reference.stage
                ))
                .with_stages(vec![spec.name.clone(), reference.stage.clone()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "CONTRACT-004-UNDECLARED_REF",
                        format!("Reference to non-upstream stage '{}'", reference.stage),
                    )
                    .with_fix_hint("Declare the referenced stage as a dependency.")
                    .with_context_entry("reference", reference.to_string()),
                ));
            }
        }
        Ok(())
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for name in &self.stage_order {
            if !visited.contains(name) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(spec) = self.stages.get(node) {
            for dep in &spec.dependencies {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}
