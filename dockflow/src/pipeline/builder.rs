//! Pipeline builder with validation.

use super::{StageGraph, StageSpec};
use crate::errors::{ContractErrorInfo, CycleDetectedError, PipelineValidationError};
use std::collections::{HashMap, HashSet};

/// Builder for creating validated stage graphs.
///
/// Stages may be added in any order; dependencies are resolved and checked
/// when [`PipelineBuilder::build`] runs.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// The stage specifications.
    stages: HashMap<String, StageSpec>,
    /// Insertion order for stages.
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

    /// Adds a stage to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage itself is invalid or its name is taken.
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        self.add_stage_spec(spec)?;
        Ok(self)
    }

    /// Adds a stage with a specification.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_stage_spec(&mut self, spec: StageSpec) -> Result<(), PipelineValidationError> {
        spec.validate()?;

        if self.stages.contains_key(&spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is defined twice",
                spec.name
            ))
            .with_stages(vec![spec.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(
                    "CONTRACT-004-DUPLICATE",
                    format!("Stage name '{}' is not unique", spec.name),
                )
                .with_fix_hint("Give every stage a distinct name."),
            ));
        }

        for artifact in &spec.outputs {
            if let Some(owner) = self
                .stage_order
                .iter()
                .filter_map(|name| self.stages.get(name))
                .find(|other| other.produces(&artifact.path))
            {
                return Err(PipelineValidationError::new(format!(
                    "Stages '{}' and '{}' both write {}",
                    owner.name,
                    spec.name,
                    artifact.path.display()
                ))
                .with_stages(vec![owner.name.clone(), spec.name.clone()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "CONTRACT-004-OUTPUT_CONFLICT",
                        "Two stages declare the same output artifact",
                    )
                    .with_context_entry("path", artifact.path.display().to_string()),
                ));
            }
        }

        self.stage_order.push(spec.name.clone());
        self.stages.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Builds the stage graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages, a dependency names an
    /// unknown stage, or the dependencies form a cycle.
    pub fn build(self) -> Result<StageGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_error_info(
                    ContractErrorInfo::new("CONTRACT-004-EMPTY", "Cannot build an empty pipeline")
                        .with_fix_hint("Add at least one stage to the pipeline before building."),
                ));
        }

        self.check_dependencies()?;
        self.detect_cycles()?;

        Ok(StageGraph::new(self.name, self.stages, self.stage_order))
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

    fn check_dependencies(&self) -> Result<(), PipelineValidationError> {
        for name in &self.stage_order {
            let Some(spec) = self.stages.get(name) else {
                continue;
            };
            let mut deps: Vec<&String> = spec.dependencies.iter().collect();
            deps.sort();
            if let Some(dep) = deps.into_iter().find(|dep| !self.stages.contains_key(*dep)) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{}' depends on unknown stage '{}'",
                    spec.name, dep
                ))
                .with_stages(vec![spec.name.clone(), dep.clone()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "CONTRACT-004-MISSING_DEP",
                        format!("Dependency '{dep}' not found"),
                    )
                    .with_fix_hint("Add the dependency stage or remove the reference to it."),
                ));
            }
        }
        Ok(())
    }

    /// Detects cycles in the dependency graph.
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
            let mut deps: Vec<&String> = spec.dependencies.iter().collect();
            deps.sort();
            for dep in deps {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let cycle_start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[cycle_start..].to_vec();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ArtifactKind, StageKind};
    use crate::pipeline::{CommandSpec, StageAction};

    fn stage(name: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(name, StageKind::Convert, StageAction::External(CommandSpec::new("true")))
            .with_dependencies(deps.iter().copied())
            .with_output(ArtifactKind::LigandPdbqt, format!("/tmp/job/{name}.out"))
    }

    #[test]
    fn test_builder_creation() {
        let builder = PipelineBuilder::new("test");
        assert_eq!(builder.name(), "test");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_builder_with_dependencies() {
        let builder = PipelineBuilder::new("test")
            .stage(stage("stage1", &[]))
            .unwrap()
            .stage(stage("stage2", &["stage1"]))
            .unwrap();

        assert_eq!(builder.stage_count(), 2);
    }

    #[test]
    fn test_builder_forward_reference_allowed() {
        let graph = PipelineBuilder::new("test")
            .stage(stage("dock", &["convert"]))
            .unwrap()
            .stage(stage("convert", &[]))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(graph.execution_order(), ["convert", "dock"]);
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("test")
            .stage(stage("stage1", &["missing"]))
            .unwrap()
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some("CONTRACT-004-MISSING_DEP"));
        assert_eq!(err.stages, vec!["stage1", "missing"]);
    }

    #[test]
    fn test_builder_cycle_detection() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a", &["c"]))
            .unwrap()
            .stage(stage("b", &["a"]))
            .unwrap()
            .stage(stage("c", &["b"]))
            .unwrap()
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some("GRAPH-CYCLE"));
        assert_eq!(err.stages.first(), err.stages.last());
        assert_eq!(err.stages.len(), 4);
    }

    #[test]
    fn test_builder_duplicate_stage() {
        let err = PipelineBuilder::new("test")
            .stage(stage("a", &[]))
            .unwrap()
            .stage(stage("a", &[]))
            .unwrap_err();
        assert_eq!(err.code(), Some("CONTRACT-004-DUPLICATE"));
    }

    #[test]
    fn test_builder_output_conflict() {
        let other = StageSpec::new("b", StageKind::Dock, StageAction::External(CommandSpec::new("true")))
            .with_output(ArtifactKind::DockingPose, "/tmp/job/a.out");

        let err = PipelineBuilder::new("test")
            .stage(stage("a", &[]))
            .unwrap()
            .stage(other)
            .unwrap_err();
        assert_eq!(err.code(), Some("CONTRACT-004-OUTPUT_CONFLICT"));
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("test").build().unwrap_err();
        assert_eq!(err.code(), Some("CONTRACT-004-EMPTY"));
    }
}
