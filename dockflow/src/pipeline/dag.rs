//! Validated stage graph.

use super::StageSpec;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// A directed acyclic graph of stages.
///
/// Only [`super::PipelineBuilder::build`] creates one, so every dependency
/// names an existing stage and there are no cycles.
#[derive(Debug, Clone)]
pub struct StageGraph {
    /// The pipeline name.
    name: String,
    /// Stage specifications.
    stages: HashMap<String, StageSpec>,
    /// Execution order (topologically sorted).
    execution_order: Vec<String>,
}

impl StageGraph {
    pub(crate) fn new(
        name: String,
        stages: HashMap<String, StageSpec>,
        stage_order: Vec<String>,
    ) -> Self {
        let execution_order = topological_sort(&stages, &stage_order);

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

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.execution_order
            .iter()
            .filter_map(|name| self.stages.get(name))
    }

    /// Stages that depend directly on `name`, in execution order.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.stages()
            .filter(|spec| spec.dependencies.contains(name))
            .map(|spec| spec.name.as_str())
            .collect()
    }

    /// Number of unmet dependencies per stage before anything runs.
    #[must_use]
    pub fn in_degrees(&self) -> HashMap<String, usize> {
        self.stages
            .iter()
            .map(|(name, spec)| (name.clone(), spec.dependencies.len()))
            .collect()
    }

    /// Declared inputs that no stage in the graph produces.
    ///
    /// These must already exist on the host before the job starts.
    #[must_use]
    pub fn external_inputs(&self) -> Vec<PathBuf> {
        let produced: HashSet<&PathBuf> = self
            .stages
            .values()
            .flat_map(|spec| spec.outputs.iter().map(|a| &a.path))
            .collect();

        let mut seen = HashSet::new();
        self.stages()
            .flat_map(|spec| spec.inputs.iter())
            .filter(|path| !produced.contains(path))
            .filter(|path| seen.insert(*path))
            .cloned()
            .collect()
    }
}

/// Performs topological sort on the stage graph.
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
            let mut deps: Vec<&String> = spec.dependencies.iter().collect();
            deps.sort();
            for dep in deps {
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

    // Visit in insertion order for determinism
    for name in stage_order {
        visit(name, stages, &mut visited, &mut temp_visited, &mut result);
    }

    result
}
