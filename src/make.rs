//! The template-level build graph.
//!
//! A [`TaskSpec`] is a task with parameters still inside: its command, input
//! paths and output paths are all templates. A [`MakeGraph`] holds the specs
//! together with the producer index mapping each logical file name to the
//! one spec that generates it. Expansion instantiates the specs under a
//! [`Binding`] into a [`CommandGraph`], once per binding; tasks whose output
//! paths coincide across bindings are instantiated once.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ExpandError, SpecError};
use crate::file::FileSpec;
use crate::graph::{CommandGraph, Inserted, Task};
use crate::params::{Binding, ParameterSpace};
use crate::resource::Resource;
use crate::template::Template;

/// A build step with parameters still unresolved.
///
/// The parameter set of a spec is the union of the placeholders in its
/// command and in every input and output path template.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    name: String,
    command: Template,
    inputs: Vec<Arc<FileSpec>>,
    outputs: Vec<Arc<FileSpec>>,
    uses: Vec<Arc<Resource>>,
    parameters: BTreeSet<String>,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        command_template: &str,
        inputs: Vec<Arc<FileSpec>>,
        outputs: Vec<Arc<FileSpec>>,
        uses: Vec<Arc<Resource>>,
    ) -> Self {
        let command = Template::parse(command_template);
        let mut parameters: BTreeSet<String> =
            command.parameters().into_iter().map(str::to_string).collect();
        for file in inputs.iter().chain(&outputs) {
            parameters.extend(file.parameters().into_iter().map(str::to_string));
        }

        Self {
            name: name.into(),
            command,
            inputs,
            outputs,
            uses,
            parameters,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inputs(&self) -> &[Arc<FileSpec>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Arc<FileSpec>] {
        &self.outputs
    }

    pub fn parameters(&self) -> &BTreeSet<String> {
        &self.parameters
    }

    /// Instantiates the spec under a binding, snapshotting every file.
    fn concretize(
        &self,
        root: &Utf8Path,
        binding: &Binding,
        redo_if_modified: bool,
    ) -> Result<Task, ExpandError> {
        let missing: Vec<String> = self
            .parameters
            .iter()
            .filter(|name| binding.get(name).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ExpandError::MissingParameters {
                place: format!("task `{}`", self.name),
                missing,
            });
        }

        let command = self
            .command
            .render(binding)
            .map_err(|missing| ExpandError::MissingParameters {
                place: format!("task `{}`", self.name),
                missing,
            })?;

        let inputs = self
            .inputs
            .iter()
            .map(|spec| spec.concretize(root, binding))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(|spec| spec.concretize(root, binding))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Task::new(
            format!("{} {}", self.name, binding),
            command,
            inputs,
            outputs,
            self.uses.clone(),
            redo_if_modified,
        ))
    }
}

/// The parameterized dependency graph: every spec, indexed by the logical
/// names of the files it generates.
#[derive(Debug, Default)]
pub struct MakeGraph {
    root: Utf8PathBuf,
    tasks: Vec<Arc<TaskSpec>>,
    producer: HashMap<String, Arc<TaskSpec>>,
}

impl MakeGraph {
    /// `root` is prepended to every concretized file path.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            tasks: Vec::new(),
            producer: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn tasks(&self) -> &[Arc<TaskSpec>] {
        &self.tasks
    }

    /// Registers a spec as the producer of each of its output files.
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<(), SpecError> {
        let spec = Arc::new(spec);
        for output in spec.outputs() {
            if let Some(prior) = self.producer.get(output.name()) {
                return Err(SpecError::DuplicateRule {
                    file: output.name().to_string(),
                    first: prior.name().to_string(),
                    second: spec.name().to_string(),
                });
            }
        }
        for output in spec.outputs() {
            self.producer.insert(output.name().to_string(), spec.clone());
        }
        self.tasks.push(spec);
        Ok(())
    }

    /// Adds to `graph` every task needed to produce `target` under
    /// `binding`, plus the transitive closure of its producers.
    ///
    /// Expanding the same target and binding twice is a no-op: tasks are
    /// keyed by output path, and edges are only wired for newly added
    /// tasks. An input whose logical name has no producer is an external
    /// source file and is not expanded.
    pub fn expand(
        &self,
        target: &str,
        binding: &Binding,
        graph: &mut CommandGraph,
        redo_if_modified: bool,
    ) -> Result<(), ExpandError> {
        if !self.producer.contains_key(target) {
            return Err(ExpandError::UnknownTarget(target.to_string()));
        }

        let mut worklist = vec![target.to_string()];
        let mut seen: HashSet<String> = worklist.iter().cloned().collect();
        let mut added = Vec::new();

        while let Some(name) = worklist.pop() {
            let spec = self
                .producer
                .get(&name)
                .ok_or_else(|| ExpandError::UnknownTarget(name.clone()))?;

            let task = spec.concretize(&self.root, binding, redo_if_modified)?;
            if let Inserted::New(index) = graph.insert(task)? {
                added.push(index);
            }

            for input in spec.inputs() {
                if self.producer.contains_key(input.name())
                    && seen.insert(input.name().to_string())
                {
                    worklist.push(input.name().to_string());
                }
            }
        }

        graph.wire(&added)
    }

    /// The product driver: expands `target` once per binding in the
    /// Cartesian product of `space`, accumulating into a single graph.
    pub fn expand_product(
        &self,
        target: &str,
        space: &ParameterSpace,
        redo_if_modified: bool,
    ) -> Result<CommandGraph, ExpandError> {
        let mut graph = CommandGraph::new();
        for binding in space.bindings() {
            self.expand(target, &binding, &mut graph, redo_if_modified)?;
        }
        Ok(graph)
    }
}
