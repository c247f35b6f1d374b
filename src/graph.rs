//! The concrete task graph.
//!
//! A [`Task`] is one unit of work: a shell command that produces one or more
//! files. Tasks are organized into a Directed Acyclic Graph where an edge
//! `p -> t` means some input file of `t` is produced by `p`. The graph is
//! assembled by [`MakeGraph`](crate::MakeGraph) expansion and run by the
//! [`executor`](crate::executor).
//!
//! ## Identity
//!
//! The absolute paths of a task's output files identify it. The
//! `by_output_path` index is the canonical key: when two parameter bindings
//! concretize a template to the same output paths, the second instantiation
//! collapses onto the node already in the graph.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Graph;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;

use crate::error::ExpandError;
use crate::file::File;
use crate::resource::Resource;

/// Lifecycle of a [`Task`] under the executor's discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    /// Terminal: the command exited 0, or `ran` is false and the outputs
    /// were already up to date so the command was never invoked.
    Succeeded { ran: bool },
    /// Terminal: the command exited nonzero or could not be spawned.
    Failed,
    /// Terminal: a direct or transitive predecessor failed; the command was
    /// never invoked and no resources were consumed.
    Blocked,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskState::Succeeded { .. })
    }
}

/// A concrete task: a command with its input and output files resolved.
#[derive(Debug)]
pub struct Task {
    pub(crate) name: String,
    pub(crate) command: String,
    pub(crate) inputs: Vec<File>,
    pub(crate) outputs: Vec<File>,
    pub(crate) uses: Vec<Arc<Resource>>,
    pub(crate) redo_if_modified: bool,
    pub(crate) state: TaskState,
}

impl Task {
    pub(crate) fn new(
        name: String,
        command: String,
        inputs: Vec<File>,
        outputs: Vec<File>,
        uses: Vec<Arc<Resource>>,
        redo_if_modified: bool,
    ) -> Self {
        Self {
            name,
            command,
            inputs,
            outputs,
            uses,
            redo_if_modified,
            state: TaskState::Pending,
        }
    }

    /// The template name plus the binding it was instantiated under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn inputs(&self) -> &[File] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[File] {
        &self.outputs
    }

    pub fn uses(&self) -> &[Arc<Resource>] {
        &self.uses
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Decides whether the command must run, from filesystem state alone.
    ///
    /// Must be called in topological order, predecessors first: the input
    /// snapshots taken here have to reflect the latest producer run.
    ///
    /// An output that does not exist always forces a run. Otherwise, with
    /// `redo_if_modified`, an input strictly newer than the oldest output
    /// forces a run; equal timestamps do not. A missing input (an external
    /// source file) forces a run so the command surfaces the real error.
    pub(crate) fn needs_running(&mut self) -> bool {
        for output in &mut self.outputs {
            output.refresh();
        }
        if self.outputs.iter().any(|o| !o.exists()) {
            return true;
        }
        if !self.redo_if_modified {
            return false;
        }

        for input in &mut self.inputs {
            input.refresh();
        }
        if self.inputs.iter().any(|i| !i.exists()) {
            return true;
        }

        let newest_input = self.inputs.iter().filter_map(File::mtime).max();
        let oldest_output = self.outputs.iter().filter_map(File::mtime).min();
        match (newest_input, oldest_output) {
            (Some(input), Some(output)) => input > output,
            _ => false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Inserted {
    New(NodeIndex),
    Existing(NodeIndex),
}

/// The runnable graph of concrete tasks.
#[derive(Debug)]
pub struct CommandGraph {
    pub(crate) graph: Graph<Task, ()>,
    by_output_path: HashMap<Utf8PathBuf, NodeIndex>,
}

impl Default for CommandGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandGraph {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            by_output_path: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn task(&self, index: NodeIndex) -> &Task {
        &self.graph[index]
    }

    pub(crate) fn task_mut(&mut self, index: NodeIndex) -> &mut Task {
        &mut self.graph[index]
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> {
        self.graph.node_indices()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// The task producing the given absolute path, if any task in the graph
    /// does.
    pub fn producer_of(&self, path: &Utf8Path) -> Option<NodeIndex> {
        self.by_output_path.get(path).copied()
    }

    /// Adds a concrete task, deduplicating by output path.
    ///
    /// A task whose outputs are already fully indexed to a single node is
    /// the same task reached through another binding, provided its command
    /// matches; it is not added again. Partial overlap, or a command
    /// mismatch, means two distinct tasks claim one path.
    pub(crate) fn insert(&mut self, task: Task) -> Result<Inserted, ExpandError> {
        let mut existing = None;
        let mut unindexed = 0usize;

        for output in &task.outputs {
            match self.by_output_path.get(output.path()) {
                Some(&index) => match existing {
                    None => existing = Some(index),
                    Some(prior) if prior == index => {}
                    Some(prior) => {
                        return Err(ExpandError::DuplicateProducer {
                            path: output.path().to_owned(),
                            first: self.graph[prior].name.clone(),
                            second: task.name.clone(),
                        });
                    }
                },
                None => unindexed += 1,
            }
        }

        if let Some(index) = existing {
            let known = &self.graph[index];
            if unindexed > 0
                || known.command != task.command
                || known.outputs.len() != task.outputs.len()
            {
                return Err(ExpandError::DuplicateProducer {
                    path: task.outputs[0].path().to_owned(),
                    first: known.name.clone(),
                    second: task.name,
                });
            }
            return Ok(Inserted::Existing(index));
        }

        let paths: Vec<Utf8PathBuf> = task.outputs.iter().map(|o| o.path().to_owned()).collect();
        let index = self.graph.add_node(task);
        for path in paths {
            self.by_output_path.insert(path, index);
        }
        Ok(Inserted::New(index))
    }

    /// Wires predecessor edges for freshly inserted tasks and verifies the
    /// graph stayed acyclic.
    ///
    /// An input path with no producer in the graph is an external source
    /// file; it gets no edge and is expected to exist at run time.
    pub(crate) fn wire(&mut self, added: &[NodeIndex]) -> Result<(), ExpandError> {
        for &index in added {
            let inputs: Vec<Utf8PathBuf> = self.graph[index]
                .inputs
                .iter()
                .map(|f| f.path().to_owned())
                .collect();

            for path in inputs {
                if let Some(&producer) = self.by_output_path.get(&path) {
                    if producer == index {
                        // Reading your own output is a one-task cycle.
                        return Err(ExpandError::DependencyCycle {
                            names: vec![self.graph[index].name.clone()],
                        });
                    }
                    self.graph.update_edge(producer, index, ());
                }
            }
        }
        self.ensure_acyclic()
    }

    fn ensure_acyclic(&self) -> Result<(), ExpandError> {
        let mut names = Vec::new();
        for component in tarjan_scc(&self.graph) {
            if component.len() > 1 {
                names.extend(component.into_iter().map(|n| self.graph[n].name.clone()));
            }
        }
        if names.is_empty() {
            Ok(())
        } else {
            Err(ExpandError::DependencyCycle { names })
        }
    }
}

impl fmt::Display for CommandGraph {
    /// Renders the graph as a Mermaid diagram.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name.replace('"', "\\\""); // Simple escape
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_indices() {
            let (source, target) = self.graph.edge_endpoints(edge).expect("edge exists");
            writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(dir: &Utf8Path, name: &str) -> File {
        File::new(dir.join(name))
    }

    fn task(name: &str, inputs: Vec<File>, outputs: Vec<File>, redo: bool) -> Task {
        Task::new(
            name.to_string(),
            format!("make {name}"),
            inputs,
            outputs,
            vec![],
            redo,
        )
    }

    fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, path)
    }

    #[test]
    fn missing_output_needs_running() {
        let (_guard, root) = tempdir();
        let mut t = task("a", vec![], vec![file(&root, "absent")], false);
        assert!(t.needs_running());
    }

    #[test]
    fn existing_output_is_fresh_without_redo() {
        let (_guard, root) = tempdir();
        std::fs::write(root.join("out"), "x").unwrap();
        let mut t = task("a", vec![], vec![file(&root, "out")], false);
        assert!(!t.needs_running());
    }

    #[test]
    fn newer_input_forces_rerun_with_redo() {
        let (_guard, root) = tempdir();
        std::fs::write(root.join("out"), "old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        std::fs::write(root.join("in"), "new").unwrap();

        let mut stale = task(
            "b",
            vec![file(&root, "in")],
            vec![file(&root, "out")],
            true,
        );
        assert!(stale.needs_running());

        // Without the flag the same snapshot is considered fresh.
        let mut fresh = task(
            "b",
            vec![file(&root, "in")],
            vec![file(&root, "out")],
            false,
        );
        assert!(!fresh.needs_running());
    }

    #[test]
    fn equal_mtimes_do_not_rerun() {
        let (_guard, root) = tempdir();
        std::fs::write(root.join("both"), "x").unwrap();
        let shared = file(&root, "both");
        // One file standing in for input and output pins the mtimes equal.
        let mut t = task("b", vec![shared.clone()], vec![shared], true);
        assert!(!t.needs_running());
    }

    #[test]
    fn missing_external_input_forces_rerun() {
        let (_guard, root) = tempdir();
        std::fs::write(root.join("out"), "x").unwrap();
        let mut t = task(
            "b",
            vec![file(&root, "never-created")],
            vec![file(&root, "out")],
            true,
        );
        assert!(t.needs_running());
    }

    #[test]
    fn insert_dedups_identical_tasks_by_output_path() {
        let (_guard, root) = tempdir();
        let mut graph = CommandGraph::new();

        let first = graph
            .insert(task("a", vec![], vec![file(&root, "out")], false))
            .unwrap();
        let second = graph
            .insert(task("a", vec![], vec![file(&root, "out")], false))
            .unwrap();

        let first = match first {
            Inserted::New(ix) => ix,
            Inserted::Existing(_) => panic!("first insert must be new"),
        };
        match second {
            Inserted::Existing(ix) => assert_eq!(ix, first),
            Inserted::New(_) => panic!("second insert must dedup"),
        }
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn insert_rejects_conflicting_producer() {
        let (_guard, root) = tempdir();
        let mut graph = CommandGraph::new();

        graph
            .insert(task("a", vec![], vec![file(&root, "out")], false))
            .unwrap();
        let err = graph
            .insert(Task::new(
                "b".to_string(),
                "something else".to_string(),
                vec![],
                vec![file(&root, "out")],
                vec![],
                false,
            ))
            .unwrap_err();
        assert!(matches!(err, ExpandError::DuplicateProducer { .. }));
    }

    #[test]
    fn multiple_outputs_index_to_one_node() {
        let (_guard, root) = tempdir();
        let mut graph = CommandGraph::new();

        graph
            .insert(task(
                "a",
                vec![],
                vec![file(&root, "one"), file(&root, "two")],
                false,
            ))
            .unwrap();

        let one = graph.producer_of(&root.join("one")).unwrap();
        let two = graph.producer_of(&root.join("two")).unwrap();
        assert_eq!(one, two);
    }

    #[test]
    fn wire_links_producers_to_consumers() {
        let (_guard, root) = tempdir();
        let mut graph = CommandGraph::new();

        let a = graph
            .insert(task("a", vec![], vec![file(&root, "mid")], false))
            .unwrap();
        let b = graph
            .insert(task(
                "b",
                vec![file(&root, "mid")],
                vec![file(&root, "end")],
                false,
            ))
            .unwrap();
        let (Inserted::New(a), Inserted::New(b)) = (a, b) else {
            panic!("both inserts must be new");
        };

        graph.wire(&[a, b]).unwrap();
        assert!(graph.graph.contains_edge(a, b));
        assert_eq!(graph.graph.edge_count(), 1);
    }

    #[test]
    fn wire_rejects_self_dependency() {
        let (_guard, root) = tempdir();
        let mut graph = CommandGraph::new();

        let Ok(Inserted::New(ix)) = graph.insert(task(
            "a",
            vec![file(&root, "loop")],
            vec![file(&root, "loop")],
            false,
        )) else {
            panic!("insert must succeed");
        };
        let err = graph.wire(&[ix]).unwrap_err();
        assert!(matches!(err, ExpandError::DependencyCycle { .. }));
    }

    #[test]
    fn wire_rejects_mutual_cycle() {
        let (_guard, root) = tempdir();
        let mut graph = CommandGraph::new();

        let Ok(Inserted::New(a)) = graph.insert(task(
            "a",
            vec![file(&root, "from_b")],
            vec![file(&root, "from_a")],
            false,
        )) else {
            panic!()
        };
        let Ok(Inserted::New(b)) = graph.insert(task(
            "b",
            vec![file(&root, "from_a")],
            vec![file(&root, "from_b")],
            false,
        )) else {
            panic!()
        };

        let err = graph.wire(&[a, b]).unwrap_err();
        match err {
            ExpandError::DependencyCycle { names } => {
                assert_eq!(names.len(), 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
