//! The parallel task runner.
//!
//! The executor performs a parallel topological traversal of a
//! [`CommandGraph`]: tasks are settled as soon as their predecessors are
//! terminal, and runnable tasks are dispatched to a worker pool the moment
//! a thread slot and their declared resource units are all free.
//!
//! The algorithm works as follows:
//! 1. A pool of worker threads is spawned, one slot per unit of
//!    parallelism.
//! 2. A channel carries results from the workers back to the scheduler.
//! 3. The initial set of tasks (those with no predecessors) is settled:
//!    a task downstream of a failure is blocked without running, a task
//!    whose outputs are up to date succeeds without running, and the rest
//!    queue up for admission.
//! 4. The admission queue dispatches each task once a thread slot and
//!    every resource unit it asks for are simultaneously available.
//! 5. When a worker reports a result, the slot and units are returned,
//!    the task's dependents are unlocked, and newly settled tasks feed
//!    steps 3-4.
//! 6. The loop continues until every task is terminal.
//!
//! A failed command only poisons its own downstream cone: everything else
//! keeps draining, which runs the maximal independent subgraph. Opting in
//! to [`RunOptions::fail_fast`] instead refuses every admission after the
//! first failure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::NodeIndex;
use rayon::ThreadPoolBuilder;
use tracing::{Level, Span, debug, error, info, span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::GraphError;
use crate::graph::{CommandGraph, TaskState};
use crate::resource::Resource;

/// Options for one run of a [`CommandGraph`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How many commands may execute at the same instant.
    pub parallelism: usize,
    /// Refuse to admit anything further after the first failure. Off by
    /// default: a failure only blocks its own downstream tasks and the
    /// rest of the graph keeps draining.
    pub fail_fast: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// Per-task outcomes and timings of one run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: HashMap<NodeIndex, TaskState>,
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
}

impl RunReport {
    /// True iff every task succeeded, whether or not its command ran.
    pub fn success(&self) -> bool {
        self.outcomes.values().all(|state| state.is_success())
    }

    fn count(&self, expected: TaskState) -> usize {
        self.outcomes
            .values()
            .filter(|&&state| state == expected)
            .count()
    }

    /// Tasks whose command ran and exited 0.
    pub fn built(&self) -> usize {
        self.count(TaskState::Succeeded { ran: true })
    }

    /// Tasks whose outputs were already up to date.
    pub fn fresh(&self) -> usize {
        self.count(TaskState::Succeeded { ran: false })
    }

    pub fn failed(&self) -> usize {
        self.count(TaskState::Failed)
    }

    pub fn blocked(&self) -> usize {
        self.count(TaskState::Blocked)
    }

    pub fn summary(&self) -> String {
        format!(
            "built {}, fresh {}, failed {}, blocked {}",
            self.built(),
            self.fresh(),
            self.failed(),
            self.blocked()
        )
    }
}

/// The scheduler-side ledger of free resource units.
struct ResourcePool {
    available: HashMap<String, usize>,
}

impl ResourcePool {
    fn new(graph: &CommandGraph) -> Self {
        let mut available = HashMap::new();
        for task in graph.tasks() {
            for resource in task.uses() {
                available
                    .entry(resource.name().to_string())
                    .or_insert_with(|| resource.capacity());
            }
        }
        Self { available }
    }

    fn needed(uses: &[Arc<Resource>]) -> HashMap<&str, usize> {
        let mut needed: HashMap<&str, usize> = HashMap::new();
        for resource in uses {
            *needed.entry(resource.name()).or_default() += 1;
        }
        needed
    }

    /// Whether every unit the task asks for is free right now.
    fn can_admit(&self, uses: &[Arc<Resource>]) -> bool {
        Self::needed(uses)
            .into_iter()
            .all(|(name, count)| self.available.get(name).is_some_and(|&free| free >= count))
    }

    /// Whether the task could ever be admitted on an idle executor.
    fn satisfiable(uses: &[Arc<Resource>]) -> bool {
        Self::needed(uses).into_iter().all(|(name, count)| {
            uses.iter()
                .find(|r| r.name() == name)
                .is_some_and(|r| r.capacity() >= count)
        })
    }

    /// Takes the units, in declaration order.
    fn acquire(&mut self, uses: &[Arc<Resource>]) {
        for resource in uses {
            if let Some(free) = self.available.get_mut(resource.name()) {
                *free -= 1;
            }
        }
    }

    /// Returns the units, in reverse declaration order.
    fn release(&mut self, uses: &[Arc<Resource>]) {
        for resource in uses.iter().rev() {
            if let Some(free) = self.available.get_mut(resource.name()) {
                *free += 1;
            }
        }
    }
}

/// Bookkeeping for one run: which tasks are settled, runnable or queued,
/// and which resources are free.
struct Scheduler<'g> {
    graph: &'g mut CommandGraph,
    dependents: HashMap<NodeIndex, Vec<NodeIndex>>,
    dependency_counts: HashMap<NodeIndex, usize>,
    upstream_failed: HashSet<NodeIndex>,
    ready: VecDeque<NodeIndex>,
    admission: VecDeque<NodeIndex>,
    pool: ResourcePool,
    report: RunReport,
    progress: Span,
    running: usize,
    terminal: u64,
    any_failed: bool,
}

impl<'g> Scheduler<'g> {
    fn new(graph: &'g mut CommandGraph, progress: Span) -> Self {
        // Map from a producer to the tasks consuming its outputs.
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in graph.graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let dependency_counts: HashMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|i| {
                (
                    i,
                    graph
                        .graph
                        .neighbors_directed(i, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let ready = graph
            .node_indices()
            .filter(|i| dependency_counts[i] == 0)
            .collect();

        let pool = ResourcePool::new(graph);

        Self {
            graph,
            dependents,
            dependency_counts,
            upstream_failed: HashSet::new(),
            ready,
            admission: VecDeque::new(),
            pool,
            report: RunReport::default(),
            progress,
            running: 0,
            terminal: 0,
            any_failed: false,
        }
    }

    /// Marks a task terminal and unlocks its dependents.
    fn settle(&mut self, index: NodeIndex, state: TaskState) {
        self.graph.task_mut(index).state = state;
        self.report.outcomes.insert(index, state);
        self.terminal += 1;
        self.progress.pb_inc(1);
        if state == TaskState::Failed {
            self.any_failed = true;
        }

        let Some(children) = self.dependents.get(&index) else {
            return;
        };
        for child in children.clone() {
            if !state.is_success() {
                self.upstream_failed.insert(child);
            }
            if let Some(count) = self.dependency_counts.get_mut(&child) {
                *count -= 1;
                if *count == 0 {
                    self.ready.push_back(child);
                }
            }
        }
    }

    /// Settles every task whose predecessors are all terminal: blocked,
    /// already fresh, or queued for admission.
    fn classify_ready(&mut self) {
        while let Some(index) = self.ready.pop_front() {
            if self.upstream_failed.contains(&index) {
                debug!(task = %self.graph.task(index).name(), "blocked by an upstream failure");
                self.settle(index, TaskState::Blocked);
            } else if !self.graph.task_mut(index).needs_running() {
                debug!(task = %self.graph.task(index).name(), "outputs up to date");
                self.settle(index, TaskState::Succeeded { ran: false });
            } else {
                self.admission.push_back(index);
            }
        }
    }

    /// In fail-fast mode a failure anywhere empties the queue.
    fn refuse_admissions(&mut self) {
        while let Some(index) = self.admission.pop_front() {
            self.settle(index, TaskState::Blocked);
        }
    }

    /// Picks the next queued task that fits in the free slots and resource
    /// units, and takes both.
    fn admit(&mut self, parallelism: usize) -> Option<NodeIndex> {
        if self.running >= parallelism {
            return None;
        }
        let position = self
            .admission
            .iter()
            .position(|&index| self.pool.can_admit(self.graph.task(index).uses()))?;
        let index = self.admission.remove(position)?;
        self.pool.acquire(self.graph.task(index).uses());
        self.running += 1;
        self.graph.task_mut(index).state = TaskState::Running;
        Some(index)
    }

    /// Returns the thread slot and resource units of a finished task.
    fn reclaim(&mut self, index: NodeIndex) {
        self.running -= 1;
        self.pool.release(self.graph.task(index).uses());
    }
}

/// Runs every task of the graph, up to `parallelism` commands at a time.
///
/// Per-command failures are not errors here: they are recorded in the
/// returned [`RunReport`] and poison only their downstream tasks. The
/// `Err` cases are defects of the graph itself.
pub fn run(graph: &mut CommandGraph, options: &RunOptions) -> Result<RunReport, GraphError> {
    if options.parallelism == 0 {
        return Err(GraphError::InvalidParallelism);
    }

    // Expansion rejects cycles already; re-check because a cycle would
    // leave the scheduler waiting on a result that never comes.
    if let Err(cycle) = toposort(&graph.graph, None) {
        return Err(GraphError::Cycle(
            graph.task(cycle.node_id()).name().to_string(),
        ));
    }

    for index in graph.node_indices() {
        if !ResourcePool::satisfiable(graph.task(index).uses()) {
            return Err(GraphError::UnsatisfiableResources(
                graph.task(index).name().to_string(),
            ));
        }
    }

    let total = graph.len() as u64;
    if total == 0 {
        return Ok(RunReport::default());
    }

    let workers = ThreadPoolBuilder::new()
        .num_threads(options.parallelism)
        .build()?;
    let (result_sender, result_receiver) =
        unbounded::<(NodeIndex, std::io::Result<ExitStatus>, Instant, Duration)>();

    let root_span = span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total);
    root_span.pb_set_style(
        &ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let pb_style = ProgressStyle::default_spinner();
    let mut scheduler = Scheduler::new(graph, root_span.clone());

    while scheduler.terminal < total {
        scheduler.classify_ready();

        if options.fail_fast && scheduler.any_failed {
            scheduler.refuse_admissions();
        }

        while let Some(index) = scheduler.admit(options.parallelism) {
            let task = scheduler.graph.task(index);
            let name = task.name().to_string();
            let command = task.command().to_string();
            debug!(task = %name, "running `{command}`");

            let sender = result_sender.clone();
            let style = pb_style.clone();
            workers.spawn(move || {
                let span = span!(Level::INFO, "task", name = %name);
                span.pb_set_style(&style);
                span.pb_set_message(&format!("Running {name}"));
                let _enter = span.enter();

                let start = Instant::now();
                let status = std::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .status();
                let duration = start.elapsed();

                sender.send((index, status, start, duration)).unwrap();
            });
        }

        if scheduler.terminal >= total {
            break;
        }
        if scheduler.running == 0 {
            // Nothing is running and nothing can be admitted; validated
            // unreachable, but better an error than a hang.
            let name = scheduler
                .admission
                .front()
                .map(|&i| scheduler.graph.task(i).name().to_string())
                .unwrap_or_default();
            return Err(GraphError::UnsatisfiableResources(name));
        }

        // Wait for any command to finish.
        let (index, status, start, duration) = result_receiver.recv().unwrap();
        scheduler.reclaim(index);
        scheduler
            .report
            .execution_times
            .insert(index, TaskExecution { start, duration });

        let state = match status {
            Ok(code) if code.success() => TaskState::Succeeded { ran: true },
            Ok(code) => {
                error!(task = %scheduler.graph.task(index).name(), "command exited with {code}");
                TaskState::Failed
            }
            Err(spawn) => {
                error!(task = %scheduler.graph.task(index).name(), "failed to spawn command: {spawn}");
                TaskState::Failed
            }
        };
        scheduler.settle(index, state);
    }

    let report = scheduler.report;
    info!("Run complete: {}", report.summary());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::{Utf8Path, Utf8PathBuf};

    use crate::config::Document;
    use crate::graph::CommandGraph;
    use crate::params::ParameterSpace;

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        (dir, path)
    }

    fn expand(
        yaml: &str,
        root: &Utf8Path,
        targets: &[&str],
        axes: &[(&str, &[&str])],
        redo_if_modified: bool,
    ) -> CommandGraph {
        let document: Document = yaml.parse().unwrap();
        let make = document.compile(root.to_path_buf()).unwrap();

        let mut space = ParameterSpace::new();
        for (name, values) in axes {
            space.insert(*name, values.iter().map(|v| v.to_string()).collect());
        }

        let mut graph = CommandGraph::new();
        for binding in space.bindings() {
            for target in targets {
                make.expand(target, &binding, &mut graph, redo_if_modified)
                    .unwrap();
            }
        }
        graph
    }

    fn state_of(graph: &CommandGraph, root: &Utf8Path, output: &str) -> TaskState {
        let index = graph.producer_of(&root.join(output)).unwrap();
        graph.task(index).state()
    }

    #[test]
    fn builds_a_missing_output() {
        let (_guard, root) = scratch();
        let yaml = format!(
            r#"
parameters:
  a: "shard"
files:
  f: "f_{{a}}"
tasks:
  - name: gen
    command: "echo ok > {root}/f_{{a}}"
    generates: [f]
"#
        );

        let mut graph = expand(&yaml, &root, &["f"], &[("a", &["x"])], false);
        let report = run(&mut graph, &RunOptions::default()).unwrap();

        assert!(report.success());
        assert!(root.join("f_x").exists());
        assert_eq!(
            state_of(&graph, &root, "f_x"),
            TaskState::Succeeded { ran: true }
        );
    }

    #[test]
    fn fresh_output_skips_the_command() {
        let (_guard, root) = scratch();
        std::fs::write(root.join("f_x"), "already there").unwrap();
        let yaml = format!(
            r#"
parameters:
  a: "shard"
files:
  f: "f_{{a}}"
tasks:
  - name: gen
    command: "touch {root}/ran_{{a}} && echo ok > {root}/f_{{a}}"
    generates: [f]
"#
        );

        let mut graph = expand(&yaml, &root, &["f"], &[("a", &["x"])], false);
        let report = run(&mut graph, &RunOptions::default()).unwrap();

        assert!(report.success());
        assert!(!root.join("ran_x").exists());
        assert_eq!(report.fresh(), 1);
        assert_eq!(
            state_of(&graph, &root, "f_x"),
            TaskState::Succeeded { ran: false }
        );
    }

    #[test]
    fn stale_output_reruns_only_the_stale_task() {
        let (_guard, root) = scratch();
        // The downstream output predates the upstream one.
        std::fs::write(root.join("b.txt"), "stale").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        std::fs::write(root.join("a.txt"), "newer").unwrap();

        let yaml = format!(
            r#"
parameters: {{}}
files:
  a_out: "a.txt"
  b_out: "b.txt"
tasks:
  - name: first
    command: "touch {root}/first_ran && echo a > {root}/a.txt"
    generates: [a_out]
  - name: second
    command: "touch {root}/second_ran && echo b > {root}/b.txt"
    generates: [b_out]
    dependencies: [a_out]
"#
        );

        let mut graph = expand(&yaml, &root, &["b_out"], &[], true);
        let report = run(&mut graph, &RunOptions::default()).unwrap();

        assert!(report.success());
        assert!(!root.join("first_ran").exists());
        assert!(root.join("second_ran").exists());
        assert_eq!(report.fresh(), 1);
        assert_eq!(report.built(), 1);
    }

    #[test]
    fn parameter_product_builds_every_combination() {
        let (_guard, root) = scratch();
        let yaml = format!(
            r#"
parameters:
  a: "first axis"
  b: "second axis"
files:
  f: "f_{{a}}_{{b}}"
tasks:
  - name: gen
    command: "echo {{a}}{{b}} > {root}/f_{{a}}_{{b}}"
    generates: [f]
"#
        );

        let mut graph = expand(
            &yaml,
            &root,
            &["f"],
            &[("a", &["1", "2"]), ("b", &["x", "y"])],
            false,
        );
        assert_eq!(graph.len(), 4);

        let report = run(
            &mut graph,
            &RunOptions {
                parallelism: 4,
                fail_fast: false,
            },
        )
        .unwrap();
        assert!(report.success());
        for name in ["f_1_x", "f_1_y", "f_2_x", "f_2_y"] {
            assert!(root.join(name).exists(), "missing {name}");
        }
    }

    #[test]
    fn resource_capacity_keeps_holders_exclusive() {
        let (_guard, root) = scratch();
        // `mkdir` is atomic: if the two commands ever overlapped, the
        // second one would find the lock directory and fail.
        let yaml = format!(
            r#"
parameters:
  n: "task number"
resources:
  gpu: 1
files:
  out: "out_{{n}}"
tasks:
  - name: exclusive
    command: "mkdir {root}/lock && sleep 0.3 && rmdir {root}/lock && touch {root}/out_{{n}}"
    generates: [out]
    uses: [gpu]
"#
        );

        let mut graph = expand(&yaml, &root, &["out"], &[("n", &["1", "2"])], false);
        let report = run(
            &mut graph,
            &RunOptions {
                parallelism: 4,
                fail_fast: false,
            },
        )
        .unwrap();

        assert!(report.success());
        assert!(root.join("out_1").exists());
        assert!(root.join("out_2").exists());
    }

    #[test]
    fn failure_blocks_downstream_and_spares_the_rest() {
        let (_guard, root) = scratch();
        let yaml = format!(
            r#"
parameters: {{}}
files:
  a_out: "a"
  b_out: "b"
  c_out: "c"
  d_out: "d"
tasks:
  - name: breaks
    command: "false"
    generates: [a_out]
  - name: mid
    command: "touch {root}/b"
    generates: [b_out]
    dependencies: [a_out]
  - name: last
    command: "touch {root}/c"
    generates: [c_out]
    dependencies: [b_out]
  - name: bystander
    command: "touch {root}/d"
    generates: [d_out]
"#
        );

        let mut graph = expand(&yaml, &root, &["c_out", "d_out"], &[], false);
        let report = run(
            &mut graph,
            &RunOptions {
                parallelism: 2,
                fail_fast: false,
            },
        )
        .unwrap();

        assert!(!report.success());
        assert_eq!(state_of(&graph, &root, "a"), TaskState::Failed);
        assert_eq!(state_of(&graph, &root, "b"), TaskState::Blocked);
        assert_eq!(state_of(&graph, &root, "c"), TaskState::Blocked);
        assert_eq!(
            state_of(&graph, &root, "d"),
            TaskState::Succeeded { ran: true }
        );
        assert!(root.join("d").exists());
        assert!(!root.join("b").exists());
    }

    #[test]
    fn fail_fast_refuses_pending_admissions() {
        let (_guard, root) = scratch();
        let yaml = format!(
            r#"
parameters: {{}}
files:
  a_out: "a"
  d_out: "d"
tasks:
  - name: breaks
    command: "false"
    generates: [a_out]
  - name: bystander
    command: "touch {root}/d"
    generates: [d_out]
"#
        );

        // With one slot the failing task is admitted first and the
        // bystander is still queued when the failure lands.
        let mut graph = expand(&yaml, &root, &["a_out", "d_out"], &[], false);
        let report = run(
            &mut graph,
            &RunOptions {
                parallelism: 1,
                fail_fast: true,
            },
        )
        .unwrap();

        assert!(!report.success());
        assert_eq!(state_of(&graph, &root, "a"), TaskState::Failed);
        assert_eq!(state_of(&graph, &root, "d"), TaskState::Blocked);
        assert!(!root.join("d").exists());
    }

    #[test]
    fn empty_graph_is_a_successful_noop() {
        let mut graph = CommandGraph::new();
        let report = run(&mut graph, &RunOptions::default()).unwrap();
        assert!(report.success());
        assert!(report.outcomes.is_empty());
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let mut graph = CommandGraph::new();
        let err = run(
            &mut graph,
            &RunOptions {
                parallelism: 0,
                fail_fast: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidParallelism));
    }

    #[test]
    fn oversubscribed_resource_is_rejected_up_front() {
        // The document loader refuses such tasks; build one directly to
        // check the executor does not hang on it either.
        let (_guard, root) = scratch();
        let gpu = crate::resource::Resource::new("gpu", 1);
        let out = Arc::new(crate::file::FileSpec::new("out", "out"));

        let mut make = crate::make::MakeGraph::new(root);
        make.add_task(crate::make::TaskSpec::new(
            "greedy",
            "true",
            vec![],
            vec![out],
            vec![gpu.clone(), gpu],
        ))
        .unwrap();

        let mut graph = make
            .expand_product("out", &ParameterSpace::new(), false)
            .unwrap();
        let err = run(&mut graph, &RunOptions::default()).unwrap_err();
        assert!(matches!(err, GraphError::UnsatisfiableResources(_)));
    }
}
