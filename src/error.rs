use camino::Utf8PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParmakeError {
    #[error("Failed to read build document `{0}`: {1}")]
    DocumentRead(Utf8PathBuf, std::io::Error),

    #[error("Invalid build document: {0}")]
    Document(#[from] SpecError),

    #[error("Failed to expand the task graph: {0}")]
    Expand(#[from] ExpandError),

    #[error("Failed to run the task graph: {0}")]
    Run(#[from] GraphError),
}

/// Errors found while validating a build document, before any expansion.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("Malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Task `{task}` refers to unknown file `{file}`")]
    UnknownFile { task: String, file: String },

    #[error("Task `{task}` uses unknown resource `{resource}`")]
    UnknownResource { task: String, resource: String },

    #[error("In {place}, undeclared parameters: {}", .names.join(" "))]
    UndeclaredParameters { place: String, names: Vec<String> },

    #[error("Resource `{0}` must have a capacity of at least 1")]
    InvalidCapacity(String),

    #[error("Task `{0}` does not generate any file")]
    EmptyGenerates(String),

    #[error("Task `{task}` uses resource `{resource}` more times than its capacity")]
    OverCapacity { task: String, resource: String },

    #[error("File `{file}` is generated by both `{first}` and `{second}`")]
    DuplicateRule {
        file: String,
        first: String,
        second: String,
    },
}

/// Errors raised while concretizing the template graph into runnable tasks.
#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("In {place}, missing parameters: {}", .missing.join(" "))]
    MissingParameters { place: String, missing: Vec<String> },

    #[error("No task generates the target `{0}`")]
    UnknownTarget(String),

    #[error("Both `{first}` and `{second}` produce {path}")]
    DuplicateProducer {
        path: Utf8PathBuf,
        first: String,
        second: String,
    },

    #[error("Dependency cycle through {}", .names.join(" -> "))]
    DependencyCycle { names: Vec<String> },
}

/// Errors of the executor itself. Failures of individual commands are not
/// errors at this level; they are recorded per task in the run report.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Parallelism must be at least 1")]
    InvalidParallelism,

    #[error("Dependency cycle involving task `{0}`")]
    Cycle(String),

    #[error("Task `{0}` can never acquire its resources")]
    UnsatisfiableResources(String),

    #[error("Failed to start the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
