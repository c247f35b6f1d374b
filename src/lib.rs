#![deny(unsafe_code, clippy::panic)]

//! A parameterized parallel build orchestrator.
//!
//! `parmake` is `make` generalized along two axes. Tasks are templates:
//! their commands and file paths carry `{name}` placeholders, and one task
//! entry is instantiated once per combination of parameter values drawn
//! from a [`ParameterSpace`]. Tasks also declare named [`Resource`]s, so a
//! run is bounded both by a thread count and by per-resource capacities
//! (two jobs sharing a `gpu: 1` resource never overlap, no matter how many
//! threads are free).
//!
//! A build goes through three stages:
//!
//! 1. A [`Document`] is parsed from YAML and compiled into a [`MakeGraph`],
//!    the template-level dependency graph.
//! 2. The graph is expanded for a target under every parameter binding
//!    into a [`CommandGraph`] of concrete tasks, deduplicated by output
//!    path and wired producer-to-consumer.
//! 3. The [`executor`] runs the concrete graph in parallel, skipping tasks
//!    whose outputs are already up to date and blocking tasks downstream
//!    of a failure.
//!
//! ```rust,no_run
//! use parmake::{Document, ParameterSpace, RunOptions, executor};
//!
//! # fn main() -> anyhow::Result<()> {
//! let document: Document = std::fs::read_to_string("build.yml")?.parse()?;
//! let make = document.compile("/data")?;
//!
//! let mut space = ParameterSpace::new();
//! space.insert("lang", vec!["en".into(), "pl".into()]);
//!
//! let mut graph = make.expand_product("model", &space, false)?;
//! let report = executor::run(&mut graph, &RunOptions::default())?;
//! assert!(report.success());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod file;
pub mod graph;
pub mod make;
pub mod params;
pub mod resource;
pub mod template;

pub use camino;

pub use crate::config::Document;
pub use crate::error::ParmakeError;
pub use crate::executor::{RunOptions, RunReport};
pub use crate::file::{File, FileSpec};
pub use crate::graph::{CommandGraph, Task, TaskState};
pub use crate::make::{MakeGraph, TaskSpec};
pub use crate::params::{Binding, ParameterSpace};
pub use crate::resource::Resource;
