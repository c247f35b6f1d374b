//! The build document: the YAML description of parameters, resources,
//! files and tasks that a run is expanded from.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::{ParmakeError, SpecError};
use crate::file::FileSpec;
use crate::make::{MakeGraph, TaskSpec};
use crate::resource::Resource;
use crate::template::Template;

/// One task entry of the document. `generates` and `dependencies` refer to
/// the logical names under `files`; `uses` refers to the names under
/// `resources`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub generates: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub uses: Vec<String>,
}

/// The parsed document, not yet validated.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Document {
    /// Parameter names mapped to their help text.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Resource names mapped to their capacity.
    #[serde(default)]
    pub resources: BTreeMap<String, usize>,
    /// Logical file names mapped to their path templates.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

impl FromStr for Document {
    type Err = SpecError;

    fn from_str(text: &str) -> Result<Self, SpecError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

impl Document {
    pub fn load(path: &Utf8Path) -> Result<Self, ParmakeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ParmakeError::DocumentRead(path.to_owned(), e))?;
        Ok(text.parse::<Document>()?)
    }

    /// Validates the document and builds the template graph, with every
    /// concretized path rooted at `root`.
    pub fn compile(&self, root: impl Into<Utf8PathBuf>) -> Result<MakeGraph, SpecError> {
        let declared: BTreeSet<&str> = self.parameters.keys().map(String::as_str).collect();

        let undeclared_in = |place: String, template: &Template| -> Result<(), SpecError> {
            let names: Vec<String> = template
                .parameters()
                .into_iter()
                .filter(|name| !declared.contains(name))
                .map(str::to_string)
                .collect();
            if names.is_empty() {
                Ok(())
            } else {
                Err(SpecError::UndeclaredParameters { place, names })
            }
        };

        let mut resources = BTreeMap::new();
        for (name, &capacity) in &self.resources {
            if capacity < 1 {
                return Err(SpecError::InvalidCapacity(name.clone()));
            }
            resources.insert(name.as_str(), Resource::new(name.clone(), capacity));
        }

        let mut files = BTreeMap::new();
        for (name, template) in &self.files {
            let spec = FileSpec::new(name.clone(), template);
            undeclared_in(format!("file `{name}`"), spec.path_template())?;
            files.insert(name.as_str(), Arc::new(spec));
        }

        let lookup_file = |task: &str, name: &str| -> Result<Arc<FileSpec>, SpecError> {
            files
                .get(name)
                .cloned()
                .ok_or_else(|| SpecError::UnknownFile {
                    task: task.to_string(),
                    file: name.to_string(),
                })
        };

        let mut make = MakeGraph::new(root);
        for entry in &self.tasks {
            undeclared_in(
                format!("task `{}`", entry.name),
                &Template::parse(&entry.command),
            )?;

            if entry.generates.is_empty() {
                return Err(SpecError::EmptyGenerates(entry.name.clone()));
            }
            let outputs = entry
                .generates
                .iter()
                .map(|name| lookup_file(&entry.name, name))
                .collect::<Result<Vec<_>, _>>()?;
            let inputs = entry
                .dependencies
                .iter()
                .map(|name| lookup_file(&entry.name, name))
                .collect::<Result<Vec<_>, _>>()?;

            let mut uses = Vec::new();
            for name in &entry.uses {
                let resource =
                    resources
                        .get(name.as_str())
                        .ok_or_else(|| SpecError::UnknownResource {
                            task: entry.name.clone(),
                            resource: name.clone(),
                        })?;
                uses.push(resource.clone());
            }
            for resource in &uses {
                let held = uses.iter().filter(|r| Arc::ptr_eq(r, resource)).count();
                if held > resource.capacity() {
                    return Err(SpecError::OverCapacity {
                        task: entry.name.clone(),
                        resource: resource.name().to_string(),
                    });
                }
            }

            make.add_task(TaskSpec::new(
                entry.name.clone(),
                &entry.command,
                inputs,
                outputs,
                uses,
            ))?;
        }

        Ok(make)
    }
}
