use std::collections::BTreeSet;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ExpandError;
use crate::params::Binding;
use crate::template::Template;

/// A file known to the build by a logical name, with a parameterized path.
#[derive(Debug, Clone)]
pub struct FileSpec {
    name: String,
    path: Template,
}

impl FileSpec {
    pub fn new(name: impl Into<String>, path_template: &str) -> Self {
        Self {
            name: name.into(),
            path: Template::parse(path_template),
        }
    }

    /// The logical name, unique within a [`MakeGraph`](crate::MakeGraph).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path_template(&self) -> &Template {
        &self.path
    }

    pub fn parameters(&self) -> BTreeSet<&str> {
        self.path.parameters()
    }

    /// Renders the path under `binding` and joins it onto `root`, taking a
    /// fresh filesystem snapshot.
    pub fn concretize(&self, root: &Utf8Path, binding: &Binding) -> Result<File, ExpandError> {
        let rendered = self
            .path
            .render(binding)
            .map_err(|missing| ExpandError::MissingParameters {
                place: format!("file `{}`", self.name),
                missing,
            })?;
        Ok(File::new(root.join(rendered)))
    }
}

/// A concrete file path together with a snapshot of its filesystem state.
///
/// The snapshot is the modification time alone: a file exists exactly when
/// its mtime is known. [`File::refresh`] re-reads the metadata.
#[derive(Debug, Clone)]
pub struct File {
    path: Utf8PathBuf,
    mtime: Option<SystemTime>,
}

impl File {
    pub fn new(path: Utf8PathBuf) -> Self {
        let mut file = Self { path, mtime: None };
        file.refresh();
        file
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.mtime.is_some()
    }

    pub fn mtime(&self) -> Option<SystemTime> {
        self.mtime
    }

    /// Re-reads the filesystem. A file whose metadata cannot be queried is
    /// treated as absent.
    pub fn refresh(&mut self) {
        self.mtime = std::fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok();
    }
}

// Two files are the same file iff they resolve to the same path; the
// snapshots are transient.
impl PartialEq for File {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for File {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concretize_joins_root_and_substitutes() {
        let spec = FileSpec::new("report", "out/report_{lang}.csv");
        let mut binding = Binding::new();
        binding.set("lang", "en");

        let file = spec.concretize(Utf8Path::new("/data"), &binding).unwrap();
        assert_eq!(file.path(), "/data/out/report_en.csv");
    }

    #[test]
    fn concretize_names_the_file_on_missing_parameters() {
        let spec = FileSpec::new("report", "out/report_{lang}.csv");
        let err = spec
            .concretize(Utf8Path::new("/data"), &Binding::new())
            .unwrap_err();
        match err {
            ExpandError::MissingParameters { place, missing } => {
                assert_eq!(place, "file `report`");
                assert_eq!(missing, vec!["lang".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn refresh_tracks_existence_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        let path = root.join("present.txt");

        let mut file = File::new(path.clone());
        assert!(!file.exists());
        assert!(file.mtime().is_none());

        std::fs::write(&path, "x").unwrap();
        file.refresh();
        assert!(file.exists());
        assert!(file.mtime().is_some());
    }
}
