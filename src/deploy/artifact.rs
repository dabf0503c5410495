//! Deployment package loading.
//!
//! A deployment artifact is the three-part schema package the engine
//! consumes: an optional pre-deployment script, an optional post-deployment
//! script, and the model script holding the schema's DDL/DML body. Two
//! on-disk forms are accepted:
//!
//! - a dacpac-style ZIP package with `predeploy.sql`, `postdeploy.sql` and
//!   `model.sql` entries, unpacked into a scratch directory for the
//!   artifact's lifetime;
//! - a plain directory containing those files (any nesting), typical for
//!   unpackaged build output.
//!
//! Artifacts are loaded fresh for every deployment and never cached; the
//! scratch directory is deleted when the artifact is dropped, deploy
//! success or failure alike.

use std::io::Read;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use super::sqlcmd::{expand_includes, read_script_file};
use crate::error::ProvisionError;

const MODEL_SCRIPT: &str = "model.sql";
const PRE_SCRIPT: &str = "predeploy.sql";
const POST_SCRIPT: &str = "postdeploy.sql";

/// A parsed schema package, ready for the deployment engine.
#[derive(Debug)]
pub struct DeploymentArtifact {
    name: String,
    /// Path the artifact was loaded from (the package file or directory).
    source_path: PathBuf,
    pre_script: Option<String>,
    post_script: Option<String>,
    model_script: String,
    /// Scratch directory holding the unpacked package. Dropping it deletes
    /// the directory.
    _scratch: Option<TempDir>,
}

impl DeploymentArtifact {
    /// Load the package at `path`, unpacking ZIP packages into a scratch
    /// directory first.
    pub fn load(path: &Path) -> Result<Self, ProvisionError> {
        if path.is_dir() {
            Self::from_directory(path)
        } else {
            Self::from_package(path)
        }
    }

    fn from_directory(path: &Path) -> Result<Self, ProvisionError> {
        let (pre, post, model) = load_scripts(path)?;
        let model = model.ok_or_else(|| ProvisionError::ArtifactMissingModel {
            path: path.to_path_buf(),
        })?;

        Ok(Self {
            name: package_name(path),
            source_path: path.to_path_buf(),
            pre_script: pre,
            post_script: post,
            model_script: model,
            _scratch: None,
        })
    }

    fn from_package(path: &Path) -> Result<Self, ProvisionError> {
        let scratch = TempDir::new().map_err(|e| ProvisionError::ArtifactReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        unpack_package(path, scratch.path())?;
        debug!(
            package = %path.display(),
            scratch = %scratch.path().display(),
            "unpacked deployment package"
        );

        let (pre, post, model) = load_scripts(scratch.path())?;
        let model = model.ok_or_else(|| ProvisionError::ArtifactMissingModel {
            path: path.to_path_buf(),
        })?;

        Ok(Self {
            name: package_name(path),
            source_path: path.to_path_buf(),
            pre_script: pre,
            post_script: post,
            model_script: model,
            _scratch: Some(scratch),
        })
    }

    /// Package name: the file stem of the package, or the directory name.
    /// A `DatabaseSpec` name always wins over this when both are present.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn pre_script(&self) -> Option<&str> {
        self.pre_script.as_deref()
    }

    pub fn post_script(&self) -> Option<&str> {
        self.post_script.as_deref()
    }

    pub fn model_script(&self) -> &str {
        &self.model_script
    }
}

/// Extract every entry of a ZIP package under `dest`.
fn unpack_package(path: &Path, dest: &Path) -> Result<(), ProvisionError> {
    let file = std::fs::File::open(path).map_err(|e| ProvisionError::ArtifactReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ProvisionError::ArtifactInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| ProvisionError::ArtifactInvalid {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        // Entries with traversal components are silently skipped.
        let Some(relative) = entry.enclosed_name() else {
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProvisionError::ArtifactReadError {
                path: path.to_path_buf(),
                source: e,
            })?;
        }

        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| ProvisionError::ArtifactReadError {
                path: path.to_path_buf(),
                source: e,
            })?;
        std::fs::write(&target, bytes).map_err(|e| ProvisionError::ArtifactReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    Ok(())
}

/// Locate and read the three scripts under `root`, expanding `:r` includes
/// relative to each script's own location.
#[allow(clippy::type_complexity)]
fn load_scripts(
    root: &Path,
) -> Result<(Option<String>, Option<String>, Option<String>), ProvisionError> {
    let pre = read_named_script(root, PRE_SCRIPT)?;
    let post = read_named_script(root, POST_SCRIPT)?;
    let model = read_named_script(root, MODEL_SCRIPT)?;
    Ok((pre, post, model))
}

fn read_named_script(root: &Path, file_name: &str) -> Result<Option<String>, ProvisionError> {
    let Some(path) = find_script(root, file_name) else {
        return Ok(None);
    };
    let content = read_script_file(&path).map_err(|e| ProvisionError::ArtifactReadError {
        path: path.clone(),
        source: e,
    })?;
    expand_includes(&content, &path).map(Some)
}

/// Shallowest case-insensitive filename match under `root`.
fn find_script(root: &Path, file_name: &str) -> Option<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| {
            entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.eq_ignore_ascii_case(file_name))
        })
        .map(|entry| entry.into_path())
}

fn package_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("package")
        .to_string()
}
