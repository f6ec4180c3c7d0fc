//! Incoming bundle validation and the update-necessity check.

use policybanner_common::hash::sha256_file;
use policybanner_common::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Outcome of comparing the incoming bundle against the installed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateDecision {
    /// Nothing installed yet.
    Install,
    /// Installed bundle differs from the incoming one.
    Replace,
    /// Installed bundle already matches; skip the mutation steps.
    UpToDate,
}

impl UpdateDecision {
    pub fn needs_update(&self) -> bool {
        !matches!(self, UpdateDecision::UpToDate)
    }
}

/// Check that the incoming bundle is a non-empty directory.
pub fn validate_structure(bundle: &Path) -> Result<()> {
    let metadata = match std::fs::metadata(bundle) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::MissingSource {
                path: bundle.to_path_buf(),
            })
        }
        Err(e) => return Err(malformed(bundle, e.to_string())),
    };

    if !metadata.is_dir() {
        return Err(malformed(bundle, "not a directory".to_string()));
    }

    let mut entries = std::fs::read_dir(bundle).map_err(|e| malformed(bundle, e.to_string()))?;
    if entries.next().is_none() {
        return Err(malformed(bundle, "bundle is empty".to_string()));
    }

    debug!("Incoming bundle {} is structurally valid", bundle.display());
    Ok(())
}

fn malformed(path: &Path, reason: String) -> Error {
    Error::MalformedSource {
        path: path.to_path_buf(),
        reason,
    }
}

/// A tree entry as seen by the content comparison. Modes and owners are
/// deliberately absent: they are reapplied on every deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TreeEntry {
    Dir,
    File { sha256: String },
    Symlink { target: PathBuf },
}

fn snapshot_tree(root: &Path) -> io::Result<BTreeMap<PathBuf, TreeEntry>> {
    let mut entries = BTreeMap::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .to_path_buf();

        let file_type = entry.file_type();
        let tree_entry = if file_type.is_symlink() {
            TreeEntry::Symlink {
                target: std::fs::read_link(entry.path())?,
            }
        } else if file_type.is_dir() {
            TreeEntry::Dir
        } else {
            TreeEntry::File {
                sha256: sha256_file(entry.path())?,
            }
        };
        entries.insert(relative, tree_entry);
    }

    Ok(entries)
}

/// Decide whether the installed bundle needs replacing.
///
/// An unreadable installed bundle counts as different so the deployment
/// replaces it; an unreadable incoming bundle is a malformed source.
pub fn compare_bundles(incoming: &Path, installed: &Path) -> Result<UpdateDecision> {
    if std::fs::symlink_metadata(installed).is_err() {
        info!("No existing PolicyBanner found. Will install new one.");
        return Ok(UpdateDecision::Install);
    }

    let incoming_tree = snapshot_tree(incoming).map_err(|e| malformed(incoming, e.to_string()))?;

    let installed_tree = match snapshot_tree(installed) {
        Ok(tree) => tree,
        Err(e) => {
            warn!(
                "Could not read installed PolicyBanner at {}: {}. Will replace it.",
                installed.display(),
                e
            );
            return Ok(UpdateDecision::Replace);
        }
    };

    if let Some(path) = first_difference(&incoming_tree, &installed_tree) {
        debug!("Bundles differ at {}", path.display());
        info!("Existing PolicyBanner differs from incoming bundle. Will update.");
        Ok(UpdateDecision::Replace)
    } else {
        info!("Existing PolicyBanner is identical to incoming bundle. No update needed.");
        Ok(UpdateDecision::UpToDate)
    }
}

fn first_difference<'a>(
    left: &'a BTreeMap<PathBuf, TreeEntry>,
    right: &'a BTreeMap<PathBuf, TreeEntry>,
) -> Option<&'a Path> {
    for (path, entry) in left {
        if right.get(path) != Some(entry) {
            return Some(path.as_path());
        }
    }
    right
        .keys()
        .find(|path| !left.contains_key(*path))
        .map(PathBuf::as_path)
}
