//! Locating the incoming bundle in the staging area.
//!
//! The external deployment mechanism drops either the bundle directory
//! itself or a gzip tarball of it into the staging directory. Tarballs are
//! unpacked into the workspace, never next to the staged file.

use crate::config::DeployConfig;
use crate::workspace::Workspace;
use flate2::read::GzDecoder;
use policybanner_common::{Error, Result};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

/// How the incoming bundle reached the staging area.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum StagingSource {
    Directory(PathBuf),
    Archive(PathBuf),
}

/// The incoming bundle, ready for validation.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingBundle {
    pub path: PathBuf,
    pub source: StagingSource,
}

/// Find the incoming bundle, extracting the staged tarball into the
/// workspace when no plain directory was staged.
pub fn stage_incoming(config: &DeployConfig, workspace: &Workspace) -> Result<IncomingBundle> {
    let staged = config.staged_bundle();
    if staged.exists() {
        info!("Using staged bundle {}", staged.display());
        return Ok(IncomingBundle {
            source: StagingSource::Directory(staged.clone()),
            path: staged,
        });
    }

    let archive = config.staged_archive();
    if !archive.is_file() {
        return Err(Error::MissingSource { path: staged });
    }

    workspace.ensure_open()?;
    let dest = config.extraction_dir();
    debug_assert!(dest.starts_with(workspace.path()));
    info!("Extracting {} into {}", archive.display(), dest.display());
    extract_archive(&archive, &dest)?;

    let extracted = dest.join(&config.bundle_name);
    if !extracted.exists() {
        // The tarball unpacked, but not into the expected bundle.
        return Err(Error::MissingSource { path: extracted });
    }

    Ok(IncomingBundle {
        path: extracted,
        source: StagingSource::Archive(archive),
    })
}

/// Unpack a gzip tarball into `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let extraction_error = |source| Error::Extraction {
        archive: archive.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dest).map_err(extraction_error)?;
    let file = File::open(archive).map_err(extraction_error)?;
    let mut tarball = Archive::new(GzDecoder::new(file));
    tarball.set_preserve_permissions(false);
    tarball.unpack(dest).map_err(extraction_error)?;

    debug!("Extracted {} to {}", archive.display(), dest.display());
    Ok(())
}
