//! The deployment engine: backup, remove, install, secure.
//!
//! Steps run strictly in that order and the first failure aborts the rest.
//! Nothing is rolled back: a failed install after a successful remove
//! leaves the banner missing, and the backup in the workspace is the only
//! copy of the previous version until the workspace is destroyed.

use crate::config::DeployConfig;
use crate::workspace::Workspace;
use nix::unistd::{Group, User};
use policybanner_common::{Error, Result, Timestamp};
use serde::Serialize;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// Summary of a completed deployment.
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    /// Snapshot of the previous bundle, if there was one.
    pub backup: Option<PathBuf>,
    pub installed_path: PathBuf,
    /// Files and symlinks copied into the installed bundle.
    pub files_installed: usize,
    /// Objects whose mode and owner were set.
    pub objects_secured: usize,
}

/// Numeric owner resolved from user and group names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn resolve(user: &str, group: &str) -> Result<Self> {
        let ownership_error = |reason: String| Error::Ownership {
            user: user.to_string(),
            group: group.to_string(),
            reason,
        };

        let uid = User::from_name(user)
            .map_err(|e| ownership_error(e.to_string()))?
            .ok_or_else(|| ownership_error(format!("unknown user {}", user)))?
            .uid;
        let gid = Group::from_name(group)
            .map_err(|e| ownership_error(e.to_string()))?
            .ok_or_else(|| ownership_error(format!("unknown group {}", group)))?
            .gid;

        Ok(Self {
            uid: uid.as_raw(),
            gid: gid.as_raw(),
        })
    }
}

/// Recursively copy `src` to `dst`. Directories are recreated, regular
/// files copied and symlinks recreated as symlinks. Any other file type is
/// refused. Returns the number of files and symlinks copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<usize> {
    let mut copied = 0;

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
            copied += 1;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported file type at {}", entry.path().display()),
            ));
        }
    }

    Ok(copied)
}

/// Pick a backup path under `dir` named `<bundle>.backup_<YYYYMMDDHHMMSS>`.
/// Two backups within the same second get a `_N` counter instead of
/// overwriting each other.
pub fn backup_path(dir: &Path, bundle_name: &str, at: &Timestamp) -> PathBuf {
    let base = format!("{}.backup_{}", bundle_name, at.to_backup_suffix());
    let mut candidate = dir.join(&base);
    let mut counter = 1;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}", base, counter));
        counter += 1;
    }
    candidate
}

fn exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

/// Runs the mutation steps against the configured install location.
pub struct Installer<'a> {
    config: &'a DeployConfig,
}

impl<'a> Installer<'a> {
    pub fn new(config: &'a DeployConfig) -> Self {
        Self { config }
    }

    /// Snapshot the installed bundle into the workspace. No-op when nothing
    /// is installed.
    pub fn backup(&self, workspace: &Workspace) -> Result<Option<PathBuf>> {
        let installed = self.config.installed_bundle();
        if !exists(&installed) {
            debug!("Nothing installed at {}, skipping backup", installed.display());
            return Ok(None);
        }

        let backup_dir = self.config.backup_dir();
        debug_assert!(backup_dir.starts_with(workspace.path()));
        let target = backup_path(&backup_dir, &self.config.bundle_name, &Timestamp::now());

        let result =
            std::fs::create_dir_all(&backup_dir).and_then(|_| copy_tree(&installed, &target));
        match result {
            Ok(files) => {
                info!(
                    "Backed up existing PolicyBanner to {} ({} files)",
                    target.display(),
                    files
                );
                Ok(Some(target))
            }
            Err(source) => {
                error!("Failed to back up {}: {}", installed.display(), source);
                Err(Error::Backup {
                    path: installed,
                    source,
                })
            }
        }
    }

    /// Delete the installed bundle. Returns `false` if there was none.
    pub fn remove(&self) -> Result<bool> {
        let installed = self.config.installed_bundle();
        let metadata = match std::fs::symlink_metadata(&installed) {
            Ok(m) => m,
            Err(_) => return Ok(false),
        };

        let result = if metadata.is_dir() {
            std::fs::remove_dir_all(&installed)
        } else {
            std::fs::remove_file(&installed)
        };

        match result {
            Ok(()) => {
                info!("Removed existing PolicyBanner at {}", installed.display());
                Ok(true)
            }
            Err(source) => {
                error!("Failed to remove {}: {}", installed.display(), source);
                Err(Error::Remove {
                    path: installed,
                    source,
                })
            }
        }
    }

    /// Copy the incoming bundle into place.
    pub fn install(&self, incoming: &Path) -> Result<usize> {
        let installed = self.config.installed_bundle();

        match copy_tree(incoming, &installed) {
            Ok(files) => {
                info!(
                    "Installed new PolicyBanner to {} ({} files)",
                    installed.display(),
                    files
                );
                Ok(files)
            }
            Err(source) => {
                error!(
                    "Failed to install PolicyBanner to {}: {}",
                    installed.display(),
                    source
                );
                Err(Error::Install {
                    path: installed,
                    source,
                })
            }
        }
    }

    /// Apply the bundle mode and owner to every object under the installed
    /// bundle. Modes first, then ownership; symlinks only get ownership.
    pub fn secure(&self) -> Result<usize> {
        let installed = self.config.installed_bundle();
        let owner = Owner::resolve(&self.config.owner_user, &self.config.owner_group)
            .inspect_err(|e| error!("{}", e))?;

        let mode = self.config.bundle_mode;
        let objects = self
            .apply_modes(&installed, mode)
            .and_then(|_| self.apply_owner(&installed, owner));

        match objects {
            Ok(count) => {
                info!(
                    "Set permissions {:o} and ownership {}:{} on {} ({} objects)",
                    mode,
                    self.config.owner_user,
                    self.config.owner_group,
                    installed.display(),
                    count
                );
                Ok(count)
            }
            Err((path, source)) => {
                error!(
                    "Failed to secure {} at {}: {}",
                    installed.display(),
                    path.display(),
                    source
                );
                Err(Error::Permissions { path, source })
            }
        }
    }

    fn apply_modes(&self, root: &Path, mode: u32) -> std::result::Result<(), (PathBuf, io::Error)> {
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| (root.to_path_buf(), io::Error::from(e)))?;
            if entry.file_type().is_symlink() {
                continue;
            }
            std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(mode))
                .map_err(|e| (entry.path().to_path_buf(), e))?;
        }
        Ok(())
    }

    fn apply_owner(
        &self,
        root: &Path,
        owner: Owner,
    ) -> std::result::Result<usize, (PathBuf, io::Error)> {
        let mut count = 0;
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| (root.to_path_buf(), io::Error::from(e)))?;
            std::os::unix::fs::lchown(entry.path(), Some(owner.uid), Some(owner.gid))
                .map_err(|e| (entry.path().to_path_buf(), e))?;
            count += 1;
        }
        Ok(count)
    }

    /// Run backup, remove, install and secure in order.
    pub fn deploy(&self, incoming: &Path, workspace: &Workspace) -> Result<InstallReport> {
        workspace.ensure_open()?;
        let backup = self.backup(workspace)?;
        // Past this point the live bundle is gone; finish install and secure
        // even if shutdown has started.
        workspace.ensure_open()?;
        self.remove()?;
        let files_installed = self.install(incoming)?;
        let objects_secured = self.secure()?;

        Ok(InstallReport {
            backup,
            installed_path: self.config.installed_bundle(),
            files_installed,
            objects_secured,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::validator::{compare_bundles, UpdateDecision};
    use crate::workspace::CleanupHook;
    use assert_fs::prelude::*;
    use nix::unistd::{getgid, getuid};
    use predicates::prelude::*;
    use std::os::unix::fs::MetadataExt;

    /// Names of the user and group running the tests, so ownership can be
    /// applied without root.
    pub(crate) fn current_owner_names() -> (String, String) {
        let user = User::from_uid(getuid()).unwrap().unwrap().name;
        let group = Group::from_gid(getgid()).unwrap().unwrap().name;
        (user, group)
    }

    struct Fixture {
        root: assert_fs::TempDir,
        config: DeployConfig,
        workspace: Workspace,
    }

    fn fixture() -> Fixture {
        let root = assert_fs::TempDir::new().unwrap();
        let (user, group) = current_owner_names();
        let config = DeployConfig::default()
            .with_staging_dir(root.child("staging").path())
            .with_install_dir(root.child("Library/Security").path())
            .with_owner(&user, &group);
        std::fs::create_dir_all(&config.install_dir).unwrap();
        let workspace = Workspace::create(&CleanupHook::new(&config.workspace_dir)).unwrap();
        Fixture {
            root,
            config,
            workspace,
        }
    }

    fn incoming(root: &assert_fs::TempDir) -> PathBuf {
        let dir = root.child("incoming/PolicyBanner.rtfd");
        dir.child("TXT.rtf").write_str("{\\rtf1 New banner}").unwrap();
        dir.child("logo.tiff").write_binary(&[9, 9, 9]).unwrap();
        dir.child("Resources/legal.txt").write_str("v2").unwrap();
        dir.path().to_path_buf()
    }

    fn assert_all_secured(path: &Path, config: &DeployConfig) {
        let owner = Owner::resolve(&config.owner_user, &config.owner_group).unwrap();
        for entry in WalkDir::new(path) {
            let entry = entry.unwrap();
            let meta = entry.metadata().unwrap();
            assert_eq!(meta.mode() & 0o777, 0o755, "{}", entry.path().display());
            assert_eq!(meta.uid(), owner.uid);
            assert_eq!(meta.gid(), owner.gid);
        }
    }

    #[test]
    fn test_fresh_install_copies_and_secures() {
        let f = fixture();
        let incoming = incoming(&f.root);

        let report = Installer::new(&f.config)
            .deploy(&incoming, &f.workspace)
            .unwrap();

        assert!(report.backup.is_none());
        assert_eq!(report.files_installed, 3);
        assert_eq!(
            compare_bundles(&incoming, &f.config.installed_bundle()).unwrap(),
            UpdateDecision::UpToDate
        );
        assert_all_secured(&f.config.installed_bundle(), &f.config);
    }

    #[test]
    fn test_backup_preserves_previous_bundle() {
        let f = fixture();
        let installed = f.config.installed_bundle();
        std::fs::create_dir_all(&installed).unwrap();
        std::fs::write(installed.join("TXT.rtf"), "{\\rtf1 Old banner}").unwrap();
        let pristine = f.root.child("pristine");
        copy_tree(&installed, pristine.path()).unwrap();

        let backup = Installer::new(&f.config)
            .backup(&f.workspace)
            .unwrap()
            .expect("backup taken");

        assert!(backup.starts_with(f.workspace.path()));
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("PolicyBanner.rtfd.backup_"));
        assert_eq!(
            compare_bundles(pristine.path(), &backup).unwrap(),
            UpdateDecision::UpToDate
        );

        let workspace_dir = f.config.workspace_dir.clone();
        f.workspace.destroy();
        assert!(predicate::path::missing().eval(&workspace_dir));
    }

    #[test]
    fn test_replace_leaves_no_stale_files() {
        let f = fixture();
        let installed = f.config.installed_bundle();
        std::fs::create_dir_all(&installed).unwrap();
        std::fs::write(installed.join("stale.rtf"), "old").unwrap();
        let incoming = incoming(&f.root);

        let report = Installer::new(&f.config)
            .deploy(&incoming, &f.workspace)
            .unwrap();

        assert!(report.backup.is_some());
        assert!(!installed.join("stale.rtf").exists());
        assert!(report.backup.unwrap().join("stale.rtf").exists());
    }

    #[test]
    fn test_install_failure_skips_secure() {
        let f = fixture();
        let incoming = incoming(&f.root);
        let _socket =
            std::os::unix::net::UnixListener::bind(incoming.join("banner.sock")).unwrap();

        let err = Installer::new(&f.config)
            .deploy(&incoming, &f.workspace)
            .unwrap_err();

        assert!(matches!(err, Error::Install { .. }));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_unknown_owner_is_mutation_error() {
        let f = fixture();
        let config = f.config.clone().with_owner("no-such-user-policybanner", "wheel");
        std::fs::create_dir_all(config.installed_bundle()).unwrap();

        let err = Installer::new(&config).secure().unwrap_err();
        assert!(matches!(err, Error::Ownership { .. }));
    }

    /// Root bypasses the mode bits these tests rely on.
    fn running_as_root() -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    fn install_previous(config: &DeployConfig) -> assert_fs::fixture::ChildPath {
        let installed = assert_fs::fixture::ChildPath::new(config.installed_bundle());
        installed.child("TXT.rtf").write_str("{\\rtf1 Old banner}").unwrap();
        installed
    }

    #[test]
    fn test_backup_failure_stops_before_remove() {
        let f = fixture();
        let incoming = incoming(&f.root);
        let installed = install_previous(&f.config);
        // A file where the backup directory belongs.
        std::fs::write(f.config.backup_dir(), b"in the way").unwrap();

        let err = Installer::new(&f.config)
            .deploy(&incoming, &f.workspace)
            .unwrap_err();

        match err {
            Error::Backup { ref path, .. } => assert_eq!(path, installed.path()),
            ref other => panic!("expected backup error, got {:?}", other),
        }
        assert_eq!(err.exit_code(), 3);
        installed.child("TXT.rtf").assert("{\\rtf1 Old banner}");
    }

    #[test]
    fn test_remove_failure_is_mutation_error() {
        if running_as_root() {
            return;
        }
        let f = fixture();
        let installed = install_previous(&f.config);
        let mode = |m| std::fs::Permissions::from_mode(m);
        std::fs::set_permissions(installed.path(), mode(0o555)).unwrap();

        let result = Installer::new(&f.config).remove();
        std::fs::set_permissions(installed.path(), mode(0o755)).unwrap();

        let err = result.unwrap_err();
        match err {
            Error::Remove { ref path, ref source } => {
                assert_eq!(path, installed.path());
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            ref other => panic!("expected remove error, got {:?}", other),
        }
        assert_eq!(err.exit_code(), 3);
        installed.child("TXT.rtf").assert("{\\rtf1 Old banner}");
    }

    #[test]
    fn test_secure_missing_bundle_is_permissions_error() {
        let f = fixture();

        let err = Installer::new(&f.config).secure().unwrap_err();

        match err {
            Error::Permissions { ref path, .. } => {
                assert_eq!(path, &f.config.installed_bundle())
            }
            ref other => panic!("expected permissions error, got {:?}", other),
        }
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_chown_without_privilege_is_permissions_error() {
        if running_as_root() {
            return;
        }
        let f = fixture();
        install_previous(&f.config);
        let root_user = User::from_uid(nix::unistd::Uid::from_raw(0))
            .unwrap()
            .unwrap()
            .name;
        let root_group = Group::from_gid(nix::unistd::Gid::from_raw(0))
            .unwrap()
            .unwrap()
            .name;
        let config = f.config.clone().with_owner(&root_user, &root_group);

        let err = Installer::new(&config).secure().unwrap_err();

        match err {
            Error::Permissions { ref path, ref source } => {
                assert!(path.starts_with(config.installed_bundle()));
                assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
            }
            ref other => panic!("expected permissions error, got {:?}", other),
        }
        // Modes were applied before ownership failed.
        let meta = std::fs::metadata(config.installed_bundle()).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o755);
    }

    #[test]
    fn test_deploy_after_shutdown_leaves_bundle_alone() {
        let f = fixture();
        let incoming = incoming(&f.root);
        let installed = install_previous(&f.config);
        let hook = CleanupHook::new(&f.config.workspace_dir);
        let workspace = Workspace::create(&hook).unwrap();
        hook.release();

        let err = Installer::new(&f.config)
            .deploy(&incoming, &workspace)
            .unwrap_err();

        assert!(matches!(err, Error::Workspace { .. }));
        installed.child("TXT.rtf").assert("{\\rtf1 Old banner}");
        assert!(!f.config.backup_dir().exists());
    }

    #[test]
    fn test_symlinks_are_recreated() {
        let root = assert_fs::TempDir::new().unwrap();
        let src = root.child("src");
        src.child("TXT.rtf").write_str("x").unwrap();
        std::os::unix::fs::symlink("TXT.rtf", src.child("alias.rtf").path()).unwrap();

        let dst = root.child("dst");
        assert_eq!(copy_tree(src.path(), dst.path()).unwrap(), 2);
        assert_eq!(
            std::fs::read_link(dst.child("alias.rtf").path()).unwrap(),
            PathBuf::from("TXT.rtf")
        );
    }

    #[test]
    fn test_backup_path_disambiguates_same_second() {
        let root = assert_fs::TempDir::new().unwrap();
        let now = Timestamp::now();
        let first = backup_path(root.path(), "PolicyBanner.rtfd", &now);
        std::fs::create_dir_all(&first).unwrap();
        let second = backup_path(root.path(), "PolicyBanner.rtfd", &now);

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1"));
    }
}
