//! Engine configuration.
//!
//! All process-global inputs (environment overrides, the home directory,
//! user vs system mode) are captured here exactly once, when the record is
//! constructed; no other module reads the environment.

use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// System-wide checkout root.
const CHECKOUT_PATH: &str = "/var/lib/containers/syscon";
/// Default libexec directory carrying helper binaries.
const LIBEXEC_DIR: &str = "/usr/libexec/syscon";
/// System-wide systemd unit and tmpfiles destinations.
const UNIT_DIR: &str = "/etc/systemd/system";
const TMPFILES_DIR: &str = "/etc/tmpfiles.d";

/// Immutable configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Operate on the per-user store and session service manager.
    pub user: bool,
    /// The invoking user's home directory.
    pub home: Utf8PathBuf,
    /// Root directory holding the per-name deployments.
    pub checkout_path: Utf8PathBuf,
    /// Explicit repository location, overriding discovery.
    pub repo_override: Option<Utf8PathBuf>,
    /// Directory with helper executables (the tar digest helper).
    pub libexec_dir: Utf8PathBuf,
    /// Where rendered service units are installed.
    pub unit_dir: Utf8PathBuf,
    /// Where rendered tmpfiles fragments are installed.
    pub tmpfiles_dir: Utf8PathBuf,
    /// Base for runtime state (`RUN_DIRECTORY` template default).
    pub runtime_dir: Utf8PathBuf,
    /// Alternative root for host installs (image-build style staging).
    pub prefix: Option<Utf8PathBuf>,
    /// OCI runtime override from the invocation.
    pub runtime: Option<String>,
    /// Test-only override for the computed image id.
    pub test_image_id: Option<String>,
}

impl Config {
    /// Build the configuration for this invocation, reading the
    /// environment overrides once.
    pub fn new(user: bool) -> Result<Self> {
        let home: Utf8PathBuf = std::env::var("HOME").unwrap_or_else(|_| "/root".into()).into();
        let checkout_path = match std::env::var("ATOMIC_OSTREE_CHECKOUT_PATH") {
            Ok(p) => p.into(),
            Err(_) if user => home.join(".containers/syscon"),
            Err(_) => CHECKOUT_PATH.into(),
        };
        let repo_override = std::env::var("ATOMIC_OSTREE_REPO").ok().map(Into::into);
        let libexec_dir = std::env::var("ATOMIC_LIBEXEC")
            .map(Into::into)
            .unwrap_or_else(|_| LIBEXEC_DIR.into());
        let (unit_dir, tmpfiles_dir) = if user {
            (
                home.join(".config/systemd/user"),
                home.join(".containers/tmpfiles"),
            )
        } else {
            (UNIT_DIR.into(), TMPFILES_DIR.into())
        };
        let runtime_dir = if user {
            std::env::var("XDG_RUNTIME_DIR")
                .map(Into::into)
                .unwrap_or_else(|_| {
                    format!("/run/user/{}", rustix::process::getuid().as_raw()).into()
                })
        } else {
            "/run".into()
        };
        Ok(Self {
            user,
            home,
            checkout_path,
            repo_override,
            libexec_dir,
            unit_dir,
            tmpfiles_dir,
            runtime_dir,
            prefix: None,
            runtime: None,
            test_image_id: std::env::var("ATOMIC_OSTREE_TEST_FORCE_IMAGE_ID").ok(),
        })
    }

    /// Root for materialized overlay layers, shared with the repository
    /// filesystem so checkouts can hard-link.
    pub fn storage_path(&self) -> Utf8PathBuf {
        self.checkout_path.join(".storage")
    }

    /// Host destinations for the rendered unit and tmpfiles files.
    pub fn systemd_destination_files(&self, name: &str) -> (Utf8PathBuf, Utf8PathBuf) {
        if let Some(prefix) = &self.prefix {
            return (
                prefix.join(format!("usr/lib/systemd/system/{name}.service")),
                prefix.join(format!("usr/lib/tmpfiles.d/{name}.conf")),
            );
        }
        (
            self.unit_dir.join(format!("{name}.service")),
            self.tmpfiles_dir.join(format!("{name}.conf")),
        )
    }

    /// Locate the object repository for this configuration.
    ///
    /// User mode pins `~/.containers/repo`.  System mode prefers
    /// `/ostree/repo` when it exists on the same filesystem as the
    /// storage root (hard-link checkouts require that), and otherwise
    /// keeps the repository under the storage path.
    #[context("Finding repository location")]
    pub fn find_repo_location(&self) -> Result<Utf8PathBuf> {
        if let Some(p) = &self.repo_override {
            return Ok(p.clone());
        }
        if self.user {
            return Ok(self.home.join(".containers/repo"));
        }
        let storage = self.storage_path();
        if Utf8Path::new("/ostree/repo/config").exists()
            && same_filesystem("/ostree/repo".into(), &storage)?
        {
            return Ok("/ostree/repo".into());
        }
        Ok(storage.join("ostree"))
    }
}

/// Whether `repo` and `destdir` share a filesystem; `destdir` is created
/// if missing.  A device-number match can lie across bind mounts, so an
/// actual hard link is attempted to confirm.
fn same_filesystem(repo: &Utf8Path, destdir: &Utf8Path) -> Result<bool> {
    std::fs::create_dir_all(destdir)
        .with_context(|| format!("Creating {destdir}"))?;
    let repo_meta = std::fs::metadata(repo)?;
    let dest_meta = std::fs::metadata(destdir)?;
    if repo_meta.dev() != dest_meta.dev() {
        return Ok(false);
    }
    let src = repo.join("config");
    let probe = destdir.join(format!("samefs-check-{}", rustix::process::getpid().as_raw_nonzero()));
    let r = std::fs::hard_link(&src, &probe);
    let _ = std::fs::remove_file(&probe);
    match r {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(rustix::io::Errno::XDEV.raw_os_error()) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &Utf8Path) -> Config {
        Config {
            user: false,
            home: root.join("home"),
            checkout_path: root.join("checkouts"),
            repo_override: None,
            libexec_dir: root.join("libexec"),
            unit_dir: root.join("units"),
            tmpfiles_dir: root.join("tmpfiles.d"),
            runtime_dir: "/run".into(),
            prefix: None,
            runtime: None,
            test_image_id: None,
        }
    }

    #[test]
    fn test_destinations() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let mut c = test_config(root);
        let (unit, tmpfiles) = c.systemd_destination_files("app");
        assert_eq!(unit, root.join("units/app.service"));
        assert_eq!(tmpfiles, root.join("tmpfiles.d/app.conf"));
        c.prefix = Some(root.join("stage"));
        let (unit, _) = c.systemd_destination_files("app");
        assert_eq!(unit, root.join("stage/usr/lib/systemd/system/app.service"));
    }

    #[test]
    fn test_same_filesystem() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let repo = root.join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("config"), "x").unwrap();
        assert!(same_filesystem(&repo, &root.join("dest")).unwrap());
    }
}
