//! Adapter for host-installed files and the optional host package.
//!
//! Images may carry an `exports/hostfs/` subtree of files to materialize
//! outside the container rootfs (wrapper scripts, drop-in configs).  Each
//! materialized file is tracked by a content checksum so a later upgrade
//! or uninstall only removes files the engine itself wrote.  The same
//! subtree can instead be wrapped into a host package; the engine treats
//! the package tooling as opaque.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use sha2::{Digest as _, Sha256};
use syscon_utils::Task;

use crate::template;

/// Checksum map: absolute host path -> hex content digest.  An empty
/// digest (from older deployments) matches any content.
pub type ChecksumMap = BTreeMap<String, String>;

/// A generated host package.
#[derive(Debug, Clone)]
pub struct GeneratedRpm {
    /// Package name, recorded in the deployment for uninstall.
    pub name: String,
    /// Path to the built package file.
    pub path: Utf8PathBuf,
}

/// Host-side install operations.
pub trait HostInstall: std::fmt::Debug {
    /// Build a host package wrapping the exports content.
    #[allow(clippy::too_many_arguments)]
    fn generate_rpm(
        &self,
        name: &str,
        image_id: &str,
        labels: &BTreeMap<String, String>,
        exports: &Utf8Path,
        destination: &Utf8Path,
        values: &BTreeMap<String, String>,
        templates: &[String],
        rename: &BTreeMap<String, String>,
        version: &str,
    ) -> Result<GeneratedRpm>;

    fn install_rpm(&self, path: &Utf8Path) -> Result<()>;

    fn uninstall_rpm(&self, name: &str) -> Result<()>;

    /// Reconcile host files: remove the files recorded in
    /// `prior_checksum` (when their content still matches), then
    /// materialize the current `exports/hostfs` subtree under `prefix`.
    /// With no `exports` this is a pure removal.  Returns the new
    /// checksum map.
    fn rm_add_files_to_host(
        &self,
        prior_checksum: Option<&ChecksumMap>,
        exports: Option<&Utf8Path>,
        prefix: &Utf8Path,
        templates: &[String],
        values: &BTreeMap<String, String>,
        rename: &BTreeMap<String, String>,
    ) -> Result<ChecksumMap>;
}

/// Whether the exports tree asks for a host package.
pub(crate) fn wants_rpm(exports: &Utf8Path) -> bool {
    if Utf8Path::new("/run/ostree-booted").exists() {
        return false;
    }
    ["rpm.spec", "rpm.spec.template", "hostfs"]
        .iter()
        .any(|p| exports.join(p).exists())
}

fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The shipped implementation, backed by plain files and the rpm tooling.
#[derive(Debug, Default)]
pub struct RpmHostInstall;

impl RpmHostInstall {
    fn collect_hostfs(
        hostfs: &Utf8Path,
        dir: &Utf8Path,
        out: &mut Vec<Utf8PathBuf>,
    ) -> Result<()> {
        for entry in dir.read_dir_utf8()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                Self::collect_hostfs(hostfs, entry.path(), out)?;
            } else {
                let rel = entry
                    .path()
                    .strip_prefix(hostfs)
                    .map_err(|_| anyhow!("{} escapes {hostfs}", entry.path()))?;
                out.push(rel.to_owned());
            }
        }
        Ok(())
    }

    /// Materialize `exports/hostfs` under `prefix`, rendering files listed
    /// in `templates` and applying the basename `rename` map.
    fn add_files(
        exports: &Utf8Path,
        prefix: &Utf8Path,
        templates: &[String],
        values: &BTreeMap<String, String>,
        rename: &BTreeMap<String, String>,
    ) -> Result<ChecksumMap> {
        let mut new = ChecksumMap::new();
        let hostfs = exports.join("hostfs");
        if !hostfs.exists() {
            return Ok(new);
        }
        let mut files = Vec::new();
        Self::collect_hostfs(&hostfs, &hostfs, &mut files)?;
        for rel in files {
            let host_rel = format!("/{rel}");
            let src = hostfs.join(&rel);
            let is_template = templates
                .iter()
                .any(|t| t.trim_start_matches('/') == rel.as_str());
            let content = if is_template {
                let raw = std::fs::read_to_string(&src)
                    .with_context(|| format!("Reading template {src}"))?;
                template::substitute(&raw, values)
                    .with_context(|| format!("Rendering {host_rel}"))?
                    .into_bytes()
            } else {
                std::fs::read(&src)?
            };
            let mut dest_rel = Utf8PathBuf::from(rel.clone());
            if let Some(file_name) = dest_rel.file_name() {
                if let Some(renamed) = rename.get(file_name) {
                    dest_rel.set_file_name(renamed);
                }
            }
            let dest = prefix.join(&dest_rel);
            std::fs::create_dir_all(dest.parent().unwrap())?;
            std::fs::write(&dest, &content).with_context(|| format!("Writing {dest}"))?;
            // Preserve the execute bit from the exports tree.
            let mode = std::fs::metadata(&src)?.permissions();
            std::fs::set_permissions(&dest, mode)?;
            new.insert(format!("/{dest_rel}"), checksum(&content));
        }
        Ok(new)
    }

    fn remove_files(prior: &ChecksumMap, prefix: &Utf8Path) -> Result<()> {
        for (path, recorded) in prior {
            let host_path = prefix.join(path.trim_start_matches('/'));
            let current = match std::fs::read(&host_path) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("Reading {host_path}")),
            };
            if !recorded.is_empty() && checksum(&current) != *recorded {
                tracing::warn!("Not removing locally modified file {host_path}");
                continue;
            }
            std::fs::remove_file(&host_path)
                .with_context(|| format!("Removing {host_path}"))?;
        }
        Ok(())
    }
}

impl HostInstall for RpmHostInstall {
    #[context("Generating host package for {name}")]
    fn generate_rpm(
        &self,
        name: &str,
        image_id: &str,
        labels: &BTreeMap<String, String>,
        exports: &Utf8Path,
        destination: &Utf8Path,
        values: &BTreeMap<String, String>,
        templates: &[String],
        rename: &BTreeMap<String, String>,
        version: &str,
    ) -> Result<GeneratedRpm> {
        let package = format!("syscon-container-{name}");
        let build = tempfile::tempdir()?;
        let build = Utf8Path::from_path(build.path())
            .ok_or_else(|| anyhow!("Non-UTF-8 temporary path"))?;
        let buildroot = build.join("buildroot");
        let installed = Self::add_files(exports, &buildroot, templates, values, rename)?;

        let spec_path = build.join(format!("{package}.spec"));
        let spec = match (
            exports.join("rpm.spec").exists(),
            exports.join("rpm.spec.template").exists(),
        ) {
            (true, _) => std::fs::read_to_string(exports.join("rpm.spec"))?,
            (false, true) => {
                let raw = std::fs::read_to_string(exports.join("rpm.spec.template"))?;
                template::substitute(&raw, values)?
            }
            _ => {
                let summary = labels
                    .get("summary")
                    .cloned()
                    .unwrap_or_else(|| format!("System container {name}"));
                let files = installed
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("\n");
                format!(
                    "Name: {package}\nVersion: {version}\nRelease: 1\nSummary: {summary}\n\
                     License: Unspecified\nProvides: syscon-container = {image_id}\n\
                     %description\n{summary}\n%files\n{files}\n"
                )
            }
        };
        std::fs::write(&spec_path, spec)?;

        let topdir = format!("_topdir {build}");
        Task::new(format!("Building host package {package}"), "rpmbuild")
            .quiet_output()
            .args([
                "-bb",
                "--define",
                topdir.as_str(),
                "--buildroot",
                buildroot.as_str(),
                spec_path.as_str(),
            ])
            .run()?;

        let mut built = None;
        for entry in walk_files(&build.join("RPMS"))? {
            if entry.extension() == Some("rpm") {
                built = Some(entry);
                break;
            }
        }
        let built = built.ok_or_else(|| anyhow!("rpmbuild produced no package"))?;
        let file_name = built
            .file_name()
            .ok_or_else(|| anyhow!("Unexpected package path {built}"))?;
        let dest = destination.join(file_name);
        std::fs::rename(&built, &dest).or_else(|_| {
            std::fs::copy(&built, &dest).map(|_| ())
        })?;
        Ok(GeneratedRpm {
            name: package,
            path: dest,
        })
    }

    fn install_rpm(&self, path: &Utf8Path) -> Result<()> {
        Task::new(format!("Installing {path}"), "rpm")
            .args(["-Uvh", path.as_str()])
            .run()
    }

    fn uninstall_rpm(&self, name: &str) -> Result<()> {
        Task::new(format!("Uninstalling {name}"), "rpm")
            .args(["-e", name])
            .run()
    }

    fn rm_add_files_to_host(
        &self,
        prior_checksum: Option<&ChecksumMap>,
        exports: Option<&Utf8Path>,
        prefix: &Utf8Path,
        templates: &[String],
        values: &BTreeMap<String, String>,
        rename: &BTreeMap<String, String>,
    ) -> Result<ChecksumMap> {
        if let Some(prior) = prior_checksum {
            Self::remove_files(prior, prefix)?;
        }
        let Some(exports) = exports else {
            return Ok(ChecksumMap::new());
        };
        if !exports.exists() {
            return Ok(ChecksumMap::new());
        }
        Self::add_files(exports, prefix, templates, values, rename)
    }
}

fn walk_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.extend(walk_files(entry.path())?);
        } else {
            out.push(entry.path().to_owned());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_add_then_remove() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let exports = root.join("exports");
        std::fs::create_dir_all(exports.join("hostfs/usr/local/bin")).unwrap();
        std::fs::write(
            exports.join("hostfs/usr/local/bin/app-wrapper.sh"),
            "exec $RUNTIME run '$NAME'\n",
        )
        .unwrap();
        std::fs::write(exports.join("hostfs/usr/local/bin/static.txt"), "$NAME untouched").unwrap();
        let prefix = root.join("host");

        let host = RpmHostInstall;
        let templates = vec!["/usr/local/bin/app-wrapper.sh".to_string()];
        let vals = values(&[("NAME", "app"), ("RUNTIME", "/usr/bin/runc")]);
        let new = host
            .rm_add_files_to_host(None, Some(&exports), &prefix, &templates, &vals, &BTreeMap::new())
            .unwrap();

        assert_eq!(new.len(), 2);
        let wrapper = prefix.join("usr/local/bin/app-wrapper.sh");
        assert_eq!(
            std::fs::read_to_string(&wrapper).unwrap(),
            "exec /usr/bin/runc run 'app'\n"
        );
        // Non-template content is copied verbatim
        assert_eq!(
            std::fs::read_to_string(prefix.join("usr/local/bin/static.txt")).unwrap(),
            "$NAME untouched"
        );

        // Locally modified files survive removal; pristine ones go away.
        std::fs::write(&wrapper, "local change").unwrap();
        let empty = host
            .rm_add_files_to_host(Some(&new), None, &prefix, &[], &vals, &BTreeMap::new())
            .unwrap();
        assert!(empty.is_empty());
        assert!(wrapper.exists());
        assert!(!prefix.join("usr/local/bin/static.txt").exists());
    }

    #[test]
    fn test_rename() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let exports = root.join("exports");
        std::fs::create_dir_all(exports.join("hostfs/etc")).unwrap();
        std::fs::write(exports.join("hostfs/etc/app.conf.in"), "x=1").unwrap();
        let prefix = root.join("host");

        let rename = BTreeMap::from([("app.conf.in".to_string(), "app.conf".to_string())]);
        let new = RpmHostInstall
            .rm_add_files_to_host(
                None,
                Some(&exports),
                &prefix,
                &[],
                &BTreeMap::new(),
                &rename,
            )
            .unwrap();
        assert!(new.contains_key("/etc/app.conf"));
        assert!(prefix.join("etc/app.conf").exists());
    }
}
