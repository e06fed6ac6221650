//! Deployment management: install, two-slot upgrade, rollback, uninstall,
//! state queries and listings.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::checkout::{swap_symlink, CheckoutOpts, InfoRecord, SystemPackage};
use crate::engine::Engine;
use crate::hostinstall::ChecksumMap;
use crate::store;
use crate::template::{self, Values};

/// Options for an install, mostly forwarded to the checkout.
#[derive(Debug, Default)]
pub struct InstallOpts {
    /// `KEY=VALUE` template assignments.
    pub set: Vec<String>,
    pub system_package: SystemPackage,
    /// Pre-existing rootfs to deploy against.
    pub rootfs: Option<Utf8PathBuf>,
    /// OCI runtime override.
    pub runtime: Option<String>,
}

/// One row of the container listing.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub image: String,
    pub revision: String,
    pub created: i64,
    pub command: String,
    pub runtime: String,
}

/// Variables referenced by an image's templates.
#[derive(Debug, Default)]
pub struct TemplateVariables {
    /// Variables the user may set, with the image's default if any.
    pub settable: BTreeMap<String, Option<String>>,
    /// Variables the engine always provides.
    pub reserved: Vec<String>,
}

pub(crate) fn split_set_args(setvalues: &[String]) -> Result<Values> {
    let mut values = Values::new();
    for pair in setvalues {
        let (k, v) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid value for --set: {pair}"))?;
        values.insert(k.to_string(), v.to_string());
    }
    Ok(values)
}

/// Derive a container name from an image reference (`name`, minus
/// registry, path and tag).
pub fn default_system_name(image: &str) -> String {
    let image = image
        .rsplit_once('/')
        .map(|(_, rest)| rest)
        .unwrap_or(image);
    image
        .rsplit_once(':')
        .map(|(name, _)| name)
        .unwrap_or(image)
        .to_string()
}

impl Engine {
    /// The active deployment directory for `name`, if installed.
    pub fn get_checkout(&self, name: &str) -> Option<Utf8PathBuf> {
        let path = self.config.checkout_path.join(name);
        path.symlink_metadata().is_ok().then_some(path)
    }

    fn active_slot(&self, name: &str) -> Result<Utf8PathBuf> {
        let path = self.config.checkout_path.join(name);
        Ok(path.canonicalize_utf8().with_context(|| format!("Reading deployment {name}"))?)
    }

    /// Install `image` under `name`.  Images labelled `atomic.run=once`
    /// are executed once from an overlay mount instead of deployed.
    #[context("Installing {image}")]
    pub async fn install(&self, image: &str, name: &str, opts: InstallOpts) -> Result<()> {
        let runtime = self.oci_runtime(opts.runtime.as_deref());
        runtime.check_available()?;

        let run_once = !image.starts_with("dockertar:/")
            && !(image.starts_with("docker:") && image.matches(':').count() > 1)
            && self.image_label(image, "atomic.run")?.as_deref() == Some("once");
        if run_once {
            let values = split_set_args(&opts.set)?;
            return self.run_once(image, name, values, opts.runtime.as_deref());
        }

        if self.get_checkout(name).is_some() {
            bail!("{name} is already installed");
        }

        let image = self.pull_image(image, false).await?;
        let mut system_package = opts.system_package;
        if system_package == SystemPackage::Auto && self.config.user {
            system_package = SystemPackage::Absent;
        }
        if system_package == SystemPackage::Build && self.config.user {
            bail!("Only system mode can generate rpms");
        }
        let values = split_set_args(&opts.set)?;
        if system_package == SystemPackage::Build {
            let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;
            let rpm = self.build_rpm_to(name, &image, values, &cwd)?;
            println!("Generated rpm {rpm}");
            return Ok(());
        }
        self.checkout(
            name,
            &image,
            0,
            false,
            CheckoutOpts {
                values,
                remote: opts.rootfs,
                system_package,
                runtime: opts.runtime,
                ..Default::default()
            },
        )
    }

    fn image_label(&self, image: &str, label: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let resolved =
            store::resolve_image(repo, image, true, self.config.test_image_id.as_deref())?;
        let Some((branch, _)) = resolved.first() else {
            return Ok(None);
        };
        let info = store::inspect_branch(repo, branch, self.config.test_image_id.as_deref())?;
        Ok(info.labels.get(label).cloned())
    }

    /// Upgrade `name` to the latest imported version of its image (or
    /// `rebase` onto a different image).  Values from the active
    /// deployment carry over unless overridden; when neither the image id
    /// nor the values changed this is a no-op.
    #[context("Updating {name}")]
    pub fn update(&self, name: &str, setvalues: &[String], rebase: Option<&str>) -> Result<()> {
        let active = self.active_slot(name)?;
        let info = InfoRecord::load(&active)?;
        if info.remote.is_some() {
            println!("Updating a container with a remote rootfs. Only changes to config will be applied.");
        }
        let next_deployment = if active.as_str().ends_with(".0") { 1 } else { 0 };

        let image = rebase.map(String::from).unwrap_or_else(|| info.image.clone());
        let mut values = info.values.clone();
        let installed_files_checksum = if info.installed_files_checksum.is_empty() {
            info.installed_files
                .iter()
                .map(|f| (f.clone(), String::new()))
                .collect::<ChecksumMap>()
        } else {
            info.installed_files_checksum.clone()
        };

        // Only re-deploy when something actually changed.
        let mut revision_changed = true;
        if !info.revision.is_empty() {
            let repo = self.repo()?;
            let resolved =
                store::resolve_image(repo, &image, true, self.config.test_image_id.as_deref())?;
            if let Some((branch, _)) = resolved.first() {
                let inspect =
                    store::inspect_branch(repo, branch, self.config.test_image_id.as_deref())?;
                if inspect.image_id == info.revision {
                    revision_changed = false;
                }
            }
        }
        let mut values_changed = false;
        for (k, v) in split_set_args(setvalues)? {
            if values.get(&k) != Some(&v) {
                values_changed = true;
            }
            values.insert(k, v);
        }
        if !revision_changed && !values_changed {
            println!("Latest version already installed.");
            return Ok(());
        }

        let system_package = match info.system_package.parse() {
            Ok(sp) => sp,
            Err(_) if info.rpm_installed.is_some() => SystemPackage::Yes,
            Err(_) => SystemPackage::No,
        };
        self.checkout(
            name,
            &image,
            next_deployment,
            true,
            CheckoutOpts {
                values,
                remote: info.remote.as_deref().map(Utf8PathBuf::from),
                installed_files_checksum: Some(installed_files_checksum),
                system_package,
                runtime: Some(info.runtime.clone()).filter(|r| !r.is_empty()),
                ..Default::default()
            },
        )
    }

    /// Switch `name` back to its other deployment slot.
    #[context("Rolling back {name}")]
    pub fn rollback(&self, name: &str) -> Result<()> {
        let path = self.config.checkout_path.join(name);
        let active = self.active_slot(name)?;
        let other = if active.as_str().ends_with(".0") { 1 } else { 0 };
        let destination = self.config.checkout_path.join(format!("{name}.{other}"));
        if !destination.exists() {
            bail!("Cannot find a previous deployment to rollback located at {destination}");
        }

        let current_info = InfoRecord::load(&active)?;
        let was_service_active =
            current_info.has_container_service && self.svc.is_active(name);
        let (unitfileout, tmpfilesout) = self.config.systemd_destination_files(name);
        let unitfile = destination.join(format!("{name}.service"));
        let tmpfiles = destination.join(format!("tmpfiles-{name}.conf"));
        if !unitfile.exists() {
            bail!(
                "Cannot find the systemd service file for the previous version. \
                 The checkout at {destination} may be corrupted"
            );
        }

        println!("Rolling back container {name} to the checkout at {destination}");

        if was_service_active {
            self.svc.stop(name)?;
        }
        if tmpfilesout.exists() {
            if let Err(e) = self.svc.tmpfiles_remove(&tmpfilesout) {
                tracing::warn!("Removing tmpfiles: {e:#}");
            }
            std::fs::remove_file(&tmpfilesout)?;
        }
        if unitfileout.exists() {
            std::fs::remove_file(&unitfileout)?;
        }
        std::fs::copy(&unitfile, &unitfileout)?;
        if tmpfiles.exists() {
            std::fs::copy(&tmpfiles, &tmpfilesout)?;
        }

        // Remove this deployment's host files, re-apply the other slot's.
        let target_info = InfoRecord::load(&destination)?;
        let checksum = if current_info.installed_files_checksum.is_empty() {
            current_info
                .installed_files
                .iter()
                .map(|f| (f.clone(), String::new()))
                .collect::<ChecksumMap>()
        } else {
            current_info.installed_files_checksum.clone()
        };
        let host_prefix = self
            .config
            .prefix
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("/"));
        let templates = if target_info.rpm_installed.is_none() {
            target_info.installed_files_template.clone()
        } else {
            Vec::new()
        };
        self.host.rm_add_files_to_host(
            Some(&checksum),
            Some(&destination.join("rootfs/exports")),
            &host_prefix,
            &templates,
            &target_info.values,
            &target_info.rename_installed_files,
        )?;

        swap_symlink(&destination, &path)?;

        if let Some(rpm) = &target_info.rpm_installed {
            if let Some(rpm_file) = find_rpm_file(&destination)? {
                self.host.install_rpm(&rpm_file)?;
            } else {
                tracing::warn!("No package file found in {destination} for {rpm}");
            }
        }

        if target_info.has_container_service {
            self.svc.daemon_reload()?;
        }
        if tmpfiles.exists() {
            self.svc.tmpfiles_create(&tmpfilesout)?;
        }
        if was_service_active {
            self.svc.start(name)?;
        }
        Ok(())
    }

    /// Remove `name` entirely: unit, tmpfiles, host files, host package,
    /// the symlink and both deployment slots.
    #[context("Uninstalling {name}")]
    pub fn uninstall(&self, name: &str) -> Result<()> {
        let path = self.config.checkout_path.join(name);
        if path.symlink_metadata().is_err() {
            return Ok(());
        }
        let info = InfoRecord::load(&path)?;
        let (unitfileout, tmpfilesout) = self.config.systemd_destination_files(name);

        if info.has_container_service {
            if let Err(e) = self.svc.disable(name) {
                tracing::warn!("Disabling {name}: {e:#}");
            }
        }
        // Make sure the unit cannot be started again before anything else
        // is deleted.
        if unitfileout.exists() {
            std::fs::remove_file(&unitfileout)?;
        }
        if let Err(e) = self.svc.daemon_reload() {
            tracing::warn!("Reloading supervisor: {e:#}");
        }
        if tmpfilesout.exists() {
            if let Err(e) = self.svc.tmpfiles_remove(&tmpfilesout) {
                tracing::warn!("Removing tmpfiles: {e:#}");
            }
            std::fs::remove_file(&tmpfilesout)?;
        }

        let checksum = if info.installed_files_checksum.is_empty() {
            info.installed_files
                .iter()
                .map(|f| (f.clone(), String::new()))
                .collect::<ChecksumMap>()
        } else {
            info.installed_files_checksum.clone()
        };
        if !checksum.is_empty() {
            let host_prefix = self
                .config
                .prefix
                .clone()
                .unwrap_or_else(|| Utf8PathBuf::from("/"));
            self.host.rm_add_files_to_host(
                Some(&checksum),
                None,
                &host_prefix,
                &[],
                &Values::new(),
                &BTreeMap::new(),
            )?;
        }
        if let Some(rpm) = &info.rpm_installed {
            if let Err(e) = self.host.uninstall_rpm(rpm) {
                tracing::warn!("Uninstalling {rpm}: {e:#}");
            }
        }

        // Failures up to the symlink removal leave the uninstall
        // repeatable; past it, pruning collects whatever remains.
        std::fs::remove_file(&path)?;
        for slot in 0..2 {
            let deploy_path = self.config.checkout_path.join(format!("{name}.{slot}"));
            if deploy_path.exists() {
                std::fs::remove_dir_all(&deploy_path)?;
            }
        }
        Ok(())
    }

    /// Service state for a deployment: `no service`, `running`, `failed`
    /// or `inactive`.
    pub fn container_state(&self, name: &str) -> Result<String> {
        let path = self
            .get_checkout(name)
            .ok_or_else(|| anyhow!("No such container {name}"))?;
        let info = InfoRecord::load(&path)?;
        let state = if !info.has_container_service {
            "no service"
        } else if self.svc.is_failed(name) {
            "failed"
        } else if self.svc.is_active(name) {
            "running"
        } else {
            "inactive"
        };
        Ok(state.to_string())
    }

    /// Enumerate installed deployments.
    pub fn containers(&self) -> Result<Vec<ContainerInfo>> {
        let checkouts = &self.config.checkout_path;
        let mut out = Vec::new();
        if !checkouts.exists() {
            return Ok(out);
        }
        let mut names: Vec<String> = Vec::new();
        for entry in checkouts.read_dir_utf8()? {
            let entry = entry?;
            let name = entry.file_name();
            if name.starts_with('.') || name.ends_with(".0") || name.ends_with(".1") {
                continue;
            }
            names.push(name.to_string());
        }
        names.sort();
        for name in names {
            let path = checkouts.join(&name);
            if !path.exists() {
                // Dangling symlink
                continue;
            }
            let info = InfoRecord::load(&path)?;
            let mut command = String::new();
            let config_json = path.join("config.json");
            if config_json.exists() {
                let raw = std::fs::read_to_string(&config_json)?;
                if let Ok(config) = serde_json::from_str::<serde_json::Value>(&raw) {
                    if let Some(args) = config.pointer("/process/args").and_then(|v| v.as_array())
                    {
                        command = args
                            .iter()
                            .filter_map(|a| a.as_str())
                            .collect::<Vec<_>>()
                            .join(" ");
                    }
                }
            }
            out.push(ContainerInfo {
                name: name.clone(),
                image: info.image,
                revision: info.revision,
                created: info.created,
                command,
                runtime: info.runtime,
            });
        }
        Ok(out)
    }

    /// Enumerate imported images.
    pub fn images(&self, get_all: bool) -> Result<Vec<store::ImageInfo>> {
        store::list_images(self.repo()?, get_all, self.config.test_image_id.as_deref())
    }

    /// Whether `img` resolves locally.
    pub fn has_image(&self, img: &str) -> Result<bool> {
        Ok(!store::resolve_image(self.repo()?, img, true, self.config.test_image_id.as_deref())?
            .is_empty())
    }

    /// Drop the branch for `img`; the objects go away on the next prune.
    pub fn delete_image(&self, img: &str) -> Result<()> {
        let repo = self.repo()?;
        let resolved =
            store::resolve_image(repo, img, true, self.config.test_image_id.as_deref())?;
        for (branch, _) in resolved {
            repo.set_ref(&branch, None)?;
        }
        Ok(())
    }

    /// Collect the variables referenced by an image's templates, split
    /// into user-settable ones (with their defaults) and the reserved set
    /// the engine always provides.
    pub fn template_variables(&self, img: &str) -> Result<TemplateVariables> {
        let repo = self.repo()?;
        let scratch = repo.tempdir()?;
        let scratch = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| anyhow!("Non-UTF-8 temporary path"))?;
        let rootfs = scratch.join("rootfs");
        self.extract(img, &rootfs)?;
        let exports = rootfs.join("exports");

        let mut referenced = std::collections::BTreeSet::new();
        for template in [
            "service.template",
            "config.json.template",
            "tmpfiles.template",
        ] {
            let path = exports.join(template);
            if path.exists() {
                referenced.extend(template::variables(&std::fs::read_to_string(&path)?));
            }
        }

        let mut defaults = Values::new();
        let manifest_file = exports.join("manifest.json");
        if manifest_file.exists() {
            let raw = std::fs::read_to_string(&manifest_file)?;
            let manifest: serde_json::Value =
                serde_json::from_str(&raw).context("Invalid manifest.json file in image")?;
            if let Some(d) = manifest.get("defaultValues").and_then(|v| v.as_object()) {
                for (k, v) in d {
                    if let Some(v) = v.as_str() {
                        defaults.insert(k.clone(), v.to_string());
                    }
                }
            }
        }

        let mut vars = TemplateVariables::default();
        for name in referenced {
            if crate::checkout::TEMPLATE_FORCED_VARIABLES.contains(&name.as_str()) {
                vars.reserved.push(name);
            } else {
                let default = defaults.get(&name).cloned().or_else(|| {
                    crate::checkout::TEMPLATE_OVERRIDABLE_VARIABLES
                        .contains(&name.as_str())
                        .then(String::new)
                });
                vars.settable.insert(name, default);
            }
        }
        Ok(vars)
    }

    /// Build a host package from an image without deploying it.
    pub fn build_rpm_to(
        &self,
        name: &str,
        image: &str,
        values: Values,
        destination: &Utf8Path,
    ) -> Result<Utf8PathBuf> {
        let staging = tempfile::tempdir()?;
        let staging = Utf8Path::from_path(staging.path())
            .ok_or_else(|| anyhow!("Non-UTF-8 temporary path"))?;
        let rpm_content = staging.join("rpmroot");
        let rootfs = rpm_content.join("usr/lib/containers/syscon").join(name);
        std::fs::create_dir_all(&rootfs)?;

        // Stage a prefixed checkout, then wrap it into a package.
        let mut staged_config = self.config.clone();
        staged_config.prefix = Some(rpm_content.clone());
        let staged = Engine::with_adapters(
            staged_config,
            Box::new(crate::systemd::Systemctl::new(self.config.user)),
            Box::new(crate::hostinstall::RpmHostInstall),
        );
        staged.checkout(
            name,
            image,
            0,
            false,
            CheckoutOpts {
                values,
                destination: Some(rootfs.clone()),
                system_package: SystemPackage::Absent,
                ..Default::default()
            },
        )?;

        let info = InfoRecord::load(&rootfs)?;
        let repo = self.repo()?;
        let resolved =
            store::resolve_image(repo, image, false, self.config.test_image_id.as_deref())?;
        let (branch, _) = resolved
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Image {image} not found"))?;
        let img_info = store::inspect_branch(repo, &branch, self.config.test_image_id.as_deref())?;
        let labels: BTreeMap<String, String> = img_info
            .labels
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()))
            .collect();
        let generated = self.host.generate_rpm(
            name,
            &img_info.image_id,
            &labels,
            &rootfs.join("rootfs/exports"),
            destination,
            &info.values,
            &info.installed_files_template,
            &info.rename_installed_files,
            "0",
        )?;
        Ok(generated.path)
    }

    /// Run an `atomic.run=once` image: overlay-mount (or extract) the
    /// rootfs, render config and tmpfiles, run the container, then tear
    /// everything down.
    #[context("Running {image} once")]
    pub(crate) fn run_once(
        &self,
        image: &str,
        name: &str,
        values: Values,
        runtime_override: Option<&str>,
    ) -> Result<()> {
        let repo = self.repo()?;
        let base_dir = repo.path().join("tmp").join(format!(
            "syscon-container-{}",
            rustix::process::getpid().as_raw_nonzero()
        ));
        let rootfs = base_dir.join("rootfs");
        std::fs::create_dir_all(&rootfs)?;

        let mut tmpfiles_destination = None;
        let mut mounted_from_storage = false;
        let result = (|| -> Result<()> {
            let upperdir = base_dir.join("upperdir");
            let workdir = base_dir.join("workdir");
            std::fs::create_dir_all(&upperdir)?;
            std::fs::create_dir_all(&workdir)?;
            match self.mount_from_storage(image, &rootfs, Some(&upperdir), Some(&workdir)) {
                Ok(()) => mounted_from_storage = true,
                Err(_) => {
                    // No overlay support; fall back to a full extraction.
                    self.extract(image, &rootfs)?;
                }
            }

            let resolved =
                store::resolve_image(repo, image, false, self.config.test_image_id.as_deref())?;
            let Some((_, rev)) = resolved.into_iter().next() else {
                bail!("Image {image} not found");
            };
            let manifest = store::manifest_for_rev(repo, &rev)?
                .map(|m| serde_json::from_str::<serde_json::Value>(&m))
                .transpose()
                .context("Invalid JSON in image manifest")?;
            let image_id = store::image_id(
                repo,
                &rev,
                manifest.as_ref(),
                self.config.test_image_id.as_deref(),
            )?;

            let runtime = self.oci_runtime(runtime_override);
            let values = self.amend_values_for_run_once(
                values, &rootfs, name, image, &image_id, &base_dir, &runtime,
            )?;

            let exports = rootfs.join("exports");
            let conf_dest = base_dir.join("config.json");
            if exports.join("config.json").exists() {
                std::fs::copy(exports.join("config.json"), &conf_dest)?;
            } else if exports.join("config.json.template").exists() {
                let raw = std::fs::read_to_string(exports.join("config.json.template"))?;
                std::fs::write(&conf_dest, template::substitute(&raw, &values)?)?;
            } else {
                runtime.generate_default_spec(&base_dir)?;
            }

            if exports.join("tmpfiles.template").exists() {
                let raw = std::fs::read_to_string(exports.join("tmpfiles.template"))?;
                let rendered = template::substitute(&raw, &values)?;
                let tmp = base_dir.join("tmpfiles.conf");
                std::fs::write(&tmp, rendered)?;
                self.svc.tmpfiles_create(&tmp)?;
                tmpfiles_destination = Some(tmp);
            }

            let directives = runtime.startstop_directives(name, "", false)?;
            syscon_utils::Task::new(format!("Running {name}"), "sh")
                .args(["-c", directives.start.as_str()])
                .cwd(&base_dir)
                .run()
        })();

        if let Some(tmp) = &tmpfiles_destination {
            if let Err(e) = self.svc.tmpfiles_remove(tmp) {
                tracing::warn!("Removing tmpfiles: {e:#}");
            }
        }
        if mounted_from_storage {
            if let Err(e) = self.umount(&rootfs) {
                tracing::warn!("Unmounting {rootfs}: {e:#}");
            }
        }
        let _ = std::fs::remove_dir_all(&base_dir);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn amend_values_for_run_once(
        &self,
        values: Values,
        rootfs: &Utf8Path,
        name: &str,
        image: &str,
        image_id: &str,
        base_dir: &Utf8Path,
        runtime: &crate::runtime::OciRuntime,
    ) -> Result<Values> {
        let manifest_file = rootfs.join("exports/manifest.json");
        let manifest_json = if manifest_file.exists() {
            Some(std::fs::read_to_string(&manifest_file)?)
        } else {
            None
        };
        self.amend_values_from_manifest_json(
            values,
            manifest_json.as_deref(),
            name,
            image,
            image_id,
            base_dir,
            runtime,
        )
    }
}

fn find_rpm_file(deployment: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    for entry in deployment.read_dir_utf8()? {
        let entry = entry?;
        if entry.path().extension() == Some("rpm") {
            return Ok(Some(entry.path().to_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hostinstall::{HostInstall, RpmHostInstall};
    use crate::runtime::tests::fake_runtime;
    use crate::store::tests::{import_test_image, make_layer_tar, testrepo};
    use crate::systemd::testutil::RecordingServiceManager;
    use std::collections::BTreeMap;

    /// Host-install wrapper keeping all host writes under a test root.
    #[derive(Debug)]
    struct RootedHostInstall {
        inner: RpmHostInstall,
        root: Utf8PathBuf,
    }

    impl HostInstall for RootedHostInstall {
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
        ) -> anyhow::Result<crate::hostinstall::GeneratedRpm> {
            self.inner.generate_rpm(
                name,
                image_id,
                labels,
                exports,
                destination,
                values,
                templates,
                rename,
                version,
            )
        }

        fn install_rpm(&self, path: &Utf8Path) -> anyhow::Result<()> {
            self.inner.install_rpm(path)
        }

        fn uninstall_rpm(&self, name: &str) -> anyhow::Result<()> {
            self.inner.uninstall_rpm(name)
        }

        fn rm_add_files_to_host(
            &self,
            prior_checksum: Option<&crate::hostinstall::ChecksumMap>,
            exports: Option<&Utf8Path>,
            prefix: &Utf8Path,
            templates: &[String],
            values: &BTreeMap<String, String>,
            rename: &BTreeMap<String, String>,
        ) -> anyhow::Result<crate::hostinstall::ChecksumMap> {
            let prefixed = self.root.join(prefix.as_str().trim_start_matches('/'));
            self.inner
                .rm_add_files_to_host(prior_checksum, exports, &prefixed, templates, values, rename)
        }
    }

    struct Fixture {
        _td: tempfile::TempDir,
        root: Utf8PathBuf,
        engine: Engine,
        svc: RecordingServiceManager,
    }

    fn fixture() -> Fixture {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(td.path().to_path_buf()).unwrap();
        let config = Config {
            user: false,
            home: root.join("home"),
            checkout_path: root.join("checkouts"),
            repo_override: Some(root.join("repo")),
            libexec_dir: root.join("libexec"),
            unit_dir: root.join("units"),
            tmpfiles_dir: root.join("tmpfiles.d"),
            runtime_dir: "/run".into(),
            prefix: None,
            runtime: Some(fake_runtime(&root)),
            test_image_id: None,
        };
        let svc = RecordingServiceManager::default();
        let host = RootedHostInstall {
            inner: RpmHostInstall,
            root: root.join("hostroot"),
        };
        let engine = Engine::with_adapters(config, Box::new(svc.clone()), Box::new(host));
        Fixture {
            _td: td,
            root,
            engine,
            svc,
        }
    }

    const AAA: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BBB: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const CCC: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
    const ID1: &str = "1111111111111111111111111111111111111111111111111111111111111111";
    const ID2: &str = "2222222222222222222222222222222222222222222222222222222222222222";

    fn exports_layer<'a>(extra: &[(&'a str, &'a str)]) -> Vec<(&'a str, &'a str)> {
        let mut files = vec![(
            "exports/config.json",
            r#"{"root": {"path": "rootfs", "readonly": true}, "process": {"args": ["run.sh"]}}"#,
        )];
        files.extend_from_slice(extra);
        files
    }

    fn import_v1(fx: &Fixture) {
        let repo = testrepo(&fx.root);
        let exports = exports_layer(&[("app-v1", "1")]);
        import_test_image(
            &repo,
            &fx.root,
            "example.com/app:1.0",
            &[(AAA, &[("usr/bin/app", "v1")]), (BBB, &exports)],
            ID1,
        );
    }

    fn import_v2(fx: &Fixture) {
        let repo = testrepo(&fx.root);
        let exports = exports_layer(&[("app-v2", "2")]);
        import_test_image(
            &repo,
            &fx.root,
            "example.com/app:2.0",
            &[(AAA, &[("usr/bin/app", "v2")]), (CCC, &exports)],
            ID2,
        );
    }

    #[tokio::test]
    async fn test_install_upgrade_rollback_uninstall() {
        let fx = fixture();
        import_v1(&fx);

        fx.engine
            .install("example.com/app:1.0", "app", InstallOpts::default())
            .await
            .unwrap();

        // Exactly slot 0 exists and the symlink selects it.
        let checkouts = &fx.engine.config().checkout_path;
        let slot0 = checkouts.join("app.0");
        assert!(slot0.is_dir());
        assert!(!checkouts.join("app.1").exists());
        assert_eq!(
            std::fs::read_link(checkouts.join("app")).unwrap(),
            slot0.as_std_path()
        );
        // The rootfs is the union of both layers.
        assert_eq!(
            std::fs::read_to_string(slot0.join("rootfs/usr/bin/app")).unwrap(),
            "v1"
        );
        assert!(slot0.join("rootfs/exports/config.json").exists());
        // Unit rendered on the host and into the deployment.
        let unit = fx.engine.config().unit_dir.join("app.service");
        assert!(unit.exists());
        let unit_text = std::fs::read_to_string(&unit).unwrap();
        assert!(unit_text.contains("Description=app"));
        assert!(unit_text.contains(&format!("WorkingDirectory={slot0}")));
        // The info record captures the config digest as revision.
        let info = InfoRecord::load(&slot0).unwrap();
        assert_eq!(info.revision, ID1);
        assert!(info.has_container_service);
        assert_eq!(fx.svc.calls().iter().filter(|c| *c == "enable app").count(), 1);
        assert_eq!(fx.engine.container_state("app").unwrap(), "inactive");

        // Installing again on the same name refuses.
        assert!(fx
            .engine
            .install("example.com/app:1.0", "app", InstallOpts::default())
            .await
            .is_err());

        // Upgrade onto the other slot while the service is running.
        import_v2(&fx);
        fx.svc.set_active(true);
        fx.engine
            .update("app", &[], Some("example.com/app:2.0"))
            .unwrap();
        let slot1 = checkouts.join("app.1");
        assert!(slot1.is_dir());
        assert!(slot0.is_dir(), "previous deployment is preserved");
        assert_eq!(
            std::fs::read_link(checkouts.join("app")).unwrap(),
            slot1.as_std_path()
        );
        assert_eq!(
            std::fs::read_to_string(slot1.join("rootfs/usr/bin/app")).unwrap(),
            "v2"
        );
        let calls = fx.svc.calls();
        assert!(calls.contains(&"stop app".to_string()));
        assert!(calls.contains(&"start app".to_string()));
        assert_eq!(InfoRecord::load(&slot1).unwrap().revision, ID2);

        // Same image again: no-op.
        let calls_before = fx.svc.calls().len();
        fx.engine.update("app", &[], None).unwrap();
        assert_eq!(fx.svc.calls().len(), calls_before);

        // Rollback flips the symlink back and restarts.
        fx.engine.rollback("app").unwrap();
        assert_eq!(
            std::fs::read_link(checkouts.join("app")).unwrap(),
            slot0.as_std_path()
        );
        assert!(std::fs::read_to_string(&unit).unwrap().contains(&slot0.to_string()));
        assert!(fx.svc.calls().contains(&"start app".to_string()));

        // Uninstall removes every trace.
        fx.engine.uninstall("app").unwrap();
        assert!(!checkouts.join("app").symlink_metadata().is_ok());
        assert!(!slot0.exists());
        assert!(!slot1.exists());
        assert!(!unit.exists());
        assert!(!fx.engine.config().tmpfiles_dir.join("app.conf").exists());
        assert!(fx.engine.containers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_values_only_upgrade_redeploys() {
        let fx = fixture();
        import_v1(&fx);
        fx.engine
            .install("example.com/app:1.0", "app", InstallOpts::default())
            .await
            .unwrap();
        let checkouts = &fx.engine.config().checkout_path;
        fx.engine
            .update("app", &["EXTRA=1".to_string()], None)
            .unwrap();
        // Same image id, changed values: the slot still flips.
        assert_eq!(
            std::fs::read_link(checkouts.join("app")).unwrap(),
            checkouts.join("app.1").as_std_path()
        );
        let info = InfoRecord::load(&checkouts.join("app.1")).unwrap();
        assert_eq!(info.values.get("EXTRA").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_no_container_service() {
        let fx = fixture();
        let repo = testrepo(&fx.root);
        let exports = exports_layer(&[(
            "exports/manifest.json",
            r#"{"noContainerService": true}"#,
        )]);
        import_test_image(
            &repo,
            &fx.root,
            "example.com/tool:1.0",
            &[(AAA, &exports)],
            ID1,
        );
        drop(repo);

        fx.engine
            .install("example.com/tool:1.0", "tool", InstallOpts::default())
            .await
            .unwrap();
        // No unit was emitted, and the state query says so.
        assert!(!fx.engine.config().unit_dir.join("tool.service").exists());
        assert_eq!(fx.engine.container_state("tool").unwrap(), "no service");
        // The rootfs is discarded once host files are reconciled.
        let slot0 = fx.engine.config().checkout_path.join("tool.0");
        assert!(!slot0.join("rootfs").exists());
        assert!(slot0.join("info").exists());
        let calls = fx.svc.calls();
        assert!(!calls.contains(&"enable tool".to_string()));
    }

    #[tokio::test]
    async fn test_installed_files_reconciliation() {
        let fx = fixture();
        let repo = testrepo(&fx.root);
        let exports = exports_layer(&[
            ("exports/hostfs/usr/local/bin/app-wrapper", "#!/bin/sh\nexec $NAME\n"),
            (
                "exports/manifest.json",
                r#"{"installedFilesTemplate": ["/usr/local/bin/app-wrapper"]}"#,
            ),
        ]);
        import_test_image(
            &repo,
            &fx.root,
            "example.com/app:1.0",
            &[(AAA, &exports)],
            ID1,
        );
        drop(repo);

        fx.engine
            .install("example.com/app:1.0", "app", InstallOpts::default())
            .await
            .unwrap();
        let wrapper = fx.root.join("hostroot/usr/local/bin/app-wrapper");
        assert_eq!(
            std::fs::read_to_string(&wrapper).unwrap(),
            "#!/bin/sh\nexec app\n"
        );
        let slot0 = fx.engine.config().checkout_path.join("app.0");
        let info = InfoRecord::load(&slot0).unwrap();
        // installed-files mirrors the checksum map keys.
        assert_eq!(
            info.installed_files,
            info.installed_files_checksum.keys().cloned().collect::<Vec<_>>()
        );
        assert_eq!(info.installed_files, vec!["/usr/local/bin/app-wrapper"]);

        fx.engine.uninstall("app").unwrap();
        assert!(!wrapper.exists());
    }

    #[tokio::test]
    async fn test_install_refuses_existing_unit() {
        let fx = fixture();
        import_v1(&fx);
        let unit = fx.engine.config().unit_dir.join("app.service");
        std::fs::create_dir_all(unit.parent().unwrap()).unwrap();
        std::fs::write(&unit, "[Unit]\n").unwrap();
        let err = fx
            .engine
            .install("example.com/app:1.0", "app", InstallOpts::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err:#}");
        // The pre-existing unit file was not clobbered.
        assert_eq!(std::fs::read_to_string(&unit).unwrap(), "[Unit]\n");
        assert!(!fx.engine.config().checkout_path.join("app.0").exists());
    }

    #[tokio::test]
    async fn test_run_once_label_dispatch() {
        let fx = fixture();
        let repo = testrepo(&fx.root);
        // A manifest with a Labels map marking the image run-once.
        let tar = make_layer_tar(&fx.root.join("l.tar"), &exports_layer(&[]));
        let manifest = serde_json::json!({
            "Layers": [AAA],
            "Labels": {"atomic.run": "once"},
        });
        store::import_image(
            &repo,
            &crate::refenc::image_branch("example.com/oneshot:1.0"),
            &manifest.to_string(),
            None,
            &BTreeMap::from([(AAA.to_string(), tar)]),
        )
        .unwrap();
        drop(repo);

        // The overlay mount fails in the test environment, so the run
        // falls back to extraction; the fake runtime exits 0.
        fx.engine
            .install("example.com/oneshot:1.0", "oneshot", InstallOpts::default())
            .await
            .unwrap();
        // No deployment was created.
        assert!(!fx.engine.config().checkout_path.join("oneshot.0").exists());
        assert!(fx.engine.get_checkout("oneshot").is_none());
    }

    #[test]
    fn test_default_system_name() {
        assert_eq!(default_system_name("example.com/apps/etcd:3.4"), "etcd");
        assert_eq!(default_system_name("busybox"), "busybox");
    }

    #[test]
    fn test_split_set_args() {
        let v = split_set_args(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(v["A"], "1");
        assert_eq!(v["B"], "x=y");
        assert!(split_set_args(&["broken".to_string()]).is_err());
    }
}
