//! Materialize a deployment from an imported image.
//!
//! A checkout produces `<checkout-root>/<name>.<slot>/` holding the
//! union-merged `rootfs/`, the runtime `config.json`, the rendered
//! service unit and tmpfiles fragment, the reconciled host files, and an
//! `info` record describing all of it.  Every step that creates
//! host-visible state is undone when a later step fails.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::hostinstall::{self, ChecksumMap};
use crate::refenc;
use crate::runtime::OciRuntime;
use crate::store;
use crate::template::{self, Values};

/// Unit template used when the image ships no `exports/service.template`.
pub(crate) const SYSTEMD_UNIT_DEFAULT_TEMPLATE: &str = "\
[Unit]
Description=$NAME

[Service]
ExecStartPre=$EXEC_STARTPRE
ExecStart=$EXEC_START
ExecStop=$EXEC_STOP
ExecStopPost=$EXEC_STOPPOST
Restart=on-failure
WorkingDirectory=$DESTDIR
PIDFile=$PIDFILE

[Install]
WantedBy=multi-user.target
";

/// Variables the engine always sets, overriding user input.
pub(crate) const TEMPLATE_FORCED_VARIABLES: &[&str] = &[
    "DESTDIR",
    "NAME",
    "EXEC_START",
    "EXEC_STOP",
    "EXEC_STARTPRE",
    "EXEC_STOPPOST",
    "HOST_UID",
    "HOST_GID",
    "IMAGE_ID",
    "IMAGE_NAME",
];

/// Variables with engine defaults the user may override.
pub(crate) const TEMPLATE_OVERRIDABLE_VARIABLES: &[&str] = &[
    "RUN_DIRECTORY",
    "STATE_DIRECTORY",
    "CONF_DIRECTORY",
    "UUID",
    "PIDFILE",
    "ALL_PROCESS_CAPABILITIES",
];

const PROCESS_CAPABILITIES: &[&str] = &[
    "CAP_AUDIT_CONTROL",
    "CAP_AUDIT_READ",
    "CAP_AUDIT_WRITE",
    "CAP_BLOCK_SUSPEND",
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_KILL",
    "CAP_LEASE",
    "CAP_LINUX_IMMUTABLE",
    "CAP_MAC_ADMIN",
    "CAP_MAC_OVERRIDE",
    "CAP_MKNOD",
    "CAP_NET_ADMIN",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_SETUID",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_CHROOT",
    "CAP_SYS_MODULE",
    "CAP_SYS_NICE",
    "CAP_SYS_PACCT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
];

/// Host-package handling mode for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemPackage {
    #[default]
    No,
    Yes,
    Auto,
    Build,
    Absent,
}

impl SystemPackage {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            SystemPackage::No => "no",
            SystemPackage::Yes => "yes",
            SystemPackage::Auto => "auto",
            SystemPackage::Build => "build",
            SystemPackage::Absent => "absent",
        }
    }
}

impl std::str::FromStr for SystemPackage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "no" => SystemPackage::No,
            "yes" => SystemPackage::Yes,
            "auto" => SystemPackage::Auto,
            "build" => SystemPackage::Build,
            "absent" => SystemPackage::Absent,
            o => bail!("Invalid --system-package mode: {o}"),
        })
    }
}

/// The per-checkout record written as `info` in the deployment directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct InfoRecord {
    pub image: String,
    pub revision: String,
    #[serde(rename = "ostree-commit")]
    pub commit: String,
    pub created: i64,
    pub values: Values,
    #[serde(rename = "has-container-service")]
    pub has_container_service: bool,
    #[serde(rename = "installed-files")]
    pub installed_files: Vec<String>,
    #[serde(rename = "installed-files-checksum")]
    pub installed_files_checksum: ChecksumMap,
    #[serde(rename = "installed-files-template")]
    pub installed_files_template: Vec<String>,
    #[serde(rename = "rename-installed-files")]
    pub rename_installed_files: BTreeMap<String, String>,
    #[serde(rename = "rpm-installed")]
    pub rpm_installed: Option<String>,
    #[serde(rename = "system-package")]
    pub system_package: String,
    pub remote: Option<String>,
    pub runtime: String,
}

impl Default for InfoRecord {
    fn default() -> Self {
        Self {
            image: String::new(),
            revision: String::new(),
            commit: String::new(),
            created: 0,
            values: Values::new(),
            has_container_service: true,
            installed_files: Vec::new(),
            installed_files_checksum: ChecksumMap::new(),
            installed_files_template: Vec::new(),
            rename_installed_files: BTreeMap::new(),
            rpm_installed: None,
            system_package: "no".to_string(),
            remote: None,
            runtime: String::new(),
        }
    }
}

impl InfoRecord {
    pub(crate) fn load(deployment: &Utf8Path) -> Result<Self> {
        let path = deployment.join("info");
        let data =
            std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        serde_json::from_str(&data).with_context(|| format!("Parsing {path}"))
    }
}

/// Per-image defaults shipped as `exports/manifest.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ExportsManifest {
    default_values: Values,
    installed_files_template: Vec<String>,
    rename_files: BTreeMap<String, String>,
    no_container_service: bool,
}

/// Inputs for one checkout.
#[derive(Debug, Default)]
pub(crate) struct CheckoutOpts {
    pub values: Values,
    /// Explicit target directory (extraction, rpm staging).
    pub destination: Option<Utf8PathBuf>,
    /// Stop after materializing the rootfs.
    pub extract_only: bool,
    /// Use a pre-existing rootfs at this location instead of extracting.
    pub remote: Option<Utf8PathBuf>,
    /// Prior deployment's checksums, for host-file reconciliation.
    pub installed_files_checksum: Option<ChecksumMap>,
    pub system_package: SystemPackage,
    pub runtime: Option<String>,
}

struct RemoteRootfs {
    rootfs: Utf8PathBuf,
    exports: Utf8PathBuf,
}

fn resolve_remote(remote: &Utf8Path) -> Result<RemoteRootfs> {
    let real = remote
        .canonicalize_utf8()
        .map_err(|_| anyhow!("The container's rootfs is set to remote, but the remote rootfs does not exist"))?;
    if real.join("rootfs").exists() {
        Ok(RemoteRootfs {
            exports: real.join("rootfs/exports"),
            rootfs: real.join("rootfs"),
        })
    } else if real.join("usr").exists() {
        // The location is the rootfs itself.
        let base = real.parent().unwrap_or(&real).to_owned();
        Ok(RemoteRootfs {
            exports: base.join("rootfs/exports"),
            rootfs: real,
        })
    } else {
        bail!("--rootfs was specified but the given location does not contain a rootfs")
    }
}

/// Ask the kernel to flush the filesystem holding the new rootfs, falling
/// back to the sync tool when `syncfs` is unavailable.
fn do_syncfs(rootfs: &Utf8Path) -> Result<()> {
    if let Ok(f) = std::fs::File::open(rootfs) {
        if rustix::fs::syncfs(&f).is_ok() {
            return Ok(());
        }
    }
    syscon_utils::Task::new("Syncing rootfs", "sync")
        .quiet()
        .quiet_output()
        .args(["--file-system", rootfs.as_str()])
        .run()
}

/// Validate a runtime configuration and collect bind-mount sources that
/// do not exist on the host (they get tmpfiles entries).
fn check_oci_configuration_file(
    conf_path: &Utf8Path,
    remote: bool,
) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(conf_path)?;
    let configuration: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid json in configuration file: {conf_path}."))?;
    let Some(obj) = configuration.as_object() else {
        bail!("Invalid json in configuration file: {conf_path}.");
    };
    if obj.is_empty() {
        return Ok(Vec::new());
    }
    let readonly = configuration
        .pointer("/root/readonly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if !readonly {
        bail!("Invalid configuration file.  Only readonly images are supported");
    }
    let root_path = configuration
        .pointer("/root/path")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if root_path != "rootfs" && !remote {
        bail!("Invalid configuration file.  Path must be 'rootfs'");
    }
    let mut missing = Vec::new();
    if let Some(mounts) = configuration.get("mounts").and_then(|v| v.as_array()) {
        for mount in mounts {
            let Some(ty) = mount.get("type").and_then(|v| v.as_str()) else {
                continue;
            };
            if !ty.contains("bind") {
                continue;
            }
            if let Some(source) = mount.get("source").and_then(|v| v.as_str()) {
                if !Utf8Path::new(source).exists() {
                    missing.push(source.to_string());
                }
            }
        }
    }
    Ok(missing)
}

/// Pre-create missing bind-mount sources via tmpfiles.
fn generate_tmpfiles_data(missing_bind_paths: &[String]) -> String {
    let uid = rustix::process::getuid().as_raw();
    let gid = rustix::process::getgid().as_raw();
    missing_bind_paths
        .iter()
        .map(|p| format!("d    {p}   0700 {uid} {gid} - -\n"))
        .collect()
}

fn all_capabilities() -> String {
    let quoted: Vec<String> = PROCESS_CAPABILITIES
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect();
    quoted.join(",\n") + "\n"
}

impl Engine {
    /// Check out `img` under `name` into deployment slot `deployment`,
    /// undoing all filesystem side effects on failure.
    #[context("Checking out {img} as {name}")]
    pub(crate) fn checkout(
        &self,
        name: &str,
        img: &str,
        deployment: u32,
        upgrade: bool,
        opts: CheckoutOpts,
    ) -> Result<()> {
        let destination = opts.destination.clone().unwrap_or_else(|| {
            self.config
                .checkout_path
                .join(format!("{name}.{deployment}"))
        });
        let (unitfileout, tmpfilesout) = self.config.systemd_destination_files(name);
        if !upgrade && !opts.extract_only {
            for f in [&unitfileout, &tmpfilesout] {
                if f.exists() {
                    bail!("The file {f} already exists.");
                }
            }
        }
        let extract_only = opts.extract_only;
        let r = self.do_checkout(
            name,
            img,
            deployment,
            upgrade,
            opts,
            &destination,
            &unitfileout,
            &tmpfilesout,
        );
        if r.is_err() && !extract_only && !upgrade {
            let _ = std::fs::remove_dir_all(&destination);
            let _ = std::fs::remove_file(&unitfileout);
            let _ = std::fs::remove_file(&tmpfilesout);
        }
        r
    }

    #[allow(clippy::too_many_arguments)]
    fn do_checkout(
        &self,
        name: &str,
        img: &str,
        deployment: u32,
        upgrade: bool,
        opts: CheckoutOpts,
        destination: &Utf8Path,
        unitfileout: &Utf8Path,
        tmpfilesout: &Utf8Path,
    ) -> Result<()> {
        let repo = self.repo()?;
        let test_id = self.config.test_image_id.as_deref();
        let resolved = store::resolve_image(repo, img, false, test_id)?;
        let Some((branch, rev)) = resolved.into_iter().next() else {
            bail!("Image {img} not found");
        };

        let remote = opts.remote.as_deref().map(resolve_remote).transpose()?;

        println!("Extracting to {destination}");

        // An upgrade only restarts the service if it was already running.
        let was_service_active = self.svc.is_active(name);

        let rootfs = if opts.extract_only {
            destination.to_owned()
        } else if let Some(remote) = &remote {
            remote.rootfs.clone()
        } else {
            destination.join("rootfs")
        };
        if remote.is_some() {
            std::fs::create_dir_all(destination)?;
        } else {
            std::fs::create_dir_all(&rootfs)?;
        }

        let manifest_str = store::manifest_for_rev(repo, &rev)?;
        if remote.is_none() {
            match &manifest_str {
                // A bare branch commit carries the tree itself.
                None => repo.checkout_commit(&rev, &rootfs)?,
                Some(manifest) => {
                    let manifest: serde_json::Value = serde_json::from_str(manifest)
                        .context("Invalid JSON in image manifest")?;
                    for layer in store::layers_from_manifest(&manifest) {
                        let layer = refenc::drop_sha256_prefix(&layer);
                        let layer_rev = repo
                            .resolve(&refenc::layer_branch(layer))?
                            .ok_or_else(|| {
                                anyhow!("Layer not found: {layer}.  Please pull the image again")
                            })?;
                        repo.checkout_commit(&layer_rev, &rootfs)?;
                    }
                }
            }
            do_syncfs(&rootfs)?;
        }

        if opts.extract_only {
            return Ok(());
        }

        let exports = match &remote {
            Some(r) => r.exports.clone(),
            None => destination.join("rootfs/exports"),
        };
        if !exports.exists() {
            println!(
                "Warning: /exports directory not found.  Default config files will be generated."
            );
            println!(
                "Warning: You may want to modify `{}` before starting the service",
                destination.join("config.json")
            );
        }

        let mut system_package = opts.system_package;
        if system_package == SystemPackage::Auto {
            system_package = if hostinstall::wants_rpm(&exports) {
                SystemPackage::Yes
            } else {
                SystemPackage::No
            };
        }

        let manifest_file = exports.join("manifest.json");
        let exports_manifest: ExportsManifest = if manifest_file.exists() {
            let raw = std::fs::read_to_string(&manifest_file)?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Invalid manifest.json file in image: {img}."))?
        } else {
            ExportsManifest::default()
        };
        let has_container_service = !exports_manifest.no_container_service;
        let installed_files_template = exports_manifest.installed_files_template.clone();

        let image_manifest: Option<serde_json::Value> = manifest_str
            .as_deref()
            .map(|m| serde_json::from_str(m).context("Invalid JSON in image manifest"))
            .transpose()?;
        let image_id = match &image_manifest {
            Some(m) => store::image_id(repo, &rev, Some(m), test_id)?,
            None => rev.clone(),
        };

        let unitfile = exports.join("service.template");
        let systemd_template = if unitfile.exists() {
            std::fs::read_to_string(&unitfile)?
        } else {
            SYSTEMD_UNIT_DEFAULT_TEMPLATE.to_string()
        };
        let unit_supports_pidfile =
            systemd_template.contains("$EXEC_STOPPOST") && systemd_template.contains("$PIDFILE");

        let runtime = self.oci_runtime(opts.runtime.as_deref());
        let values = self.amend_values(
            opts.values,
            &exports_manifest,
            name,
            img,
            &image_id,
            destination,
            &runtime,
            unit_supports_pidfile,
        )?;

        // config.json: shipped file wins, then a template, then the
        // runtime-generated default.
        let conf_src = exports.join("config.json");
        let conf_dest = destination.join("config.json");
        if conf_src.exists() {
            std::fs::copy(&conf_src, &conf_dest)?;
        } else if exports.join("config.json.template").exists() {
            let raw = std::fs::read_to_string(exports.join("config.json.template"))?;
            std::fs::write(&conf_dest, template::substitute(&raw, &values)?)?;
        } else {
            runtime.generate_default_spec(destination)?;
        }

        if let Some(remote) = &remote {
            let raw = std::fs::read_to_string(&conf_dest)?;
            let mut config: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid config.json file in given remote location: {conf_dest}."))?;
            config["root"]["path"] = remote.rootfs.as_str().into();
            std::fs::write(&conf_dest, serde_json::to_string_pretty(&config)?)?;
            // Make the remote rootfs reachable the same way as a local one.
            std::os::unix::fs::symlink(&remote.rootfs, destination.join("rootfs"))?;
        }

        // When upgrading, stop the service and drop the previously
        // installed tmpfiles before switching anything over.
        if has_container_service && upgrade {
            if was_service_active {
                self.svc.stop(name)?;
            }
            if tmpfilesout.exists() {
                if let Err(e) = self.svc.tmpfiles_remove(tmpfilesout) {
                    tracing::warn!("Removing tmpfiles: {e:#}");
                }
            }
        }

        // rename_files values may themselves be templates.
        let mut rename_files = BTreeMap::new();
        for (k, v) in &exports_manifest.rename_files {
            let rendered = template::substitute(v, &values)
                .context("The template file 'manifest.json' contains an unreplaced value")?;
            rename_files.insert(k.clone(), rendered);
        }

        let missing_bind_paths = check_oci_configuration_file(&conf_dest, remote.is_some())?;

        let mut rpm_installed = None;
        let mut rpm_file = None;
        if system_package == SystemPackage::Yes {
            let img_info = store::inspect_branch(repo, &branch, test_id)?;
            let labels: BTreeMap<String, String> = img_info
                .labels
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect();
            let generated = self.host.generate_rpm(
                name,
                &img_info.image_id,
                &labels,
                &exports,
                destination,
                &values,
                &installed_files_template,
                &rename_files,
                &deployment.to_string(),
            )?;
            rpm_installed = Some(generated.name);
            rpm_file = Some(generated.path);
        }

        let host_prefix = self
            .config
            .prefix
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("/"));
        let new_installed_files_checksum =
            if rpm_installed.is_some() || system_package == SystemPackage::Absent {
                ChecksumMap::new()
            } else {
                self.host.rm_add_files_to_host(
                    opts.installed_files_checksum.as_ref(),
                    Some(&exports),
                    &host_prefix,
                    &installed_files_template,
                    &values,
                    &rename_files,
                )?
            };
        let new_installed_files: Vec<String> =
            new_installed_files_checksum.keys().cloned().collect();

        let info = InfoRecord {
            image: img.to_string(),
            revision: image_id,
            commit: rev.clone(),
            created: chrono::Utc::now().timestamp(),
            values: values.clone(),
            has_container_service,
            installed_files: new_installed_files.clone(),
            installed_files_checksum: new_installed_files_checksum,
            installed_files_template,
            rename_installed_files: rename_files,
            rpm_installed: rpm_installed.clone(),
            system_package: system_package.as_str().to_string(),
            remote: opts.remote.as_ref().map(|r| r.to_string()),
            runtime: runtime.exe().to_string(),
        };
        let mut info_data = serde_json::to_vec_pretty(&info)?;
        info_data.push(b'\n');
        let write_info = || -> Result<()> {
            let dir = Dir::open_ambient_dir(destination, cap_std::ambient_authority())?;
            dir.atomic_write("info", &info_data)?;
            Ok(())
        };
        if let Err(e) = write_info() {
            // Take back the host files this checkout just created.
            for f in &new_installed_files {
                let _ = std::fs::remove_file(host_prefix.join(f.trim_start_matches('/')));
            }
            return Err(e);
        }

        let tmpfiles_src = exports.join("tmpfiles.template");
        let tmpfiles_template = if tmpfiles_src.exists() {
            std::fs::read_to_string(&tmpfiles_src)?
        } else {
            generate_tmpfiles_data(&missing_bind_paths)
        };

        if has_container_service {
            let rendered = template::substitute(&systemd_template, &values)?;
            std::fs::create_dir_all(unitfileout.parent().unwrap())?;
            std::fs::write(unitfileout, &rendered)?;
            std::fs::write(destination.join(format!("{name}.service")), &rendered)?;
        }
        let has_tmpfiles = !tmpfiles_template.is_empty();
        if has_tmpfiles {
            let rendered = template::substitute(&tmpfiles_template, &values)?;
            std::fs::create_dir_all(tmpfilesout.parent().unwrap())?;
            std::fs::write(tmpfilesout, &rendered)?;
            std::fs::write(destination.join(format!("tmpfiles-{name}.conf")), &rendered)?;
        }

        if self.config.prefix.is_some() {
            return Ok(());
        }

        let sym = self.config.checkout_path.join(name);
        swap_symlink(destination, &sym)?;

        // Without a container service there is nothing to supervise; the
        // host files are already reconciled, so the rootfs can go.
        if !has_container_service {
            if remote.is_none() {
                std::fs::remove_dir_all(destination.join("rootfs"))?;
            }
            return Ok(());
        }

        let finalize = || -> Result<()> {
            match (&rpm_installed, &rpm_file) {
                (Some(_), Some(path)) => self.host.install_rpm(path)?,
                _ => {
                    for f in &new_installed_files {
                        println!("Created file {f}");
                    }
                }
            }
            self.svc.daemon_reload()?;
            if has_tmpfiles {
                self.svc.tmpfiles_create(tmpfilesout)?;
            }
            if !upgrade {
                self.svc.enable(name)?;
            } else if was_service_active {
                self.svc.start(name)?;
            }
            Ok(())
        };
        if let Err(e) = finalize() {
            if let Some(rpm) = &rpm_installed {
                let _ = self.host.uninstall_rpm(rpm);
            }
            for f in &new_installed_files {
                let _ = std::fs::remove_file(host_prefix.join(f.trim_start_matches('/')));
            }
            let _ = std::fs::remove_file(&sym);
            return Err(e);
        }
        Ok(())
    }

    /// Fill in the template variables, in order: engine defaults, the
    /// image's `defaultValues`, then the forced variables that always win.
    #[allow(clippy::too_many_arguments)]
    fn amend_values(
        &self,
        mut values: Values,
        manifest: &ExportsManifest,
        name: &str,
        image: &str,
        image_id: &str,
        destination: &Utf8Path,
        runtime: &OciRuntime,
        unit_supports_pidfile: bool,
    ) -> Result<Values> {
        let config = &self.config;
        if !values.contains_key("RUN_DIRECTORY") {
            values.insert("RUN_DIRECTORY".into(), config.runtime_dir.to_string());
        }
        if !values.contains_key("PIDFILE") {
            let run_dir = values["RUN_DIRECTORY"].clone();
            values.insert("PIDFILE".into(), format!("{run_dir}/container-{name}.pid"));
        }
        if !values.contains_key("CONF_DIRECTORY") {
            let conf = if config.user {
                config.home.join(".config").to_string()
            } else {
                "/etc".to_string()
            };
            values.insert("CONF_DIRECTORY".into(), conf);
        }
        if !values.contains_key("STATE_DIRECTORY") {
            let state = if config.user {
                config.home.join(".data").to_string()
            } else {
                "/var/lib".to_string()
            };
            values.insert("STATE_DIRECTORY".into(), state);
        }
        if !values.contains_key("ALL_PROCESS_CAPABILITIES") {
            values.insert("ALL_PROCESS_CAPABILITIES".into(), all_capabilities());
        }
        if !values.contains_key("RUNTIME") {
            values.insert("RUNTIME".into(), runtime.exe().to_string());
        }
        for (k, v) in &manifest.default_values {
            values.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if !values.contains_key("UUID") {
            values.insert("UUID".into(), uuid::Uuid::new_v4().to_string());
        }

        let destdir = match &config.prefix {
            Some(prefix) => {
                let rel = destination.strip_prefix(prefix).unwrap_or(destination);
                format!("/{rel}")
            }
            None => destination.to_string(),
        };
        values.insert("DESTDIR".into(), destdir);
        values.insert("NAME".into(), name.to_string());
        let pidfile = values["PIDFILE"].clone();
        let directives = runtime.startstop_directives(name, &pidfile, unit_supports_pidfile)?;
        values.insert("EXEC_START".into(), directives.start);
        values.insert("EXEC_STOP".into(), directives.stop);
        values.insert("EXEC_STARTPRE".into(), directives.startpre);
        values.insert("EXEC_STOPPOST".into(), directives.stoppost);
        values.insert(
            "HOST_UID".into(),
            rustix::process::getuid().as_raw().to_string(),
        );
        values.insert(
            "HOST_GID".into(),
            rustix::process::getgid().as_raw().to_string(),
        );
        values.insert("IMAGE_NAME".into(), image.to_string());
        values.insert("IMAGE_ID".into(), image_id.to_string());
        Ok(values)
    }

    /// [`Engine::amend_values`] for callers holding a raw
    /// `exports/manifest.json` document (the one-shot path).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn amend_values_from_manifest_json(
        &self,
        values: Values,
        manifest_json: Option<&str>,
        name: &str,
        image: &str,
        image_id: &str,
        destination: &Utf8Path,
        runtime: &OciRuntime,
    ) -> Result<Values> {
        let manifest: ExportsManifest = match manifest_json {
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("Invalid manifest.json file in image: {image}."))?,
            None => ExportsManifest::default(),
        };
        self.amend_values(
            values,
            &manifest,
            name,
            image,
            image_id,
            destination,
            runtime,
            false,
        )
    }

    /// Materialize an image's rootfs at an arbitrary location.
    pub fn extract(&self, img: &str, destination: &Utf8Path) -> Result<()> {
        self.checkout(
            img,
            img,
            0,
            false,
            CheckoutOpts {
                destination: Some(destination.to_owned()),
                extract_only: true,
                ..Default::default()
            },
        )
    }
}

/// Atomically repoint `link` at `target` (symlink to a temporary name,
/// then rename over).
pub(crate) fn swap_symlink(target: &Utf8Path, link: &Utf8Path) -> Result<()> {
    let tmp = link
        .parent()
        .unwrap()
        .join(format!(".{}.tmp", link.file_name().unwrap()));
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(target, &tmp)?;
    std::fs::rename(&tmp, link).with_context(|| format!("Updating symlink {link}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_oci_configuration_file() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let conf = root.join("config.json");

        std::fs::write(&conf, "{}").unwrap();
        assert!(check_oci_configuration_file(&conf, false).unwrap().is_empty());

        std::fs::write(
            &conf,
            serde_json::json!({
                "root": {"path": "rootfs", "readonly": true},
                "mounts": [
                    {"type": "bind", "source": "/nonexistent/source", "destination": "/data"},
                    {"type": "proc", "source": "proc"},
                ],
            })
            .to_string(),
        )
        .unwrap();
        assert_eq!(
            check_oci_configuration_file(&conf, false).unwrap(),
            vec!["/nonexistent/source".to_string()]
        );

        std::fs::write(
            &conf,
            serde_json::json!({"root": {"path": "rootfs", "readonly": false}}).to_string(),
        )
        .unwrap();
        assert!(check_oci_configuration_file(&conf, false).is_err());

        std::fs::write(
            &conf,
            serde_json::json!({"root": {"path": "/elsewhere", "readonly": true}}).to_string(),
        )
        .unwrap();
        assert!(check_oci_configuration_file(&conf, false).is_err());
        // A remote rootfs is allowed to point elsewhere.
        assert!(check_oci_configuration_file(&conf, true).is_ok());
    }

    #[test]
    fn test_generate_tmpfiles_data() {
        let data = generate_tmpfiles_data(&["/var/lib/app".to_string(), "/etc/app".to_string()]);
        let lines: Vec<&str> = data.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("d    /var/lib/app   0700 "));
        assert!(lines[1].starts_with("d    /etc/app   0700 "));
    }

    #[test]
    fn test_swap_symlink() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let a = root.join("app.0");
        let b = root.join("app.1");
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let link = root.join("app");
        swap_symlink(&a, &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), a.as_std_path());
        swap_symlink(&b, &link).unwrap();
        assert_eq!(std::fs::read_link(&link).unwrap(), b.as_std_path());
    }

    #[test]
    fn test_render_default_unit() {
        let values: crate::template::Values = [
            ("NAME", "app"),
            ("EXEC_STARTPRE", ""),
            ("EXEC_START", "/usr/bin/runc run 'app'"),
            ("EXEC_STOP", "/usr/bin/runc kill 'app'"),
            ("EXEC_STOPPOST", ""),
            ("DESTDIR", "/var/lib/containers/syscon/app.0"),
            ("PIDFILE", "/run/container-app.pid"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let rendered =
            crate::template::substitute(SYSTEMD_UNIT_DEFAULT_TEMPLATE, &values).unwrap();
        similar_asserts::assert_eq!(
            rendered,
            indoc::indoc! {"
                [Unit]
                Description=app

                [Service]
                ExecStartPre=
                ExecStart=/usr/bin/runc run 'app'
                ExecStop=/usr/bin/runc kill 'app'
                ExecStopPost=
                Restart=on-failure
                WorkingDirectory=/var/lib/containers/syscon/app.0
                PIDFile=/run/container-app.pid

                [Install]
                WantedBy=multi-user.target
            "}
        );
    }

    #[test]
    fn test_default_template_supports_pidfile() {
        assert!(SYSTEMD_UNIT_DEFAULT_TEMPLATE.contains("$EXEC_STOPPOST"));
        assert!(SYSTEMD_UNIT_DEFAULT_TEMPLATE.contains("$PIDFILE"));
        let vars = crate::template::variables(SYSTEMD_UNIT_DEFAULT_TEMPLATE);
        for v in ["NAME", "DESTDIR", "EXEC_START", "EXEC_STOP", "PIDFILE"] {
            assert!(vars.contains(v), "{v}");
        }
    }
}
