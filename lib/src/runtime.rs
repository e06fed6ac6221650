//! Adapter for the OCI runtime binary (runc or a compatible tool).
//!
//! Feature discovery works the way the runtime itself advertises it: the
//! help output is probed once per engine instance for `--pid-file` and
//! `--systemd-cgroup` support, and the result is cached.

use anyhow::{Context, Result};
use camino::Utf8Path;
use once_cell::sync::OnceCell;
use syscon_utils::Task;

/// Default system runtime.
pub(crate) const RUNC_PATH: &str = "/usr/bin/runc";
/// Default rootless runtime.
pub(crate) const BWRAP_OCI_PATH: &str = "/usr/bin/bwrap-oci";

#[derive(Debug, Clone, Copy)]
struct RuntimeCaps {
    pid_file: bool,
    systemd_cgroup: bool,
}

/// Start/stop command lines for the service unit.
#[derive(Debug, Clone, Default)]
pub(crate) struct StartStopDirectives {
    pub start: String,
    pub stop: String,
    pub startpre: String,
    pub stoppost: String,
}

#[derive(Debug)]
pub(crate) struct OciRuntime {
    exe: String,
    caps: OnceCell<RuntimeCaps>,
}

impl OciRuntime {
    pub fn new(exe: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            caps: OnceCell::new(),
        }
    }

    pub fn exe(&self) -> &str {
        &self.exe
    }

    /// Verify the runtime is installed.
    pub fn check_available(&self) -> Result<()> {
        Task::new("Checking runtime", &self.exe)
            .quiet()
            .quiet_output()
            .arg("--version")
            .run()
            .with_context(|| {
                format!(
                    "Cannot install the container: the runtime {} is not installed",
                    self.exe
                )
            })
    }

    fn caps(&self) -> Result<RuntimeCaps> {
        self.caps
            .get_or_try_init(|| {
                let run_help = Task::new("Probing runtime run", &self.exe)
                    .quiet()
                    .allow_failure()
                    .quiet_output()
                    .args(["run", "--help"])
                    .read()?;
                let help = Task::new("Probing runtime", &self.exe)
                    .quiet()
                    .allow_failure()
                    .quiet_output()
                    .arg("--help")
                    .read()?;
                Ok(RuntimeCaps {
                    pid_file: run_help.contains("--pid-file"),
                    systemd_cgroup: help.contains("--systemd-cgroup"),
                })
            })
            .copied()
    }

    /// Synthesize the `EXEC_*` directives for the unit template.  When
    /// both the template and the runtime can handle a pid file, the
    /// container runs detached and is deleted in ExecStopPost; otherwise
    /// it runs in the foreground with a run/kill pair.
    pub fn startstop_directives(
        &self,
        name: &str,
        pidfile: &str,
        unit_file_supports_pidfile: bool,
    ) -> Result<StartStopDirectives> {
        let caps = self.caps()?;
        let cgroup = if caps.systemd_cgroup {
            " --systemd-cgroup"
        } else {
            ""
        };
        let exe = &self.exe;
        if unit_file_supports_pidfile && caps.pid_file {
            Ok(StartStopDirectives {
                start: format!("{exe}{cgroup} run -d --pid-file {pidfile} '{name}'"),
                stop: String::new(),
                startpre: String::new(),
                stoppost: format!("{exe} delete '{name}'"),
            })
        } else {
            Ok(StartStopDirectives {
                start: format!("{exe}{cgroup} run '{name}'"),
                stop: format!("{exe}{cgroup} kill '{name}'"),
                startpre: String::new(),
                stoppost: String::new(),
            })
        }
    }

    /// Generate a default `config.json` in `destination` via the
    /// runtime's `spec` subcommand, then constrain it: read-only root at
    /// `rootfs`, no terminal, `run.sh` as entrypoint.  Without a usable
    /// runtime an empty document is written for the admin to fill in.
    pub fn generate_default_spec(&self, destination: &Utf8Path) -> Result<()> {
        let conf_path = destination.join("config.json");
        if self.check_available().is_err() {
            std::fs::write(&conf_path, "{}")?;
            return Ok(());
        }
        Task::new("Generating default configuration", &self.exe)
            .quiet()
            .quiet_output()
            .arg("spec")
            .cwd(destination)
            .run()?;
        let raw = std::fs::read_to_string(&conf_path)
            .with_context(|| format!("Reading generated {conf_path}"))?;
        let mut config: serde_json::Value =
            serde_json::from_str(&raw).context("Invalid JSON from runtime spec")?;
        config["root"]["readonly"] = serde_json::Value::Bool(true);
        config["root"]["path"] = "rootfs".into();
        config["process"]["terminal"] = serde_json::Value::Bool(false);
        config["process"]["args"] = serde_json::json!(["run.sh"]);
        std::fs::write(&conf_path, serde_json::to_string_pretty(&config)?)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Install a fake runtime script advertising both probe flags and a
    /// working `spec` subcommand.
    pub(crate) fn fake_runtime(dir: &Utf8Path) -> String {
        let path = dir.join("fakeruntime");
        let script = r#"#!/bin/sh
case "$1" in
  --version) echo "fakeruntime 1.0" ;;
  --help) echo "usage: ... --systemd-cgroup ..." ;;
  run) echo "usage: run ... --pid-file ..." ;;
  spec) printf '%s' '{"root": {"path": "rootfs", "readonly": false}, "process": {"terminal": true, "args": ["sh"]}, "mounts": []}' > config.json ;;
esac
"#;
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string()
    }

    #[test]
    fn test_directives() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let rt = OciRuntime::new(fake_runtime(root));
        rt.check_available().unwrap();

        let d = rt
            .startstop_directives("app", "/run/container-app.pid", true)
            .unwrap();
        assert!(d.start.contains("run -d --pid-file /run/container-app.pid 'app'"));
        assert!(d.start.contains("--systemd-cgroup"));
        assert!(d.stoppost.ends_with("delete 'app'"));
        assert!(d.stop.is_empty());

        let d = rt
            .startstop_directives("app", "/run/container-app.pid", false)
            .unwrap();
        assert!(d.start.ends_with("run 'app'"));
        assert!(d.stop.ends_with("kill 'app'"));
        assert!(d.stoppost.is_empty());
    }

    #[test]
    fn test_generate_default_spec() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let rt = OciRuntime::new(fake_runtime(root));
        rt.generate_default_spec(root).unwrap();
        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(root.join("config.json")).unwrap())
                .unwrap();
        assert_eq!(config["root"]["readonly"], true);
        assert_eq!(config["root"]["path"], "rootfs");
        assert_eq!(config["process"]["terminal"], false);
        assert_eq!(config["process"]["args"][0], "run.sh");
    }
}
