//! Run external commands with a user-visible description.
//!
//! Everything the engine delegates to the host (the OCI runtime, systemd,
//! mount, tar helpers, rpm tooling) goes through [`Task`] so that execution
//! is traced uniformly and failures carry the task description.

use std::ffi::OsStr;
use std::io::Seek;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Builder for an external command invocation.
pub struct Task {
    description: String,
    quiet: bool,
    quiet_output: bool,
    allow_failure: bool,
    /// The underlying command; exposed for cases that need direct tweaks.
    pub cmd: Command,
}

impl Task {
    pub fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    pub fn new_cmd(description: impl AsRef<str>, mut cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        // Default to noninteractive
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            quiet_output: false,
            allow_failure: false,
            cmd,
        }
    }

    /// Don't print the description when running.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    // Do not print stdout/stderr, unless the command fails
    pub fn quiet_output(mut self) -> Self {
        self.quiet_output = true;
        self
    }

    /// A nonzero exit is reported via the return value instead of an error.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cmd.current_dir(dir.as_ref());
        self
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub fn run(self) -> Result<()> {
        self.run_get_status().map(|_| ())
    }

    /// Run the command and report whether it exited successfully.
    pub fn run_get_status(self) -> Result<bool> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        let mut output = None;
        if self.quiet_output {
            let tmpf = tempfile::tempfile()?;
            cmd.stdout(Stdio::from(tmpf.try_clone()?));
            cmd.stderr(Stdio::from(tmpf.try_clone()?));
            output = Some(tmpf);
        }
        tracing::debug!("exec: {cmd:?}");
        let st = cmd
            .status()
            .with_context(|| format!("Spawning {description} failed"))?;
        if !st.success() {
            if self.allow_failure {
                return Ok(false);
            }
            if let Some(mut output) = output {
                output.seek(std::io::SeekFrom::Start(0))?;
                let mut stderr = std::io::stderr().lock();
                std::io::copy(&mut output, &mut stderr)?;
            }
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(true)
    }

    /// Like [`Task::run`], but return stdout.
    pub fn read(self) -> Result<String> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            println!("{description}");
        }
        tracing::debug!("exec: {cmd:?}");
        cmd.stdout(Stdio::piped());
        if self.quiet_output {
            cmd.stderr(Stdio::null());
        }
        let child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let o = child
            .wait_with_output()
            .with_context(|| format!("Executing {description} failed"))?;
        let st = o.status;
        if !st.success() && !self.allow_failure {
            anyhow::bail!("Task {description} failed: {st:?}");
        }
        Ok(String::from_utf8(o.stdout)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read() {
        let out = Task::new("test echo", "echo")
            .quiet()
            .args(["hello"])
            .read()
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_status() {
        assert!(Task::new("true", "true").quiet().run_get_status().unwrap());
        assert!(!Task::new("false", "false")
            .quiet()
            .allow_failure()
            .run_get_status()
            .unwrap());
        assert!(Task::new("false", "false").quiet().run().is_err());
    }
}
