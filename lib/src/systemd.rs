//! Adapter for the host service supervisor.
//!
//! The engine only needs a small command surface; it is kept behind a
//! trait so deployment logic can be exercised without a running systemd.

use anyhow::Result;
use camino::Utf8Path;
use syscon_utils::Task;

/// Operations the engine requests from the init system.
pub trait ServiceManager: std::fmt::Debug {
    fn daemon_reload(&self) -> Result<()>;
    fn enable(&self, name: &str) -> Result<()>;
    /// Disable and stop the unit.
    fn disable(&self, name: &str) -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str) -> Result<()>;
    fn is_active(&self, name: &str) -> bool;
    fn is_failed(&self, name: &str) -> bool;
    fn tmpfiles_create(&self, path: &Utf8Path) -> Result<()>;
    fn tmpfiles_remove(&self, path: &Utf8Path) -> Result<()>;
}

/// The real thing: shells out to `systemctl` and `systemd-tmpfiles`,
/// with `--user` in per-user mode.
#[derive(Debug)]
pub struct Systemctl {
    user: bool,
}

impl Systemctl {
    pub fn new(user: bool) -> Self {
        Self { user }
    }

    fn systemctl(&self, args: &[&str]) -> Task {
        let mut task = Task::new(format!("systemctl {}", args.join(" ")), "systemctl").quiet();
        if self.user {
            task = task.arg("--user");
        }
        task.args(args)
    }

    fn tmpfiles(&self, command: &str, path: &Utf8Path) -> Task {
        let mut task = Task::new(format!("systemd-tmpfiles {command}"), "systemd-tmpfiles").quiet();
        if self.user {
            task = task.arg("--user");
        }
        task.arg(command).arg(path)
    }
}

impl ServiceManager for Systemctl {
    fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"]).run()
    }

    fn enable(&self, name: &str) -> Result<()> {
        self.systemctl(&["enable", name]).run()
    }

    fn disable(&self, name: &str) -> Result<()> {
        self.systemctl(&["disable", "--now", name]).run()
    }

    fn start(&self, name: &str) -> Result<()> {
        self.systemctl(&["start", name]).run()
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.systemctl(&["stop", name]).run()
    }

    fn is_active(&self, name: &str) -> bool {
        self.systemctl(&["is-active", "--quiet", name])
            .quiet_output()
            .allow_failure()
            .run_get_status()
            .unwrap_or(false)
    }

    fn is_failed(&self, name: &str) -> bool {
        self.systemctl(&["is-failed", "--quiet", name])
            .quiet_output()
            .allow_failure()
            .run_get_status()
            .unwrap_or(false)
    }

    fn tmpfiles_create(&self, path: &Utf8Path) -> Result<()> {
        self.tmpfiles("--create", path).run()
    }

    fn tmpfiles_remove(&self, path: &Utf8Path) -> Result<()> {
        self.tmpfiles("--remove", path).run()
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every supervisor call; unit activity is scripted by tests.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingState {
        pub calls: Vec<String>,
        pub active: bool,
        pub failed: bool,
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingServiceManager {
        pub state: Arc<Mutex<RecordingState>>,
    }

    impl RecordingServiceManager {
        pub fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        pub fn set_active(&self, active: bool) {
            self.state.lock().unwrap().active = active;
        }

        fn log(&self, entry: String) {
            self.state.lock().unwrap().calls.push(entry);
        }
    }

    impl ServiceManager for RecordingServiceManager {
        fn daemon_reload(&self) -> Result<()> {
            self.log("daemon-reload".into());
            Ok(())
        }

        fn enable(&self, name: &str) -> Result<()> {
            self.log(format!("enable {name}"));
            Ok(())
        }

        fn disable(&self, name: &str) -> Result<()> {
            self.log(format!("disable {name}"));
            self.state.lock().unwrap().active = false;
            Ok(())
        }

        fn start(&self, name: &str) -> Result<()> {
            self.log(format!("start {name}"));
            self.state.lock().unwrap().active = true;
            Ok(())
        }

        fn stop(&self, name: &str) -> Result<()> {
            self.log(format!("stop {name}"));
            self.state.lock().unwrap().active = false;
            Ok(())
        }

        fn is_active(&self, _name: &str) -> bool {
            self.state.lock().unwrap().active
        }

        fn is_failed(&self, _name: &str) -> bool {
            self.state.lock().unwrap().failed
        }

        fn tmpfiles_create(&self, path: &Utf8Path) -> Result<()> {
            self.log(format!("tmpfiles-create {path}"));
            Ok(())
        }

        fn tmpfiles_remove(&self, path: &Utf8Path) -> Result<()> {
            self.log(format!("tmpfiles-remove {path}"));
            Ok(())
        }
    }
}
