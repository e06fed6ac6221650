//! The engine instance: configuration, the lazily-opened repository, and
//! the host adapters, wired together once per invocation.

use anyhow::Result;
use once_cell::sync::OnceCell;

use crate::config::Config;
use crate::hostinstall::{HostInstall, RpmHostInstall};
use crate::runtime::{OciRuntime, BWRAP_OCI_PATH, RUNC_PATH};
use crate::store::{Repo, RepoMode};
use crate::systemd::{ServiceManager, Systemctl};

#[derive(Debug)]
pub struct Engine {
    pub(crate) config: Config,
    repo: OnceCell<Repo>,
    pub(crate) svc: Box<dyn ServiceManager>,
    pub(crate) host: Box<dyn HostInstall>,
}

impl Engine {
    /// Create an engine talking to the real host.
    pub fn new(config: Config) -> Self {
        let svc = Box::new(Systemctl::new(config.user));
        Self::with_adapters(config, svc, Box::<RpmHostInstall>::default())
    }

    /// Create an engine with explicit adapters (used by tests).
    pub fn with_adapters(
        config: Config,
        svc: Box<dyn ServiceManager>,
        host: Box<dyn HostInstall>,
    ) -> Self {
        Self {
            config,
            repo: OnceCell::new(),
            svc,
            host,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The object repository, discovered and opened (creating it when
    /// missing) on first use.
    pub fn repo(&self) -> Result<&Repo> {
        self.repo.get_or_try_init(|| {
            let location = self.config.find_repo_location()?;
            let mode = if self.config.user {
                RepoMode::BareUser
            } else {
                RepoMode::Bare
            };
            std::fs::create_dir_all(&location)?;
            Repo::open_or_create(&location, mode)
        })
    }

    /// The OCI runtime for this invocation: an explicit choice (from the
    /// command line or a deployment's info record) wins over the
    /// mode-dependent default.
    pub(crate) fn oci_runtime(&self, explicit: Option<&str>) -> OciRuntime {
        let exe = explicit
            .or(self.config.runtime.as_deref())
            .unwrap_or(if self.config.user {
                BWRAP_OCI_PATH
            } else {
                RUNC_PATH
            });
        OciRuntime::new(exe)
    }
}
