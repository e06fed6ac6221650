//! Per-layer storage for overlay mounts.
//!
//! One-shot execution does not need a full checkout: each layer is
//! materialized once under `<checkout-root>/.storage/<digest>/` and an
//! overlay mount assembles the stack read-only.

use anyhow::{anyhow, bail, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use syscon_utils::Task;

use crate::engine::Engine;
use crate::refenc;
use crate::store;

impl Engine {
    /// Materialize every layer of `img` under the storage root and return
    /// the layer directories in manifest order.
    #[context("Preparing storage for {img}")]
    pub(crate) fn ensure_storage_for_image(&self, img: &str) -> Result<Vec<Utf8PathBuf>> {
        let repo = self.repo()?;
        let resolved =
            store::resolve_image(repo, img, false, self.config.test_image_id.as_deref())?;
        let Some((_, rev)) = resolved.into_iter().next() else {
            bail!("Image {img} not found");
        };
        let manifest = store::manifest_for_rev(repo, &rev)?
            .ok_or_else(|| anyhow!("Image `{img}` not present"))?;
        let manifest: serde_json::Value = serde_json::from_str(&manifest)?;

        let storage_path = self.config.storage_path();
        let mut layers_dir = Vec::new();
        for layer in store::layers_from_manifest(&manifest) {
            let layer = refenc::drop_sha256_prefix(&layer).to_string();
            let rootfs = storage_path.join(&layer);
            if !rootfs.exists() {
                let layer_rev = repo.resolve(&refenc::layer_branch(&layer))?.ok_or_else(|| {
                    anyhow!("Layer not found: {layer}.  Please pull the image again")
                })?;
                std::fs::create_dir_all(&rootfs)?;
                repo.checkout_commit(&layer_rev, &rootfs)?;
            }
            layers_dir.push(rootfs);
        }
        Ok(layers_dir)
    }

    /// Assemble an overlay mount of `img` at `destination`.  Without an
    /// `upperdir` the mount is read-only.
    pub(crate) fn mount_from_storage(
        &self,
        img: &str,
        destination: &Utf8Path,
        upperdir: Option<&Utf8Path>,
        workdir: Option<&Utf8Path>,
    ) -> Result<()> {
        let layers = self.ensure_storage_for_image(img)?;
        let lowerdir = layers
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(":");
        let options = match (upperdir, workdir) {
            (Some(upper), Some(work)) => {
                format!("-olowerdir={lowerdir},upperdir={upper},workdir={work}")
            }
            _ => format!("-olowerdir={lowerdir}"),
        };
        Task::new(format!("Mounting overlay at {destination}"), "mount")
            .quiet()
            .quiet_output()
            .args(["-t", "overlay", "overlay", options.as_str(), destination.as_str()])
            .run()
    }

    pub(crate) fn umount(&self, destination: &Utf8Path) -> Result<()> {
        Task::new(format!("Unmounting {destination}"), "umount")
            .quiet()
            .quiet_output()
            .arg(destination)
            .run()
    }

    /// Drop storage directories whose layer no longer resolves.
    pub(crate) fn prune_storage(&self) -> Result<()> {
        let storage = self.config.storage_path();
        if !storage.exists() {
            return Ok(());
        }
        let repo = self.repo()?;
        for entry in storage.read_dir_utf8()? {
            let entry = entry?;
            let name = entry.file_name();
            if name == "ostree" {
                continue;
            }
            if repo.resolve(&refenc::layer_branch(name))?.is_none() {
                std::fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::engine::Engine;
    use crate::hostinstall::RpmHostInstall;
    use crate::store::tests::{import_test_image, testrepo};
    use crate::systemd::testutil::RecordingServiceManager;

    fn test_engine(root: &Utf8Path) -> Engine {
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
            runtime: None,
            test_image_id: None,
        };
        Engine::with_adapters(
            config,
            Box::new(RecordingServiceManager::default()),
            Box::new(RpmHostInstall),
        )
    }

    #[test]
    fn test_storage_materialize_and_prune() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let repo = testrepo(root);
        let aaa = "a".repeat(64);
        let bbb = "b".repeat(64);
        import_test_image(
            &repo,
            root,
            "example.com/app:1.0",
            &[
                (&aaa, &[("usr/bin/app", "x")]),
                (&bbb, &[("etc/conf", "y")]),
            ],
            &"c".repeat(64),
        );
        drop(repo);

        let engine = test_engine(root);
        let layers = engine.ensure_storage_for_image("example.com/app:1.0").unwrap();
        assert_eq!(layers.len(), 2);
        assert!(layers[0].ends_with(&aaa));
        assert!(layers[0].join("usr/bin/app").exists());
        assert!(layers[1].join("etc/conf").exists());

        // An unreferenced storage directory is collected
        let stale = engine.config().storage_path().join("d".repeat(64));
        std::fs::create_dir_all(&stale).unwrap();
        engine.prune_storage().unwrap();
        assert!(!stale.exists());
        assert!(layers[0].exists());
    }
}
