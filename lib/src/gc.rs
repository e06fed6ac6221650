//! Garbage collection: orphaned deployments, unreferenced image and layer
//! branches, unreachable objects, and stale overlay storage.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use fn_error_context::context;

use crate::engine::Engine;
use crate::refenc::{self, OCIIMAGE_PREFIX};
use crate::store;

fn valid_encoded_name(payload: &str) -> bool {
    payload
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
}

impl Engine {
    /// Prune everything unreachable: deployment directories whose `name`
    /// symlink is gone, layer branches no manifest references, image
    /// branches with an invalid encoding, unreachable objects, and
    /// storage directories whose layer no longer resolves.
    #[context("Pruning images")]
    pub fn prune_images(&self) -> Result<()> {
        let repo = self.repo()?;

        // Deployments that lost their symlink (interrupted uninstalls).
        let checkouts = &self.config.checkout_path;
        if checkouts.exists() {
            for entry in checkouts.read_dir_utf8()? {
                let entry = entry?;
                let name = entry.file_name();
                if name.starts_with('.') {
                    continue;
                }
                let Some(container) = name
                    .strip_suffix(".0")
                    .or_else(|| name.strip_suffix(".1"))
                else {
                    continue;
                };
                if checkouts.join(container).symlink_metadata().is_ok() {
                    continue;
                }
                if !entry.path().is_dir() {
                    continue;
                }
                if let Err(e) = std::fs::remove_dir_all(entry.path()) {
                    tracing::warn!("Could not remove directory {}: {e}", entry.path());
                }
            }
        }

        // Classify branches: layer branches and invalidly encoded image
        // branches start out unreferenced; every manifest marks its
        // layers as live.
        let mut refs: BTreeMap<String, bool> = BTreeMap::new();
        let mut app_refs = Vec::new();
        for branch in repo.list_refs(Some(OCIIMAGE_PREFIX))? {
            if refenc::is_layer_branch(&branch) {
                refs.insert(branch, false);
            } else if !valid_encoded_name(refenc::branch_payload(&branch)?) {
                refs.insert(branch, false);
            } else {
                app_refs.push(branch);
            }
        }
        for app in &app_refs {
            let rev = repo
                .resolve(app)?
                .ok_or_else(|| anyhow!("Branch {app} vanished during prune"))?;
            let Some(manifest) = store::manifest_for_rev(repo, &rev)? else {
                continue;
            };
            let manifest: serde_json::Value = serde_json::from_str(&manifest)
                .with_context(|| format!("Invalid JSON in manifest of {app}"))?;
            for layer in store::layers_from_manifest(&manifest) {
                refs.insert(refenc::layer_branch(&layer), true);
            }
        }
        for (branch, live) in &refs {
            if !live {
                println!("Deleting {branch}");
                repo.set_ref(branch, None)?;
            }
        }

        let removed = repo.prune()?;
        tracing::debug!("pruned {removed} objects");
        self.prune_storage()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hostinstall::RpmHostInstall;
    use crate::refenc::image_branch;
    use crate::store::tests::{import_test_image, testrepo};
    use crate::systemd::testutil::RecordingServiceManager;
    use camino::Utf8Path;

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
    fn test_prune_unreferenced_layers_and_orphans() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let repo = testrepo(root);
        let aaa = "a".repeat(64);
        let bbb = "b".repeat(64);
        let ccc = "c".repeat(64);
        import_test_image(
            &repo,
            root,
            "example.com/app:1.0",
            &[(&aaa, &[("f1", "1")]), (&bbb, &[("f2", "2")])],
            &"1".repeat(64),
        );
        import_test_image(
            &repo,
            root,
            "example.com/app:2.0",
            &[(&aaa, &[("f1", "1")]), (&ccc, &[("f3", "3")])],
            &"2".repeat(64),
        );
        drop(repo);

        let engine = test_engine(root);
        // An orphaned deployment directory with no symlink.
        let orphan = engine.config().checkout_path.join("gone.0");
        std::fs::create_dir_all(&orphan).unwrap();
        // A deployment whose symlink still exists stays.
        let kept = engine.config().checkout_path.join("app.0");
        std::fs::create_dir_all(&kept).unwrap();
        std::os::unix::fs::symlink(&kept, engine.config().checkout_path.join("app")).unwrap();

        // Remove 1.0: its unshared layer becomes garbage.
        engine.delete_image("example.com/app:1.0").unwrap();
        engine.prune_images().unwrap();

        let repo = engine.repo().unwrap();
        assert!(repo.resolve(&crate::refenc::layer_branch(&bbb)).unwrap().is_none());
        for layer in [&aaa, &ccc] {
            assert!(
                repo.resolve(&crate::refenc::layer_branch(layer)).unwrap().is_some(),
                "{layer} must survive"
            );
        }
        assert!(repo
            .resolve(&image_branch("example.com/app:2.0"))
            .unwrap()
            .is_some());
        assert!(!orphan.exists());
        assert!(kept.exists());

        // After the union of manifests, layer branches equal exactly the
        // referenced set.
        let layer_branches: Vec<String> = repo
            .list_refs(Some(OCIIMAGE_PREFIX))
            .unwrap()
            .into_iter()
            .filter(|b| refenc::is_layer_branch(b))
            .collect();
        assert_eq!(
            layer_branches,
            vec![
                crate::refenc::layer_branch(&aaa),
                crate::refenc::layer_branch(&ccc)
            ]
        );
    }
}
