//! Ingest images into the object store.
//!
//! Four entry points, selected by the reference prefix:
//!
//! - `ostree:<repo path>:<branch>` pulls a branch from another repository
//!   on the local filesystem.
//! - `docker:<name>:<tag>` asks the Docker daemon to `save` the image and
//!   falls through to the tarball path.
//! - `dockertar:/<path>` ingests a docker-save tarball.
//! - anything else is fetched from its registry with the v2 protocol.

use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, bail, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;
use syscon_utils::Task;

use crate::engine::Engine;
use crate::refenc::{self, ImageName};
use crate::registry::Registry;
use crate::store::{self, Repo};

/// One entry of a docker-save `manifest.json`.
#[derive(Debug, Deserialize)]
struct DockerSaveEntry {
    #[serde(rename = "Config")]
    config: Option<String>,
    #[serde(rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// The per-layer `json` metadata inside a docker-save tarball.
#[derive(Debug, Deserialize)]
struct DockerLayerMeta {
    parent: Option<String>,
}

impl Engine {
    /// Pull `image` into the store.  Returns the name the image was
    /// registered under (tarball ingests may rename).
    #[context("Pulling {image}")]
    pub async fn pull_image(&self, image: &str, upgrade: bool) -> Result<String> {
        let mut image = image.to_string();
        if image.starts_with("ostree:") && image.matches(':').count() > 1 {
            self.pull_ostree_branch(&image, upgrade)?;
        } else if image.starts_with("docker:") && image.matches(':').count() > 1 {
            image = self.pull_docker_image(image.strip_prefix("docker:").unwrap())?;
        } else if let Some(tarpath) = image.strip_prefix("dockertar:/") {
            let default_name = Utf8Path::new(tarpath)
                .file_name()
                .unwrap_or("image")
                .trim_end_matches(".tar")
                .to_string();
            image = self.pull_docker_tar(Utf8Path::new(tarpath), &default_name)?;
        } else {
            self.pull_oci_registry(&image, upgrade).await?;
        }
        Ok(image)
    }

    /// `ostree:<repo path>:<branch>`: copy the branch from a repository
    /// on the local filesystem.
    fn pull_ostree_branch(&self, image: &str, upgrade: bool) -> Result<()> {
        let rest = image.strip_prefix("ostree:").unwrap();
        let (src, branch) = rest
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Invalid reference {image}"))?;
        let repo = self.repo()?;
        if !upgrade && repo.resolve(branch)?.is_some() {
            return Ok(());
        }
        let src_repo = Repo::open(Utf8Path::new(src))?;
        repo.pull_local(&src_repo, branch)?;
        Ok(())
    }

    /// Fetch manifest and missing blobs from the registry and import.
    async fn pull_oci_registry(&self, image: &str, upgrade: bool) -> Result<()> {
        let repo = self.repo()?;
        let branch = refenc::image_branch(image);

        // Already present with all layers cached: nothing to do.
        if !upgrade {
            if let Some(rev) = repo.resolve(&branch)? {
                if let Some(manifest) = store::manifest_for_rev(repo, &rev)? {
                    let manifest: serde_json::Value = serde_json::from_str(&manifest)
                        .context("Invalid JSON in image manifest")?;
                    if store::missing_layers(repo, &manifest)?.is_empty() {
                        return Ok(());
                    }
                }
            }
        }

        let (insecure, name) = match image.strip_prefix("http:") {
            Some(rest) => (true, rest),
            None => (false, image),
        };
        let name = ImageName::parse(name.strip_prefix("oci:").unwrap_or(name));
        if name.registry.is_empty() {
            bail!("The image `{image}` is not fully qualified");
        }
        let registry = Registry::new(&name.registry, insecure)?;
        let manifest_bytes = registry
            .manifest(&name.repository, &name.tag)
            .await
            .with_context(|| format!("Fetching manifest for {image}"))?
            .ok_or_else(|| anyhow!("Unable to find {image}"))?;
        let manifest_str = String::from_utf8(manifest_bytes).context("Non-UTF-8 manifest")?;
        let manifest: serde_json::Value =
            serde_json::from_str(&manifest_str).context("Invalid JSON in image manifest")?;

        let missing = store::missing_layers(repo, &manifest)?;
        for layer in &missing {
            println!("Pulling layer {}", refenc::drop_sha256_prefix(layer));
        }
        let fetched = registry
            .fetch_layers(&name.repository, &missing)
            .await
            .with_context(|| format!("Fetching layers for {image}"))?;
        let mut layers = BTreeMap::new();
        for (digest, tmp) in &fetched {
            let path = Utf8Path::from_path(tmp.path())
                .ok_or_else(|| anyhow!("Non-UTF-8 temporary path"))?;
            layers.insert(digest.clone(), path.to_owned());
        }
        store::import_image(repo, &branch, &manifest_str, None, &layers)?;
        Ok(())
    }

    /// `docker:<name>`: export the image from the Docker daemon and
    /// ingest the tarball.
    fn pull_docker_image(&self, image: &str) -> Result<String> {
        let tmp = tempfile::NamedTempFile::new()?;
        let tarpath = Utf8Path::from_path(tmp.path())
            .ok_or_else(|| anyhow!("Non-UTF-8 temporary path"))?;
        Task::new(format!("Exporting {image} from the Docker daemon"), "docker")
            .quiet_output()
            .args(["save", "-o", tarpath.as_str(), image])
            .run()?;
        self.pull_docker_tar(tarpath, image)
    }

    /// Ingest a docker-save tarball.
    #[context("Importing tarball {tarpath}")]
    fn pull_docker_tar(&self, tarpath: &Utf8Path, default_name: &str) -> Result<String> {
        let repo = self.repo()?;
        let scratch = repo.tempdir()?;
        let scratch = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| anyhow!("Non-UTF-8 temporary path"))?;
        store::extract_layer_tar(tarpath, scratch)?;

        let manifest_file = scratch.join("manifest.json");
        if manifest_file.exists() {
            let raw = std::fs::read_to_string(&manifest_file)?;
            let entries: Vec<DockerSaveEntry> =
                serde_json::from_str(&raw).context("Invalid manifest.json in tarball")?;
            let mut imagename = default_name.to_string();
            for entry in entries {
                let labels = match &entry.config {
                    Some(config) => {
                        let raw = std::fs::read_to_string(scratch.join(config))?;
                        let config: serde_json::Value = serde_json::from_str(&raw)
                            .context("Invalid image configuration in tarball")?;
                        config
                            .pointer("/config/Labels")
                            .and_then(|v| v.as_object())
                            .map(|o| {
                                o.iter()
                                    .filter_map(|(k, v)| {
                                        v.as_str().map(|v| (k.clone(), v.to_string()))
                                    })
                                    .collect::<BTreeMap<_, _>>()
                            })
                            .unwrap_or_default()
                    }
                    None => BTreeMap::new(),
                };
                imagename = entry
                    .repo_tags
                    .as_ref()
                    .and_then(|t| t.first().cloned())
                    .unwrap_or_else(|| default_name.to_string());
                let branch = refenc::image_branch(&imagename);
                self.pull_dockertar_layers(repo, &branch, scratch, &entry.layers, labels)?;
            }
            Ok(imagename)
        } else {
            // Older docker-save layout: a `repositories` file and one
            // directory per layer.
            let raw = std::fs::read_to_string(scratch.join("repositories"))
                .context("Tarball carries neither manifest.json nor repositories")?;
            let repositories: serde_json::Value = serde_json::from_str(&raw)?;
            let imagename = repositories
                .as_object()
                .and_then(|o| o.keys().next().cloned())
                .ok_or_else(|| anyhow!("No image name in repositories file"))?;
            let mut input_layers = Vec::new();
            for entry in scratch.read_dir_utf8()? {
                let entry = entry?;
                if entry.file_name() == "repositories" {
                    continue;
                }
                if entry.file_type()?.is_dir() {
                    input_layers.push(format!("{}/layer.tar", entry.file_name()));
                }
            }
            let branch = refenc::image_branch(&imagename);
            self.pull_dockertar_layers(repo, &branch, scratch, &input_layers, BTreeMap::new())?;
            Ok(imagename)
        }
    }

    /// Order the extracted layers by their `parent` links, digest each
    /// tarball, synthesize a manifest and import.
    fn pull_dockertar_layers(
        &self,
        repo: &Repo,
        branch: &str,
        scratch: &Utf8Path,
        input_layers: &[String],
        labels: BTreeMap<String, String>,
    ) -> Result<()> {
        let mut tar_for_layer = HashMap::new();
        let mut child_of: HashMap<String, String> = HashMap::new();
        let mut base_layer = None;
        for input in input_layers {
            let layer = input.trim_end_matches("/layer.tar").to_string();
            tar_for_layer.insert(layer.clone(), scratch.join(input));
            let meta_raw = std::fs::read_to_string(scratch.join(&layer).join("json"))
                .with_context(|| format!("Reading metadata for layer {layer}"))?;
            let meta: DockerLayerMeta = serde_json::from_str(&meta_raw)
                .with_context(|| format!("Invalid metadata for layer {layer}"))?;
            match meta.parent {
                Some(parent) => {
                    child_of.insert(parent, layer);
                }
                None => base_layer = Some(layer),
            }
        }

        let mut digest_for_layer = HashMap::new();
        for (layer, tar) in &tar_for_layer {
            digest_for_layer.insert(layer.clone(), self.tar_digest(tar)?);
        }

        // Walk the parent chain from the base; the bound catches cycles.
        let mut ordered = Vec::new();
        let mut cursor = base_layer;
        while let Some(layer) = cursor {
            if ordered.len() > tar_for_layer.len() {
                bail!("Layer parent links form a cycle");
            }
            ordered.push(
                digest_for_layer
                    .get(&layer)
                    .cloned()
                    .ok_or_else(|| anyhow!("Unknown layer {layer} in parent chain"))?,
            );
            cursor = child_of.get(&layer).cloned();
        }
        if ordered.len() != tar_for_layer.len() {
            bail!("Layer parent links do not connect all layers");
        }

        let manifest = serde_json::json!({"Layers": ordered, "Labels": labels});
        let mut layers = BTreeMap::new();
        for (layer, tar) in &tar_for_layer {
            layers.insert(digest_for_layer[layer].clone(), tar.clone());
        }
        store::import_image(repo, branch, &manifest.to_string(), None, &layers)?;
        Ok(())
    }

    /// Digest a layer tarball via the libexec helper.
    fn tar_digest(&self, tarpath: &Utf8Path) -> Result<String> {
        let helper = self.config.libexec_dir.join("dockertar-sha256-helper");
        let out = Task::new(format!("Computing digest of {tarpath}"), helper.as_str())
            .quiet()
            .quiet_output()
            .arg(tarpath)
            .read()?;
        let digest = out.trim().to_string();
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("Unexpected digest helper output: {digest}");
        }
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hostinstall::RpmHostInstall;
    use crate::store::tests::make_layer_tar;
    use crate::systemd::testutil::RecordingServiceManager;
    use camino::Utf8PathBuf;
    use std::os::unix::fs::PermissionsExt;

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

    /// A digest helper backed by sha256sum.
    fn install_digest_helper(libexec: &Utf8Path) {
        std::fs::create_dir_all(libexec).unwrap();
        let helper = libexec.join("dockertar-sha256-helper");
        std::fs::write(&helper, "#!/bin/sh\nsha256sum \"$1\" | cut -d' ' -f1\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// Build a docker-save style tarball with two parent-linked layers.
    fn make_docker_save_tar(root: &Utf8Path) -> Utf8PathBuf {
        let stage = root.join("save");
        std::fs::create_dir_all(stage.join("l1")).unwrap();
        std::fs::create_dir_all(stage.join("l2")).unwrap();
        make_layer_tar(&stage.join("l1/layer.tar"), &[("usr/bin/app", "base")]);
        make_layer_tar(&stage.join("l2/layer.tar"), &[("etc/conf", "top")]);
        std::fs::write(stage.join("l1/json"), r#"{}"#).unwrap();
        std::fs::write(stage.join("l2/json"), r#"{"parent": "l1"}"#).unwrap();
        std::fs::write(
            stage.join("config.json"),
            r#"{"config": {"Labels": {"atomic.type": "system"}}}"#,
        )
        .unwrap();
        std::fs::write(
            stage.join("manifest.json"),
            r#"[{"Config": "config.json", "RepoTags": ["example.com/saved:1.0"], "Layers": ["l1/layer.tar", "l2/layer.tar"]}]"#,
        )
        .unwrap();

        let out = root.join("saved.tar");
        let mut builder = tar::Builder::new(std::fs::File::create(&out).unwrap());
        builder.append_dir_all(".", &stage).unwrap();
        builder.finish().unwrap();
        out
    }

    #[tokio::test]
    async fn test_pull_dockertar() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let engine = test_engine(root);
        install_digest_helper(&engine.config().libexec_dir.clone());
        let tar = make_docker_save_tar(root);

        let name = engine
            .pull_image(&format!("dockertar:/{tar}"), false)
            .await
            .unwrap();
        assert_eq!(name, "example.com/saved:1.0");

        let repo = engine.repo().unwrap();
        let branch = refenc::image_branch(&name);
        let rev = repo.resolve(&branch).unwrap().unwrap();
        let manifest = store::manifest_for_rev(repo, &rev).unwrap().unwrap();
        let manifest: serde_json::Value = serde_json::from_str(&manifest).unwrap();
        // Parent links order the base layer first, and labels survive.
        let layers = store::layers_from_manifest(&manifest);
        assert_eq!(layers.len(), 2);
        assert_eq!(manifest["Labels"]["atomic.type"], "system");
        for layer in &layers {
            assert!(repo.resolve(&refenc::layer_branch(layer)).unwrap().is_some());
        }
        // The first layer holds the base content
        let base_rev = repo
            .resolve(&refenc::layer_branch(&layers[0]))
            .unwrap()
            .unwrap();
        let out = root.join("out");
        repo.checkout_commit(&base_rev, &out).unwrap();
        assert_eq!(std::fs::read_to_string(out.join("usr/bin/app")).unwrap(), "base");
    }

    #[tokio::test]
    async fn test_pull_ostree_branch() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let src = Repo::create(&root.join("src"), crate::store::RepoMode::BareUser).unwrap();
        let content = root.join("content");
        std::fs::create_dir_all(&content).unwrap();
        std::fs::write(content.join("data"), "x").unwrap();
        let tree = src.write_directory(&content).unwrap();
        let commit = src.write_commit(Some(tree), BTreeMap::new()).unwrap();
        src.set_ref("main", Some(&commit)).unwrap();

        let engine = test_engine(root);
        let image = format!("ostree:{}:main", root.join("src"));
        engine.pull_image(&image, false).await.unwrap();
        assert_eq!(
            engine.repo().unwrap().resolve("main").unwrap().unwrap(),
            commit
        );
        // The branch also resolves as an image reference
        assert_eq!(refenc::image_branch(&image), "main");
    }
}
