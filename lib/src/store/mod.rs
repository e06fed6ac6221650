//! Image-level operations over the object repository.
//!
//! Every layer is a commit on branch `ociimage/<digest>`; every image is a
//! metadata-only commit on branch `ociimage/<encoded name>` whose
//! `docker.manifest` key holds the raw manifest JSON.

use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::os::unix::fs::MetadataExt;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::refenc::{self, OCIIMAGE_PREFIX};

pub mod repo;
pub use repo::{Commit, Repo, RepoMode, Transaction};

/// Commit metadata key holding the raw manifest JSON on image commits.
pub const META_MANIFEST: &str = "docker.manifest";
/// Commit metadata key holding the image digest, when known.
pub const META_DIGEST: &str = "docker.digest";
/// Commit metadata key holding a layer's digest.
pub const META_LAYER: &str = "docker.layer";
/// Commit metadata key holding a layer's apparent size.
pub const META_SIZE: &str = "docker.size";

/// Inspection data for one image branch.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    /// Preferred identity (tagged name or image id).
    pub id: String,
    /// The image id (see [`image_id`] for the derivation).
    pub image_id: String,
    /// `name:tag`, or `<none>` for bare layer branches.
    pub tag: String,
    /// Commit timestamp, UTC seconds.
    pub created: i64,
    /// Image labels from the manifest, when present.
    pub labels: BTreeMap<String, String>,
    /// The commit revision backing the branch.
    pub rev: String,
    /// Sum of the layers' apparent sizes; `None` when a layer is missing.
    pub virtual_size: Option<u64>,
}

/// Extract the ordered layer digests from a manifest: legacy `fsLayers`
/// are reversed on ingest, OCI `layers` and tarball `Layers` are in order.
pub fn layers_from_manifest(manifest: &serde_json::Value) -> Vec<String> {
    if let Some(fs_layers) = manifest.get("fsLayers").and_then(|v| v.as_array()) {
        let mut layers: Vec<String> = fs_layers
            .iter()
            .filter_map(|l| l.get("blobSum").and_then(|v| v.as_str()))
            .map(String::from)
            .collect();
        layers.reverse();
        layers
    } else if let Some(layers) = manifest.get("layers").and_then(|v| v.as_array()) {
        layers
            .iter()
            .filter_map(|l| l.get("digest").and_then(|v| v.as_str()))
            .map(String::from)
            .collect()
    } else if let Some(layers) = manifest.get("Layers").and_then(|v| v.as_array()) {
        layers
            .iter()
            .filter_map(|v| v.as_str())
            .map(String::from)
            .collect()
    } else {
        Vec::new()
    }
}

/// The raw manifest stored on an image commit, if any.
pub fn manifest_for_rev(repo: &Repo, rev: &str) -> Result<Option<String>> {
    repo.commit_metadata(rev, META_MANIFEST)
}

/// Derive the image id for a commit: the `docker.digest` metadata wins,
/// then the manifest `Digest`, then `config.digest`, falling back to the
/// commit revision itself.  `test_override` is for tests only.
pub fn image_id(
    repo: &Repo,
    rev: &str,
    manifest: Option<&serde_json::Value>,
    test_override: Option<&str>,
) -> Result<String> {
    if let Some(forced) = test_override {
        return Ok(forced.to_string());
    }
    if let Some(digest) = repo.commit_metadata(rev, META_DIGEST)? {
        return Ok(refenc::drop_sha256_prefix(&digest).to_string());
    }
    let from_manifest = manifest.and_then(|m| {
        m.get("Digest")
            .and_then(|v| v.as_str())
            .or_else(|| {
                m.get("config")
                    .and_then(|c| c.get("digest"))
                    .and_then(|v| v.as_str())
            })
    });
    Ok(from_manifest
        .map(|d| refenc::drop_sha256_prefix(d).to_string())
        .unwrap_or_else(|| rev.to_string()))
}

fn parse_manifest(manifest: &str) -> Result<serde_json::Value> {
    serde_json::from_str(manifest).context("Invalid JSON in image manifest")
}

/// Inspect one image (or layer) branch.
pub fn inspect_branch(repo: &Repo, branch: &str, test_override: Option<&str>) -> Result<ImageInfo> {
    let rev = repo
        .resolve(branch)?
        .ok_or_else(|| anyhow!("Layer not found: {branch}.  Please pull the image again"))?;
    let commit = repo.load_commit(&rev)?;
    let branch_id = refenc::decode_image_name(refenc::branch_payload(branch)?);

    let mut image_id_v = rev.clone();
    let mut id = None;
    let tag = if branch_id.len() == 64 && branch_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        image_id_v = branch_id;
        "<none>".to_string()
    } else if let Some((name, digest)) = branch_id.rsplit_once("@sha256:") {
        id = Some(branch_id.clone());
        format!("{name}:{digest}")
    } else {
        branch_id
    };

    let mut labels = BTreeMap::new();
    let mut virtual_size = None;
    if let Some(manifest) = commit.metadata.get(META_MANIFEST) {
        let manifest = parse_manifest(manifest)?;
        virtual_size = manifest_virtual_size(repo, &manifest)?;
        if let Some(l) = manifest.get("Labels").and_then(|v| v.as_object()) {
            labels = l
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect();
        }
        image_id_v = image_id(repo, &rev, Some(&manifest), test_override)?;
    }

    Ok(ImageInfo {
        id: id.unwrap_or_else(|| image_id_v.clone()),
        image_id: image_id_v,
        tag,
        created: commit.timestamp,
        labels,
        rev,
        virtual_size,
    })
}

fn manifest_virtual_size(repo: &Repo, manifest: &serde_json::Value) -> Result<Option<u64>> {
    let mut total = 0u64;
    for layer in layers_from_manifest(manifest) {
        let branch = refenc::layer_branch(&layer);
        let Some(rev) = repo.resolve(&branch)? else {
            return Ok(None);
        };
        let Some(size) = repo.commit_metadata(&rev, META_SIZE)? else {
            return Ok(None);
        };
        total += size.parse::<u64>().unwrap_or(0);
    }
    Ok(Some(total))
}

/// Enumerate image branches.  Bare layer branches are only included with
/// `get_all`.
pub fn list_images(repo: &Repo, get_all: bool, test_override: Option<&str>) -> Result<Vec<ImageInfo>> {
    let mut out = Vec::new();
    for branch in repo.list_refs(Some(OCIIMAGE_PREFIX))? {
        if !get_all && refenc::is_layer_branch(&branch) {
            continue;
        }
        out.push(inspect_branch(repo, &branch, test_override)?);
    }
    Ok(out)
}

/// Resolve a user-supplied image reference to `(branch, rev)` pairs.
///
/// The encoded name is tried first; an alphanumeric reference that does
/// not resolve is then matched as an ImageId prefix over tagged images.
/// Multiple matches are an error unless `allow_multiple`.
#[context("Resolving image {img}")]
pub fn resolve_image(
    repo: &Repo,
    img: &str,
    allow_multiple: bool,
    test_override: Option<&str>,
) -> Result<Vec<(String, String)>> {
    let branch = refenc::image_branch(img);
    if let Some(rev) = repo.resolve(&branch)? {
        return Ok(vec![(branch, rev)]);
    }
    if img.is_empty() || !img.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Ok(Vec::new());
    }
    let tagged: Vec<ImageInfo> = list_images(repo, true, test_override)?
        .into_iter()
        .filter(|i| i.tag != "<none>")
        .collect();
    let matches: Vec<&ImageInfo> = tagged
        .iter()
        .filter(|i| i.image_id.starts_with(img))
        .collect();
    if matches.len() > 1 && !allow_multiple {
        bail!("more images matching prefix `{img}`");
    }
    Ok(matches
        .into_iter()
        .map(|i| {
            let branch = format!("{}{}", OCIIMAGE_PREFIX, refenc::encode_image_name(&i.tag));
            (branch, i.rev.clone())
        })
        .collect())
}

/// The subset of a manifest's layers with no cached layer commit.
pub fn missing_layers(repo: &Repo, manifest: &serde_json::Value) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    for layer in layers_from_manifest(manifest) {
        if repo.resolve(&refenc::layer_branch(&layer))?.is_none() {
            missing.push(layer);
        }
    }
    Ok(missing)
}

/// Extract a (possibly gzip-compressed) layer tarball, skipping device,
/// socket and FIFO entries.
pub(crate) fn extract_layer_tar(tarpath: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let mut f = std::fs::File::open(tarpath).with_context(|| format!("Opening {tarpath}"))?;
    let mut magic = [0u8; 2];
    let n = f.read(&mut magic)?;
    let f = {
        use std::io::Seek;
        let mut f = f;
        f.rewind()?;
        f
    };
    let reader: Box<dyn Read> = if n == 2 && magic == [0x1f, 0x8b] {
        Box::new(flate2::read::GzDecoder::new(f))
    } else {
        Box::new(f)
    };
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);
    for entry in archive.entries()? {
        let mut entry = entry?;
        use tar::EntryType::*;
        match entry.header().entry_type() {
            Char | Block | Fifo => continue,
            _ => {
                entry.unpack_in(dest)?;
            }
        }
    }
    Ok(())
}

/// Apparent size of a directory: the sum of `lstat` sizes of regular
/// files, deduplicated by `(dev, ino)` so hard links count once.
fn directory_size(dir: &Utf8Path, seen: &mut HashSet<(u64, u64)>) -> Result<u64> {
    let mut size = 0;
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        let meta = std::fs::symlink_metadata(entry.path())?;
        if meta.is_dir() {
            size += directory_size(entry.path(), seen)?;
        } else if meta.is_file() && seen.insert((meta.dev(), meta.ino())) {
            size += meta.len();
        }
    }
    Ok(size)
}

/// Import an image: each layer tarball becomes a layer commit, then a
/// metadata-only image commit binds the manifest (and image digest, when
/// known) under `branch`.  Refs only land when the transaction commits, so
/// a failed import leaves no referenced-but-missing layers behind.
#[context("Importing image into {branch}")]
pub fn import_image(
    repo: &Repo,
    branch: &str,
    manifest: &str,
    image_digest: Option<&str>,
    layers: &BTreeMap<String, Utf8PathBuf>,
) -> Result<String> {
    let mut txn = repo.transaction();
    for (digest, tarpath) in layers {
        let digest = refenc::drop_sha256_prefix(digest);
        let scratch = repo.tempdir()?;
        let scratch_path = Utf8Path::from_path(scratch.path())
            .ok_or_else(|| anyhow!("Non-UTF-8 temporary path"))?;
        extract_layer_tar(tarpath, scratch_path)
            .with_context(|| format!("Extracting layer {digest}"))?;
        let size = directory_size(scratch_path, &mut HashSet::new())?;
        let tree = repo.write_directory(scratch_path)?;
        let commit = repo.write_commit(
            Some(tree),
            BTreeMap::from([
                (META_LAYER.to_string(), digest.to_string()),
                (META_SIZE.to_string(), size.to_string()),
            ]),
        )?;
        txn.set_ref(&refenc::layer_branch(digest), &commit);
    }

    let mut metadata = BTreeMap::from([(META_MANIFEST.to_string(), manifest.to_string())]);
    if let Some(digest) = image_digest {
        metadata.insert(META_DIGEST.to_string(), digest.to_string());
    }
    let image_commit = repo.write_commit(None, metadata)?;
    txn.set_ref(branch, &image_commit);
    txn.commit()?;
    Ok(image_commit)
}
