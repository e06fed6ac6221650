//! Encode image names as branch names in the object store.
//!
//! Branch names have a restricted character set, basically alphanumerics
//! plus `/`, `.`, `-` and `_`.  Image references such as
//! `quay.io/examplecorp/os:latest` are mapped into that set by escaping
//! every other byte as `_HH` (uppercase hex), so `:` becomes `_3A`.  The
//! mapping is a bijection on legal image names, which lets the garbage
//! collector recover the image name from a branch.

use std::fmt::Write as _;

use anyhow::{anyhow, Result};

/// Branch namespace for imported images and layers.
pub const OCIIMAGE_PREFIX: &str = "ociimage/";

/// An image name split into its registry, repository and tag parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry host, empty when the name carries none.
    pub registry: String,
    /// Repository path, e.g. `examplecorp/os`.
    pub repository: String,
    /// Tag, defaulting to `latest`.
    pub tag: String,
}

impl ImageName {
    /// Parse a user-supplied image name.  The first path segment is only
    /// treated as a registry when it contains a `.`; otherwise it is part
    /// of the repository.
    pub fn parse(name: &str) -> Self {
        let (registry, rest) = match name.split_once('/') {
            Some((first, rest)) if first.contains('.') => (first.to_string(), rest),
            _ => (String::new(), name),
        };
        let (repository, tag) = match rest.rsplit_once(':') {
            // A colon inside a path segment would belong to a port, but a
            // registry without a dot was folded into the repository above;
            // treat any colon in the remainder as the tag separator.
            Some((repo, tag)) if !tag.contains('/') && !repo.is_empty() => {
                (repo.to_string(), tag.to_string())
            }
            _ => (rest.to_string(), "latest".to_string()),
        };
        Self {
            registry,
            repository,
            tag,
        }
    }

    /// The canonical `registry/repository:tag` form (no registry part when
    /// the name carries none).
    pub fn canonical(&self) -> String {
        if self.registry.is_empty() {
            format!("{}:{}", self.repository, self.tag)
        } else {
            format!("{}/{}:{}", self.registry, self.repository, self.tag)
        }
    }
}

impl std::fmt::Display for ImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Escape a single string for use as a branch component.  Bytes matching
/// `[A-Za-z0-9.-]` pass through; everything else becomes `_HH`.
fn escape(s: &str) -> String {
    let mut r = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => r.push(b as char),
            o => write!(r, "_{:02X}", o).unwrap(),
        }
    }
    r
}

/// Reverse [`escape`].  On any malformed `_HH` sequence the input is
/// returned unchanged; such a branch can never collide with a legitimately
/// encoded name, so callers treat it as opaque.
fn unescape(s: &str) -> String {
    fn try_unescape(s: &str) -> Option<String> {
        let bytes = s.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'_' {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        String::from_utf8(out).ok()
    }
    try_unescape(s).unwrap_or_else(|| s.to_string())
}

/// Strip a `sha256:` prefix from a digest-like string.
pub fn drop_sha256_prefix(s: &str) -> &str {
    s.strip_prefix("sha256:").unwrap_or(s)
}

/// Compute the encoded (un-prefixed) branch component for an image name.
/// An `oci:` transport prefix is stripped before parsing.
pub fn encode_image_name(name: &str) -> String {
    let name = name.strip_prefix("oci:").unwrap_or(name);
    escape(&ImageName::parse(name).canonical())
}

/// Reverse [`encode_image_name`] on a branch component.
pub fn decode_image_name(encoded: &str) -> String {
    unescape(encoded)
}

/// The full branch name for an image reference.  `ostree:` references name
/// a branch directly (the part after the source repository); everything
/// else lives under [`OCIIMAGE_PREFIX`].  An `http:` prefix only marks the
/// registry as insecure and does not change the branch.
pub fn image_branch(img: &str) -> String {
    if let Some(rest) = img.strip_prefix("ostree:") {
        rest.rsplit(':').next().unwrap_or(rest).to_string()
    } else {
        let img = img.strip_prefix("http:").unwrap_or(img);
        let img = drop_sha256_prefix(img);
        format!("{}{}", OCIIMAGE_PREFIX, encode_image_name(img))
    }
}

/// The branch name caching a layer, keyed by its digest.
pub fn layer_branch(digest: &str) -> String {
    format!("{}{}", OCIIMAGE_PREFIX, drop_sha256_prefix(digest))
}

/// Remove the image prefix from a branch, failing on foreign branches.
pub fn branch_payload(branch: &str) -> Result<&str> {
    branch
        .strip_prefix(OCIIMAGE_PREFIX)
        .ok_or_else(|| anyhow!("branch does not match expected prefix {OCIIMAGE_PREFIX}: {branch}"))
}

/// Whether a branch payload is a layer digest rather than an encoded name.
pub fn is_layer_branch(branch: &str) -> bool {
    branch
        .strip_prefix(OCIIMAGE_PREFIX)
        .is_some_and(|p| p.len() == 64 && p.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, TestResult};

    #[test]
    fn test_parse_imagename() {
        let n = ImageName::parse("quay.io/examplecorp/os:42");
        assert_eq!(
            (n.registry.as_str(), n.repository.as_str(), n.tag.as_str()),
            ("quay.io", "examplecorp/os", "42")
        );
        // No tag defaults to latest
        assert_eq!(ImageName::parse("quay.io/app").canonical(), "quay.io/app:latest");
        // A first segment without a dot is part of the repository
        let n = ImageName::parse("localhost/app");
        assert_eq!(n.registry, "");
        assert_eq!(n.canonical(), "localhost/app:latest");
        assert_eq!(ImageName::parse("busybox").canonical(), "busybox:latest");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("fedora-27.1"), "fedora-27.1");
        assert_eq!(escape("quay.io/app:latest"), "quay.io_2Fapp_3Alatest");
        assert_eq!(escape("a_b"), "a_5Fb");
        for case in ["foo/bar:baz", "x:y", "_", "a b", "\u{e9}tag:1"] {
            assert_eq!(unescape(&escape(case)), case);
        }
    }

    #[test]
    fn test_unescape_malformed() {
        // Truncated or non-hex escapes return the input unchanged.
        for case in ["app_3", "app_ZZtag", "_"] {
            assert_eq!(unescape(case), case);
        }
    }

    #[test]
    fn test_branches() {
        assert_eq!(
            image_branch("example.com/app:1.0"),
            "ociimage/example.com_2Fapp_3A1.0"
        );
        // oci:/http: prefixes are stripped, ostree: names the branch itself
        assert_eq!(image_branch("oci:busybox"), image_branch("busybox"));
        assert_eq!(
            image_branch("http:example.com/app:1.0"),
            image_branch("example.com/app:1.0")
        );
        assert_eq!(image_branch("ostree:/srv/repo:main"), "main");
        let digest = "sha256:".to_string() + &"ab".repeat(32);
        assert_eq!(layer_branch(&digest), format!("ociimage/{}", "ab".repeat(32)));
        assert!(is_layer_branch(&layer_branch(&digest)));
        assert!(!is_layer_branch(&image_branch("example.com/app:1.0")));
    }

    fn roundtrip(s: String) -> TestResult {
        let escaped = escape(&s);
        TestResult::from_bool(unescape(&escaped) == s)
    }

    #[test]
    fn qcheck() {
        quickcheck(roundtrip as fn(String) -> TestResult);
    }
}
