//! Client for the v2 container registry wire protocol.
//!
//! Speaks just enough of the protocol to pull: manifest fetch, blob fetch
//! with bearer-token challenge/response, manual redirect following, and a
//! bounded-concurrency parallel blob download.
//!
//! Auth: a 401 carrying `Www-Authenticate: Bearer realm=...,service=...,
//! scope=...` triggers a token fetch against `realm` and a single retry of
//! the original request; a second 401 is surfaced as
//! [`RegistryError::AuthFailed`].  Redirects are not followed by the HTTP
//! client itself: a registry's blob hop may cross hosts and must be
//! re-fetched without the Authorization header.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use tokio::sync::Mutex;

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registry authentication failed for {url}")]
    AuthFailed { url: String },

    #[error("unexpected status {status} fetching {url}")]
    Status { status: StatusCode, url: String },

    #[error("malformed bearer challenge: {0}")]
    BadChallenge(String),

    #[error("token endpoint returned no token")]
    NoToken,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, RegistryError>;

/// Key/value pairs in a challenge; values may be quoted.
static CHALLENGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)= *"?([^",]+)"?"#).unwrap());

/// A client for one registry host.
#[derive(Debug)]
pub struct Registry {
    registry: String,
    insecure: bool,
    client: Client,
    token: Arc<Mutex<Option<String>>>,
}

impl Registry {
    /// Create a client for `registry` (`host` or `host:port`).  With
    /// `insecure`, plain HTTP is used instead of HTTPS.
    pub fn new(registry: &str, insecure: bool) -> Result<Self> {
        Ok(Self {
            registry: registry.to_string(),
            insecure,
            client: Self::build_client()?,
            token: Arc::new(Mutex::new(None)),
        })
    }

    fn build_client() -> Result<Client> {
        Ok(Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?)
    }

    /// A handle with its own connection pool but the shared auth token;
    /// each parallel blob fetch owns one.
    fn fork(&self) -> Result<Self> {
        Ok(Self {
            registry: self.registry.clone(),
            insecure: self.insecure,
            client: Self::build_client()?,
            token: Arc::clone(&self.token),
        })
    }

    fn base_url(&self) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{scheme}://{}", self.registry)
    }

    /// Fetch a token per the challenge and store it for later requests.
    async fn request_token(&self, challenge: &str) -> Result<()> {
        let mut fields = HashMap::new();
        for cap in CHALLENGE_RE.captures_iter(challenge) {
            fields.insert(cap[1].to_string(), cap[2].to_string());
        }
        let realm = fields
            .get("realm")
            .ok_or_else(|| RegistryError::BadChallenge(challenge.to_string()))?;
        let mut url = reqwest::Url::parse(realm)
            .map_err(|_| RegistryError::BadChallenge(challenge.to_string()))?;
        for key in ["service", "scope"] {
            if let Some(v) = fields.get(key) {
                url.query_pairs_mut().append_pair(key, v);
            }
        }
        tracing::debug!("fetching bearer token from {url}");
        let resp = self.client.get(url).send().await?;
        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .and_then(|t| t.as_str())
            .ok_or(RegistryError::NoToken)?;
        *self.token.lock().await = Some(token.to_string());
        Ok(())
    }

    /// GET `url`, handling one bearer-auth round trip and one redirect hop.
    async fn do_request(&self, url: &str) -> Result<reqwest::Response> {
        let mut retry = true;
        loop {
            let mut req = self.client.get(url);
            if let Some(token) = self.token.lock().await.as_deref() {
                req = req.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"));
            }
            let resp = req.send().await?;
            let status = resp.status();
            if status.is_redirection() {
                // The redirect target (possibly another host) carries its
                // own authorization in the URL; fetch it directly.
                let location = resp
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RegistryError::Status {
                        status,
                        url: url.to_string(),
                    })?;
                return Ok(self.client.get(location).send().await?);
            }
            if status == StatusCode::UNAUTHORIZED {
                if !retry {
                    return Err(RegistryError::AuthFailed {
                        url: url.to_string(),
                    });
                }
                let challenge = resp
                    .headers()
                    .get(reqwest::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from);
                if let Some(challenge) = challenge.filter(|c| c.contains("Bearer")) {
                    self.request_token(&challenge).await?;
                    retry = false;
                    continue;
                }
            }
            return Ok(resp);
        }
    }

    /// Fetch the manifest for `image:tag`; `None` unless the registry
    /// answers 200.
    pub async fn manifest(&self, image: &str, tag: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/v2/{image}/manifests/{tag}", self.base_url());
        let resp = self.do_request(&url).await?;
        if resp.status() == StatusCode::OK {
            Ok(Some(resp.bytes().await?.to_vec()))
        } else {
            Ok(None)
        }
    }

    /// The ordered layer digests of `image:tag`, or `None` when the
    /// manifest is unavailable.
    pub async fn layers(&self, image: &str, tag: &str) -> Result<Option<Vec<String>>> {
        let Some(manifest) = self.manifest(image, tag).await? else {
            return Ok(None);
        };
        let manifest: serde_json::Value = serde_json::from_slice(&manifest)
            .map_err(|e| RegistryError::Io(std::io::Error::other(e)))?;
        Ok(Some(crate::store::layers_from_manifest(&manifest)))
    }

    async fn fetch_blob(&self, image: &str, digest: &str, out: &mut dyn Write) -> Result<()> {
        let url = format!("{}/v2/{image}/blobs/{digest}", self.base_url());
        let resp = self.do_request(&url).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RegistryError::Status { status, url });
        }
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            out.write_all(&chunk?)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Stream the blob `digest` of `image` into `path`.
    pub async fn fetch_layer(
        &self,
        image: &str,
        digest: &str,
        path: &camino::Utf8Path,
    ) -> Result<()> {
        let mut f = std::fs::File::create(path)?;
        self.fetch_blob(image, digest, &mut f).await
    }

    /// Fetch several blobs concurrently, bounded to three in-flight
    /// requests, each worker with its own connection and temporary file.
    /// Completion order is unspecified; the map is keyed by digest.
    pub async fn fetch_layers(
        &self,
        image: &str,
        layers: &[String],
    ) -> Result<HashMap<String, tempfile::NamedTempFile>> {
        let fetches = layers.iter().map(|digest| {
            let digest = digest.clone();
            let image = image.to_string();
            let forked = self.fork();
            async move {
                let reg = forked?;
                let mut tmp = tempfile::NamedTempFile::new()?;
                reg.fetch_blob(&image, &digest, tmp.as_file_mut()).await?;
                Ok::<_, RegistryError>((digest, tmp))
            }
        });
        let mut stream = futures_util::stream::iter(fetches).buffer_unordered(3);
        let mut out = HashMap::new();
        while let Some(result) = stream.next().await {
            let (digest, tmp) = result?;
            out.insert(digest, tmp);
        }
        Ok(out)
    }
}
