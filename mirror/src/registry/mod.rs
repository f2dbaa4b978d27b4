//! Registry access.
//!
//! [`ImageRepo`] is the capability surface the rest of the engine is
//! written against; [`RegistryClient`] is the production implementation on
//! top of the OCI distribution protocol. An in-memory implementation for
//! tests lives in [`crate::testing`].

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use http::header::HeaderValue;
use log::trace;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::secrets::RegistryAuth;
use oci_client::Reference;

use commons::MirrorError;

use crate::image::{
    Image, ImageBlob, ManifestDescriptor, ManifestDoc, ALL_MANIFEST_MEDIA_TYPES,
};

/// Tag-listing page size.
const TAGS_PAGE_SIZE: usize = 100;

/// Fixed username carried by license-token authentication.
pub const LICENSE_TOKEN_USER: &str = "license-token";

/// Authentication modes against a registry endpoint.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    Anonymous,
    Basic { username: String, password: String },
    /// A product license token, sent as HTTP Basic with a fixed user.
    License { token: String },
}

// Secrets stay out of debug dumps.
impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMode::Anonymous => write!(f, "Anonymous"),
            AuthMode::Basic { username, .. } => {
                write!(f, "Basic {{ username: {:?}, password: <redacted> }}", username)
            }
            AuthMode::License { .. } => write!(f, "License {{ token: <redacted> }}"),
        }
    }
}

/// Transport configuration for one registry endpoint.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Accept any certificate chain and hostname.
    pub skip_tls_verify: bool,
    pub auth: AuthMode,
    /// Fan-out over layer blobs of a single image.
    pub blob_concurrency: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            insecure: false,
            skip_tls_verify: false,
            auth: AuthMode::Anonymous,
            blob_concurrency: 4,
        }
    }
}

/// Capability surface the transfer engine needs from a registry.
#[async_trait]
pub trait ImageRepo: Send + Sync {
    /// Derive a client scoped one repository path segment deeper.
    /// An empty segment yields a clone of the current scope.
    fn with_segment(&self, segment: &str) -> Box<dyn ImageRepo>;

    /// `host[:port][/path]` of the current scope.
    fn registry(&self) -> String;

    /// All tags of the scoped repository.
    async fn list_tags(&self) -> Result<Vec<String>, MirrorError>;

    /// Whether `tag` (a tag name or a `sha256:` digest) resolves.
    async fn check_image_exists(&self, tag: &str) -> Result<bool, MirrorError>;

    /// Resolve a tag to its manifest digest without downloading it.
    async fn get_manifest_digest(&self, tag: &str) -> Result<String, MirrorError>;

    /// Download the raw manifest bytes and their digest, nothing else.
    async fn get_manifest(&self, tag: &str) -> Result<(Vec<u8>, String), MirrorError>;

    /// Download the manifest and every blob it references.
    async fn get_image(&self, tag: &str) -> Result<Image, MirrorError>;

    /// Upload an image, blobs first, manifest last.
    async fn push_image(&self, tag: &str, image: &Image) -> Result<(), MirrorError>;
}

/// Production registry client speaking the OCI distribution protocol.
#[derive(Clone)]
pub struct RegistryClient {
    client: oci_client::Client,
    auth: RegistryAuth,
    host: String,
    repo: String,
    blob_concurrency: usize,
}

impl RegistryClient {
    /// Build a client scoped at `base` (`host[:port][/path...]`).
    ///
    /// A scheme prefix in `base` is tolerated and stripped; the `insecure`
    /// flag alone selects the wire scheme.
    pub fn new(base: &str, cfg: &RegistryConfig) -> anyhow::Result<Self> {
        let base = base
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_matches('/');
        anyhow::ensure!(!base.is_empty(), "empty registry address");

        let (host, repo) = match base.split_once('/') {
            Some((host, repo)) => (host.to_string(), repo.to_string()),
            None => (base.to_string(), String::new()),
        };

        let client_config = ClientConfig {
            protocol: if cfg.insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: cfg.skip_tls_verify,
            ..Default::default()
        };

        let auth = match &cfg.auth {
            AuthMode::Anonymous => RegistryAuth::Anonymous,
            AuthMode::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            AuthMode::License { token } => {
                RegistryAuth::Basic(LICENSE_TOKEN_USER.to_string(), token.clone())
            }
        };

        Ok(RegistryClient {
            client: oci_client::Client::new(client_config),
            auth,
            host,
            repo,
            blob_concurrency: cfg.blob_concurrency.max(1),
        })
    }

    fn reference(&self, tag_or_digest: &str) -> Reference {
        if tag_or_digest.starts_with("sha256:") {
            Reference::with_digest(
                self.host.clone(),
                self.repo.clone(),
                tag_or_digest.to_string(),
            )
        } else {
            Reference::with_tag(
                self.host.clone(),
                self.repo.clone(),
                tag_or_digest.to_string(),
            )
        }
    }

    async fn fetch_manifest_raw(
        &self,
        tag_or_digest: &str,
    ) -> Result<(Vec<u8>, String), MirrorError> {
        self.client
            .pull_manifest_raw(
                &self.reference(tag_or_digest),
                &self.auth,
                ALL_MANIFEST_MEDIA_TYPES,
            )
            .await
            .map(|(bytes, digest)| (bytes.to_vec(), digest))
            .map_err(|e| classify(&format!("{}:{}", self.registry(), tag_or_digest), e))
    }

    async fn fetch_blob(&self, desc: &ManifestDescriptor) -> Result<ImageBlob, MirrorError> {
        let mut data = Vec::new();
        self.client
            .pull_blob(&self.reference(&desc.digest), desc.digest.as_str(), &mut data)
            .await
            .map_err(|e| classify(&format!("{}@{}", self.registry(), desc.digest), e))?;
        Ok(ImageBlob::with_digest(
            &desc.digest,
            desc.media_type_or_default(),
            data,
        ))
    }
}

#[async_trait]
impl ImageRepo for RegistryClient {
    fn with_segment(&self, segment: &str) -> Box<dyn ImageRepo> {
        let mut scoped = self.clone();
        if !segment.is_empty() {
            scoped.repo = if scoped.repo.is_empty() {
                segment.to_string()
            } else {
                format!("{}/{}", scoped.repo, segment)
            };
        }
        Box::new(scoped)
    }

    fn registry(&self) -> String {
        if self.repo.is_empty() {
            self.host.clone()
        } else {
            format!("{}/{}", self.host, self.repo)
        }
    }

    async fn list_tags(&self) -> Result<Vec<String>, MirrorError> {
        let mut tags = Vec::new();
        let mut last: Option<String> = None;
        loop {
            let page = self
                .client
                .list_tags(
                    &self.reference("latest"),
                    &self.auth,
                    Some(TAGS_PAGE_SIZE),
                    last.as_deref(),
                )
                .await
                .map_err(|e| classify(&self.registry(), e))?
                .tags;
            if page.is_empty() {
                break;
            }
            last = page.last().cloned();
            let full_page = page.len() == TAGS_PAGE_SIZE;
            tags.extend(page);
            if !full_page {
                break;
            }
        }
        Ok(tags)
    }

    async fn check_image_exists(&self, tag: &str) -> Result<bool, MirrorError> {
        match self.get_manifest_digest(tag).await {
            Ok(_) => Ok(true),
            Err(MirrorError::ImageNotFound(_)) | Err(MirrorError::RepoNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_manifest_digest(&self, tag: &str) -> Result<String, MirrorError> {
        self.client
            .fetch_manifest_digest(&self.reference(tag), &self.auth)
            .await
            .map_err(|e| classify(&format!("{}:{}", self.registry(), tag), e))
    }

    async fn get_manifest(&self, tag: &str) -> Result<(Vec<u8>, String), MirrorError> {
        self.fetch_manifest_raw(tag).await
    }

    async fn get_image(&self, tag: &str) -> Result<Image, MirrorError> {
        let (manifest, digest) = self.fetch_manifest_raw(tag).await?;
        let doc = ManifestDoc::parse(&manifest)
            .map_err(|e| MirrorError::Fatal(format!("{}: {}", self.registry(), e)))?;

        // Resolve all nested manifests up front so the blob fetch below is a
        // flat, bounded fan-out.
        let mut descriptors: Vec<ManifestDescriptor> = Vec::new();
        let mut nested: Vec<(ManifestDescriptor, Vec<u8>)> = Vec::new();
        if doc.is_index() {
            for child in &doc.manifests {
                let (child_bytes, _) = self.fetch_manifest_raw(&child.digest).await?;
                let child_doc = ManifestDoc::parse(&child_bytes)
                    .map_err(|e| MirrorError::Fatal(format!("{}: {}", self.registry(), e)))?;
                descriptors.extend(child_doc.data_descriptors().into_iter().cloned());
                nested.push((child.clone(), child_bytes));
            }
        } else {
            descriptors.extend(doc.data_descriptors().into_iter().cloned());
        }

        let fetched: Vec<ImageBlob> = stream::iter(descriptors.clone())
            .map(|desc| async move { self.fetch_blob(&desc).await })
            .buffered(self.blob_concurrency)
            .try_collect()
            .await?;

        // Children's data blobs first, then each child manifest, so the blob
        // vector replays cleanly on push.
        let mut blobs = fetched;
        for (child, child_bytes) in nested {
            blobs.push(ImageBlob::with_digest(
                &child.digest,
                child.media_type_or_default(),
                child_bytes,
            ));
        }

        trace!(
            "[{}:{}] fetched manifest {} with {} blobs",
            self.registry(),
            tag,
            digest,
            blobs.len()
        );

        let media_type = doc
            .media_type
            .clone()
            .unwrap_or_else(|| crate::image::MEDIA_TYPE_DOCKER_MANIFEST.to_string());
        Ok(Image {
            digest,
            media_type,
            manifest,
            blobs,
        })
    }

    async fn push_image(&self, tag: &str, image: &Image) -> Result<(), MirrorError> {
        let reference = self.reference(tag);

        // Data blobs fan out; content addressing makes re-uploads no-ops.
        let data_blobs: Vec<&ImageBlob> = image.blobs.iter().filter(|b| !b.is_manifest()).collect();
        stream::iter(data_blobs.into_iter().map(Ok::<_, MirrorError>))
            .try_for_each_concurrent(self.blob_concurrency, |blob| {
                let reference = reference.clone();
                async move {
                    if let Ok(true) = self.client.blob_exists(&reference, &blob.digest).await {
                        trace!("[{}] blob {} already present", self.registry(), blob.digest);
                        return Ok(());
                    }
                    self.client
                        .push_blob(&reference, blob.data.clone(), &blob.digest)
                        .await
                        .map(|_| ())
                        .map_err(|e| classify(&format!("{}@{}", self.registry(), blob.digest), e))
                }
            })
            .await?;

        // Nested manifests next, in stored order, addressed by digest.
        for blob in image.blobs.iter().filter(|b| b.is_manifest()) {
            self.client
                .push_manifest_raw(
                    &self.reference(&blob.digest),
                    blob.data.clone(),
                    media_type_header(&blob.media_type)?,
                )
                .await
                .map_err(|e| classify(&format!("{}@{}", self.registry(), blob.digest), e))?;
        }

        // The top-level manifest seals the image under its tag.
        self.client
            .push_manifest_raw(
                &reference,
                image.manifest.clone(),
                media_type_header(&image.media_type)?,
            )
            .await
            .map_err(|e| classify(&format!("{}:{}", self.registry(), tag), e))?;
        Ok(())
    }
}

fn media_type_header(media_type: &str) -> Result<HeaderValue, MirrorError> {
    HeaderValue::from_str(media_type)
        .map_err(|e| MirrorError::Fatal(format!("invalid media type '{}': {}", media_type, e)))
}

/// Normalize a transport error into the classified taxonomy.
///
/// Classification is string-based on purpose: registry error envelopes,
/// reqwest and TLS failures all end up flattened into messages, and the
/// distribution-spec error codes (`MANIFEST_UNKNOWN`, `NAME_UNKNOWN`, ...)
/// are stable text.
fn classify(what: &str, err: oci_client::errors::OciDistributionError) -> MirrorError {
    classify_message(what, &err.to_string())
}

fn classify_message(what: &str, raw: &str) -> MirrorError {
    let text = raw.to_lowercase();
    let msg = format!("{}: {}", what, raw);

    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&[
        "certificate",
        "unknown issuer",
        "self signed",
        "self-signed",
        "tls handshake",
        "hostname mismatch",
    ]) {
        MirrorError::CertificateUntrusted(msg)
    } else if has(&[
        "unauthorized",
        "authentication",
        "401",
        "403",
        "forbidden",
        "denied",
    ]) {
        MirrorError::Unauthorized(msg)
    } else if has(&["name_unknown", "name unknown", "repository not found"]) {
        MirrorError::RepoNotFound(msg)
    } else if has(&[
        "manifest_unknown",
        "manifest unknown",
        "not found",
        "notfound",
        "404",
    ]) {
        MirrorError::ImageNotFound(msg)
    } else if has(&["manifest_invalid", "manifest invalid", "media type", "unsupported"]) {
        MirrorError::UnsupportedMediaType(msg)
    } else if has(&[
        "dns",
        "connect",
        "connection",
        "timed out",
        "timeout",
        "unreachable",
        "reset",
        "broken pipe",
        "network",
    ]) {
        MirrorError::NetworkUnavailable(msg)
    } else {
        MirrorError::Fatal(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_message() {
        let cases = vec![
            ("invalid peer certificate: UnknownIssuer", "tls"),
            ("server error 401 Unauthorized", "auth"),
            ("requested access to the resource is denied", "auth"),
            ("OCI API error: NAME_UNKNOWN", "repo-not-found"),
            ("OCI API error: MANIFEST_UNKNOWN: manifest tagged by x", "not-found"),
            ("image manifest not found for tag v1", "not-found"),
            (
                "OCI API error: MANIFEST_INVALID: unknown media type",
                "unsupported-media-type",
            ),
            ("error sending request: dns error: failed to lookup", "network"),
            ("connection refused", "network"),
            ("something else entirely", "fatal"),
        ];
        for (raw, kind) in cases {
            assert_eq!(
                classify_message("r.example/repo", raw).as_kind(),
                kind,
                "message: {}",
                raw
            );
        }
    }

    #[test]
    fn tls_wins_over_network() {
        // reqwest wraps certificate failures inside connection errors.
        let err = classify_message(
            "r.example",
            "error sending request: connection error: invalid peer certificate",
        );
        assert_eq!(err.as_kind(), "tls");
    }

    #[test]
    fn scheme_is_stripped_from_base() {
        let cfg = RegistryConfig {
            insecure: true,
            ..Default::default()
        };
        let client = RegistryClient::new("https://r.example/d/ce/", &cfg).unwrap();
        assert_eq!(client.registry(), "r.example/d/ce");
    }

    #[test]
    fn segment_descent_extends_scope() {
        let client = RegistryClient::new("r.example/d/ce", &RegistryConfig::default()).unwrap();
        let scoped = client.with_segment("install");
        assert_eq!(scoped.registry(), "r.example/d/ce/install");
        assert_eq!(scoped.with_segment("").registry(), "r.example/d/ce/install");
    }
}
