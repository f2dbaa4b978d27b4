//! In-memory registry fixtures.
//!
//! [`InMemoryRegistry`] implements the same capability surface as the
//! production client, backed by maps, so the transfer engine and the
//! phase drivers can be exercised hermetically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use commons::MirrorError;

use crate::image::{
    collect_referenced_blobs, Image, ImageBlob, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_LAYER,
    MEDIA_TYPE_OCI_LAYER_GZIP,
};
use crate::registry::ImageRepo;

#[derive(Debug, Default)]
struct RepoStore {
    /// tag -> manifest digest
    tags: HashMap<String, String>,
    /// manifest digest -> (media type, raw bytes)
    manifests: HashMap<String, (String, Vec<u8>)>,
    /// data blob digest -> bytes
    blobs: HashMap<String, Vec<u8>>,
}

/// A whole in-memory registry shared between scoped clients.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    repos: Arc<RwLock<HashMap<String, RepoStore>>>,
    manifest_fetches: Arc<AtomicUsize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        InMemoryRegistry::default()
    }

    /// A client scoped at `base` (`host/path...`).
    pub fn client(&self, base: &str) -> Box<dyn ImageRepo> {
        Box::new(InMemoryRepo {
            registry: self.clone(),
            path: base.trim_matches('/').to_string(),
        })
    }

    /// Publish an image under `repo:tag`, creating the repository.
    pub async fn publish(&self, repo: &str, tag: &str, image: &Image) {
        let mut repos = self.repos.write().await;
        let store = repos.entry(repo.to_string()).or_default();
        for blob in &image.blobs {
            if blob.is_manifest() {
                store
                    .manifests
                    .insert(blob.digest.clone(), (blob.media_type.clone(), blob.data.clone()));
            } else {
                store.blobs.insert(blob.digest.clone(), blob.data.clone());
            }
        }
        store
            .manifests
            .insert(image.digest.clone(), (image.media_type.clone(), image.manifest.clone()));
        store.tags.insert(tag.to_string(), image.digest.clone());
    }

    /// Repoint (or remove) a tag, simulating channel-head motion.
    pub async fn set_tag(&self, repo: &str, tag: &str, digest: Option<&str>) {
        let mut repos = self.repos.write().await;
        let store = repos.entry(repo.to_string()).or_default();
        match digest {
            Some(digest) => {
                store.tags.insert(tag.to_string(), digest.to_string());
            }
            None => {
                store.tags.remove(tag);
            }
        }
    }

    pub async fn resolve_tag(&self, repo: &str, tag: &str) -> Option<String> {
        self.repos.read().await.get(repo)?.tags.get(tag).cloned()
    }

    /// Number of data blobs stored for `repo`.
    pub async fn blob_count(&self, repo: &str) -> usize {
        self.repos
            .read()
            .await
            .get(repo)
            .map(|s| s.blobs.len())
            .unwrap_or(0)
    }

    /// Number of manifests stored for `repo`.
    pub async fn manifest_count(&self, repo: &str) -> usize {
        self.repos
            .read()
            .await
            .get(repo)
            .map(|s| s.manifests.len())
            .unwrap_or(0)
    }

    /// Whether a manifest with this digest is stored for `repo`.
    pub async fn has_manifest(&self, repo: &str, digest: &str) -> bool {
        self.repos
            .read()
            .await
            .get(repo)
            .map(|s| s.manifests.contains_key(digest))
            .unwrap_or(false)
    }

    /// All tags of `repo`, sorted.
    pub async fn tags(&self, repo: &str) -> Vec<String> {
        let mut tags: Vec<String> = self
            .repos
            .read()
            .await
            .get(repo)
            .map(|s| s.tags.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }

    /// How many full manifest downloads have been served.
    pub async fn manifest_fetches(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }
}

/// One scope into an [`InMemoryRegistry`].
pub struct InMemoryRepo {
    registry: InMemoryRegistry,
    path: String,
}

impl InMemoryRepo {
    async fn resolve_digest(&self, tag_or_digest: &str) -> Result<String, MirrorError> {
        let repos = self.registry.repos.read().await;
        let store = repos
            .get(&self.path)
            .ok_or_else(|| MirrorError::RepoNotFound(format!("NAME_UNKNOWN: {}", self.path)))?;
        if tag_or_digest.starts_with("sha256:") {
            if store.manifests.contains_key(tag_or_digest) {
                return Ok(tag_or_digest.to_string());
            }
            return Err(MirrorError::ImageNotFound(format!(
                "MANIFEST_UNKNOWN: {}@{}",
                self.path, tag_or_digest
            )));
        }
        store.tags.get(tag_or_digest).cloned().ok_or_else(|| {
            MirrorError::ImageNotFound(format!("MANIFEST_UNKNOWN: {}:{}", self.path, tag_or_digest))
        })
    }
}

#[async_trait]
impl ImageRepo for InMemoryRepo {
    fn with_segment(&self, segment: &str) -> Box<dyn ImageRepo> {
        let path = if segment.is_empty() {
            self.path.clone()
        } else if self.path.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", self.path, segment)
        };
        Box::new(InMemoryRepo {
            registry: self.registry.clone(),
            path,
        })
    }

    fn registry(&self) -> String {
        self.path.clone()
    }

    async fn list_tags(&self) -> Result<Vec<String>, MirrorError> {
        let repos = self.registry.repos.read().await;
        let store = repos
            .get(&self.path)
            .ok_or_else(|| MirrorError::RepoNotFound(format!("NAME_UNKNOWN: {}", self.path)))?;
        let mut tags: Vec<String> = store.tags.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }

    async fn check_image_exists(&self, tag: &str) -> Result<bool, MirrorError> {
        match self.resolve_digest(tag).await {
            Ok(_) => Ok(true),
            Err(MirrorError::ImageNotFound(_)) | Err(MirrorError::RepoNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_manifest_digest(&self, tag: &str) -> Result<String, MirrorError> {
        self.resolve_digest(tag).await
    }

    async fn get_manifest(&self, tag: &str) -> Result<(Vec<u8>, String), MirrorError> {
        let digest = self.resolve_digest(tag).await?;
        let repos = self.registry.repos.read().await;
        let store = repos
            .get(&self.path)
            .ok_or_else(|| MirrorError::RepoNotFound(format!("NAME_UNKNOWN: {}", self.path)))?;
        let (_, manifest) = store
            .manifests
            .get(&digest)
            .cloned()
            .ok_or_else(|| MirrorError::ImageNotFound(format!("MANIFEST_UNKNOWN: {}", digest)))?;
        Ok((manifest, digest))
    }

    async fn get_image(&self, tag: &str) -> Result<Image, MirrorError> {
        let digest = self.resolve_digest(tag).await?;
        self.registry
            .manifest_fetches
            .fetch_add(1, Ordering::SeqCst);

        let repos = self.registry.repos.read().await;
        let store = repos
            .get(&self.path)
            .ok_or_else(|| MirrorError::RepoNotFound(format!("NAME_UNKNOWN: {}", self.path)))?;
        let (media_type, manifest) = store
            .manifests
            .get(&digest)
            .cloned()
            .ok_or_else(|| MirrorError::ImageNotFound(format!("MANIFEST_UNKNOWN: {}", digest)))?;

        let blobs = collect_referenced_blobs(&manifest, |wanted| {
            if let Some((_, bytes)) = store.manifests.get(wanted) {
                return Ok(bytes.clone());
            }
            store
                .blobs
                .get(wanted)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("BLOB_UNKNOWN: {}", wanted))
        })
        .map_err(|e| MirrorError::Fatal(e.to_string()))?;

        Ok(Image {
            digest,
            media_type: if media_type.is_empty() {
                MEDIA_TYPE_DOCKER_MANIFEST.to_string()
            } else {
                media_type
            },
            manifest,
            blobs,
        })
    }

    async fn push_image(&self, tag: &str, image: &Image) -> Result<(), MirrorError> {
        let mut repos = self.registry.repos.write().await;
        let store = repos.entry(self.path.clone()).or_default();
        for blob in &image.blobs {
            if blob.is_manifest() {
                store
                    .manifests
                    .insert(blob.digest.clone(), (blob.media_type.clone(), blob.data.clone()));
            } else {
                store.blobs.insert(blob.digest.clone(), blob.data.clone());
            }
        }
        store
            .manifests
            .insert(image.digest.clone(), (image.media_type.clone(), image.manifest.clone()));
        if !tag.starts_with("sha256:") {
            store.tags.insert(tag.to_string(), image.digest.clone());
        }
        Ok(())
    }
}

/// A gzip-compressed tar layer carrying the given files.
pub fn files_layer(files: &[(&str, &[u8])]) -> ImageBlob {
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *data)
            .expect("writing to an in-memory tar cannot fail");
    }
    let gz = builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .expect("finishing an in-memory tar cannot fail");
    ImageBlob::new(MEDIA_TYPE_OCI_LAYER_GZIP, gz)
}

/// A single-layer image whose root file system carries `files`.
pub fn image_with_files(files: &[(&str, &[u8])]) -> Image {
    Image::assemble(b"{}".to_vec(), vec![files_layer(files)])
}

/// A small image with `layers` distinct layers derived from `seed`.
pub fn image_with_layers(seed: &str, layers: usize) -> Image {
    let layers = (0..layers)
        .map(|i| {
            ImageBlob::new(
                MEDIA_TYPE_OCI_LAYER,
                format!("{}-layer-{}", seed, i).into_bytes(),
            )
        })
        .collect();
    Image::assemble(format!("{{\"seed\":\"{}\"}}", seed).into_bytes(), layers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::sha256_digest;

    #[tokio::test]
    async fn publish_and_fetch_round_trip() {
        let registry = InMemoryRegistry::new();
        let image = image_with_layers("fixture", 2);
        registry.publish("r.example/repo", "v1", &image).await;

        let client = registry.client("r.example/repo");
        assert_eq!(client.list_tags().await.unwrap(), vec!["v1"]);
        assert!(client.check_image_exists("v1").await.unwrap());
        assert!(!client.check_image_exists("v2").await.unwrap());

        let fetched = client.get_image("v1").await.unwrap();
        assert_eq!(fetched.digest, image.digest);
        assert_eq!(fetched.manifest, image.manifest);
        assert_eq!(fetched.blobs.len(), image.blobs.len());

        let (manifest, digest) = client.get_manifest("v1").await.unwrap();
        assert_eq!(manifest, image.manifest);
        assert_eq!(digest, image.digest);
    }

    #[tokio::test]
    async fn unknown_repo_is_repo_not_found() {
        let registry = InMemoryRegistry::new();
        let client = registry.client("r.example/absent");
        let err = client.list_tags().await.unwrap_err();
        assert_eq!(err.as_kind(), "repo-not-found");
    }

    #[test]
    fn fabricated_digests_are_real() {
        let image = image_with_layers("check", 1);
        assert_eq!(image.digest, sha256_digest(&image.manifest));
    }
}
