//! In-memory image model.
//!
//! An [`Image`] is the unit moved by the transfer engine: the raw manifest
//! bytes exactly as served by the source registry, plus every blob the
//! manifest (transitively, for image indices) refers to. Keeping manifests
//! as raw bytes is what makes digests survive the pull/push round-trip.

use serde::Deserialize;
use sha2::{Digest, Sha256};

/// OCI image manifest media type.
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index media type.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker schema-2 manifest media type.
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema-2 manifest list media type.
pub const MEDIA_TYPE_DOCKER_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image configuration media type.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// Uncompressed OCI layer media type.
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
/// Gzip-compressed OCI layer media type.
pub const MEDIA_TYPE_OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// Fallback media type for blobs whose descriptor does not carry one.
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Media types a manifest request may legitimately return.
pub const ALL_MANIFEST_MEDIA_TYPES: &[&str] = &[
    MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_LIST,
];

/// Compute the canonical `sha256:<hex>` digest of a byte slice.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn is_manifest_media_type(media_type: &str) -> bool {
    ALL_MANIFEST_MEDIA_TYPES.contains(&media_type)
}

/// A content-addressed piece of an image: a layer, a config object, or a
/// nested manifest of an image index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBlob {
    pub digest: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

impl ImageBlob {
    /// Wrap raw bytes, computing their digest.
    pub fn new(media_type: &str, data: Vec<u8>) -> Self {
        ImageBlob {
            digest: sha256_digest(&data),
            media_type: media_type.to_string(),
            data,
        }
    }

    /// Wrap raw bytes whose digest is already known.
    pub fn with_digest(digest: &str, media_type: &str, data: Vec<u8>) -> Self {
        ImageBlob {
            digest: digest.to_string(),
            media_type: media_type.to_string(),
            data,
        }
    }

    /// Whether this blob must be uploaded through the manifest endpoint.
    pub fn is_manifest(&self) -> bool {
        is_manifest_media_type(&self.media_type)
    }
}

/// Descriptor entry inside a manifest document.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDescriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl ManifestDescriptor {
    /// The descriptor's media type, or the octet-stream fallback.
    pub fn media_type_or_default(&self) -> &str {
        self.media_type.as_deref().unwrap_or(MEDIA_TYPE_OCTET_STREAM)
    }
}

/// The subset of a manifest document the engine needs to walk references.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDoc {
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<ManifestDescriptor>,
    #[serde(default)]
    pub layers: Vec<ManifestDescriptor>,
    #[serde(default)]
    pub manifests: Vec<ManifestDescriptor>,
}

impl ManifestDoc {
    pub fn parse(raw: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(raw).map_err(|e| anyhow::anyhow!("malformed manifest: {}", e))
    }

    /// Whether the document is an image index rather than a single image.
    pub fn is_index(&self) -> bool {
        if let Some(mt) = &self.media_type {
            if mt == MEDIA_TYPE_OCI_INDEX || mt == MEDIA_TYPE_DOCKER_LIST {
                return true;
            }
        }
        !self.manifests.is_empty()
    }

    /// Descriptors of the data blobs (config plus layers) of an image
    /// manifest, in document order.
    pub fn data_descriptors(&self) -> Vec<&ManifestDescriptor> {
        self.config.iter().chain(self.layers.iter()).collect()
    }
}

/// A fully materialized image.
///
/// `blobs` holds every blob reachable from the manifest. For an image
/// index, each child's data blobs precede the child manifest blob itself,
/// so replaying `blobs` in order never references a missing digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub digest: String,
    pub media_type: String,
    pub manifest: Vec<u8>,
    pub blobs: Vec<ImageBlob>,
}

impl Image {
    /// Assemble an image from raw manifest bytes and its blobs.
    pub fn from_manifest(media_type: &str, manifest: Vec<u8>, blobs: Vec<ImageBlob>) -> Self {
        Image {
            digest: sha256_digest(&manifest),
            media_type: media_type.to_string(),
            manifest,
            blobs,
        }
    }

    pub fn parsed(&self) -> anyhow::Result<ManifestDoc> {
        ManifestDoc::parse(&self.manifest)
    }

    pub fn blob(&self, digest: &str) -> Option<&ImageBlob> {
        self.blobs.iter().find(|b| b.digest == digest)
    }

    /// Ordered layer blobs of the image manifest.
    ///
    /// For an image index the first child manifest is used; the platform
    /// and module images this engine introspects are single-architecture.
    pub fn layer_blobs(&self) -> anyhow::Result<Vec<&ImageBlob>> {
        let mut doc = self.parsed()?;
        if doc.is_index() {
            let child = doc
                .manifests
                .first()
                .ok_or_else(|| anyhow::anyhow!("image index {} has no manifests", self.digest))?;
            let child_blob = self.blob(&child.digest).ok_or_else(|| {
                anyhow::anyhow!("child manifest {} missing from image", child.digest)
            })?;
            doc = ManifestDoc::parse(&child_blob.data)?;
        }
        doc.layers
            .iter()
            .map(|l| {
                self.blob(&l.digest)
                    .ok_or_else(|| anyhow::anyhow!("layer {} missing from image", l.digest))
            })
            .collect()
    }

    /// Build a single-layer image around the given config bytes and layers.
    pub fn assemble(config: Vec<u8>, layers: Vec<ImageBlob>) -> Self {
        let config = ImageBlob::new(MEDIA_TYPE_OCI_CONFIG, config);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": config.media_type,
                "digest": config.digest,
                "size": config.data.len(),
            },
            "layers": layers.iter().map(|l| serde_json::json!({
                "mediaType": l.media_type,
                "digest": l.digest,
                "size": l.data.len(),
            })).collect::<Vec<_>>(),
        });
        let manifest = serde_json::to_vec(&manifest).expect("manifest serialization cannot fail");
        let mut blobs = vec![config];
        blobs.extend(layers);
        Image::from_manifest(MEDIA_TYPE_OCI_MANIFEST, manifest, blobs)
    }

    /// A tiny throwaway image used as a repository discovery marker; its
    /// content carries no meaning.
    pub fn random_marker() -> Self {
        use rand::RngCore;
        let mut noise = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut noise);
        let layer = ImageBlob::new(MEDIA_TYPE_OCI_LAYER, noise.to_vec());
        Image::assemble(b"{}".to_vec(), vec![layer])
    }
}

/// Walk a manifest document and materialize every blob it references.
///
/// `lookup` resolves any digest (nested manifest or data blob) to its
/// bytes. Child data blobs are emitted before the child manifest blob that
/// references them, so the resulting vector replays cleanly on push.
pub fn collect_referenced_blobs<L>(manifest: &[u8], mut lookup: L) -> anyhow::Result<Vec<ImageBlob>>
where
    L: FnMut(&str) -> anyhow::Result<Vec<u8>>,
{
    let doc = ManifestDoc::parse(manifest)?;
    let mut out = Vec::new();

    if doc.is_index() {
        for child in &doc.manifests {
            let child_bytes = lookup(&child.digest)?;
            let child_doc = ManifestDoc::parse(&child_bytes)?;
            for desc in child_doc.data_descriptors() {
                out.push(ImageBlob::with_digest(
                    &desc.digest,
                    desc.media_type_or_default(),
                    lookup(&desc.digest)?,
                ));
            }
            out.push(ImageBlob::with_digest(
                &child.digest,
                child.media_type_or_default(),
                child_bytes,
            ));
        }
    } else {
        for desc in doc.data_descriptors() {
            out.push(ImageBlob::with_digest(
                &desc.digest,
                desc.media_type_or_default(),
                lookup(&desc.digest)?,
            ));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_canonical() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn assembled_image_is_consistent() {
        let layer = ImageBlob::new(MEDIA_TYPE_OCI_LAYER, b"layer-bytes".to_vec());
        let image = Image::assemble(b"{}".to_vec(), vec![layer.clone()]);

        assert_eq!(image.media_type, MEDIA_TYPE_OCI_MANIFEST);
        assert_eq!(image.digest, sha256_digest(&image.manifest));
        assert_eq!(image.blobs.len(), 2);

        let doc = image.parsed().unwrap();
        assert!(!doc.is_index());
        assert_eq!(doc.layers.len(), 1);
        assert_eq!(doc.layers[0].digest, layer.digest);
        for desc in doc.data_descriptors() {
            assert!(image.blob(&desc.digest).is_some());
        }
    }

    #[test]
    fn layer_blobs_follow_manifest_order() {
        let first = ImageBlob::new(MEDIA_TYPE_OCI_LAYER, b"first".to_vec());
        let second = ImageBlob::new(MEDIA_TYPE_OCI_LAYER, b"second".to_vec());
        let image = Image::assemble(b"{}".to_vec(), vec![first.clone(), second.clone()]);

        let layers = image.layer_blobs().unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0].digest, first.digest);
        assert_eq!(layers[1].digest, second.digest);
    }

    #[test]
    fn marker_images_differ() {
        let a = Image::random_marker();
        let b = Image::random_marker();
        assert_ne!(a.digest, b.digest);
        assert!(a.parsed().unwrap().layers.len() == 1);
    }

    #[test]
    fn index_detection() {
        let index = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#;
        assert!(ManifestDoc::parse(index).unwrap().is_index());

        let image = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","layers":[]}"#;
        assert!(!ManifestDoc::parse(image).unwrap().is_index());
    }
}
