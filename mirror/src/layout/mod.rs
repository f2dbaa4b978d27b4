//! On-disk OCI image layouts.
//!
//! A layout is the directory form an image set takes between the two
//! phases: `oci-layout` marker, content-addressed `blobs/sha256/` files
//! and a top-level `index.json`. Every index descriptor carries two
//! annotations: the full source reference that produced it and the short
//! tag it must be published under.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use futures::lock::Mutex;
use serde::{Deserialize, Serialize};

use commons::MirrorError;

use crate::image::{collect_referenced_blobs, Image, MEDIA_TYPE_OCI_INDEX};
use crate::reference;

/// Annotation carrying the full source reference of a descriptor.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
/// Annotation carrying the tag a descriptor is published under on push.
pub const ANNOTATION_SHORT_TAG: &str = "io.deckhouse.image.short_tag";

/// OCI layout marker version.
pub const LAYOUT_VERSION: &str = "1.0.0";

/// An index entry.
///
/// Annotations are a sorted map so index serialization is bit-identical
/// for identical descriptor sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// The full source reference recorded at append time.
    pub fn ref_name(&self) -> &str {
        self.annotations
            .get(ANNOTATION_REF_NAME)
            .map(String::as_str)
            .unwrap_or("")
    }

    /// The tag this entry publishes under.
    pub fn short_tag(&self) -> &str {
        self.annotations
            .get(ANNOTATION_SHORT_TAG)
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Index {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    #[serde(rename = "mediaType")]
    media_type: String,
    manifests: Vec<Descriptor>,
}

impl Index {
    fn empty() -> Self {
        Index {
            schema_version: 2,
            media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
            manifests: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// One on-disk OCI layout.
///
/// Blob writes are content-addressed and may race freely; the in-memory
/// index and its `index.json` write-through are serialized by a per-layout
/// async mutex.
pub struct Layout {
    root: PathBuf,
    index: Mutex<Index>,
}

impl Layout {
    /// Create an empty layout at `root` (parent directories included).
    pub fn create(root: impl AsRef<Path>) -> anyhow::Result<Layout> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("blobs").join("sha256"))?;
        let marker = LayoutMarker {
            image_layout_version: LAYOUT_VERSION.to_string(),
        };
        fs::write(root.join("oci-layout"), serde_json::to_vec(&marker)?)?;
        let index = Index::empty();
        fs::write(root.join("index.json"), serde_json::to_vec(&index)?)?;
        Ok(Layout {
            root,
            index: Mutex::new(index),
        })
    }

    /// Open an existing layout.
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Layout> {
        let root = root.as_ref().to_path_buf();
        let raw = fs::read(root.join("index.json"))
            .map_err(|e| anyhow::anyhow!("no image layout at {}: {}", root.display(), e))?;
        let index: Index = serde_json::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("malformed index at {}: {}", root.display(), e))?;
        Ok(Layout {
            root,
            index: Mutex::new(index),
        })
    }

    /// Open a layout, creating it empty when absent.
    pub fn open_or_create(root: impl AsRef<Path>) -> anyhow::Result<Layout> {
        let root = root.as_ref();
        if root.join("index.json").is_file() {
            Layout::open(root)
        } else {
            Layout::create(root)
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> anyhow::Result<PathBuf> {
        let hex = digest
            .strip_prefix("sha256:")
            .filter(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| anyhow::anyhow!("unsupported digest '{}'", digest))?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    fn write_blob(&self, digest: &str, data: &[u8]) -> anyhow::Result<()> {
        let path = self.blob_path(digest)?;
        if path.is_file() {
            return Ok(());
        }
        fs::write(path, data)?;
        Ok(())
    }

    fn read_blob(&self, digest: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.blob_path(digest)?;
        fs::read(&path).map_err(|e| anyhow::anyhow!("missing blob {}: {}", digest, e))
    }

    fn write_index(&self, index: &Index) -> anyhow::Result<()> {
        fs::write(self.root.join("index.json"), serde_json::to_vec(index)?)?;
        Ok(())
    }

    /// Append an image under the given source reference and short tag.
    ///
    /// All blobs (manifest included) hit disk before the descriptor is
    /// added, so every descriptor in the index always has its blob.
    pub async fn append_image(
        &self,
        image: &Image,
        ref_name: &str,
        short_tag: &str,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !ref_name.is_empty() && !short_tag.is_empty(),
            "descriptor annotations must not be empty"
        );

        for blob in &image.blobs {
            self.write_blob(&blob.digest, &blob.data)?;
        }
        self.write_blob(&image.digest, &image.manifest)?;

        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_REF_NAME.to_string(), ref_name.to_string());
        annotations.insert(ANNOTATION_SHORT_TAG.to_string(), short_tag.to_string());
        let descriptor = Descriptor {
            media_type: image.media_type.clone(),
            digest: image.digest.clone(),
            size: image.manifest.len() as u64,
            annotations,
        };

        let mut index = self.index.lock().await;
        if !index.manifests.contains(&descriptor) {
            index.manifests.push(descriptor);
            self.write_index(&index)?;
        }
        Ok(())
    }

    /// All current index entries.
    pub async fn manifests(&self) -> Vec<Descriptor> {
        self.index.lock().await.manifests.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.manifests.is_empty()
    }

    /// Whether a descriptor with this digest and short tag exists.
    pub async fn has_descriptor(&self, digest: &str, short_tag: &str) -> bool {
        self.index
            .lock()
            .await
            .manifests
            .iter()
            .any(|d| d.digest == digest && d.short_tag() == short_tag)
    }

    /// The first descriptor carrying `digest`, if any.
    pub async fn find_digest(&self, digest: &str) -> Option<Descriptor> {
        self.index
            .lock()
            .await
            .manifests
            .iter()
            .find(|d| d.digest == digest)
            .cloned()
    }

    /// Look up a descriptor by its short tag.
    pub async fn find_by_tag(&self, tag: &str) -> Result<Descriptor, MirrorError> {
        self.index
            .lock()
            .await
            .manifests
            .iter()
            .find(|d| d.short_tag() == tag)
            .cloned()
            .ok_or_else(|| {
                MirrorError::ImageNotFound(format!(
                    "no image tagged '{}' in layout {}",
                    tag,
                    self.root.display()
                ))
            })
    }

    /// Duplicate the descriptor of an already-present digest under a new
    /// short tag. The repository part of the source reference is kept.
    pub async fn tag_existing_digest(&self, digest: &str, new_tag: &str) -> anyhow::Result<()> {
        let mut index = self.index.lock().await;
        let existing = index
            .manifests
            .iter()
            .find(|d| d.digest == digest)
            .cloned()
            .ok_or_else(|| {
                MirrorError::ImageNotFound(format!(
                    "no image with digest {} in layout {}",
                    digest,
                    self.root.display()
                ))
            })?;

        let repo = reference::repo_of(existing.ref_name()).to_string();
        let mut duplicate = existing;
        duplicate
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), format!("{}:{}", repo, new_tag));
        duplicate
            .annotations
            .insert(ANNOTATION_SHORT_TAG.to_string(), new_tag.to_string());

        if !index.manifests.contains(&duplicate) {
            index.manifests.push(duplicate);
            self.write_index(&index)?;
        }
        Ok(())
    }

    /// Link an already-present digest under a new reference and short tag
    /// without refetching anything. Returns false when the digest is not in
    /// the layout yet.
    pub async fn link_digest(
        &self,
        digest: &str,
        ref_name: &str,
        short_tag: &str,
    ) -> anyhow::Result<bool> {
        let mut index = self.index.lock().await;
        let existing = match index.manifests.iter().find(|d| d.digest == digest) {
            Some(d) => d.clone(),
            None => return Ok(false),
        };
        let mut duplicate = existing;
        duplicate
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), ref_name.to_string());
        duplicate
            .annotations
            .insert(ANNOTATION_SHORT_TAG.to_string(), short_tag.to_string());
        if !index.manifests.contains(&duplicate) {
            index.manifests.push(duplicate);
            self.write_index(&index)?;
        }
        Ok(true)
    }

    /// Seal the index: sort descriptors by source reference (byte-wise)
    /// and collapse exact duplicates.
    pub async fn sort_index(&self) -> anyhow::Result<()> {
        let mut index = self.index.lock().await;
        index.manifests.sort_by(|a, b| {
            a.ref_name()
                .cmp(b.ref_name())
                .then_with(|| a.short_tag().cmp(b.short_tag()))
                .then_with(|| a.digest.cmp(&b.digest))
        });
        index.manifests.dedup();
        self.write_index(&index)
    }

    /// Reconstruct an image from the layout.
    pub async fn read_image(&self, descriptor: &Descriptor) -> anyhow::Result<Image> {
        let manifest = self.read_blob(&descriptor.digest)?;
        let blobs = collect_referenced_blobs(&manifest, |digest| self.read_blob(digest))?;
        Ok(Image {
            digest: descriptor.digest.clone(),
            media_type: descriptor.media_type.clone(),
            manifest,
            blobs,
        })
    }
}
