//! Parallel transfer of images between registries and layouts.
//!
//! Pull fills a layout from a set of references; push replays a layout
//! into a destination repository. Both fan out over distinct images with
//! bounded concurrency; blob fan-out inside one image is handled by the
//! registry client. A failing worker cancels its siblings because the
//! whole batch lives inside one stream combinator.

use std::collections::BTreeSet;

use futures::stream::{self, TryStreamExt};
use log::{debug, info, warn};

use anyhow::Context;
use commons::retry::{self, with_retries};
use commons::MirrorError;

use crate::image::Image;
use crate::layout::Layout;
use crate::reference::{self, RefKind};
use crate::registry::ImageRepo;

/// Fan-out knobs: distinct images per batch, blobs per image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parallelism {
    pub images: usize,
    pub blobs: usize,
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism { images: 5, blobs: 4 }
    }
}

impl Parallelism {
    /// Fully serialized transfers.
    pub fn serial() -> Self {
        Parallelism { images: 1, blobs: 1 }
    }
}

/// Transfer-specific failures.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Pushing a layout with no images is a caller bug, not a no-op.
    #[error("layout '{0}' contains no images to push")]
    EmptyLayout(String),
}

/// Pull behavior switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullOpts {
    /// Resolve tags to digests before fetching, so a moving channel head
    /// cannot tear a long pull.
    pub resolve_tags: bool,
    /// Log-and-skip references the source does not have.
    pub allow_missing: bool,
}

fn is_missing(err: &MirrorError) -> bool {
    matches!(
        err,
        MirrorError::ImageNotFound(_) | MirrorError::RepoNotFound(_)
    )
}

/// The tag a reference publishes under inside its layout.
///
/// Auxiliary images keep their `<name>:<tag>` suffix so the push side can
/// restore the directory separation below the extra root.
pub fn short_tag_for(reference: &str) -> String {
    if let Some(idx) = reference.find("/extra/") {
        return reference[idx + "/extra/".len()..].to_string();
    }
    match reference::split_reference(reference).1 {
        RefKind::Tag(tag) => tag.to_string(),
        RefKind::Digest(digest) => digest.to_string(),
        RefKind::Bare => "latest".to_string(),
    }
}

/// Scope `client` down to `target_repo`, one segment at a time.
pub(crate) fn descend(
    client: &dyn ImageRepo,
    target_repo: &str,
) -> anyhow::Result<Box<dyn ImageRepo>> {
    let base = client.registry();
    let mut scoped = client.with_segment("");
    for segment in reference::segments_below(&base, target_repo)? {
        scoped = scoped.with_segment(segment);
    }
    Ok(scoped)
}

/// One pull work item: the original reference plus what to actually fetch.
struct PullItem {
    reference: String,
    repo: String,
    fetch: String,
}

/// Pull every reference in `refs` into `layout`.
///
/// References must live below the client's scope. Already-present digests
/// are linked, not refetched.
pub async fn pull(
    client: &dyn ImageRepo,
    refs: &BTreeSet<String>,
    layout: &Layout,
    parallelism: Parallelism,
    opts: PullOpts,
) -> anyhow::Result<()> {
    // Resolution step: pin every tagged reference to the digest its tag
    // points at right now.
    let mut items: Vec<PullItem> = Vec::with_capacity(refs.len());
    for full in refs {
        let (repo, kind) = reference::split_reference(full);
        match kind {
            RefKind::Digest(digest) => items.push(PullItem {
                reference: full.clone(),
                repo: repo.to_string(),
                fetch: digest.to_string(),
            }),
            RefKind::Tag(tag) if opts.resolve_tags => {
                let scoped = descend(client, repo)?;
                let resolved =
                    with_retries(full, retry::ON_PULL, || scoped.get_manifest_digest(tag)).await;
                match resolved {
                    Ok(digest) => items.push(PullItem {
                        reference: full.clone(),
                        repo: repo.to_string(),
                        fetch: digest,
                    }),
                    Err(e) if opts.allow_missing && is_missing(&e) => {
                        warn!("[{}] skipping missing image: {}", full, e);
                    }
                    Err(e) => {
                        return Err(anyhow::Error::from(e).context(format!("resolve {}", full)))
                    }
                }
            }
            RefKind::Tag(tag) => items.push(PullItem {
                reference: full.clone(),
                repo: repo.to_string(),
                fetch: tag.to_string(),
            }),
            RefKind::Bare => anyhow::bail!("reference '{}' has neither tag nor digest", full),
        }
    }

    stream::iter(items.into_iter().map(Ok::<_, anyhow::Error>))
        .try_for_each_concurrent(parallelism.images.max(1), |item| async move {
            let short_tag = short_tag_for(&item.reference);

            // Digest already on disk: link it instead of refetching.
            if item.fetch.starts_with("sha256:") {
                if layout.has_descriptor(&item.fetch, &short_tag).await {
                    debug!("[{}] already present, skipping", item.reference);
                    return Ok(());
                }
                if layout
                    .link_digest(&item.fetch, &item.reference, &short_tag)
                    .await?
                {
                    debug!("[{}] linked existing digest {}", item.reference, item.fetch);
                    return Ok(());
                }
            }

            let scoped = descend(client, &item.repo)?;
            let image =
                match with_retries(&item.reference, retry::ON_PULL, || scoped.get_image(&item.fetch))
                    .await
                {
                    Ok(image) => image,
                    Err(e) if opts.allow_missing && is_missing(&e) => {
                        warn!("[{}] skipping missing image: {}", item.reference, e);
                        return Ok(());
                    }
                    Err(e) => {
                        return Err(
                            anyhow::Error::from(e).context(format!("pull {}", item.reference))
                        )
                    }
                };

            layout
                .append_image(&image, &item.reference, &short_tag)
                .await
                .with_context(|| format!("store {}", item.reference))?;
            info!("[{}] pulled", item.reference);
            Ok(())
        })
        .await
}

/// Push every image of `layout` to the destination repository.
///
/// Descriptors are pushed in batches of `parallelism.images`; a batch is
/// fully read from disk before its first write so a torn layout aborts
/// the batch cleanly.
pub async fn push_layout(
    dest: &dyn ImageRepo,
    layout: &Layout,
    layout_name: &str,
    parallelism: Parallelism,
) -> anyhow::Result<()> {
    let descriptors = layout.manifests().await;
    if descriptors.is_empty() {
        return Err(TransferError::EmptyLayout(layout_name.to_string()).into());
    }

    for batch in descriptors.chunks(parallelism.images.max(1)) {
        let mut images: Vec<(String, Image)> = Vec::with_capacity(batch.len());
        for descriptor in batch {
            let image = layout
                .read_image(descriptor)
                .await
                .with_context(|| format!("read {} from layout", descriptor.ref_name()))?;
            images.push((descriptor.short_tag().to_string(), image));
        }

        stream::iter(images.into_iter().map(Ok::<_, anyhow::Error>))
            .try_for_each_concurrent(parallelism.images.max(1), |(short_tag, image)| async move {
                push_one(dest, &short_tag, &image)
                    .await
                    .with_context(|| format!("push {}:{}", dest.registry(), short_tag))
            })
            .await?;
    }
    Ok(())
}

async fn push_one(dest: &dyn ImageRepo, short_tag: &str, image: &Image) -> anyhow::Result<()> {
    // Short tags may be raw digests or carry a path prefix ("name:tag").
    let (scoped, publish_as): (Box<dyn ImageRepo>, String) = if short_tag.starts_with("sha256:") {
        (dest.with_segment(""), short_tag.to_string())
    } else if let Some((path, tag)) = short_tag.split_once(':') {
        let mut scoped = dest.with_segment("");
        for segment in path.split('/') {
            scoped = scoped.with_segment(segment);
        }
        (scoped, tag.to_string())
    } else {
        (dest.with_segment(""), short_tag.to_string())
    };

    with_retries(short_tag, retry::ON_PUSH, || {
        scoped.push_image(&publish_as, image)
    })
    .await?;
    info!("[{}:{}] pushed", scoped.registry(), publish_as);
    Ok(())
}

/// Publish the tiny discovery-marker image for a module.
///
/// Module discovery works by listing tags of the modules repository, so
/// each pushed module leaves a `<modules-repo>:<name>` marker behind. The
/// marker's content is meaningless.
pub async fn push_module_marker(modules_repo: &dyn ImageRepo, module: &str) -> anyhow::Result<()> {
    let marker = Image::random_marker();
    with_retries(module, retry::ON_PUSH, || {
        modules_repo.push_image(module, &marker)
    })
    .await
    .with_context(|| format!("publish module marker {}:{}", modules_repo.registry(), module))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{image_with_files, image_with_layers, InMemoryRegistry};
    use commons::testing::init_runtime;

    const SRC: &str = "src.example/d/ce";

    #[test]
    fn short_tags() {
        assert_eq!(short_tag_for("r.example/d/ce:v1.50.0"), "v1.50.0");
        let digest = format!("sha256:{}", "a".repeat(64));
        assert_eq!(short_tag_for(&format!("r.example/d/ce@{}", digest)), digest);
        assert_eq!(
            short_tag_for("r.example/d/modules/m1/extra/redis:7.2"),
            "redis:7.2"
        );
    }

    #[test]
    fn pull_set_lands_in_layout() {
        let runtime = init_runtime().unwrap();
        runtime.block_on(async {
            let registry = InMemoryRegistry::new();
            let image = image_with_files(&[("version.json", br#"{"version":"1.0.0"}"# as &[u8])]);
            registry.publish(SRC, "v1.0.0", &image).await;
            registry
                .publish(&format!("{}/install", SRC), "v1.0.0", &image)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let layout = Layout::create(dir.path()).unwrap();
            let refs: BTreeSet<String> = vec![
                format!("{}:v1.0.0", SRC),
                format!("{}/install:v1.0.0", SRC),
            ]
            .into_iter()
            .collect();

            pull(
                &*registry.client(SRC),
                &refs,
                &layout,
                Parallelism::default(),
                PullOpts {
                    resolve_tags: true,
                    allow_missing: false,
                },
            )
            .await
            .unwrap();

            layout.sort_index().await.unwrap();
            let descriptors = layout.manifests().await;
            assert_eq!(descriptors.len(), 2);
            assert!(descriptors.iter().all(|d| d.digest == image.digest));
            assert_eq!(descriptors[0].ref_name(), format!("{}/install:v1.0.0", SRC));
            assert_eq!(descriptors[1].ref_name(), format!("{}:v1.0.0", SRC));
        });
    }

    // Paused clock: the not-found retries would otherwise sleep for real.
    #[tokio::test(start_paused = true)]
    async fn missing_references_honor_allow_missing() {
        let registry = InMemoryRegistry::new();
        let image = image_with_layers("present", 1);
        registry.publish(SRC, "present", &image).await;

        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::create(dir.path()).unwrap();
        let refs: BTreeSet<String> = vec![format!("{}:present", SRC), format!("{}:absent", SRC)]
            .into_iter()
            .collect();

        let denied = pull(
            &*registry.client(SRC),
            &refs,
            &layout,
            Parallelism::serial(),
            PullOpts {
                resolve_tags: true,
                allow_missing: false,
            },
        )
        .await;
        assert!(denied.is_err());

        pull(
            &*registry.client(SRC),
            &refs,
            &layout,
            Parallelism::serial(),
            PullOpts {
                resolve_tags: true,
                allow_missing: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(layout.manifests().await.len(), 1);
    }

    #[test]
    fn present_digests_are_not_refetched() {
        let runtime = init_runtime().unwrap();
        runtime.block_on(async {
            let registry = InMemoryRegistry::new();
            let image = image_with_layers("stable-content", 2);
            registry.publish(SRC, "v1.0.0", &image).await;

            let dir = tempfile::tempdir().unwrap();
            let layout = Layout::create(dir.path()).unwrap();
            let refs: BTreeSet<String> = vec![format!("{}:v1.0.0", SRC)].into_iter().collect();
            let opts = PullOpts {
                resolve_tags: true,
                allow_missing: false,
            };

            pull(&*registry.client(SRC), &refs, &layout, Parallelism::serial(), opts)
                .await
                .unwrap();
            let fetched_before = registry.manifest_fetches().await;

            pull(&*registry.client(SRC), &refs, &layout, Parallelism::serial(), opts)
                .await
                .unwrap();
            // The second pull resolves the digest but never refetches the
            // manifest payload.
            assert_eq!(registry.manifest_fetches().await, fetched_before);
            assert_eq!(layout.manifests().await.len(), 1);
        });
    }

    #[test]
    fn parallel_and_serial_pulls_agree() {
        let runtime = init_runtime().unwrap();
        runtime.block_on(async {
            let registry = InMemoryRegistry::new();
            let mut refs = BTreeSet::new();
            for i in 0..7 {
                let tag = format!("v1.{}.0", i);
                registry
                    .publish(SRC, &tag, &image_with_layers(&format!("img-{}", i), 2))
                    .await;
                refs.insert(format!("{}:{}", SRC, tag));
            }

            let mut indices = Vec::new();
            for parallelism in [Parallelism::serial(), Parallelism::default()] {
                let dir = tempfile::tempdir().unwrap();
                let layout = Layout::create(dir.path()).unwrap();
                pull(
                    &*registry.client(SRC),
                    &refs,
                    &layout,
                    parallelism,
                    PullOpts {
                        resolve_tags: true,
                        allow_missing: false,
                    },
                )
                .await
                .unwrap();
                layout.sort_index().await.unwrap();
                indices.push(std::fs::read(dir.path().join("index.json")).unwrap());
            }
            assert_eq!(indices[0], indices[1]);
        });
    }

    #[test]
    fn push_replays_layout_blob_for_blob() {
        let runtime = init_runtime().unwrap();
        runtime.block_on(async {
            let registry = InMemoryRegistry::new();
            let mut refs = BTreeSet::new();
            for i in 0..10 {
                let tag = format!("v0.{}.0", i);
                registry
                    .publish(SRC, &tag, &image_with_layers(&format!("payload-{}", i), 3))
                    .await;
                refs.insert(format!("{}:{}", SRC, tag));
            }

            let dir = tempfile::tempdir().unwrap();
            let layout = Layout::create(dir.path()).unwrap();
            pull(
                &*registry.client(SRC),
                &refs,
                &layout,
                Parallelism::default(),
                PullOpts {
                    resolve_tags: true,
                    allow_missing: false,
                },
            )
            .await
            .unwrap();
            layout.sort_index().await.unwrap();

            const DEST: &str = "air.gap/deckhouse";
            push_layout(
                &*registry.client(DEST),
                &layout,
                "platform images",
                Parallelism { images: 5, blobs: 4 },
            )
            .await
            .unwrap();

            // 10 images x (3 layers + config) data blobs, plus one manifest
            // blob each.
            assert_eq!(registry.blob_count(DEST).await, 10 * 4);
            assert_eq!(registry.manifest_count(DEST).await, 10);

            // Pushing the identical layout again must be a no-op in effect.
            push_layout(
                &*registry.client(DEST),
                &layout,
                "platform images",
                Parallelism::serial(),
            )
            .await
            .unwrap();
            assert_eq!(registry.blob_count(DEST).await, 10 * 4);
            assert_eq!(registry.manifest_count(DEST).await, 10);

            for descriptor in layout.manifests().await {
                let tag = descriptor.short_tag();
                assert_eq!(
                    registry.resolve_tag(DEST, tag).await.unwrap(),
                    descriptor.digest
                );
            }
        });
    }

    #[test]
    fn empty_layout_push_is_an_error() {
        let runtime = init_runtime().unwrap();
        runtime.block_on(async {
            let registry = InMemoryRegistry::new();
            let dir = tempfile::tempdir().unwrap();
            let layout = Layout::create(dir.path()).unwrap();
            let err = push_layout(
                &*registry.client("air.gap/deckhouse"),
                &layout,
                "release channels",
                Parallelism::serial(),
            )
            .await
            .unwrap_err();
            assert!(
                err.downcast_ref::<TransferError>().is_some(),
                "unexpected error: {:#}",
                err
            );
        });
    }

    #[test]
    fn extra_short_tags_split_on_push() {
        let runtime = init_runtime().unwrap();
        runtime.block_on(async {
            let registry = InMemoryRegistry::new();
            let module_repo = format!("{}/modules/m1", SRC);
            let image = image_with_layers("extra-img", 1);
            registry
                .publish(&format!("{}/extra/redis", module_repo), "7.2", &image)
                .await;

            let dir = tempfile::tempdir().unwrap();
            let layout = Layout::create(dir.path()).unwrap();
            let refs: BTreeSet<String> =
                vec![format!("{}/extra/redis:7.2", module_repo)].into_iter().collect();
            pull(
                &*registry.client(SRC),
                &refs,
                &layout,
                Parallelism::serial(),
                PullOpts {
                    resolve_tags: true,
                    allow_missing: false,
                },
            )
            .await
            .unwrap();

            let descriptor = &layout.manifests().await[0];
            assert_eq!(descriptor.short_tag(), "redis:7.2");

            const DEST: &str = "air.gap/deckhouse/modules/m1/extra";
            push_layout(&*registry.client(DEST), &layout, "extras", Parallelism::serial())
                .await
                .unwrap();
            assert_eq!(
                registry.resolve_tag("air.gap/deckhouse/modules/m1/extra/redis", "7.2").await,
                Some(image.digest.clone())
            );
        });
    }

    #[test]
    fn module_marker_is_published() {
        let runtime = init_runtime().unwrap();
        runtime.block_on(async {
            let registry = InMemoryRegistry::new();
            let modules = registry.client("air.gap/deckhouse/modules");
            push_module_marker(&*modules, "m1").await.unwrap();
            assert!(registry.resolve_tag("air.gap/deckhouse/modules", "m1").await.is_some());
        });
    }
}
