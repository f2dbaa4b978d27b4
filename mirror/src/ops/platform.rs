//! The platform pull flow.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use log::{info, warn};
use semver::Version;

use commons::retry::{self, with_retries};
use commons::MirrorError;

use crate::bundle;
use crate::layout::Layout;
use crate::ops::{bundle_writer, finish_bundle, prepare_workdir, PullContext};
use crate::registry::ImageRepo;
use crate::release;
use crate::resolve::closure;
use crate::resolve::platform::{plan_versions, DEFAULT_CHANNELS, OPTIONAL_CHANNELS};
use crate::transfer::{self, PullOpts};
use crate::versions;

/// The four layouts of the platform working tree.
pub(crate) struct PlatformLayouts {
    pub root: Layout,
    pub install: Layout,
    pub standalone: Layout,
    pub release_channel: Layout,
}

impl PlatformLayouts {
    pub fn open_or_create(workdir: &Path) -> anyhow::Result<Self> {
        Ok(PlatformLayouts {
            root: Layout::open_or_create(workdir)?,
            install: Layout::open_or_create(workdir.join("install"))?,
            standalone: Layout::open_or_create(workdir.join("install-standalone"))?,
            release_channel: Layout::open_or_create(workdir.join("release-channel"))?,
        })
    }

    pub fn all(&self) -> [&Layout; 4] {
        [
            &self.root,
            &self.install,
            &self.standalone,
            &self.release_channel,
        ]
    }
}

pub async fn pull_platform(ctx: &PullContext) -> anyhow::Result<()> {
    let workdir = ctx.working_dir.join("platform");
    prepare_workdir(&workdir, ctx.resume)?;
    let layouts = PlatformLayouts::open_or_create(&workdir)?;

    let source = ctx.client.registry();
    let release_repo = format!("{}/release-channel", source);
    let pinned = PullOpts {
        resolve_tags: true,
        allow_missing: false,
    };

    // Release channels (or the one pinned build) land first; they decide
    // which versions exist at all.
    let version_tags: Vec<String> = if let Some(tag) = &ctx.deckhouse_tag {
        info!("[release-channels] pulling pinned build {}", tag);
        let refs: BTreeSet<String> = std::iter::once(format!("{}:{}", release_repo, tag)).collect();
        transfer::pull(
            &*ctx.client,
            &refs,
            &layouts.release_channel,
            ctx.parallelism,
            pinned,
        )
        .await
        .context("pull release channel for pinned build")?;
        vec![tag.clone()]
    } else {
        info!("[release-channels] pulling channel heads");
        let mandatory: BTreeSet<String> = DEFAULT_CHANNELS
            .iter()
            .map(|channel| format!("{}:{}", release_repo, channel))
            .collect();
        transfer::pull(
            &*ctx.client,
            &mandatory,
            &layouts.release_channel,
            ctx.parallelism,
            pinned,
        )
        .await
        .context("pull mandatory release channels")?;

        let optional: BTreeSet<String> = OPTIONAL_CHANNELS
            .iter()
            .map(|channel| format!("{}:{}", release_repo, channel))
            .collect();
        transfer::pull(
            &*ctx.client,
            &optional,
            &layouts.release_channel,
            ctx.parallelism,
            PullOpts {
                resolve_tags: true,
                allow_missing: true,
            },
        )
        .await
        .context("pull optional release channels")?;

        let heads = channel_heads(ctx, &layouts.release_channel).await?;

        let channels_client = ctx.client.with_segment("release-channel");
        let all_tags = with_retries("list release channels", retry::ON_PULL, || {
            channels_client.list_tags()
        })
        .await
        .context("list release-channel tags")?;

        let planned = plan_versions(&heads, &all_tags, ctx.since_version.as_ref());
        let tags: Vec<String> = planned.iter().map(versions::format_tag).collect();
        info!("[release-channels] mirroring versions: {}", tags.join(", "));

        let version_refs: BTreeSet<String> = tags
            .iter()
            .map(|tag| format!("{}:{}", release_repo, tag))
            .collect();
        transfer::pull(
            &*ctx.client,
            &version_refs,
            &layouts.release_channel,
            ctx.parallelism,
            pinned,
        )
        .await
        .context("pull versioned release-channel images")?;
        tags
    };

    // Platform images and both installer flavors, one tag per version.
    let root_refs: BTreeSet<String> = version_tags
        .iter()
        .map(|tag| format!("{}:{}", source, tag))
        .collect();
    let install_refs: BTreeSet<String> = version_tags
        .iter()
        .map(|tag| format!("{}/install:{}", source, tag))
        .collect();
    let standalone_refs: BTreeSet<String> = version_tags
        .iter()
        .map(|tag| format!("{}/install-standalone:{}", source, tag))
        .collect();

    info!("[platform] pulling {} release images", root_refs.len());
    transfer::pull(&*ctx.client, &root_refs, &layouts.root, ctx.parallelism, pinned)
        .await
        .context("pull platform images")?;
    transfer::pull(
        &*ctx.client,
        &install_refs,
        &layouts.install,
        ctx.parallelism,
        pinned,
    )
    .await
    .context("pull installers")?;
    transfer::pull(
        &*ctx.client,
        &standalone_refs,
        &layouts.standalone,
        ctx.parallelism,
        pinned,
    )
    .await
    .context("pull standalone installers")?;

    // Every installer embeds the digest map of its release; the closure
    // joins the root layout.
    let closure_refs = installer_closure(&layouts.install, &source).await?;
    info!("[platform] pulling {} images of the digest closure", closure_refs.len());
    transfer::pull(
        &*ctx.client,
        &closure_refs,
        &layouts.root,
        ctx.parallelism,
        pinned,
    )
    .await
    .context("pull installer digest closure")?;

    for layout in layouts.all() {
        layout.sort_index().await?;
    }

    // A pinned build still has to cover every default channel on push.
    if let Some(tag) = &ctx.deckhouse_tag {
        let descriptor = layouts.release_channel.find_by_tag(tag).await?;
        for channel in DEFAULT_CHANNELS {
            layouts
                .release_channel
                .tag_existing_digest(&descriptor.digest, channel)
                .await?;
        }
        layouts.release_channel.sort_index().await?;
    }

    write_release_manifests(ctx, &layouts.release_channel, &version_tags).await?;

    info!("[platform] packing bundle");
    let writer = bundle_writer(ctx, "platform.tar")?;
    let writer = bundle::pack(&workdir, writer, None).context("pack platform bundle")?;
    let files = writer.finish()?;
    let _ = fs::remove_dir_all(&workdir);
    finish_bundle(files, ctx.gost_digest)?;
    Ok(())
}

/// Read every channel's `version.json` back from the layout.
async fn channel_heads(
    ctx: &PullContext,
    release_channel: &Layout,
) -> anyhow::Result<BTreeMap<String, Version>> {
    let mut heads = BTreeMap::new();
    for channel in DEFAULT_CHANNELS.iter().chain(OPTIONAL_CHANNELS) {
        let descriptor = match release_channel.find_by_tag(channel).await {
            Ok(descriptor) => descriptor,
            Err(_) if OPTIONAL_CHANNELS.contains(channel) => {
                warn!("[release-channels] optional channel {} not published, skipping", channel);
                continue;
            }
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("release channel {}", channel))
            }
        };

        let image = release_channel.read_image(&descriptor).await?;
        let record = match release::version_record(&image) {
            Ok(record) => record,
            Err(e) => {
                warn!("[release-channels] channel {} carries no usable version record: {}", channel, e);
                continue;
            }
        };
        if record.suspended && !ctx.ignore_suspend {
            return Err(MirrorError::Fatal(format!(
                "release channel {} is suspended at {}; retry later",
                channel,
                record.tag()
            ))
            .into());
        }
        heads.insert(
            channel.to_string(),
            record
                .semver()
                .with_context(|| format!("release channel {}", channel))?,
        );
    }
    Ok(heads)
}

/// Digest (or legacy tag) closure of every pulled installer image.
async fn installer_closure(
    install: &Layout,
    source: &str,
) -> anyhow::Result<BTreeSet<String>> {
    let mut refs = BTreeSet::new();
    for descriptor in install.manifests().await {
        let image = install
            .read_image(&descriptor)
            .await
            .with_context(|| format!("read installer {}", descriptor.ref_name()))?;

        match release::extract_file(&image, release::INSTALLER_DIGESTS_FILE) {
            Ok(doc) => {
                refs.extend(closure::digest_references(source, &doc));
                continue;
            }
            Err(MirrorError::ImageNotFound(_)) => {}
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("installer {}", descriptor.ref_name()))
            }
        }

        // Old installers carry a tag map instead.
        match release::extract_file(&image, release::INSTALLER_TAGS_FILE) {
            Ok(doc) => refs.extend(closure::tag_references(source, &doc)?),
            Err(MirrorError::ImageNotFound(_)) => warn!(
                "[{}] installer carries no digest map, nothing to close over",
                descriptor.ref_name()
            ),
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("installer {}", descriptor.ref_name()))
            }
        }
    }
    Ok(refs)
}

/// Generate the `deckhousereleases.yaml` companion document.
async fn write_release_manifests(
    ctx: &PullContext,
    release_channel: &Layout,
    version_tags: &[String],
) -> anyhow::Result<()> {
    let mut manifests = Vec::new();
    for tag in version_tags {
        let descriptor = match release_channel.find_by_tag(tag).await {
            Ok(descriptor) => descriptor,
            Err(_) => continue,
        };
        let image = release_channel.read_image(&descriptor).await?;
        let record = match release::version_record(&image) {
            Ok(record) => record,
            Err(e) => {
                warn!("[{}] no release manifest generated: {}", tag, e);
                continue;
            }
        };
        let changelog = release::extract_file(&image, release::CHANGELOG_FILE).ok();
        manifests.push(release::release_manifest(&record, changelog.as_deref())?);
    }

    if manifests.is_empty() {
        return Ok(());
    }
    let rendered = release::render_manifests(&manifests)?;
    let target = ctx.bundle_dir.join("deckhousereleases.yaml");
    fs::write(&target, rendered).with_context(|| format!("write {}", target.display()))?;
    info!("[platform] release manifests written to {}", target.display());
    Ok(())
}
