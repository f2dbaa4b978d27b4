//! The modules pull flow.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use anyhow::Context;
use log::{debug, info, warn};

use commons::retry::{self, with_retries};
use commons::MirrorError;

use crate::bundle;
use crate::layout::Layout;
use crate::ops::{bundle_writer, finish_bundle, prepare_workdir, PullContext};
use crate::reference;
use crate::registry::ImageRepo;
use crate::release;
use crate::resolve::closure;
use crate::resolve::platform::DEFAULT_CHANNELS;
use crate::resolve::vex::{attestation_reference, VexTracker};
use crate::transfer::{self, PullOpts};

pub async fn pull_modules(ctx: &PullContext) -> anyhow::Result<()> {
    let modules_client = ctx.client.with_segment(&ctx.modules_path_suffix);

    // Module discovery is a tag listing of the modules repository; editions
    // without modules simply miss it.
    let module_names = match with_retries("list modules", retry::ON_PULL, || {
        modules_client.list_tags()
    })
    .await
    {
        Ok(tags) => tags,
        Err(MirrorError::RepoNotFound(e)) => {
            warn!("[modules] no modules repository published: {}", e);
            return Ok(());
        }
        Err(e) => return Err(anyhow::Error::from(e)).context("list modules"),
    };

    for name in module_names {
        if !ctx.filter.matches(&name) {
            debug!("[{}] filtered out, skipping", name);
            continue;
        }
        commons::logs::process(format!("Mirroring module {}", name))
            .run(pull_module(ctx, &*modules_client, &name))
            .await
            .with_context(|| format!("pull module {}", name))?;
    }
    Ok(())
}

async fn pull_module(
    ctx: &PullContext,
    modules_client: &dyn ImageRepo,
    name: &str,
) -> anyhow::Result<()> {
    let module_repo = format!("{}/{}", modules_client.registry(), name);
    let module_client = modules_client.with_segment(name);

    let workdir = ctx.working_dir.join("modules").join(name);
    prepare_workdir(&workdir, ctx.resume)?;
    let root_layout = Layout::open_or_create(&workdir)?;
    let release_layout = Layout::open_or_create(workdir.join("release"))?;

    let pinned = PullOpts {
        resolve_tags: true,
        allow_missing: false,
    };
    let constraint = ctx.filter.constraint(name);
    let mut version_tags: Vec<String> = Vec::new();

    // Release channels first: their version records name the module
    // versions to mirror.
    if ctx.filter.should_mirror_release_channels(name) {
        let channel_refs: BTreeSet<String> = DEFAULT_CHANNELS
            .iter()
            .map(|channel| format!("{}/release:{}", module_repo, channel))
            .collect();
        transfer::pull(
            &*ctx.client,
            &channel_refs,
            &release_layout,
            ctx.parallelism,
            PullOpts {
                resolve_tags: true,
                allow_missing: true,
            },
        )
        .await
        .context("pull module release channels")?;

        for channel in DEFAULT_CHANNELS {
            let descriptor = match release_layout.find_by_tag(channel).await {
                Ok(descriptor) => descriptor,
                Err(_) => {
                    warn!("[{}] release channel {} not published, skipping", name, channel);
                    continue;
                }
            };
            let image = release_layout.read_image(&descriptor).await?;
            let record = match release::version_record(&image) {
                Ok(record) => record,
                Err(e) => {
                    warn!("[{}] channel {} carries no usable version record: {}", name, channel, e);
                    continue;
                }
            };
            let tag = record.tag();
            // The channel image doubles as the versioned release image.
            release_layout
                .tag_existing_digest(&descriptor.digest, &tag)
                .await?;
            version_tags.push(tag);
        }
        if release_layout.is_empty().await {
            warn!("[{}] no release channels found at {}/release", name, module_repo);
        }
    }

    // Explicit versions from the filter constraint.
    match constraint {
        Some(c) if c.is_exact() => {
            version_tags.push(c.exact_tag().expect("exact constraints pin a tag"));
        }
        Some(_) => {
            let tags = with_retries(&module_repo, retry::ON_PULL, || module_client.list_tags())
                .await
                .with_context(|| format!("list tags of {}", module_repo))?;
            version_tags.extend(ctx.filter.versions_to_mirror(name, &tags));
        }
        None => {}
    }

    // First occurrence wins; duplicates come from channels repeating an
    // explicitly requested version.
    let mut seen = BTreeSet::new();
    let version_tags: Vec<String> = version_tags
        .into_iter()
        .filter(|tag| seen.insert(tag.clone()))
        .collect();
    info!("[{}] mirroring versions: {}", name, version_tags.join(", "));

    let image_refs: BTreeSet<String> = version_tags
        .iter()
        .map(|tag| format!("{}:{}", module_repo, tag))
        .collect();
    transfer::pull(&*ctx.client, &image_refs, &root_layout, ctx.parallelism, pinned)
        .await
        .context("pull module images")?;

    // Per-version digest closure and auxiliary images.
    let mut closure_refs: BTreeSet<String> = BTreeSet::new();
    let mut extras: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for tag in &version_tags {
        let descriptor = root_layout.find_by_tag(tag).await?;
        let image = root_layout.read_image(&descriptor).await?;

        match release::extract_file(&image, release::MODULE_DIGESTS_FILE) {
            Ok(doc) => {
                closure_refs.extend(closure::digest_references(&module_repo, &doc));
            }
            Err(MirrorError::ImageNotFound(_)) => {
                debug!("[{}:{}] no digest map shipped", name, tag)
            }
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("read digest map of {}:{}", name, tag))
            }
        }

        match release::extract_file(&image, release::EXTRA_IMAGES_FILE) {
            Ok(doc) => {
                for (extra_name, extra_tag) in release::extra_images(&doc)? {
                    extras.entry(extra_name.clone()).or_default().insert(format!(
                        "{}/extra/{}:{}",
                        module_repo, extra_name, extra_tag
                    ));
                }
            }
            Err(MirrorError::ImageNotFound(_)) => {}
            Err(e) => {
                return Err(anyhow::Error::from(e))
                    .with_context(|| format!("read extra images of {}:{}", name, tag))
            }
        }
    }

    transfer::pull(
        &*ctx.client,
        &closure_refs,
        &root_layout,
        ctx.parallelism,
        pinned,
    )
    .await
    .context("pull module digest closure")?;

    let mut extra_layouts: Vec<(String, Layout)> = Vec::new();
    for (extra_name, refs) in &extras {
        let layout = Layout::open_or_create(workdir.join("extra").join(extra_name))?;
        transfer::pull(&*ctx.client, refs, &layout, ctx.parallelism, pinned)
            .await
            .with_context(|| format!("pull extra images '{}'", extra_name))?;
        extra_layouts.push((extra_name.clone(), layout));
    }

    // Vulnerability attestations ride along when published.
    let mut tracker = VexTracker::new();
    pull_attestations(ctx, &root_layout, &mut tracker)
        .await
        .context("pull module attestations")?;
    for (extra_name, layout) in &extra_layouts {
        pull_attestations(ctx, layout, &mut tracker)
            .await
            .with_context(|| format!("pull attestations for extra '{}'", extra_name))?;
    }

    // An exact pin still needs channel coverage in the release layout.
    if let Some(c) = constraint {
        if c.is_exact() {
            let tag = c.exact_tag().expect("exact constraints pin a tag");
            let release_ref: BTreeSet<String> =
                std::iter::once(format!("{}/release:{}", module_repo, tag)).collect();
            transfer::pull(
                &*ctx.client,
                &release_ref,
                &release_layout,
                ctx.parallelism,
                pinned,
            )
            .await
            .with_context(|| format!("pull release image for pinned version {}", tag))?;

            let descriptor = release_layout.find_by_tag(&tag).await?;
            match c.channel_alias() {
                Some(alias) => {
                    release_layout
                        .tag_existing_digest(&descriptor.digest, alias)
                        .await?;
                }
                None => {
                    for channel in DEFAULT_CHANNELS {
                        release_layout
                            .tag_existing_digest(&descriptor.digest, channel)
                            .await?;
                    }
                }
            }
        }
    }

    root_layout.sort_index().await?;
    release_layout.sort_index().await?;
    for (_, layout) in &extra_layouts {
        layout.sort_index().await?;
    }

    info!("[{}] packing bundle", name);
    let writer = bundle_writer(ctx, &format!("module-{}.tar", name))?;
    let prefix = format!("modules/{}", name);
    let writer = bundle::pack(&workdir, writer, Some(&prefix))
        .with_context(|| format!("pack module {}", name))?;
    let files = writer.finish()?;
    let _ = fs::remove_dir_all(&workdir);
    finish_bundle(files, ctx.gost_digest)?;
    Ok(())
}

/// Probe and pull VEX attestations for every digest in `layout`.
///
/// Absence is normal; any other probe failure propagates.
async fn pull_attestations(
    ctx: &PullContext,
    layout: &Layout,
    tracker: &mut VexTracker,
) -> anyhow::Result<()> {
    let mut candidates: BTreeSet<String> = BTreeSet::new();
    for descriptor in layout.manifests().await {
        if descriptor.short_tag().ends_with(".att") {
            continue;
        }
        if !tracker.first_seen(&descriptor.digest) {
            continue;
        }
        let repo = reference::repo_of(descriptor.ref_name());
        if repo.is_empty() {
            continue;
        }
        let digest_ref = format!("{}@{}", repo, descriptor.digest);
        let candidate = match attestation_reference(&digest_ref) {
            Some(candidate) => candidate,
            None => continue,
        };

        let (candidate_repo, kind) = reference::split_reference(&candidate);
        let scoped = transfer::descend(&*ctx.client, candidate_repo)?;
        let tag = match kind {
            reference::RefKind::Tag(tag) => tag.to_string(),
            _ => continue,
        };
        let exists = with_retries(&candidate, retry::ON_PULL, || {
            scoped.check_image_exists(&tag)
        })
        .await
        .with_context(|| format!("probe attestation {}", candidate))?;
        if exists {
            candidates.insert(candidate);
        } else {
            debug!("[{}] no attestation published", digest_ref);
        }
    }

    if candidates.is_empty() {
        return Ok(());
    }
    info!("[attestations] pulling {} attestation images", candidates.len());
    transfer::pull(
        &*ctx.client,
        &candidates,
        layout,
        ctx.parallelism,
        PullOpts {
            resolve_tags: false,
            allow_missing: true,
        },
    )
    .await
}
