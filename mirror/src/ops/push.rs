//! The push flow: replay bundles into the destination registry.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{info, warn};

use crate::bundle::{self, chunked};
use crate::layout::Layout;
use crate::ops::PushContext;
use crate::registry::ImageRepo;
use crate::transfer;

/// Push every bundle found in the bundle directory.
pub async fn push_bundles(ctx: &PushContext) -> anyhow::Result<()> {
    let platform_bundle = ctx.bundle_dir.join("platform.tar");
    if chunked::bundle_exists(&platform_bundle) {
        commons::logs::process("Pushing platform releases")
            .run(push_platform(ctx, &platform_bundle))
            .await
            .context("push platform")?;
    } else {
        info!("[push] no platform bundle found, skipping");
    }

    let security_bundle = ctx.bundle_dir.join("security.tar");
    if chunked::bundle_exists(&security_bundle) {
        commons::logs::process("Pushing security vulnerability databases")
            .run(push_security(ctx, &security_bundle))
            .await
            .context("push security databases")?;
    } else {
        info!("[push] no security bundle found, skipping");
    }

    for (module, bundle_path) in module_bundles(&ctx.bundle_dir)? {
        commons::logs::process(format!("Pushing module {}", module))
            .run(push_module(ctx, &module, &bundle_path))
            .await
            .with_context(|| format!("push module {}", module))?;
    }

    info!("Push complete");
    Ok(())
}

/// Module bundles present in the bundle directory, `(name, path)`.
fn module_bundles(bundle_dir: &Path) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(bundle_dir)
        .with_context(|| format!("read bundle directory {}", bundle_dir.display()))?
    {
        let path = entry?.path();
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        // Either module-<name>.tar or the first chunk of it.
        let module = if let Some(stem) = name.strip_suffix(".tar") {
            stem.strip_prefix("module-").map(str::to_string)
        } else if let Some(stem) = name.strip_suffix(".tar.0000.chunk") {
            stem.strip_prefix("module-").map(str::to_string)
        } else {
            None
        };
        if let Some(module) = module {
            out.push((
                module.clone(),
                bundle_dir.join(format!("module-{}.tar", module)),
            ));
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

async fn push_platform(ctx: &PushContext, bundle_path: &Path) -> anyhow::Result<()> {
    let scratch = ctx.working_dir.join("push").join("platform");
    let result = async {
        unpack_to(bundle_path, &scratch)?;
        bundle::validate_layouts(&[
            ("platform images", scratch.clone()),
            ("installers", scratch.join("install")),
            ("standalone installers", scratch.join("install-standalone")),
            ("release channels", scratch.join("release-channel")),
        ])?;

        let targets: [(&str, PathBuf, &str); 4] = [
            ("platform images", scratch.clone(), ""),
            ("installers", scratch.join("install"), "install"),
            (
                "standalone installers",
                scratch.join("install-standalone"),
                "install-standalone",
            ),
            (
                "release channels",
                scratch.join("release-channel"),
                "release-channel",
            ),
        ];
        for (description, layout_dir, segment) in &targets {
            let layout = Layout::open(layout_dir)?;
            let dest = ctx.client.with_segment(segment);
            transfer::push_layout(&*dest, &layout, description, ctx.parallelism)
                .await
                .with_context(|| format!("push {}", description))?;
        }
        Ok(())
    }
    .await;
    let _ = fs::remove_dir_all(&scratch);
    result
}

async fn push_security(ctx: &PushContext, bundle_path: &Path) -> anyhow::Result<()> {
    let scratch = ctx.working_dir.join("push").join("security");
    let result = async {
        unpack_to(bundle_path, &scratch)?;
        let security_root = scratch.join("security");
        for (name, _) in super::security::SECURITY_DATABASES {
            let layout_dir = security_root.join(name);
            if !layout_dir.join("index.json").is_file() {
                warn!("[push] security database {} not in bundle, skipping", name);
                continue;
            }
            let layout = Layout::open(&layout_dir)?;
            if layout.is_empty().await {
                // The source edition shipped without this database.
                warn!("[push] security database {} is empty, skipping", name);
                continue;
            }
            let dest = ctx.client.with_segment("security").with_segment(name);
            transfer::push_layout(&*dest, &layout, name, ctx.parallelism)
                .await
                .with_context(|| format!("push security database {}", name))?;
        }
        Ok(())
    }
    .await;
    let _ = fs::remove_dir_all(&scratch);
    result
}

async fn push_module(
    ctx: &PushContext,
    module: &str,
    bundle_path: &Path,
) -> anyhow::Result<()> {
    let scratch = ctx.working_dir.join("push").join("modules").join(module);
    let result = async {
        unpack_to(bundle_path, &scratch)?;
        let module_root = scratch.join("modules").join(module);
        bundle::validate_layouts(&[
            ("module images", module_root.clone()),
            ("module release channels", module_root.join("release")),
        ])?;

        let modules_client = ctx.client.with_segment(&ctx.modules_path_suffix);
        let module_client = modules_client.with_segment(module);

        let layout = Layout::open(&module_root)?;
        transfer::push_layout(&*module_client, &layout, "module images", ctx.parallelism)
            .await
            .context("push module images")?;

        let release_layout = Layout::open(module_root.join("release"))?;
        let release_client = module_client.with_segment("release");
        transfer::push_layout(
            &*release_client,
            &release_layout,
            "module release channels",
            ctx.parallelism,
        )
        .await
        .context("push module release channels")?;

        let extra_root = module_root.join("extra");
        if extra_root.is_dir() {
            let extra_client = module_client.with_segment("extra");
            let mut extra_dirs: Vec<PathBuf> = fs::read_dir(&extra_root)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            extra_dirs.sort();
            for extra_dir in extra_dirs {
                let extra_name = extra_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let layout = Layout::open(&extra_dir)?;
                // Extra short tags carry their own "<name>:<tag>" path, so
                // the push target is the extra root itself.
                transfer::push_layout(&*extra_client, &layout, &extra_name, ctx.parallelism)
                    .await
                    .with_context(|| format!("push extra images '{}'", extra_name))?;
            }
        }

        // Leave the discovery marker so the destination lists this module.
        transfer::push_module_marker(&*modules_client, module).await?;
        Ok(())
    }
    .await;
    let _ = fs::remove_dir_all(&scratch);
    result
}

fn unpack_to(bundle_path: &Path, scratch: &Path) -> anyhow::Result<()> {
    if scratch.exists() {
        fs::remove_dir_all(scratch)
            .with_context(|| format!("reset scratch directory {}", scratch.display()))?;
    }
    fs::create_dir_all(scratch)?;
    let reader = chunked::open_bundle(bundle_path)
        .with_context(|| format!("open bundle {}", bundle_path.display()))?;
    bundle::unpack(reader, scratch)
        .with_context(|| format!("unpack {}", bundle_path.display()))?;
    Ok(())
}
