//! Phase drivers for the three artifact families.
//!
//! Each pull flow is a straight sequence: create layouts, resolve the
//! reference set, transfer, introspect, seal, pack. The push flow replays
//! bundles in the opposite direction. Drivers log a scoped begin/end line
//! per phase and wrap failures with the phase name.

pub mod modules;
pub mod platform;
pub mod push;
pub mod security;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info};
use semver::Version;

use commons::MirrorError;

use crate::bundle::{chunked, gost};
use crate::filter::ModuleFilter;
use crate::registry::ImageRepo;
use crate::transfer::Parallelism;

/// Bound on the pre-flight registry access probe.
pub const ACCESS_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything the pull phase needs.
pub struct PullContext {
    /// Client scoped at the source registry root.
    pub client: Box<dyn ImageRepo>,
    /// Transient working directory base.
    pub working_dir: PathBuf,
    /// Directory receiving the bundle files.
    pub bundle_dir: PathBuf,
    /// Chunk size in bytes; zero writes unsplit bundles.
    pub chunk_size: u64,
    pub parallelism: Parallelism,
    /// Pull exactly this build instead of walking release channels.
    pub deckhouse_tag: Option<String>,
    /// Oldest release to include when walking channels.
    pub since_version: Option<Version>,
    /// Proceed past suspended release channels.
    pub ignore_suspend: bool,
    pub filter: ModuleFilter,
    /// Repository path suffix where modules live.
    pub modules_path_suffix: String,
    pub skip_platform: bool,
    pub skip_security_db: bool,
    pub skip_modules: bool,
    /// Emit GOST R 34.11-2012 checksums next to bundle files.
    pub gost_digest: bool,
    /// Overwrite bundle files left by a previous run.
    pub force: bool,
    /// Reuse a previous partially-populated working directory.
    pub resume: bool,
}

/// Everything the push phase needs.
pub struct PushContext {
    /// Client scoped at the destination repository root.
    pub client: Box<dyn ImageRepo>,
    pub working_dir: PathBuf,
    /// Directory holding the bundle files.
    pub bundle_dir: PathBuf,
    pub parallelism: Parallelism,
    pub modules_path_suffix: String,
}

/// Probe registry reachability and authorization within a bounded context.
///
/// Not-found answers still prove the registry is reachable and the
/// credentials are accepted, so they pass the probe.
pub async fn check_access(client: &dyn ImageRepo) -> anyhow::Result<()> {
    let probe = tokio::time::timeout(ACCESS_PROBE_TIMEOUT, client.list_tags()).await;
    match probe {
        Err(_) => Err(MirrorError::NetworkUnavailable(format!(
            "{}: access probe timed out",
            client.registry()
        ))
        .into()),
        Ok(Ok(_)) => Ok(()),
        Ok(Err(MirrorError::ImageNotFound(_))) | Ok(Err(MirrorError::RepoNotFound(_))) => Ok(()),
        Ok(Err(e)) => Err(anyhow::Error::from(e))
            .with_context(|| format!("validate access to {}", client.registry())),
    }
}

/// Run the whole pull phase.
pub async fn run_pull(ctx: &PullContext) -> anyhow::Result<()> {
    info!("Validating access to {}", ctx.client.registry());
    check_access(&*ctx.client).await?;
    prepare_bundle_dir(ctx)?;

    if !ctx.skip_platform {
        commons::logs::process("Mirroring platform releases")
            .run(platform::pull_platform(ctx))
            .await
            .context("pull platform")?;
    }
    if !ctx.skip_security_db {
        commons::logs::process("Mirroring security vulnerability databases")
            .run(security::pull_security_db(ctx))
            .await
            .context("pull security databases")?;
    }
    if !ctx.skip_modules {
        commons::logs::process("Mirroring modules")
            .run(modules::pull_modules(ctx))
            .await
            .context("pull modules")?;
    }

    let _ = fs::remove_dir_all(&ctx.working_dir);
    info!("Pull complete, bundle written to {}", ctx.bundle_dir.display());
    Ok(())
}

/// Run the whole push phase.
pub async fn run_push(ctx: &PushContext) -> anyhow::Result<()> {
    info!("Validating access to {}", ctx.client.registry());
    check_access(&*ctx.client).await?;
    push::push_bundles(ctx).await
}

/// Create (or reset, depending on the resume policy) a working directory.
pub(crate) fn prepare_workdir(path: &Path, resume: bool) -> anyhow::Result<()> {
    if !resume && path.exists() {
        debug!("[{}] discarding previous working data", path.display());
        fs::remove_dir_all(path)
            .with_context(|| format!("reset working directory {}", path.display()))?;
    }
    fs::create_dir_all(path)
        .with_context(|| format!("create working directory {}", path.display()))?;
    Ok(())
}

/// Refuse to clobber previous bundle files unless forced.
fn prepare_bundle_dir(ctx: &PullContext) -> anyhow::Result<()> {
    fs::create_dir_all(&ctx.bundle_dir)
        .with_context(|| format!("create bundle directory {}", ctx.bundle_dir.display()))?;

    let mut existing: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(&ctx.bundle_dir)? {
        let path = entry?.path();
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let is_bundle = name == "platform.tar"
            || name == "security.tar"
            || name == "deckhousereleases.yaml"
            || name.starts_with("module-")
            || name.contains(".tar.") && (name.ends_with(".chunk") || name.ends_with(".gostsum"));
        if is_bundle {
            existing.push(path);
        }
    }

    if existing.is_empty() {
        return Ok(());
    }
    anyhow::ensure!(
        ctx.force,
        "bundle files already exist in {}; pass --force to overwrite",
        ctx.bundle_dir.display()
    );
    for path in existing {
        debug!("[{}] removing previous bundle file", path.display());
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

/// Seal a packed bundle: sync chunk list, optional GOST checksums.
pub(crate) fn finish_bundle(files: Vec<PathBuf>, emit_gost: bool) -> anyhow::Result<()> {
    for file in &files {
        info!("[{}] bundle file written", file.display());
        if emit_gost {
            let sum = gost::write_digest_file(file)?;
            info!("[{}] checksum written", sum.display());
        }
    }
    Ok(())
}

/// The chunked sink for one bundle file.
pub(crate) fn bundle_writer(ctx: &PullContext, name: &str) -> anyhow::Result<chunked::ChunkedWriter> {
    chunked::ChunkedWriter::create(ctx.bundle_dir.join(name), ctx.chunk_size)
        .with_context(|| format!("create bundle {}", name))
}
