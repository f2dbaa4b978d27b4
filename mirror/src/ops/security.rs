//! The security-databases pull flow.

use std::collections::BTreeSet;
use std::fs;

use anyhow::Context;
use log::info;

use crate::bundle;
use crate::layout::Layout;
use crate::ops::{bundle_writer, finish_bundle, prepare_workdir, PullContext};
use crate::registry::ImageRepo;
use crate::transfer::{self, PullOpts};

/// The fixed vulnerability-database images, `(repository, tag)`.
pub const SECURITY_DATABASES: &[(&str, &str)] = &[
    ("trivy-db", "2"),
    ("trivy-bdu", "1"),
    ("trivy-java-db", "1"),
    ("trivy-checks", "0"),
];

pub async fn pull_security_db(ctx: &PullContext) -> anyhow::Result<()> {
    let workdir = ctx.working_dir.join("security");
    prepare_workdir(&workdir, ctx.resume)?;

    let source = ctx.client.registry();
    for (name, tag) in SECURITY_DATABASES {
        let layout = Layout::open_or_create(workdir.join(name))?;
        let refs: BTreeSet<String> =
            std::iter::once(format!("{}/security/{}:{}", source, name, tag)).collect();
        // Some editions ship without security content; absent databases
        // are fine.
        transfer::pull(
            &*ctx.client,
            &refs,
            &layout,
            ctx.parallelism,
            PullOpts {
                resolve_tags: true,
                allow_missing: true,
            },
        )
        .await
        .with_context(|| format!("pull {}", name))?;
        layout.sort_index().await?;
    }

    info!("[security] packing bundle");
    let writer = bundle_writer(ctx, "security.tar")?;
    let writer = bundle::pack(&workdir, writer, Some("security")).context("pack security bundle")?;
    let files = writer.finish()?;
    let _ = fs::remove_dir_all(&workdir);
    finish_bundle(files, ctx.gost_digest)?;
    Ok(())
}
