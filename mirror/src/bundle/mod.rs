//! Packing layout trees into portable tar bundles.
//!
//! Bundles are plain tar streams with fully deterministic headers: every
//! entry is a regular file, mode `0777`, epoch mtime, slash-separated
//! path. Source files are deleted as soon as their bytes are streamed;
//! from that point the tar is the canonical copy.

pub mod chunked;
pub mod gost;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use log::debug;
use walkdir::WalkDir;

/// Stream `source` into a tar writer, optionally below `prefix`.
///
/// Returns the writer so chunked sinks can be finished by the caller.
pub fn pack<W: Write>(source: &Path, out: W, prefix: Option<&str>) -> anyhow::Result<W> {
    let mut builder = tar::Builder::new(out);

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .expect("walked entries live below the walk root");
        let mut name = slash_path(relative);
        if let Some(prefix) = prefix {
            name = format!("{}/{}", prefix.trim_matches('/'), name);
        }

        let metadata = entry.metadata()?;
        let mut header = tar::Header::new_gnu();
        header.set_size(metadata.len());
        header.set_mode(0o777);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);

        let mut file = File::open(entry.path())
            .with_context(|| format!("open {}", entry.path().display()))?;
        builder
            .append_data(&mut header, &name, &mut file)
            .with_context(|| format!("archive {}", name))?;
        drop(file);

        // The tar stream owns this content now.
        fs::remove_file(entry.path())
            .with_context(|| format!("remove streamed file {}", entry.path().display()))?;
        debug!("[{}] archived", name);
    }

    builder.finish()?;
    Ok(builder.into_inner()?)
}

/// Unpack a bundle stream into `dest`.
///
/// Errors abort immediately; the caller owns (and will remove) the
/// scratch directory.
pub fn unpack<R: Read>(input: R, dest: &Path) -> anyhow::Result<()> {
    let mut archive = tar::Archive::new(input);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        anyhow::ensure!(
            relative
                .components()
                .all(|c| matches!(c, Component::Normal(_))),
            "unsafe path '{}' in bundle",
            relative.display()
        );

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = File::create(&target)
            .with_context(|| format!("create {}", target.display()))?;
        io::copy(&mut entry, &mut file)
            .with_context(|| format!("extract {}", relative.display()))?;
        file.sync_all()?;
    }
    Ok(())
}

/// Assert that every expected layout exists and carries at least one
/// image. `expected` maps human descriptions to layout directories.
pub fn validate_layouts(expected: &[(&str, PathBuf)]) -> anyhow::Result<()> {
    #[derive(serde::Deserialize)]
    struct MinimalIndex {
        #[serde(default)]
        manifests: Vec<serde_json::Value>,
    }

    for (description, path) in expected {
        let raw = fs::read(path.join("index.json")).map_err(|e| {
            anyhow::anyhow!(
                "bundle has no layout for {} at {}: {}",
                description,
                path.display(),
                e
            )
        })?;
        let index: MinimalIndex = serde_json::from_slice(&raw).map_err(|e| {
            anyhow::anyhow!("malformed index for {} at {}: {}", description, path.display(), e)
        })?;
        anyhow::ensure!(
            !index.manifests.is_empty(),
            "bundle carries no images for {} (layout {})",
            description,
            path.display()
        );
    }
    Ok(())
}

fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
