//! Supplementary GOST R 34.11-2012 bundle checksums.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use streebog::{Digest, Streebog256};

/// Compute the Streebog-256 digest of a file, hex-encoded.
pub fn file_digest(path: &Path) -> anyhow::Result<String> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Streebog256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write the digest of `path` next to it as `<path>.gostsum` and return
/// the checksum file's path.
pub fn write_digest_file(path: &Path) -> anyhow::Result<PathBuf> {
    let digest = file_digest(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let target = path.with_file_name(format!("{}.gostsum", file_name));
    std::fs::write(&target, format!("{}  {}\n", digest, file_name))
        .with_context(|| format!("write {}", target.display()))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_file_is_written_alongside() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("platform.tar");
        std::fs::write(&bundle, b"bundle-bytes").unwrap();

        let sum_path = write_digest_file(&bundle).unwrap();
        assert_eq!(
            sum_path.file_name().unwrap().to_string_lossy(),
            "platform.tar.gostsum"
        );
        let contents = std::fs::read_to_string(&sum_path).unwrap();
        let digest = contents.split_whitespace().next().unwrap();
        assert_eq!(digest.len(), 64);
        assert!(contents.trim_end().ends_with("platform.tar"));

        // Deterministic for identical content.
        assert_eq!(digest, file_digest(&bundle).unwrap());
    }
}
