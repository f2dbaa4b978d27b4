//! Size-bounded chunked file sink.
//!
//! A chunked writer rolls to the next sequential `<base>.NNNN.chunk` file
//! whenever the current chunk is full, so bundles can be streamed onto
//! media of bounded size. Chunk size zero disables chunking and produces
//! a single `<base>` file. Reading back concatenates the chunks in
//! lexicographic order.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Writer that splits its output across sequential chunk files.
pub struct ChunkedWriter {
    base: PathBuf,
    chunk_size: u64,
    written_in_chunk: u64,
    sequence: usize,
    current: File,
    files: Vec<PathBuf>,
}

impl ChunkedWriter {
    /// Open the sink. `chunk_size` of zero means one unsplit file.
    pub fn create(base: impl AsRef<Path>, chunk_size: u64) -> io::Result<ChunkedWriter> {
        let base = base.as_ref().to_path_buf();
        let first = if chunk_size == 0 {
            base.clone()
        } else {
            chunk_path(&base, 0)
        };
        let current = File::create(&first)?;
        Ok(ChunkedWriter {
            base,
            chunk_size,
            written_in_chunk: 0,
            sequence: 0,
            current,
            files: vec![first],
        })
    }

    fn roll(&mut self) -> io::Result<()> {
        self.current.sync_all()?;
        self.sequence += 1;
        let next = chunk_path(&self.base, self.sequence);
        self.current = File::create(&next)?;
        self.files.push(next);
        self.written_in_chunk = 0;
        Ok(())
    }

    /// Flush, sync and return the list of files written, in order.
    pub fn finish(mut self) -> io::Result<Vec<PathBuf>> {
        self.current.flush()?;
        self.current.sync_all()?;
        Ok(self.files)
    }
}

impl Write for ChunkedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.chunk_size == 0 {
            return self.current.write(buf);
        }
        if self.written_in_chunk >= self.chunk_size {
            self.roll()?;
        }
        let room = (self.chunk_size - self.written_in_chunk) as usize;
        let n = self.current.write(&buf[..buf.len().min(room)])?;
        self.written_in_chunk += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.flush()
    }
}

fn chunk_path(base: &Path, sequence: usize) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}.{:04}.chunk", name, sequence))
}

/// The on-disk files of a bundle: the single file, or its chunks sorted
/// lexicographically.
pub fn bundle_files(base: &Path) -> io::Result<Vec<PathBuf>> {
    if base.is_file() {
        return Ok(vec![base.to_path_buf()]);
    }
    let dir = base.parent().unwrap_or_else(|| Path::new("."));
    let stem = format!(
        "{}.",
        base.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut chunks: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| {
                    let name = n.to_string_lossy();
                    name.starts_with(&stem) && name.ends_with(".chunk")
                })
                .unwrap_or(false)
        })
        .collect();
    if chunks.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no bundle at {}", base.display()),
        ));
    }
    chunks.sort();
    Ok(chunks)
}

/// Whether a bundle (single file or chunks) exists at `base`.
pub fn bundle_exists(base: &Path) -> bool {
    bundle_files(base).is_ok()
}

/// Reader that concatenates a bundle's files.
pub struct ChunkedReader {
    files: Vec<PathBuf>,
    next: usize,
    current: Option<File>,
}

/// Open a bundle for sequential reading.
pub fn open_bundle(base: &Path) -> io::Result<ChunkedReader> {
    Ok(ChunkedReader {
        files: bundle_files(base)?,
        next: 0,
        current: None,
    })
}

impl Read for ChunkedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.current.is_none() {
                if self.next >= self.files.len() {
                    return Ok(0);
                }
                self.current = Some(File::open(&self.files[self.next])?);
                self.next += 1;
            }
            let n = self
                .current
                .as_mut()
                .expect("just ensured a current file")
                .read(buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_chunk_size_writes_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("platform.tar");
        let mut writer = ChunkedWriter::create(&base, 0).unwrap();
        writer.write_all(b"0123456789").unwrap();
        let files = writer.finish().unwrap();
        assert_eq!(files, vec![base.clone()]);
        assert_eq!(fs::read(&base).unwrap(), b"0123456789");
        assert_eq!(bundle_files(&base).unwrap(), vec![base]);
    }

    #[test]
    fn chunks_roll_at_the_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("platform.tar");
        let mut writer = ChunkedWriter::create(&base, 4).unwrap();
        writer.write_all(b"0123456789").unwrap();
        let files = writer.finish().unwrap();

        assert_eq!(files.len(), 3);
        assert_eq!(
            files[0].file_name().unwrap().to_string_lossy(),
            "platform.tar.0000.chunk"
        );
        assert_eq!(fs::read(&files[0]).unwrap(), b"0123");
        assert_eq!(fs::read(&files[1]).unwrap(), b"4567");
        assert_eq!(fs::read(&files[2]).unwrap(), b"89");
    }

    #[test]
    fn read_back_concatenates_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("platform.tar");
        let mut writer = ChunkedWriter::create(&base, 3).unwrap();
        writer.write_all(b"abcdefghij").unwrap();
        writer.finish().unwrap();

        let mut out = Vec::new();
        open_bundle(&base).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abcdefghij");
    }

    #[test]
    fn missing_bundle_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("absent.tar");
        assert!(!bundle_exists(&base));
        assert!(open_bundle(&base).is_err());
    }
}
