use crate::error::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Append a bare suffix (e.g. `".hpd"`) to a base path without treating it
/// as an extension swap, so `profile.run1` becomes `profile.run1.hpd`.
pub fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// A file handle that is opened on construction and closed on drop.
///
/// When `delete_on_drop` is set the file is also unlinked on drop; the
/// digest builder uses this so a half-written digest never survives an
/// error path.
pub struct ScopedFile {
    file: File,
    path: PathBuf,
    delete_on_drop: bool,
}

impl ScopedFile {
    /// Open for writing, truncating any existing file.
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(ScopedFile {
            file,
            path,
            delete_on_drop: false,
        })
    }

    /// Open an existing file for reading.
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path)?;
        Ok(ScopedFile {
            file,
            path,
            delete_on_drop: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_delete_on_drop(&mut self, delete: bool) {
        self.delete_on_drop = delete;
    }
}

impl Drop for ScopedFile {
    fn drop(&mut self) {
        if self.delete_on_drop
            && let Err(err) = fs::remove_file(&self.path)
        {
            log::warn!("failed to remove {}: {err}", self.path.display());
        }
    }
}

impl Read for ScopedFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for ScopedFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Seek for ScopedFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_appends_without_replacing() {
        let base = Path::new("/tmp/run.2024");
        assert_eq!(with_suffix(base, ".hpm"), PathBuf::from("/tmp/run.2024.hpm"));
    }

    #[test]
    fn create_truncates_and_drop_keeps_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.hpc");
        {
            let mut f = ScopedFile::create(path.clone()).unwrap();
            f.write_all(b"stale").unwrap();
        }
        {
            let _f = ScopedFile::create(path.clone()).unwrap();
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn delete_on_drop_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.hpc");
        {
            let mut f = ScopedFile::create(path.clone()).unwrap();
            f.set_delete_on_drop(true);
            f.write_all(b"partial").unwrap();
        }
        assert!(!path.exists());
    }
}
