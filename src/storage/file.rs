use std::fs::{File, OpenOptions};
use std::os::unix::prelude::FileExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};

use crate::common::{PageNo, PAGE_SIZE};

/// Thin page-granular wrapper around the single database (or journal)
/// file. All offsets are `page_no * PAGE_SIZE`; partial pages are an error.
pub struct DbFile {
    path: PathBuf,
    file: File,
}

impl DbFile {
    /// Opens the file read-write, creating it when asked.
    pub fn open(path: impl Into<PathBuf>, create: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .with_context(|| format!("could not open {}", path.display()))?;

        let size = file
            .metadata()
            .with_context(|| format!("could not stat {}", path.display()))?
            .len();
        if size % PAGE_SIZE as u64 != 0 {
            return Err(Error::msg(format!(
                "{} has size {} which is not a multiple of the page size {}",
                path.display(),
                size,
                PAGE_SIZE
            )));
        }

        Ok(Self { path, file })
    }

    /// Opens without the page-multiple size check. The journal's records
    /// are not page-aligned.
    pub fn open_raw(path: impl Into<PathBuf>, create: bool) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
            .with_context(|| format!("could not open {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    pub fn delete(path: &Path) -> Result<()> {
        std::fs::remove_file(path)
            .with_context(|| format!("could not delete {}", path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of whole pages currently in the file.
    pub fn page_span(&self) -> Result<u32> {
        let size = self
            .file
            .metadata()
            .with_context(|| format!("could not stat {}", self.path.display()))?
            .len();
        Ok((size / PAGE_SIZE as u64) as u32)
    }

    pub fn read_page(&self, page_no: PageNo, buffer: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), PAGE_SIZE);
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.file
            .read_exact_at(buffer, offset)
            .with_context(|| format!("could not read page {} of {}", page_no, self.path.display()))
    }

    pub fn write_page(&self, page_no: PageNo, buffer: &[u8]) -> Result<()> {
        debug_assert_eq!(buffer.len(), PAGE_SIZE);
        let offset = page_no as u64 * PAGE_SIZE as u64;
        self.file
            .write_all_at(buffer, offset)
            .with_context(|| format!("could not write page {} of {}", page_no, self.path.display()))
    }

    /// Raw positional write, used by the journal whose records are not
    /// page-aligned.
    pub fn write_at(&self, offset: u64, buffer: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buffer, offset)
            .with_context(|| format!("could not write to {}", self.path.display()))
    }

    pub fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buffer, offset)
            .with_context(|| format!("could not read from {}", self.path.display()))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .with_context(|| format!("could not stat {}", self.path.display()))?
            .len())
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .with_context(|| format!("could not sync {}", self.path.display()))
    }

    pub fn truncate(&self, pages: u32) -> Result<()> {
        self.truncate_raw(pages as u64 * PAGE_SIZE as u64)
    }

    pub fn truncate_raw(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .with_context(|| format!("could not truncate {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::DbFile;
    use crate::common::PAGE_SIZE;

    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn pages_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.db");
        let file = DbFile::open(&path, true)?;

        assert_eq!(file.page_span()?, 0);

        let page: [u8; PAGE_SIZE] = [7u8; PAGE_SIZE];
        file.write_page(2, &page)?;
        assert_eq!(file.page_span()?, 3);

        let mut read = [0u8; PAGE_SIZE];
        file.read_page(2, &mut read)?;
        assert_eq!(read, page);

        file.truncate(1)?;
        assert_eq!(file.page_span()?, 1);
        Ok(())
    }

    #[test]
    fn partial_page_file_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data.db");
        std::fs::write(&path, [0u8; 100])?;
        assert!(DbFile::open(&path, false).is_err());
        Ok(())
    }
}
