use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Error, Result};
use tracing::{debug, warn};

use super::file::DbFile;
use crate::common::{PageNo, HEADER_PAGE_NO, PAGE_SIZE};

const DB_MAGIC: u32 = 0x534C_5444;
const JOURNAL_MAGIC: u32 = 0x534C_544A;
const JOURNAL_SUFFIX: &str = ".journal";
const JOURNAL_HEADER_SIZE: u64 = 12;
const JOURNAL_ENTRY_SIZE: u64 = 4 + PAGE_SIZE as u64;

// Header page layout: magic, page_count, freelist_head. The rest is unused.
const HDR_MAGIC_OFF: usize = 0;
const HDR_PAGE_COUNT_OFF: usize = 4;
const HDR_FREELIST_OFF: usize = 8;

/// Soft bound on cached pages. Clean pages past this are evicted; dirty
/// pages always stay resident until commit or rollback.
const CACHE_SOFT_LIMIT: usize = 1024;

struct CachedPage {
    data: Box<[u8]>,
    dirty: bool,
}

impl CachedPage {
    fn zeroed() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
            dirty: false,
        }
    }
}

/// Mediates every page read and write on the database file and owns the
/// transaction machinery. Mutations stay in the cache until commit; the
/// rollback journal holds pre-images so a crash during the commit window
/// is recoverable on the next open.
pub struct Pager {
    file: DbFile,
    journal_path: PathBuf,
    cache: HashMap<PageNo, CachedPage>,
    page_count: u32,
    freelist_head: PageNo,
    in_tx: bool,
    tx_orig_page_count: u32,
    journal: Option<DbFile>,
    journal_entries: u32,
    journaled: HashSet<PageNo>,
}

impl Pager {
    /// Opens (or creates) a database file. A leftover journal with a valid
    /// header means a crash interrupted a commit; it is rolled back before
    /// anything is served.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let journal_path = journal_path_for(&path);
        let file = DbFile::open(&path, true)?;

        if DbFile::exists(&journal_path) {
            warn!(journal = %journal_path.display(), "hot journal found, recovering");
            recover(&file, &journal_path)?;
        }

        let mut pager = Self {
            file,
            journal_path,
            cache: HashMap::new(),
            page_count: 0,
            freelist_head: 0,
            in_tx: false,
            tx_orig_page_count: 0,
            journal: None,
            journal_entries: 0,
            journaled: HashSet::new(),
        };

        if pager.file.page_span()? == 0 {
            pager.init_header()?;
        }
        pager.load_header()?;
        Ok(pager)
    }

    fn init_header(&mut self) -> Result<()> {
        let mut header = [0u8; PAGE_SIZE];
        write_u32(&mut header, HDR_MAGIC_OFF, DB_MAGIC);
        write_u32(&mut header, HDR_PAGE_COUNT_OFF, 1);
        write_u32(&mut header, HDR_FREELIST_OFF, 0);
        self.file.write_page(HEADER_PAGE_NO, &header)?;
        self.file.sync()?;
        debug!(path = %self.file.path().display(), "initialized fresh database file");
        Ok(())
    }

    fn load_header(&mut self) -> Result<()> {
        self.cache.remove(&HEADER_PAGE_NO);
        let mut header = [0u8; PAGE_SIZE];
        self.file.read_page(HEADER_PAGE_NO, &mut header)?;
        if read_u32(&header, HDR_MAGIC_OFF) != DB_MAGIC {
            return Err(Error::msg(format!(
                "{} is not a database file",
                self.file.path().display()
            )));
        }
        self.page_count = read_u32(&header, HDR_PAGE_COUNT_OFF);
        self.freelist_head = read_u32(&header, HDR_FREELIST_OFF);
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn in_transaction(&self) -> bool {
        self.in_tx
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Read access to a page. Legal outside a transaction.
    pub fn page(&mut self, page_no: PageNo) -> Result<&[u8]> {
        self.fetch(page_no)?;
        Ok(&self.cache.get(&page_no).unwrap().data)
    }

    /// Write access to a page. Requires an active transaction; the first
    /// write to an on-disk page journals its original image.
    pub fn page_mut(&mut self, page_no: PageNo) -> Result<&mut [u8]> {
        if !self.in_tx {
            return Err(Error::msg("page write outside a transaction"));
        }
        self.fetch(page_no)?;
        self.journal_if_needed(page_no)?;
        let cached = self.cache.get_mut(&page_no).unwrap();
        cached.dirty = true;
        Ok(&mut cached.data)
    }

    fn fetch(&mut self, page_no: PageNo) -> Result<()> {
        if self.cache.contains_key(&page_no) {
            return Ok(());
        }
        if page_no >= self.page_count {
            return Err(Error::msg(format!(
                "page {} is out of bounds (database has {} pages)",
                page_no, self.page_count
            )));
        }
        self.evict_if_crowded();
        let mut cached = CachedPage::zeroed();
        self.file.read_page(page_no, &mut cached.data)?;
        self.cache.insert(page_no, cached);
        Ok(())
    }

    fn evict_if_crowded(&mut self) {
        if self.cache.len() < CACHE_SOFT_LIMIT {
            return;
        }
        let victim = self
            .cache
            .iter()
            .find(|(no, page)| !page.dirty && **no != HEADER_PAGE_NO)
            .map(|(no, _)| *no);
        if let Some(no) = victim {
            self.cache.remove(&no);
        }
    }

    /// Pops the free list or extends the file. The returned page is zeroed
    /// and resident in the cache.
    pub fn allocate_page(&mut self) -> Result<PageNo> {
        if !self.in_tx {
            return Err(Error::msg("page allocation outside a transaction"));
        }
        if self.freelist_head != 0 {
            let page_no = self.freelist_head;
            let next = read_u32(self.page(page_no)?, 0);
            let page = self.page_mut(page_no)?;
            page.fill(0);
            self.set_freelist_head(next)?;
            return Ok(page_no);
        }

        let page_no = self.page_count;
        self.page_count += 1;
        self.evict_if_crowded();
        let mut cached = CachedPage::zeroed();
        cached.dirty = true;
        self.cache.insert(page_no, cached);
        self.write_header_field(HDR_PAGE_COUNT_OFF, self.page_count)?;
        Ok(page_no)
    }

    /// Pushes a page onto the free list.
    pub fn free_page(&mut self, page_no: PageNo) -> Result<()> {
        if page_no == HEADER_PAGE_NO || page_no >= self.page_count {
            return Err(Error::msg(format!("cannot free page {}", page_no)));
        }
        let head = self.freelist_head;
        let page = self.page_mut(page_no)?;
        page.fill(0);
        write_u32(page, 0, head);
        self.set_freelist_head(page_no)
    }

    fn set_freelist_head(&mut self, head: PageNo) -> Result<()> {
        self.freelist_head = head;
        self.write_header_field(HDR_FREELIST_OFF, head)
    }

    fn write_header_field(&mut self, offset: usize, value: u32) -> Result<()> {
        let header = self.page_mut(HEADER_PAGE_NO)?;
        write_u32(header, offset, value);
        Ok(())
    }

    pub fn begin_transaction(&mut self) -> Result<()> {
        if self.in_tx {
            return Err(Error::msg("a transaction is already active"));
        }
        let journal = DbFile::open_raw(&self.journal_path, true)?;
        journal.truncate_raw(0)?;
        let mut header = [0u8; JOURNAL_HEADER_SIZE as usize];
        write_u32(&mut header, 0, JOURNAL_MAGIC);
        write_u32(&mut header, 4, 0);
        write_u32(&mut header, 8, self.page_count);
        journal.write_at(0, &header)?;
        journal.sync()?;

        self.journal = Some(journal);
        self.journal_entries = 0;
        self.journaled.clear();
        self.tx_orig_page_count = self.page_count;
        self.in_tx = true;
        Ok(())
    }

    fn journal_if_needed(&mut self, page_no: PageNo) -> Result<()> {
        if self.journaled.contains(&page_no) || page_no >= self.tx_orig_page_count {
            return Ok(());
        }
        // The cached image still matches the disk at this point; a page
        // cannot be dirty without having been journaled first.
        let image = self.cache.get(&page_no).unwrap().data.clone();
        debug_assert!(!self.cache.get(&page_no).unwrap().dirty);

        let journal = self.journal.as_ref().unwrap();
        let offset = JOURNAL_HEADER_SIZE + self.journal_entries as u64 * JOURNAL_ENTRY_SIZE;
        journal.write_at(offset, &page_no.to_le_bytes())?;
        journal.write_at(offset + 4, &image)?;
        journal.sync()?;
        self.journal_entries += 1;
        journal.write_at(4, &self.journal_entries.to_le_bytes())?;
        journal.sync()?;

        self.journaled.insert(page_no);
        Ok(())
    }

    /// Flushes every dirty page to the data file, syncs it, then deletes
    /// the journal. The journal's absence is the commit marker.
    pub fn commit(&mut self) -> Result<()> {
        if !self.in_tx {
            return Err(Error::msg("commit with no active transaction"));
        }
        if let Some(journal) = &self.journal {
            journal.sync()?;
        }
        let mut dirty: Vec<PageNo> = self
            .cache
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(no, _)| *no)
            .collect();
        dirty.sort_unstable();
        for page_no in &dirty {
            let page = self.cache.get(page_no).unwrap();
            self.file.write_page(*page_no, &page.data)?;
        }
        self.file.sync()?;
        self.end_transaction()?;
        debug!(pages = dirty.len(), "transaction committed");
        Ok(())
    }

    /// Discards every in-transaction change. Dirty pages never reach the
    /// data file before commit, so this only has to drop cached state and
    /// forget pages allocated past the original length.
    pub fn rollback(&mut self) -> Result<()> {
        if !self.in_tx {
            return Err(Error::msg("rollback with no active transaction"));
        }
        self.cache.retain(|_, page| !page.dirty);
        self.page_count = self.tx_orig_page_count;
        self.end_transaction()?;
        self.load_header()?;
        debug!("transaction rolled back");
        Ok(())
    }

    fn end_transaction(&mut self) -> Result<()> {
        for page in self.cache.values_mut() {
            page.dirty = false;
        }
        self.journal = None;
        self.journal_entries = 0;
        self.journaled.clear();
        self.in_tx = false;
        if DbFile::exists(&self.journal_path) {
            DbFile::delete(&self.journal_path)?;
        }
        Ok(())
    }

    /// Writes a subset of the dirty pages to disk and abandons the pager
    /// mid-commit, leaving the hot journal behind. Test hook for crash
    /// recovery.
    #[cfg(test)]
    pub fn simulate_torn_commit(mut self, pages_to_write: &[PageNo]) -> Result<()> {
        for page_no in pages_to_write {
            let page = self.cache.get(page_no).unwrap();
            self.file.write_page(*page_no, &page.data)?;
        }
        self.file.sync()?;
        self.journal = None; // keep the journal file on disk
        self.in_tx = false;
        Ok(())
    }
}

fn journal_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(JOURNAL_SUFFIX);
    PathBuf::from(name)
}

/// Restores journaled pre-images into the data file and truncates it back
/// to its pre-transaction length. An unreadable or torn header means no
/// data page was ever touched, so only the journal itself is removed.
fn recover(file: &DbFile, journal_path: &Path) -> Result<()> {
    let journal = DbFile::open_raw(journal_path, false)?;
    let len = journal.len()?;
    if len >= JOURNAL_HEADER_SIZE {
        let mut header = [0u8; JOURNAL_HEADER_SIZE as usize];
        journal.read_at(0, &mut header)?;
        if read_u32(&header, 0) == JOURNAL_MAGIC {
            let entries = read_u32(&header, 4);
            let orig_page_count = read_u32(&header, 8);
            let mut restored = 0u32;
            for i in 0..entries as u64 {
                let offset = JOURNAL_HEADER_SIZE + i * JOURNAL_ENTRY_SIZE;
                if offset + JOURNAL_ENTRY_SIZE > len {
                    break;
                }
                let mut page_no_bytes = [0u8; 4];
                journal.read_at(offset, &mut page_no_bytes)?;
                let page_no = u32::from_le_bytes(page_no_bytes);
                let mut image = [0u8; PAGE_SIZE];
                journal.read_at(offset + 4, &mut image)?;
                file.write_page(page_no, &image)?;
                restored += 1;
            }
            file.truncate(orig_page_count)?;
            file.sync()?;
            debug!(restored, orig_page_count, "journal rollback complete");
        }
    }
    DbFile::delete(journal_path)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
