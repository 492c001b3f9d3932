//! Paged file with a bounded set of resident pages
//!
//! ```text
//! read_page(n) ──→ TwoQueueCache ──miss──→ file @ n * page_size
//! write_page(n) ─→ TwoQueueCache (dirty)
//!                      │ eviction / flush
//!                      ▼
//!                  PageWriter ──→ file
//! ```
//!
//! Pages beyond the end of the file read as zeros.

use crate::cache::{Cache, CacheObject, CacheWriter, TwoQueueCache, TwoQueueStats};
use crate::config::IndexConfig;
use crate::error::{Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bookkeeping cost of a resident page, in 4-byte words
pub const OVERHEAD_WORDS: usize = 16;

/// One resident page
#[derive(Debug, Clone)]
pub struct Page {
    number: i32,
    data: Bytes,
    changed: bool,
}

impl Page {
    pub fn number(&self) -> u32 {
        self.number as u32
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl CacheObject for Page {
    fn position(&self) -> i32 {
        self.number
    }

    fn memory_size(&self) -> usize {
        self.data.len() / 4 + OVERHEAD_WORDS
    }

    fn is_changed(&self) -> bool {
        self.changed
    }
}

/// Writes pages back to the underlying file
#[derive(Debug)]
pub struct PageWriter {
    file: File,
    page_size: usize,
    pages_written: u64,
}

impl PageWriter {
    fn offset(&self, number: i32) -> u64 {
        number as u64 * self.page_size as u64
    }

    fn write_page(&mut self, page: &Page) -> Result<()> {
        let offset = self.offset(page.number);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(format!("Seek failed: {}", e)))?;
        self.file
            .write_all(&page.data)
            .map_err(|e| Error::Storage(format!("Write failed: {}", e)))?;
        self.pages_written += 1;
        Ok(())
    }

    fn read_page(&mut self, number: i32) -> Result<Bytes> {
        let offset = self.offset(number);
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Storage(format!("Seek failed: {}", e)))?;
        let mut data = Vec::with_capacity(self.page_size);
        (&mut self.file)
            .take(self.page_size as u64)
            .read_to_end(&mut data)
            .map_err(|e| Error::Storage(format!("Read failed: {}", e)))?;
        data.resize(self.page_size, 0);
        Ok(Bytes::from(data))
    }

    fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::Storage(format!("Sync failed: {}", e)))
    }

    /// Pages written so far, by eviction or flush
    pub fn pages_written(&self) -> u64 {
        self.pages_written
    }
}

impl CacheWriter<Page> for PageWriter {
    fn write_back(&mut self, batch: Vec<Page>) -> Result<()> {
        for page in &batch {
            self.write_page(page)?;
        }
        debug!(pages = batch.len(), "Wrote back evicted pages");
        Ok(())
    }
}

/// File of fixed-size pages fronted by a 2Q cache
pub struct PageFile {
    path: PathBuf,
    page_size: usize,
    cache: Mutex<TwoQueueCache<Page, PageWriter>>,
}

impl std::fmt::Debug for PageFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFile")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl PageFile {
    /// Open or create a page file
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize, cache_max_kb: usize) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "Page size must be a power of two, got {}",
                page_size
            )));
        }
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create page directory: {}", e)))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open page file: {}", e)))?;

        info!(path = ?path, page_size, cache_max_kb, "Opened page file");

        let writer = PageWriter {
            file,
            page_size,
            pages_written: 0,
        };
        Ok(Self {
            path,
            page_size,
            cache: Mutex::new(TwoQueueCache::new(writer, cache_max_kb)),
        })
    }

    /// Open with page size and cache budget from the configuration
    pub fn with_config<P: AsRef<Path>>(path: P, cfg: &IndexConfig) -> Result<Self> {
        Self::open(path, cfg.page_size, cfg.cache_max_kb)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn position(number: u32) -> Result<i32> {
        i32::try_from(number)
            .map_err(|_| Error::Storage(format!("Page number {} out of range", number)))
    }

    /// Contents of page `number`
    pub fn read_page(&self, number: u32) -> Result<Bytes> {
        let pos = Self::position(number)?;
        let mut cache = self.cache.lock();
        if let Some(page) = cache.get(pos) {
            return Ok(page.data.clone());
        }
        let data = cache.writer_mut().read_page(pos)?;
        cache.put(Page {
            number: pos,
            data: data.clone(),
            changed: false,
        })?;
        Ok(data)
    }

    /// Replace page `number`; shorter data is zero-padded
    pub fn write_page(&self, number: u32, data: &[u8]) -> Result<()> {
        let pos = Self::position(number)?;
        if data.len() > self.page_size {
            return Err(Error::Storage(format!(
                "Page data of {} bytes exceeds page size {}",
                data.len(),
                self.page_size
            )));
        }
        let mut page = data.to_vec();
        page.resize(self.page_size, 0);

        self.cache.lock().update(
            pos,
            Page {
                number: pos,
                data: Bytes::from(page),
                changed: true,
            },
        )?;
        Ok(())
    }

    /// Write every dirty page in page order and sync the file
    pub fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock();
        let dirty: Vec<Page> = cache.get_all_changed().into_iter().cloned().collect();
        for page in &dirty {
            cache.writer_mut().write_page(page)?;
            if let Some(resident) = cache.find_mut(page.number) {
                resident.changed = false;
            }
        }
        cache.writer_mut().sync()?;
        debug!(path = ?self.path, pages = dirty.len(), "Flushed page file");
        Ok(())
    }

    pub fn cache_stats(&self) -> TwoQueueStats {
        self.cache.lock().stats()
    }

    /// Pages written to disk since open
    pub fn pages_written(&self) -> u64 {
        self.cache.lock().writer().pages_written()
    }
}
