//! spool — append-only файл страниц под merge-сортировку.
//!
//! Записи — готовые образы KV-записей (самоописываемые), страница хранит
//! только их число. Страницы spool'а меньше страниц контейнеров:
//! треть half-региона, чтобы merge держал два входа и выход одновременно.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::mem::round_file;
use crate::metrics;

#[derive(Debug, Clone, Copy)]
pub struct SpoolPage {
    pub nentry: u64,
    pub size: usize,
    pub filesize: u64,
    pub fileoffset: u64,
}

pub struct Spool {
    pagesize: usize,
    page: Vec<u8>,
    pages: Vec<SpoolPage>,
    loaded: Option<usize>,

    nentry: u64,
    size: usize,

    path: PathBuf,
    file: Option<File>,
    fileflag: bool,
    complete: bool,
}

impl Spool {
    /// Создать spool с собственной страницей заданного размера
    /// (кратного ALIGN_FILE).
    pub fn new<P: AsRef<Path>>(path: P, pagesize: usize) -> Self {
        Self {
            pagesize,
            page: vec![0u8; pagesize],
            pages: Vec::new(),
            loaded: None,
            nentry: 0,
            size: 0,
            path: path.as_ref().to_path_buf(),
            file: None,
            fileflag: false,
            complete: false,
        }
    }

    #[inline]
    pub fn npage(&self) -> usize {
        self.pages.len()
    }

    /// Дописать один готовый образ записи.
    pub fn add(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.pagesize {
            bail!(
                "single entry exceeds spool page size ({} > {})",
                bytes.len(),
                self.pagesize
            );
        }
        if self.size + bytes.len() > self.pagesize {
            self.flush_page()?;
        }
        self.page[self.size..self.size + bytes.len()].copy_from_slice(bytes);
        self.size += bytes.len();
        self.nentry += 1;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.commit_page();
        if self.fileflag {
            self.write_page()?;
            self.file = None;
        }
        self.nentry = 0;
        self.size = 0;
        self.loaded = None;
        self.complete = true;
        Ok(())
    }

    /// Поднять страницу в RAM, вернуть её дескриптор.
    pub fn request_page(&mut self, ipage: usize) -> Result<SpoolPage> {
        if !self.complete {
            bail!("cannot iterate an incomplete spool");
        }
        let desc = *self
            .pages
            .get(ipage)
            .ok_or_else(|| anyhow::anyhow!("spool page {} out of range ({})", ipage, self.pages.len()))?;
        if self.fileflag && self.loaded != Some(ipage) {
            self.ensure_file()?;
            let f = self.file.as_mut().unwrap();
            f.seek(SeekFrom::Start(desc.fileoffset))
                .with_context(|| format!("seek spool file {}", self.path.display()))?;
            let n = desc.filesize as usize;
            f.read_exact(&mut self.page[..n])
                .with_context(|| format!("read spool file {}", self.path.display()))?;
            metrics::record_spill_read(desc.filesize);
            self.loaded = Some(ipage);
        }
        Ok(desc)
    }

    #[inline]
    pub fn page_bytes(&self, size: usize) -> &[u8] {
        &self.page[..size]
    }

    // ---------------- внутреннее ----------------

    fn commit_page(&mut self) {
        let fileoffset = match self.pages.last() {
            Some(prev) => prev.fileoffset + prev.filesize,
            None => 0,
        };
        self.pages.push(SpoolPage {
            nentry: self.nentry,
            size: self.size,
            filesize: round_file(self.size) as u64,
            fileoffset,
        });
    }

    fn flush_page(&mut self) -> Result<()> {
        self.commit_page();
        self.write_page()?;
        self.nentry = 0;
        self.size = 0;
        self.loaded = None;
        Ok(())
    }

    fn ensure_file(&mut self) -> Result<()> {
        if self.file.is_none() {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)
                .with_context(|| format!("open spool file {}", self.path.display()))?;
            self.file = Some(f);
            self.fileflag = true;
        }
        Ok(())
    }

    fn write_page(&mut self) -> Result<()> {
        let desc = *self.pages.last().expect("write_page without a page");
        self.ensure_file()?;
        let f = self.file.as_mut().unwrap();
        f.seek(SeekFrom::Start(desc.fileoffset))
            .with_context(|| format!("seek spool file {}", self.path.display()))?;
        f.write_all(&self.page[..desc.filesize as usize])
            .with_context(|| format!("write spool file {}", self.path.display()))?;
        metrics::record_spool_write(desc.filesize);
        Ok(())
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        self.file = None;
        if self.fileflag {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
