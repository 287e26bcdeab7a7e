//! kmv — контейнер KeyMultiValue: по записи на ключ со списком значений.
//!
//! Та же постраничная дисциплина, что у kv: резидентная страница,
//! spill-файл из сырых образов, таблица дескрипторов. Отличия:
//! трёхпрефиксный заголовок записи и цепочки блочных страниц для ключей,
//! чей список значений не помещается в одну страницу (знак nv —
//! дискриминант, как у overflow-цепочек страничных движков). Заголовок
//! цепочки всегда начинает свежую страницу и лежит на ней один.

pub mod record;

mod convert;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::PAGE_RECORD_MAX;
use crate::kv::{KeyValue, PageDesc};
use crate::mem::{align_up, round_file, Alignment};
use crate::metrics;

pub use record::{KmvRef, read_sizes_into};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Empty,
    Appending,
    Complete,
}

pub struct KeyMultiValue {
    align: Alignment,
    pagesize: usize,

    page: Vec<u8>,
    pages: Vec<PageDesc>,
    loaded: Option<usize>,

    // ----- счётчики открытой страницы -----
    nkey: u64,
    keysize: u64,
    valuesize: u64,
    alignsize: usize,
    /// Точные байты страницы (заголовки + длины + ключи + значения).
    exact: u64,

    // ----- итоги контейнера -----
    pub nkmv: u64,
    pub ksize: u64,
    pub vsize: u64,
    pub tsize: u64,

    path: PathBuf,
    file: Option<File>,
    fileflag: bool,

    state: State,
}

impl KeyMultiValue {
    pub fn new<P: AsRef<Path>>(path: P, pagesize: usize, align: Alignment) -> Self {
        Self {
            align,
            pagesize,
            page: vec![0u8; pagesize],
            pages: Vec::new(),
            loaded: None,
            nkey: 0,
            keysize: 0,
            valuesize: 0,
            alignsize: 0,
            exact: 0,
            nkmv: 0,
            ksize: 0,
            vsize: 0,
            tsize: 0,
            path: path.as_ref().to_path_buf(),
            file: None,
            fileflag: false,
            state: State::Empty,
        }
    }

    #[inline]
    pub fn align(&self) -> Alignment {
        self.align
    }

    #[inline]
    pub fn pagesize(&self) -> usize {
        self.pagesize
    }

    #[inline]
    pub fn npage(&self) -> usize {
        self.pages.len()
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    // ---------------- создание из KV ----------------

    /// clone: каждая пара KV становится записью KMV с nv = 1.
    /// Без коммуникации и без сортировки; ключи не обязаны быть уникальны.
    pub fn clone_from(&mut self, kv: &mut KeyValue) -> Result<()> {
        for ipage in 0..kv.npage() {
            let desc = kv.request_page(ipage)?;
            // записи читаются из страницы источника, пишутся в свою
            let mut off = 0usize;
            for _ in 0..desc.nkey {
                let rec = crate::kv::record::read_record(
                    kv.page_bytes(desc.alignsize),
                    off,
                    desc.alignsize,
                    kv.align(),
                )
                .ok_or_else(|| anyhow::anyhow!("malformed KeyValue page {}", ipage))?;
                off = rec.end;
                let sizes = [rec.value.len() as u32];
                self.add_record(rec.key, &sizes, rec.value)?;
            }
        }
        Ok(())
    }

    /// collapse: весь KV — одна запись с ключом key и значениями
    /// k1,v1,k2,v2,... (nv = 2*nkv). При переполнении страницы — цепочка.
    pub fn collapse_from(&mut self, key: &[u8], kv: &mut KeyValue) -> Result<()> {
        let nv_total = 2 * kv.nkv;
        let mvb_total = kv.ksize + kv.vsize;
        if mvb_total > i32::MAX as u64 || nv_total > i32::MAX as u64 {
            bail!("single key's value list exceeds i32::MAX (collapse of {} pairs)", kv.nkv);
        }

        let fits = record::normal_size(key.len(), nv_total as usize, mvb_total as usize, self.align)
            <= self.pagesize;
        if fits {
            self.collapse_inline(key, kv, nv_total as usize, mvb_total as usize)
        } else {
            self.collapse_chained(key, kv, mvb_total)
        }
    }

    /// Инлайновый collapse: запись собирается прямо в странице,
    /// длины и байты дописываются по ходу одного прохода по KV.
    fn collapse_inline(&mut self, key: &[u8], kv: &mut KeyValue, nv: usize, mvb: usize) -> Result<()> {
        let need = record::normal_size(key.len(), nv, mvb, self.align);
        if self.alignsize + need > self.pagesize {
            self.flush_page()?;
        }
        let base = self.alignsize;
        let a = self.align;

        LittleEndian::write_i32(&mut self.page[base..base + 4], key.len() as i32);
        LittleEndian::write_i32(&mut self.page[base + 4..base + 8], mvb as i32);
        LittleEndian::write_i32(&mut self.page[base + 8..base + 12], nv as i32);

        let mut soff = base + record::THREE_LEN_BYTES;
        let koff = align_up(soff + nv * 4, a.k);
        self.page[koff..koff + key.len()].copy_from_slice(key);
        let mut voff = align_up(koff + key.len(), a.v);

        for ipage in 0..kv.npage() {
            let desc = kv.request_page(ipage)?;
            let mut off = 0usize;
            for _ in 0..desc.nkey {
                let rec = crate::kv::record::read_record(
                    kv.page_bytes(desc.alignsize),
                    off,
                    desc.alignsize,
                    kv.align(),
                )
                .ok_or_else(|| anyhow::anyhow!("malformed KeyValue page {}", ipage))?;
                off = rec.end;
                for part in [rec.key, rec.value] {
                    LittleEndian::write_i32(&mut self.page[soff..soff + 4], part.len() as i32);
                    soff += 4;
                    self.page[voff..voff + part.len()].copy_from_slice(part);
                    voff += part.len();
                }
            }
        }

        self.alignsize = align_up(voff, a.t);
        self.nkey += 1;
        self.keysize += key.len() as u64;
        self.valuesize += mvb as u64;
        self.exact += (record::THREE_LEN_BYTES + nv * 4 + key.len() + mvb) as u64;
        self.state = State::Appending;
        Ok(())
    }

    /// Цепной collapse: план блоков по длинам, затем второй проход с байтами.
    fn collapse_chained(&mut self, key: &[u8], kv: &mut KeyValue, mvb_total: u64) -> Result<()> {
        // проход 1: считаем блоки жадной укладкой
        let mut planner = BlockPlanner::new(self.pagesize, self.align);
        for ipage in 0..kv.npage() {
            let desc = kv.request_page(ipage)?;
            let mut off = 0usize;
            for _ in 0..desc.nkey {
                let rec = crate::kv::record::read_record(
                    kv.page_bytes(desc.alignsize),
                    off,
                    desc.alignsize,
                    kv.align(),
                )
                .ok_or_else(|| anyhow::anyhow!("malformed KeyValue page {}", ipage))?;
                off = rec.end;
                planner.push(rec.key.len())?;
                planner.push(rec.value.len())?;
            }
        }
        let nblocks = planner.finish();

        // проход 2: заголовок и блоки
        self.begin_chain(key, mvb_total, nblocks)?;
        let mut sizes: Vec<u32> = Vec::new();
        let mut staged: Vec<u8> = Vec::with_capacity(self.pagesize);
        for ipage in 0..kv.npage() {
            let desc = kv.request_page(ipage)?;
            let mut off = 0usize;
            for _ in 0..desc.nkey {
                let rec = crate::kv::record::read_record(
                    kv.page_bytes(desc.alignsize),
                    off,
                    desc.alignsize,
                    kv.align(),
                )
                .ok_or_else(|| anyhow::anyhow!("malformed KeyValue page {}", ipage))?;
                off = rec.end;
                self.stage_value(rec.key, &mut sizes, &mut staged)?;
                self.stage_value(rec.value, &mut sizes, &mut staged)?;
            }
        }
        self.finish_chain(&mut sizes, &mut staged)
    }

    /// Добавить одну обычную запись (значения единым срезом).
    pub fn add_record(&mut self, key: &[u8], sizes: &[u32], values: &[u8]) -> Result<()> {
        let need = record::normal_size(key.len(), sizes.len(), values.len(), self.align);
        if need > self.pagesize {
            bail!(
                "single key/multivalue pair exceeds page size ({} > {})",
                need,
                self.pagesize
            );
        }
        if self.alignsize + need > self.pagesize || self.nkey == PAGE_RECORD_MAX {
            self.flush_page()?;
        }
        self.alignsize = record::write_normal(&mut self.page, self.alignsize, key, sizes, values, self.align);
        self.nkey += 1;
        self.keysize += key.len() as u64;
        self.valuesize += values.len() as u64;
        self.exact += (record::THREE_LEN_BYTES + sizes.len() * 4 + key.len() + values.len()) as u64;
        self.state = State::Appending;
        Ok(())
    }

    // ---------------- цепочки ----------------

    /// Начать цепочку: сбросить недописанную страницу и выпустить
    /// заголовочную страницу (на ней только ключ).
    pub(crate) fn begin_chain(&mut self, key: &[u8], mvb_total: u64, nblocks: usize) -> Result<()> {
        if mvb_total > i32::MAX as u64 || nblocks > i32::MAX as usize {
            bail!("single key's value list exceeds i32::MAX ({} bytes)", mvb_total);
        }
        let need = record::header_size(key.len(), self.align);
        if need > self.pagesize {
            bail!(
                "single key/multivalue pair exceeds page size ({} > {})",
                need,
                self.pagesize
            );
        }
        if self.alignsize > 0 || self.nkey > 0 {
            self.flush_page()?;
        }
        self.alignsize =
            record::write_header(&mut self.page, 0, key, mvb_total as usize, nblocks, self.align);
        self.nkey = 1;
        self.keysize = key.len() as u64;
        self.valuesize = mvb_total; // байты значений учитываются на заголовке
        self.exact += (record::THREE_LEN_BYTES + key.len()) as u64;
        self.state = State::Appending;
        self.flush_page()
    }

    /// Выпустить одну блочную страницу цепочки.
    pub(crate) fn add_chain_block(&mut self, sizes: &[u32], values: &[u8]) -> Result<()> {
        let used = record::block_size(sizes.len(), values.len(), self.align);
        if used > self.pagesize {
            bail!("chain block exceeds page size ({} > {})", used, self.pagesize);
        }
        debug_assert!(self.alignsize == 0 && self.nkey == 0);
        self.alignsize = record::write_block(&mut self.page, sizes, values, self.align);
        self.exact += (4 + sizes.len() * 4 + values.len()) as u64;
        self.state = State::Appending;
        self.flush_page()
    }

    /// Уложить значение в текущий блок, при переполнении выпустив его.
    pub(crate) fn stage_value(
        &mut self,
        value: &[u8],
        sizes: &mut Vec<u32>,
        staged: &mut Vec<u8>,
    ) -> Result<()> {
        let would = record::block_size(sizes.len() + 1, staged.len() + value.len(), self.align);
        if would > self.pagesize && !sizes.is_empty() {
            self.add_chain_block(sizes, staged)?;
            sizes.clear();
            staged.clear();
        }
        if record::block_size(1, value.len(), self.align) > self.pagesize {
            bail!("single value exceeds page size ({} bytes)", value.len());
        }
        sizes.push(value.len() as u32);
        staged.extend_from_slice(value);
        Ok(())
    }

    /// Добить последний блок цепочки.
    pub(crate) fn finish_chain(&mut self, sizes: &mut Vec<u32>, staged: &mut Vec<u8>) -> Result<()> {
        if !sizes.is_empty() {
            self.add_chain_block(sizes, staged)?;
            sizes.clear();
            staged.clear();
        }
        Ok(())
    }

    // ---------------- жизненный цикл ----------------

    pub fn complete(&mut self) -> Result<()> {
        self.commit_page()?;
        if self.fileflag {
            self.write_page()?;
            self.file = None;
        }
        self.init_page();

        self.nkmv = 0;
        self.ksize = 0;
        self.vsize = 0;
        self.tsize = 0;
        for desc in &self.pages {
            self.nkmv += desc.nkey;
            self.ksize += desc.keysize;
            self.vsize += desc.valuesize;
            self.tsize += desc.exactsize;
        }
        self.state = State::Complete;
        Ok(())
    }

    /// Стать постраничной копией другого KMV (той же выкладки).
    pub fn copy_from(&mut self, other: &mut KeyMultiValue) -> Result<()> {
        if self.state != State::Empty {
            bail!("cannot copy into a non-empty KeyMultiValue");
        }
        if !other.is_complete() {
            bail!("cannot copy an incomplete KeyMultiValue");
        }
        if self.align != other.align {
            bail!("KeyMultiValue copy requires identical alignment");
        }
        let npage = other.npage();
        for ipage in 0..npage {
            let desc = other.request_page(ipage)?;
            self.page[..desc.alignsize].copy_from_slice(other.page_bytes(desc.alignsize));
            self.nkey = desc.nkey;
            self.keysize = desc.keysize;
            self.valuesize = desc.valuesize;
            self.alignsize = desc.alignsize;
            self.exact += desc.exactsize;
            self.state = State::Appending;
            if ipage + 1 < npage {
                self.flush_page()?;
            }
        }
        self.complete()
    }

    // ---------------- итерация ----------------

    pub fn request_page(&mut self, ipage: usize) -> Result<PageDesc> {
        if self.state != State::Complete {
            bail!("cannot iterate an incomplete KeyMultiValue");
        }
        let desc = *self
            .pages
            .get(ipage)
            .ok_or_else(|| anyhow::anyhow!("page {} out of range ({})", ipage, self.pages.len()))?;
        if self.fileflag && self.loaded != Some(ipage) {
            self.load_page(ipage)?;
        }
        Ok(desc)
    }

    #[inline]
    pub fn page_bytes(&self, alignsize: usize) -> &[u8] {
        &self.page[..alignsize]
    }

    #[inline]
    pub(crate) fn page_bytes_mut(&mut self, alignsize: usize) -> &mut [u8] {
        &mut self.page[..alignsize]
    }

    /// Переписать изменённую страницу обратно (sort_multivalues).
    pub fn overwrite_page(&mut self, ipage: usize) -> Result<()> {
        if !self.fileflag {
            // без файла страница резидентна и уже изменена
            return Ok(());
        }
        if self.loaded != Some(ipage) {
            bail!("overwrite_page({}) without loading it first", ipage);
        }
        let desc = self.pages[ipage];
        self.ensure_file()?;
        let f = self.file.as_mut().unwrap();
        f.seek(SeekFrom::Start(desc.fileoffset))
            .with_context(|| format!("seek spill file {}", self.path.display()))?;
        f.write_all(&self.page[..desc.filesize as usize])
            .with_context(|| format!("write spill file {}", self.path.display()))?;
        metrics::record_spill_write(desc.filesize);
        Ok(())
    }

    // ---------------- страницы и файл ----------------

    fn commit_page(&mut self) -> Result<()> {
        if self.pages.len() as u64 >= PAGE_RECORD_MAX {
            bail!("page count exceeds i32::MAX");
        }
        let fileoffset = match self.pages.last() {
            Some(prev) => prev.fileoffset + prev.filesize,
            None => 0,
        };
        self.pages.push(PageDesc {
            nkey: self.nkey,
            keysize: self.keysize,
            valuesize: self.valuesize,
            exactsize: self.exact,
            alignsize: self.alignsize,
            filesize: round_file(self.alignsize) as u64,
            fileoffset,
        });
        Ok(())
    }

    fn init_page(&mut self) {
        self.nkey = 0;
        self.keysize = 0;
        self.valuesize = 0;
        self.alignsize = 0;
        self.exact = 0;
        self.loaded = None;
    }

    fn flush_page(&mut self) -> Result<()> {
        self.commit_page()?;
        self.write_page()?;
        self.init_page();
        Ok(())
    }

    fn ensure_file(&mut self) -> Result<()> {
        if self.file.is_none() {
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)
                .with_context(|| format!("open spill file {}", self.path.display()))?;
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
            .with_context(|| format!("seek spill file {}", self.path.display()))?;
        f.write_all(&self.page[..desc.filesize as usize])
            .with_context(|| format!("write spill file {}", self.path.display()))?;
        metrics::record_spill_write(desc.filesize);
        Ok(())
    }

    fn load_page(&mut self, ipage: usize) -> Result<()> {
        let desc = self.pages[ipage];
        self.ensure_file()?;
        let f = self.file.as_mut().unwrap();
        f.seek(SeekFrom::Start(desc.fileoffset))
            .with_context(|| format!("seek spill file {}", self.path.display()))?;
        let n = desc.filesize as usize;
        f.read_exact(&mut self.page[..n])
            .with_context(|| format!("read spill file {}", self.path.display()))?;
        metrics::record_spill_read(desc.filesize);
        self.loaded = Some(ipage);
        Ok(())
    }
}

impl Drop for KeyMultiValue {
    fn drop(&mut self) {
        self.file = None;
        if self.fileflag {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Жадный план цепочки: сколько блочных страниц займёт список значений.
pub(crate) struct BlockPlanner {
    pagesize: usize,
    align: Alignment,
    nv: usize,
    bytes: usize,
    nblocks: usize,
}

impl BlockPlanner {
    pub(crate) fn new(pagesize: usize, align: Alignment) -> Self {
        Self {
            pagesize,
            align,
            nv: 0,
            bytes: 0,
            nblocks: 0,
        }
    }

    pub(crate) fn push(&mut self, len: usize) -> Result<()> {
        let would = record::block_size(self.nv + 1, self.bytes + len, self.align);
        if would > self.pagesize && self.nv > 0 {
            self.nblocks += 1;
            self.nv = 0;
            self.bytes = 0;
        }
        if record::block_size(1, len, self.align) > self.pagesize {
            bail!("single value exceeds page size ({} bytes)", len);
        }
        self.nv += 1;
        self.bytes += len;
        Ok(())
    }

    pub(crate) fn finish(&mut self) -> usize {
        if self.nv > 0 {
            self.nblocks += 1;
            self.nv = 0;
            self.bytes = 0;
        }
        self.nblocks
    }
}
