//! kv — контейнер KeyValue: append-only последовательность записей
//! переменного размера, разложенная по страницам фиксированного размера.
//!
//! Страница строится в RAM; заполнившись, уходит в spill-файл (сырые
//! образы, выровненные до ALIGN_FILE, без заголовков). Таблица дескрипторов
//! страниц — арена с целочисленными индексами: счётчик записей, точные и
//! выровненные размеры, смещение в файле (бегущая сумма). Файл открывается
//! лениво при первом spill и закрывается в complete(); контейнер,
//! влезающий в RAM, диска не касается. Spill-файл удаляется в Drop.
//!
//! Состояния: Empty → Appending → Complete; append() возвращает Complete
//! обратно в Appending, подняв последнюю страницу из файла.

pub mod record;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::consts::PAGE_RECORD_MAX;
use crate::mem::{round_file, Alignment};
use crate::metrics;

pub use record::{KvPageIter, KvRef};

/// Дескриптор одной закоммиченной страницы.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageDesc {
    pub nkey: u64,
    pub keysize: u64,
    pub valuesize: u64,
    /// nkey * 8 + keysize + valuesize, без паддинга.
    pub exactsize: u64,
    /// Занятые байты страницы вместе с выравниванием.
    pub alignsize: usize,
    /// alignsize, округлённый до ALIGN_FILE.
    pub filesize: u64,
    /// Бегущая сумма filesize предыдущих страниц.
    pub fileoffset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Empty,
    Appending,
    Complete,
}

pub struct KeyValue {
    align: Alignment,
    pagesize: usize,

    /// Единственная резидентная страница (quarter всего memsize).
    page: Vec<u8>,
    pages: Vec<PageDesc>,
    /// Какая закоммиченная страница сейчас загружена в `page`
    /// (None — в `page` строится открытая страница).
    loaded: Option<usize>,

    // ----- счётчики открытой страницы -----
    nkey: u64,
    keysize: u64,
    valuesize: u64,
    alignsize: usize,

    // ----- итоги контейнера, публикуются в complete() -----
    pub nkv: u64,
    pub ksize: u64,
    pub vsize: u64,
    pub tsize: u64,

    path: PathBuf,
    file: Option<File>,
    /// Файл существует на диске (был хотя бы один spill).
    fileflag: bool,

    state: State,
}

impl KeyValue {
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
            nkv: 0,
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

    // ---------------- запись ----------------

    /// Добавить одну пару ключ/значение.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let need = record::encoded_size(key.len(), value.len(), self.align);
        if need > self.pagesize {
            bail!(
                "single key/value pair exceeds page size ({} > {})",
                need,
                self.pagesize
            );
        }
        if self.alignsize + need > self.pagesize || self.nkey == PAGE_RECORD_MAX {
            self.flush_page()?;
        }

        self.alignsize = record::write_record(&mut self.page, self.alignsize, key, value, self.align);
        self.nkey += 1;
        self.keysize += key.len() as u64;
        self.valuesize += value.len() as u64;
        self.state = State::Appending;
        Ok(())
    }

    /// n пар фиксированной ширины из двух плоских буферов.
    pub fn add_n(&mut self, n: usize, keys: &[u8], kb: usize, values: &[u8], vb: usize) -> Result<()> {
        for i in 0..n {
            self.add(&keys[i * kb..(i + 1) * kb], &values[i * vb..(i + 1) * vb])?;
        }
        Ok(())
    }

    /// Пары переменной ширины: плоские буферы плюс массивы длин.
    pub fn add_n_var(
        &mut self,
        keys: &[u8],
        key_sizes: &[usize],
        values: &[u8],
        value_sizes: &[usize],
    ) -> Result<()> {
        let mut koff = 0usize;
        let mut voff = 0usize;
        for (kb, vb) in key_sizes.iter().zip(value_sizes) {
            self.add(&keys[koff..koff + kb], &values[voff..voff + vb])?;
            koff += kb;
            voff += vb;
        }
        Ok(())
    }

    /// n упакованных записей чужого буфера той же выкладки;
    /// размеры определяются сканированием.
    pub fn add_packed(&mut self, n: u64, buf: &[u8]) -> Result<()> {
        let (ks, vs, asz) = record::scan_packed(buf, n, self.align)
            .ok_or_else(|| anyhow::anyhow!("malformed packed KV buffer ({} records)", n))?;
        self.add_packed_sized(n, &buf[..asz], ks, vs, asz)
    }

    /// n упакованных записей с известными суммами; буфер режется по границам
    /// страниц сканированием записей.
    pub fn add_packed_sized(
        &mut self,
        n: u64,
        buf: &[u8],
        keysize_buf: u64,
        valuesize_buf: u64,
        alignsize_buf: usize,
    ) -> Result<()> {
        let mut n = n;
        let mut ks = keysize_buf;
        let mut vs = valuesize_buf;
        let mut asz = alignsize_buf;
        let mut ptr = 0usize;
        let mut nlimit = PAGE_RECORD_MAX - self.nkey;

        while self.alignsize + asz > self.pagesize || n > nlimit {
            // набрать записи, влезающие в остаток текущей страницы
            let begin = ptr;
            let avail = self.pagesize - self.alignsize;
            let mut nchunk = 0u64;
            let mut kchunk = 0u64;
            let mut vchunk = 0u64;

            while nchunk < n && nchunk < nlimit {
                let rec = record::read_record(buf, ptr, buf.len(), self.align)
                    .ok_or_else(|| anyhow::anyhow!("malformed packed KV buffer ({} records)", n))?;
                let size = rec.end - rec.start;
                if size > self.pagesize {
                    bail!(
                        "single key/value pair exceeds page size ({} > {})",
                        size,
                        self.pagesize
                    );
                }
                if rec.end - begin > avail {
                    break;
                }
                kchunk += rec.key.len() as u64;
                vchunk += rec.value.len() as u64;
                ptr = rec.end;
                nchunk += 1;
            }

            let chunksize = ptr - begin;
            self.page[self.alignsize..self.alignsize + chunksize]
                .copy_from_slice(&buf[begin..ptr]);
            self.nkey += nchunk;
            self.keysize += kchunk;
            self.valuesize += vchunk;
            self.alignsize += chunksize;
            self.state = State::Appending;

            self.flush_page()?;

            n -= nchunk;
            ks -= kchunk;
            vs -= vchunk;
            asz -= chunksize;
            nlimit = PAGE_RECORD_MAX;
        }

        // остаток целиком помещается в резидентную страницу
        let base = alignsize_buf - asz;
        self.page[self.alignsize..self.alignsize + asz].copy_from_slice(&buf[base..base + asz]);
        self.nkey += n;
        self.keysize += ks;
        self.valuesize += vs;
        self.alignsize += asz;
        if n > 0 || asz > 0 {
            self.state = State::Appending;
        }
        Ok(())
    }

    /// n записей буфера с другой выкладкой: перекодировать по одной.
    pub fn add_realigned(&mut self, n: u64, buf: &[u8], src: Alignment) -> Result<()> {
        let mut off = 0usize;
        for _ in 0..n {
            let rec = record::read_record(buf, off, buf.len(), src)
                .ok_or_else(|| anyhow::anyhow!("malformed packed KV buffer ({} records)", n))?;
            self.add(rec.key, rec.value)?;
            off = rec.end;
        }
        Ok(())
    }

    /// Присоединить содержимое другого (завершённого) KV.
    pub fn add_kv(&mut self, other: &mut KeyValue) -> Result<()> {
        if !other.is_complete() {
            bail!("cannot add an incomplete KeyValue");
        }
        let same = self.align == other.align;
        for ipage in 0..other.npage() {
            let desc = other.request_page(ipage)?;
            if same {
                self.add_packed_sized(
                    desc.nkey,
                    other.page_bytes(desc.alignsize),
                    desc.keysize,
                    desc.valuesize,
                    desc.alignsize,
                )?;
            } else {
                self.add_realigned(desc.nkey, other.page_bytes(desc.alignsize), other.align)?;
            }
        }
        Ok(())
    }

    /// Стать постраничной копией другого KV. self должен быть пуст.
    /// При одинаковой выкладке — байтовое копирование страниц, при разной —
    /// перекодирование записей.
    pub fn copy_from(&mut self, other: &mut KeyValue) -> Result<()> {
        if self.state != State::Empty {
            bail!("cannot copy into a non-empty KeyValue");
        }
        if !other.is_complete() {
            bail!("cannot copy an incomplete KeyValue");
        }
        let npage = other.npage();
        if self.align == other.align {
            for ipage in 0..npage {
                let desc = other.request_page(ipage)?;
                self.page[..desc.alignsize].copy_from_slice(other.page_bytes(desc.alignsize));
                self.nkey = desc.nkey;
                self.keysize = desc.keysize;
                self.valuesize = desc.valuesize;
                self.alignsize = desc.alignsize;
                self.state = State::Appending;
                if ipage + 1 < npage {
                    self.flush_page()?;
                }
            }
        } else {
            for ipage in 0..npage {
                let desc = other.request_page(ipage)?;
                self.add_realigned(desc.nkey, other.page_bytes(desc.alignsize), other.align)?;
            }
        }
        self.complete()
    }

    // ---------------- жизненный цикл ----------------

    /// Снова открыть контейнер на дозапись: последняя страница поднимается
    /// из файла (если была сброшена) и продолжает наполняться.
    pub fn append(&mut self) -> Result<()> {
        if self.state != State::Complete || self.pages.is_empty() {
            // пустой или уже наполняемый контейнер — дозапись и так идёт
            return Ok(());
        }

        let last = self.pages.len() - 1;
        if self.fileflag {
            self.load_page(last)?;
        }
        let desc = self.pages[last];
        self.nkey = desc.nkey;
        self.keysize = desc.keysize;
        self.valuesize = desc.valuesize;
        self.alignsize = desc.alignsize;
        self.pages.pop();
        self.loaded = None;
        self.state = State::Appending;
        Ok(())
    }

    /// Закоммитить резидентную страницу, закрыть файл, опубликовать итоги.
    pub fn complete(&mut self) -> Result<()> {
        self.create_page()?;
        if self.fileflag {
            self.write_page()?;
            self.file = None;
        }
        self.init_page();

        self.nkv = 0;
        self.ksize = 0;
        self.vsize = 0;
        self.tsize = 0;
        for desc in &self.pages {
            self.nkv += desc.nkey;
            self.ksize += desc.keysize;
            self.vsize += desc.valuesize;
            self.tsize += desc.exactsize;
        }
        self.state = State::Complete;
        Ok(())
    }

    // ---------------- итерация ----------------

    /// Поднять страницу ipage в RAM и вернуть её дескриптор.
    pub fn request_page(&mut self, ipage: usize) -> Result<PageDesc> {
        if self.state != State::Complete {
            bail!("cannot iterate an incomplete KeyValue");
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

    /// Байты загруженной страницы.
    #[inline]
    pub fn page_bytes(&self, alignsize: usize) -> &[u8] {
        &self.page[..alignsize]
    }

    #[inline]
    pub(crate) fn page_bytes_mut(&mut self, alignsize: usize) -> &mut [u8] {
        &mut self.page[..alignsize]
    }

    /// Записи загруженной страницы.
    pub fn iter_page(&self, desc: &PageDesc) -> KvPageIter<'_> {
        KvPageIter::new(&self.page, desc.alignsize, desc.nkey, self.align)
    }

    // ---------------- страницы и файл ----------------

    fn create_page(&mut self) -> Result<()> {
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
            exactsize: self.nkey * record::TWO_LEN_BYTES as u64 + self.keysize + self.valuesize,
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
        self.loaded = None;
    }

    /// Закоммитить текущую страницу и сбросить её в файл.
    fn flush_page(&mut self) -> Result<()> {
        self.create_page()?;
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

    /// Записать последнюю закоммиченную страницу по её fileoffset
    /// (seek обязателен: возможна перезапись прежней частичной страницы).
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

impl Drop for KeyValue {
    fn drop(&mut self) {
        self.file = None;
        if self.fileflag {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
