//! mr/sort — сортировки: ключи/значения KV и значения внутри записей KMV.
//!
//! Сортировка KV построчная по страницам: индексный массив order[]
//! сортируется компаратором пользователя, затем записи переписываются в
//! отсортированном порядке. Одна страница переписывается на месте через
//! scratch; несколько страниц идут через spool-файлы: npage
//! отсортированных спулов, npage-1 попарных слияний, финальный спул
//! перечитывается в свежий KV. Компаратор — замыкание, захватывающее
//! всё нужное ему; никакого процессно-глобального состояния.

use std::cmp::Ordering;

use anyhow::{anyhow, bail, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::kv::{record as kv_record, KeyValue};
use crate::kmv::record as kmv_record;
use crate::mem::{align_up, Alignment};
use crate::spool::Spool;

use super::{MapReduce, StatKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortTarget {
    Keys,
    Values,
}

impl MapReduce {
    /// Отсортировать пары KV по ключам (в пределах ранга).
    pub fn sort_keys<F>(&mut self, mut cmp: F) -> Result<u64>
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        if self.kv.is_none() {
            bail!("cannot sort_keys without KeyValue");
        }
        self.start_timer();
        self.sort_kv(SortTarget::Keys, &mut cmp)?;
        self.op_stats("Sort_keys", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Отсортировать пары KV по значениям (в пределах ранга).
    pub fn sort_values<F>(&mut self, mut cmp: F) -> Result<u64>
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        if self.kv.is_none() {
            bail!("cannot sort_values without KeyValue");
        }
        self.start_timer();
        self.sort_kv(SortTarget::Values, &mut cmp)?;
        self.op_stats("Sort_values", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Отсортировать значения внутри каждой записи KMV, на месте.
    /// Цепочечные записи не поддерживаются.
    pub fn sort_multivalues<F>(&mut self, mut cmp: F) -> Result<u64>
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        if self.kmv.is_none() {
            bail!("cannot sort_multivalues without KeyMultiValue");
        }
        self.start_timer();

        let kmv = self.kmv.as_mut().unwrap();
        let a = kmv.align();
        let mut sizes: Vec<u32> = Vec::new();
        let mut offsets: Vec<usize> = Vec::new();
        let mut order: Vec<usize> = Vec::new();
        let mut scratch: Vec<u8> = Vec::new();

        for ipage in 0..kmv.npage() {
            let desc = kmv.request_page(ipage)?;
            let mut off = 0usize;
            let mut touched = false;

            for _ in 0..desc.nkey {
                // читаем запись, планируем перестановку
                let (rec_end, nv, soff, voff, mvb) = {
                    let page = kmv.page_bytes(desc.alignsize);
                    let rec = kmv_record::read_kmv(page, off, desc.alignsize, a)
                        .ok_or_else(|| anyhow!("malformed KeyMultiValue page {}", ipage))?;
                    if rec.nvalues < 0 {
                        bail!("cannot sort multivalues for a multiple block KeyMultiValue");
                    }
                    kmv_record::read_sizes_into(rec.sizes_bytes, &mut sizes);
                    let soff = rec.start + kmv_record::THREE_LEN_BYTES;
                    let koff = align_up(soff + sizes.len() * 4, a.k);
                    let voff = align_up(koff + rec.key.len(), a.v);
                    (rec.end, sizes.len(), soff, voff, rec.mvbytes)
                };

                offsets.clear();
                offsets.push(0);
                for i in 0..nv.saturating_sub(1) {
                    let prev = offsets[i];
                    offsets.push(prev + sizes[i] as usize);
                }

                order.clear();
                order.extend(0..nv);
                {
                    let page = kmv.page_bytes(desc.alignsize);
                    order.sort_unstable_by(|&i, &j| {
                        let a_val = &page[voff + offsets[i]..voff + offsets[i] + sizes[i] as usize];
                        let b_val = &page[voff + offsets[j]..voff + offsets[j] + sizes[j] as usize];
                        cmp(a_val, b_val)
                    });
                }

                // переписать байты значений и массив длин согласованно
                scratch.clear();
                scratch.reserve(mvb);
                {
                    let page = kmv.page_bytes(desc.alignsize);
                    for &k in &order {
                        scratch
                            .extend_from_slice(&page[voff + offsets[k]..voff + offsets[k] + sizes[k] as usize]);
                    }
                }
                let page = kmv.page_bytes_mut(desc.alignsize);
                page[voff..voff + mvb].copy_from_slice(&scratch);
                for (slot, &k) in order.iter().enumerate() {
                    LittleEndian::write_i32(
                        &mut page[soff + slot * 4..soff + slot * 4 + 4],
                        sizes[k] as i32,
                    );
                }

                touched = true;
                off = rec_end;
            }

            if touched {
                kmv.overwrite_page(ipage)?;
            }
        }

        self.op_stats("Sort_multivalues", StatKind::Kmv)?;
        self.global_kmv_count()
    }

    // ---------------- общий путь сортировки KV ----------------

    fn sort_kv<F>(&mut self, target: SortTarget, cmp: &mut F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Ordering,
    {
        let mut kv = self.kv.take().unwrap();
        let a = kv.align();
        let npage = kv.npage();

        if npage == 1 {
            // одна страница: переставить записи через scratch и вернуть на место
            let desc = kv.request_page(0)?;
            let (order, spans) = page_order(&kv, desc.alignsize, desc.nkey, a, target, cmp)?;

            let mut scratch = vec![0u8; desc.alignsize];
            {
                let page = kv.page_bytes(desc.alignsize);
                let mut off = 0usize;
                for &i in &order {
                    let (start, end) = (spans[i].0, spans[i].1);
                    scratch[off..off + (end - start)].copy_from_slice(&page[start..end]);
                    off += end - start;
                }
            }
            kv.page_bytes_mut(desc.alignsize).copy_from_slice(&scratch);
            self.kv = Some(kv);
            return Ok(());
        }

        // несколько страниц: отсортированные спулы + попарные слияния
        let spool_page = self.split.spool_page();
        if spool_page == 0 {
            bail!("invalid memsize setting: too small for a multi-page sort");
        }
        let nspool = 2 * npage - 1;
        let mut spools: Vec<Option<Spool>> = Vec::with_capacity(nspool);
        for _ in 0..nspool {
            let sp = self.fresh_spool(spool_page);
            spools.push(Some(sp));
        }

        for ipage in 0..npage {
            let desc = kv.request_page(ipage)?;
            let (order, spans) = page_order(&kv, desc.alignsize, desc.nkey, a, target, cmp)?;
            let sp = spools[ipage].as_mut().unwrap();
            let page = kv.page_bytes(desc.alignsize);
            for &i in &order {
                sp.add(&page[spans[i].0..spans[i].1])?;
            }
            sp.complete()?;
        }
        drop(kv);

        let mut isrc = 0usize;
        let mut idest = npage;
        for _ in 0..npage - 1 {
            let mut s1 = spools[isrc].take().unwrap();
            let mut s2 = spools[isrc + 1].take().unwrap();
            let mut dest = spools[idest].take().unwrap();
            merge_spools(&mut s1, &mut s2, &mut dest, a, target, cmp)?;
            dest.complete()?;
            spools[idest] = Some(dest);
            isrc += 2;
            idest += 1;
        }

        // финальный спул перечитывается в свежий KV
        let mut sp = spools[nspool - 1].take().unwrap();
        let mut kvnew = self.fresh_kv();
        for ipage in 0..sp.npage() {
            let desc = sp.request_page(ipage)?;
            kvnew.add_packed(desc.nentry, sp.page_bytes(desc.size))?;
        }
        kvnew.complete()?;
        self.kv = Some(kvnew);
        Ok(())
    }
}

/// Вычислить порядок записей страницы по ключам или значениям.
/// Возвращает (order, spans), spans[i] = (начало, конец) записи i.
fn page_order<F>(
    kv: &KeyValue,
    alignsize: usize,
    nkey: u64,
    a: Alignment,
    target: SortTarget,
    cmp: &mut F,
) -> Result<(Vec<usize>, Vec<(usize, usize, usize, usize)>)>
where
    F: FnMut(&[u8], &[u8]) -> Ordering,
{
    let page = kv.page_bytes(alignsize);
    let n = nkey as usize;
    let mut spans: Vec<(usize, usize, usize, usize)> = Vec::with_capacity(n);

    let mut off = 0usize;
    for _ in 0..n {
        let rec = kv_record::read_record(page, off, alignsize, a)
            .ok_or_else(|| anyhow!("malformed KeyValue page"))?;
        let koff = align_up(rec.start + kv_record::TWO_LEN_BYTES, a.k);
        let voff = align_up(koff + rec.key.len(), a.v);
        let (fstart, fend) = match target {
            SortTarget::Keys => (koff, koff + rec.key.len()),
            SortTarget::Values => (voff, voff + rec.value.len()),
        };
        spans.push((rec.start, rec.end, fstart, fend));
        off = rec.end;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_unstable_by(|&i, &j| {
        cmp(&page[spans[i].2..spans[i].3], &page[spans[j].2..spans[j].3])
    });
    Ok((order, spans))
}

/// Потоковое слияние двух отсортированных спулов в третий.
fn merge_spools<F>(
    s1: &mut Spool,
    s2: &mut Spool,
    dest: &mut Spool,
    a: Alignment,
    target: SortTarget,
    cmp: &mut F,
) -> Result<()>
where
    F: FnMut(&[u8], &[u8]) -> Ordering,
{
    let mut c1 = MergeCursor::new(s1, a, target)?;
    let mut c2 = MergeCursor::new(s2, a, target)?;

    while !c1.done || !c2.done {
        let take_first = if c1.done {
            false
        } else if c2.done {
            true
        } else {
            cmp(c1.field(), c2.field()) != Ordering::Greater
        };
        if take_first {
            dest.add(&c1.cur)?;
            c1.advance()?;
        } else {
            dest.add(&c2.cur)?;
            c2.advance()?;
        }
    }
    Ok(())
}

/// Курсор слияния: текущая запись скопирована в собственный буфер,
/// чтобы страницы обоих источников могли обновляться независимо.
struct MergeCursor<'a> {
    sp: &'a mut Spool,
    align: Alignment,
    target: SortTarget,
    next_page: usize,
    nentry: u64,
    ientry: u64,
    off: usize,
    limit: usize,
    cur: Vec<u8>,
    field: (usize, usize),
    done: bool,
}

impl<'a> MergeCursor<'a> {
    fn new(sp: &'a mut Spool, align: Alignment, target: SortTarget) -> Result<Self> {
        let mut cursor = Self {
            sp,
            align,
            target,
            next_page: 0,
            nentry: 0,
            ientry: 0,
            off: 0,
            limit: 0,
            cur: Vec::new(),
            field: (0, 0),
            done: false,
        };
        cursor.advance()?;
        Ok(cursor)
    }

    fn field(&self) -> &[u8] {
        &self.cur[self.field.0..self.field.1]
    }

    fn advance(&mut self) -> Result<()> {
        loop {
            if self.ientry >= self.nentry {
                if self.next_page >= self.sp.npage() {
                    self.done = true;
                    return Ok(());
                }
                let desc = self.sp.request_page(self.next_page)?;
                self.next_page += 1;
                self.nentry = desc.nentry;
                self.ientry = 0;
                self.off = 0;
                self.limit = desc.size;
                continue;
            }

            let a = self.align;
            let page = self.sp.page_bytes(self.limit);
            let rec = kv_record::read_record(page, self.off, self.limit, a)
                .ok_or_else(|| anyhow!("malformed spool page"))?;
            let koff = align_up(rec.start + kv_record::TWO_LEN_BYTES, a.k);
            let voff = align_up(koff + rec.key.len(), a.v);
            let (fstart, fend) = match self.target {
                SortTarget::Keys => (koff, koff + rec.key.len()),
                SortTarget::Values => (voff, voff + rec.value.len()),
            };

            self.cur.clear();
            self.cur.extend_from_slice(&page[rec.start..rec.end]);
            self.field = (fstart - rec.start, fend - rec.start);
            self.off = rec.end;
            self.ientry += 1;
            return Ok(());
        }
    }
}
