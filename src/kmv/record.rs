//! kmv/record — кодек записи KeyMultiValue.
//!
//! Обычная запись (смещения от начала страницы, префиксы i32 LE):
//!   [kb i32][mvb i32][nv i32][nv × i32 sizes] pad→kalign, key,
//!   pad→valign, значения подряд, pad→talign
//!
//! Multi-block запись: тот же заголовок, но nv хранит -N (число блочных
//! страниц); заголовочная страница несёт только ключ, за ней N страниц
//! вида [nv_block i32][nv_block × i32 sizes] pad→valign, байты значений.
//! Дискриминант — знак nv.

use byteorder::{ByteOrder, LittleEndian};

use crate::mem::{align_up, Alignment};

/// Три длинных префикса заголовка записи.
pub const THREE_LEN_BYTES: usize = 3 * std::mem::size_of::<i32>();

/// Ссылка на одну запись KMV внутри загруженной страницы.
#[derive(Debug, Clone, Copy)]
pub struct KmvRef<'a> {
    pub key: &'a [u8],
    /// > 0 — столько значений в записи; < 0 — заголовок цепочки из -nvalues
    /// блочных страниц.
    pub nvalues: i32,
    /// Суммарные байты значений (для цепочки — всей цепочки).
    pub mvbytes: usize,
    /// Массив длин значений, nv × i32 LE (пуст у заголовка цепочки).
    pub sizes_bytes: &'a [u8],
    /// Значения подряд (пусто у заголовка цепочки).
    pub values: &'a [u8],
    pub start: usize,
    pub end: usize,
}

/// Выровненная стоимость обычной записи.
#[inline]
pub fn normal_size(kb: usize, nv: usize, mvb: usize, a: Alignment) -> usize {
    let mut off = THREE_LEN_BYTES + nv * 4;
    off = align_up(off, a.k);
    off += kb;
    off = align_up(off, a.v);
    off += mvb;
    align_up(off, a.t)
}

/// Выровненная стоимость заголовка цепочки (только ключ).
#[inline]
pub fn header_size(kb: usize, a: Alignment) -> usize {
    let mut off = THREE_LEN_BYTES;
    off = align_up(off, a.k);
    off += kb;
    align_up(off, a.t)
}

/// Занятые байты блочной страницы с nv значениями суммарной длины bytes.
#[inline]
pub fn block_size(nv: usize, bytes: usize, a: Alignment) -> usize {
    let mut off = 4 + nv * 4;
    off = align_up(off, a.v);
    off + bytes
}

/// Записать обычную запись; значения переданы единым срезом.
/// Вернуть смещение следующей записи.
pub fn write_normal(
    page: &mut [u8],
    base: usize,
    key: &[u8],
    sizes: &[u32],
    values: &[u8],
    a: Alignment,
) -> usize {
    LittleEndian::write_i32(&mut page[base..base + 4], key.len() as i32);
    LittleEndian::write_i32(&mut page[base + 4..base + 8], values.len() as i32);
    LittleEndian::write_i32(&mut page[base + 8..base + 12], sizes.len() as i32);
    let mut off = base + THREE_LEN_BYTES;
    for s in sizes {
        LittleEndian::write_i32(&mut page[off..off + 4], *s as i32);
        off += 4;
    }
    off = align_up(off, a.k);
    page[off..off + key.len()].copy_from_slice(key);
    off = align_up(off + key.len(), a.v);
    page[off..off + values.len()].copy_from_slice(values);
    align_up(off + values.len(), a.t)
}

/// Записать заголовок цепочки из nblocks страниц.
pub fn write_header(
    page: &mut [u8],
    base: usize,
    key: &[u8],
    mvbytes: usize,
    nblocks: usize,
    a: Alignment,
) -> usize {
    LittleEndian::write_i32(&mut page[base..base + 4], key.len() as i32);
    LittleEndian::write_i32(&mut page[base + 4..base + 8], mvbytes as i32);
    LittleEndian::write_i32(&mut page[base + 8..base + 12], -(nblocks as i32));
    let off = align_up(base + THREE_LEN_BYTES, a.k);
    page[off..off + key.len()].copy_from_slice(key);
    align_up(off + key.len(), a.t)
}

/// Прочитать запись по смещению base. None при выходе за limit.
pub fn read_kmv(page: &[u8], base: usize, limit: usize, a: Alignment) -> Option<KmvRef<'_>> {
    if base + THREE_LEN_BYTES > limit {
        return None;
    }
    let kb = LittleEndian::read_i32(&page[base..base + 4]);
    let mvb = LittleEndian::read_i32(&page[base + 4..base + 8]);
    let nv = LittleEndian::read_i32(&page[base + 8..base + 12]);
    if kb < 0 || mvb < 0 {
        return None;
    }
    let (kb, mvb) = (kb as usize, mvb as usize);

    if nv >= 0 {
        let soff = base + THREE_LEN_BYTES;
        let send = soff + nv as usize * 4;
        let koff = align_up(send, a.k);
        let voff = align_up(koff + kb, a.v);
        let end = align_up(voff + mvb, a.t);
        if end > limit {
            return None;
        }
        Some(KmvRef {
            key: &page[koff..koff + kb],
            nvalues: nv,
            mvbytes: mvb,
            sizes_bytes: &page[soff..send],
            values: &page[voff..voff + mvb],
            start: base,
            end,
        })
    } else {
        let koff = align_up(base + THREE_LEN_BYTES, a.k);
        let end = align_up(koff + kb, a.t);
        if end > limit {
            return None;
        }
        Some(KmvRef {
            key: &page[koff..koff + kb],
            nvalues: nv,
            mvbytes: mvb,
            sizes_bytes: &page[0..0],
            values: &page[0..0],
            start: base,
            end,
        })
    }
}

/// Собрать блочную страницу: [nv][sizes] pad→valign, bytes.
/// Вернуть занятый размер.
pub fn write_block(page: &mut [u8], sizes: &[u32], values: &[u8], a: Alignment) -> usize {
    LittleEndian::write_i32(&mut page[0..4], sizes.len() as i32);
    let mut off = 4;
    for s in sizes {
        LittleEndian::write_i32(&mut page[off..off + 4], *s as i32);
        off += 4;
    }
    off = align_up(off, a.v);
    page[off..off + values.len()].copy_from_slice(values);
    off + values.len()
}

/// Разобрать блочную страницу: (число значений, байты длин, байты значений).
pub fn read_block(page: &[u8], limit: usize, a: Alignment) -> Option<(usize, &[u8], &[u8])> {
    if limit < 4 {
        return None;
    }
    let nv = LittleEndian::read_i32(&page[0..4]);
    if nv < 0 {
        return None;
    }
    let nv = nv as usize;
    let send = 4 + nv * 4;
    let voff = align_up(send, a.v);
    if voff > limit {
        return None;
    }
    Some((nv, &page[4..send], &page[voff..limit]))
}

/// Распаковать массив длин в переиспользуемый Vec.
pub fn read_sizes_into(sizes_bytes: &[u8], out: &mut Vec<u32>) {
    out.clear();
    out.reserve(sizes_bytes.len() / 4);
    for chunk in sizes_bytes.chunks_exact(4) {
        out.push(LittleEndian::read_i32(chunk) as u32);
    }
}
