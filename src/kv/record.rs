//! kv/record — кодек записи KV внутри страницы.
//!
//! Формат (смещения относительно начала страницы, префиксы i32 LE):
//!   [kb i32][vb i32] pad→kalign, key, pad→valign, value, pad→talign
//!
//! Запись начинается с t-границы; t = max(k, v, 4), поэтому t-выровненное
//! начало одновременно k- и v-выровнено и внутренние отступы записи не
//! зависят от её позиции. Чтения проверяют границы и не выходят за
//! пределы данных страницы.

use byteorder::{ByteOrder, LittleEndian};

use crate::mem::{align_up, Alignment};

/// Два длинных префикса записи.
pub const TWO_LEN_BYTES: usize = 2 * std::mem::size_of::<i32>();

/// Ссылка на одну запись внутри загруженной страницы.
#[derive(Debug, Clone, Copy)]
pub struct KvRef<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Начало записи (t-выровнено).
    pub start: usize,
    /// Конец записи вместе с хвостовым паддингом; следующая запись
    /// начинается ровно здесь.
    pub end: usize,
}

/// Выровненная стоимость записи (kb, vb) в байтах.
#[inline]
pub fn encoded_size(kb: usize, vb: usize, a: Alignment) -> usize {
    let mut off = TWO_LEN_BYTES;
    off = align_up(off, a.k);
    off += kb;
    off = align_up(off, a.v);
    off += vb;
    align_up(off, a.t)
}

/// Записать одну запись по смещению `base`; вернуть смещение следующей.
/// Байты паддинга не трогаются. Caller гарантирует, что запись влезает.
pub fn write_record(page: &mut [u8], base: usize, key: &[u8], value: &[u8], a: Alignment) -> usize {
    LittleEndian::write_i32(&mut page[base..base + 4], key.len() as i32);
    LittleEndian::write_i32(&mut page[base + 4..base + 8], value.len() as i32);
    let mut off = align_up(base + TWO_LEN_BYTES, a.k);
    page[off..off + key.len()].copy_from_slice(key);
    off = align_up(off + key.len(), a.v);
    page[off..off + value.len()].copy_from_slice(value);
    align_up(off + value.len(), a.t)
}

/// Прочитать запись по смещению `base`. None при выходе за `limit`
/// (границу данных страницы) или отрицательных префиксах.
pub fn read_record(page: &[u8], base: usize, limit: usize, a: Alignment) -> Option<KvRef<'_>> {
    if base + TWO_LEN_BYTES > limit {
        return None;
    }
    let kb = LittleEndian::read_i32(&page[base..base + 4]);
    let vb = LittleEndian::read_i32(&page[base + 4..base + 8]);
    if kb < 0 || vb < 0 {
        return None;
    }
    let (kb, vb) = (kb as usize, vb as usize);

    let koff = align_up(base + TWO_LEN_BYTES, a.k);
    let voff = align_up(koff + kb, a.v);
    let end = align_up(voff + vb, a.t);
    if end > limit {
        return None;
    }
    Some(KvRef {
        key: &page[koff..koff + kb],
        value: &page[voff..voff + vb],
        start: base,
        end,
    })
}

/// Итератор записей одной страницы: `n` записей от смещения 0.
pub struct KvPageIter<'a> {
    page: &'a [u8],
    limit: usize,
    align: Alignment,
    off: usize,
    remaining: u64,
}

impl<'a> KvPageIter<'a> {
    pub fn new(page: &'a [u8], limit: usize, n: u64, align: Alignment) -> Self {
        Self {
            page,
            limit,
            align,
            off: 0,
            remaining: n,
        }
    }
}

impl<'a> Iterator for KvPageIter<'a> {
    type Item = KvRef<'a>;

    fn next(&mut self) -> Option<KvRef<'a>> {
        if self.remaining == 0 {
            return None;
        }
        let rec = read_record(self.page, self.off, self.limit, self.align)?;
        self.off = rec.end;
        self.remaining -= 1;
        Some(rec)
    }
}

/// Просканировать `n` упакованных записей чужого буфера: точные суммы
/// ключей/значений и выровненный размер. None, если буфер оборван.
pub fn scan_packed(buf: &[u8], n: u64, a: Alignment) -> Option<(u64, u64, usize)> {
    let mut ks = 0u64;
    let mut vs = 0u64;
    let mut off = 0usize;
    for _ in 0..n {
        let rec = read_record(buf, off, buf.len(), a)?;
        ks += rec.key.len() as u64;
        vs += rec.value.len() as u64;
        off = rec.end;
    }
    Some((ks, vs, off))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a44() -> Alignment {
        Alignment::new(4, 4).unwrap()
    }

    #[test]
    fn roundtrip_single() {
        let a = a44();
        let mut page = vec![0u8; 256];
        let end = write_record(&mut page, 0, b"key", b"value-bytes", a);
        assert_eq!(end, encoded_size(3, 11, a));
        let rec = read_record(&page, 0, end, a).unwrap();
        assert_eq!(rec.key, b"key");
        assert_eq!(rec.value, b"value-bytes");
        assert_eq!(rec.end, end);
    }

    #[test]
    fn zero_length_key_and_value() {
        let a = a44();
        let mut page = vec![0u8; 64];
        let end = write_record(&mut page, 0, b"", b"", a);
        let rec = read_record(&page, 0, end, a).unwrap();
        assert!(rec.key.is_empty() && rec.value.is_empty());
        assert_eq!(rec.end, align_up(TWO_LEN_BYTES, a.t));
    }

    #[test]
    fn iter_and_scan_agree() {
        let a = Alignment::new(8, 4).unwrap();
        let mut page = vec![0u8; 1024];
        let mut off = 0;
        let pairs: &[(&[u8], &[u8])] = &[(b"a", b"1"), (b"bb", b""), (b"", b"333"), (b"dddd", b"4")];
        for (k, v) in pairs {
            off = write_record(&mut page, off, k, v, a);
        }
        let got: Vec<_> = KvPageIter::new(&page, off, pairs.len() as u64, a).collect();
        assert_eq!(got.len(), pairs.len());
        for (rec, (k, v)) in got.iter().zip(pairs) {
            assert_eq!(rec.key, *k);
            assert_eq!(rec.value, *v);
        }
        let (ks, vs, asz) = scan_packed(&page, pairs.len() as u64, a).unwrap();
        assert_eq!(ks, 7);
        assert_eq!(vs, 5);
        assert_eq!(asz, off);
    }

    #[test]
    fn truncated_read_is_none() {
        let a = a44();
        let mut page = vec![0u8; 64];
        let end = write_record(&mut page, 0, b"key", b"value", a);
        assert!(read_record(&page, 0, end - 1, a).is_none());
        assert!(read_record(&page, end, end, a).is_none());
    }
}
