//! exchange — irregular all-to-all: записи переменного размера разъезжаются
//! по рангам-владельцам за один проход.
//!
//! Вход: плотный буфер записей, их размеры и ранги-адресаты. Выход: буфер
//! принятых записей плюс их размеры. Порядок внутри одного отправителя
//! сохраняется (приём идёт в порядке рангов), между отправителями — никаких
//! гарантий. Однопроходность держится на буферизованном send коммуникатора:
//! все отправки уходят до первого приёма, дедлок невозможен.

use std::sync::Arc;

use anyhow::{bail, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::comm::Communicator;
use crate::consts::{TAG_XCHG_DATA, TAG_XCHG_SIZES};
use crate::metrics;

pub struct Irregular {
    comm: Arc<dyn Communicator>,
}

impl Irregular {
    pub fn new(comm: Arc<dyn Communicator>) -> Self {
        Self { comm }
    }

    /// Обменяться записями; вернуть число принятых.
    ///
    /// `sizes[i]` — выровненный размер i-й записи, записи лежат в `payload`
    /// подряд; `dests[i]` — ранг-адресат. Приёмные буферы очищаются.
    pub fn exchange(
        &self,
        sizes: &[u32],
        dests: &[usize],
        payload: &[u8],
        recv_payload: &mut Vec<u8>,
        recv_sizes: &mut Vec<u32>,
    ) -> Result<u64> {
        if sizes.len() != dests.len() {
            bail!(
                "exchange size/destination vectors disagree: {} vs {}",
                sizes.len(),
                dests.len()
            );
        }
        recv_payload.clear();
        recv_sizes.clear();

        let np = self.comm.size();
        let me = self.comm.rank();

        if np == 1 {
            recv_payload.extend_from_slice(payload);
            recv_sizes.extend_from_slice(sizes);
            return Ok(sizes.len() as u64);
        }

        // раскладка по адресатам, порядок отправителя сохраняем
        let mut out_sizes: Vec<Vec<u32>> = vec![Vec::new(); np];
        let mut out_bufs: Vec<Vec<u8>> = vec![Vec::new(); np];
        let mut off = 0usize;
        for (&sz, &d) in sizes.iter().zip(dests) {
            if d >= np {
                bail!("exchange destination {} outside communicator of size {}", d, np);
            }
            let sz = sz as usize;
            if off + sz > payload.len() {
                bail!("exchange payload shorter than its size vector");
            }
            out_bufs[d].extend_from_slice(&payload[off..off + sz]);
            out_sizes[d].push(sz as u32);
            off += sz;
        }

        // все отправки до первого приёма
        let mut sent_records = 0u64;
        let mut sent_bytes = 0u64;
        let mut frame: Vec<u8> = Vec::new();
        for d in 0..np {
            if d == me {
                continue;
            }
            frame.clear();
            frame.resize(out_sizes[d].len() * 4, 0);
            for (i, s) in out_sizes[d].iter().enumerate() {
                LittleEndian::write_u32(&mut frame[i * 4..i * 4 + 4], *s);
            }
            self.comm.send(d, TAG_XCHG_SIZES, &frame)?;
            self.comm.send(d, TAG_XCHG_DATA, &out_bufs[d])?;
            sent_records += out_sizes[d].len() as u64;
            sent_bytes += out_bufs[d].len() as u64;
        }
        metrics::record_exchange(sent_records, sent_bytes);

        // приём в порядке рангов; свои записи — на своей позиции
        for src in 0..np {
            if src == me {
                recv_sizes.extend_from_slice(&out_sizes[me]);
                recv_payload.extend_from_slice(&out_bufs[me]);
                continue;
            }
            let frame = self.comm.recv(src, TAG_XCHG_SIZES)?;
            if frame.len() % 4 != 0 {
                bail!("malformed exchange size frame from rank {}", src);
            }
            let mut expect = 0usize;
            for chunk in frame.chunks_exact(4) {
                let s = LittleEndian::read_u32(chunk);
                recv_sizes.push(s);
                expect += s as usize;
            }
            let data = self.comm.recv(src, TAG_XCHG_DATA)?;
            if data.len() != expect {
                bail!(
                    "exchange payload from rank {} is {} bytes, sizes say {}",
                    src,
                    data.len(),
                    expect
                );
            }
            recv_payload.extend_from_slice(&data);
        }

        Ok(recv_sizes.len() as u64)
    }
}
