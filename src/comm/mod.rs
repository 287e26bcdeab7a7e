//! comm — SPMD-коммуникатор: шов между движком и запускалкой процессов.
//!
//! Движку нужны: ранг/размер, барьер, all-reduce, broadcast и буферизованный
//! point-to-point (send обязан не блокироваться в ожидании парного recv —
//! на этом держится однопроходный irregular exchange).
//!
//! Коллективы по умолчанию собраны из p2p (gather на ранг 0 + рассылка):
//! реализациям достаточно дать rank/size/barrier/send/recv. Все операции
//! движка коллективны и входят в них все ранги в одном порядке, поэтому
//! матчинг по (from, tag) с FIFO внутри пары однозначен.

mod local;
mod threads;

pub use local::SelfComm;
pub use threads::ThreadComm;

use anyhow::Result;

use crate::consts::{TAG_BCAST, TAG_REDUCE_DOWN, TAG_REDUCE_UP};

/// Редукция для all-reduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl ReduceOp {
    #[inline]
    fn apply_u64(self, a: u64, b: u64) -> u64 {
        match self {
            ReduceOp::Sum => a.wrapping_add(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }

    #[inline]
    fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }
}

pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Все ранги входят, никто не выходит раньше последнего.
    fn barrier(&self);

    /// Буферизованная отправка: не ждёт парного recv.
    fn send(&self, to: usize, tag: u32, bytes: &[u8]) -> Result<()>;

    /// Принять сообщение именно от `from` с тегом `tag` (FIFO внутри пары).
    fn recv(&self, from: usize, tag: u32) -> Result<Vec<u8>>;

    /// Принять от любого отправителя (master/slave-диспетчер map).
    fn recv_any(&self, tag: u32) -> Result<(usize, Vec<u8>)>;

    // ---------------- collectives (default: gather-to-0 + fan-out) ----------------

    fn allreduce_u64(&self, v: u64, op: ReduceOp) -> Result<u64> {
        let np = self.size();
        if np == 1 {
            return Ok(v);
        }
        if self.rank() == 0 {
            let mut acc = v;
            for src in 1..np {
                let b = self.recv(src, TAG_REDUCE_UP)?;
                acc = op.apply_u64(acc, u64_from(&b)?);
            }
            for dst in 1..np {
                self.send(dst, TAG_REDUCE_DOWN, &acc.to_le_bytes())?;
            }
            Ok(acc)
        } else {
            self.send(0, TAG_REDUCE_UP, &v.to_le_bytes())?;
            u64_from(&self.recv(0, TAG_REDUCE_DOWN)?)
        }
    }

    fn allreduce_f64(&self, v: f64, op: ReduceOp) -> Result<f64> {
        let np = self.size();
        if np == 1 {
            return Ok(v);
        }
        if self.rank() == 0 {
            let mut acc = v;
            for src in 1..np {
                let b = self.recv(src, TAG_REDUCE_UP)?;
                acc = op.apply_f64(acc, f64_from(&b)?);
            }
            for dst in 1..np {
                self.send(dst, TAG_REDUCE_DOWN, &acc.to_le_bytes())?;
            }
            Ok(acc)
        } else {
            self.send(0, TAG_REDUCE_UP, &v.to_le_bytes())?;
            f64_from(&self.recv(0, TAG_REDUCE_DOWN)?)
        }
    }

    /// Поэлементная сумма по всем рангам (гистограммы статистики).
    fn allreduce_sum_u64_slice(&self, vals: &mut [u64]) -> Result<()> {
        let np = self.size();
        if np == 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for src in 1..np {
                let b = self.recv(src, TAG_REDUCE_UP)?;
                anyhow::ensure!(
                    b.len() == vals.len() * 8,
                    "allreduce slice length mismatch: got {} bytes, expected {}",
                    b.len(),
                    vals.len() * 8
                );
                for (i, chunk) in b.chunks_exact(8).enumerate() {
                    vals[i] = vals[i].wrapping_add(u64_from(chunk)?);
                }
            }
            let mut out = Vec::with_capacity(vals.len() * 8);
            for v in vals.iter() {
                out.extend_from_slice(&v.to_le_bytes());
            }
            for dst in 1..np {
                self.send(dst, TAG_REDUCE_DOWN, &out)?;
            }
        } else {
            let mut out = Vec::with_capacity(vals.len() * 8);
            for v in vals.iter() {
                out.extend_from_slice(&v.to_le_bytes());
            }
            self.send(0, TAG_REDUCE_UP, &out)?;
            let b = self.recv(0, TAG_REDUCE_DOWN)?;
            for (i, chunk) in b.chunks_exact(8).enumerate() {
                vals[i] = u64_from(chunk)?;
            }
        }
        Ok(())
    }

    /// Разослать байты с ранга root на все остальные.
    fn broadcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<()> {
        let np = self.size();
        if np == 1 {
            return Ok(());
        }
        if self.rank() == root {
            for dst in 0..np {
                if dst != root {
                    self.send(dst, TAG_BCAST, buf)?;
                }
            }
        } else {
            *buf = self.recv(root, TAG_BCAST)?;
        }
        Ok(())
    }
}

#[inline]
fn u64_from(b: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = b
        .try_into()
        .map_err(|_| anyhow::anyhow!("malformed u64 frame: {} bytes", b.len()))?;
    Ok(u64::from_le_bytes(arr))
}

#[inline]
fn f64_from(b: &[u8]) -> Result<f64> {
    let arr: [u8; 8] = b
        .try_into()
        .map_err(|_| anyhow::anyhow!("malformed f64 frame: {} bytes", b.len()))?;
    Ok(f64::from_le_bytes(arr))
}
