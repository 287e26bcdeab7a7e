//! mr/stats — статистика операций: итоги, гистограммы по рангам, таймеры.
//!
//! Печать идёт через log::info! на ранге 0; данные собираются all-reduce'ами,
//! поэтому в сбор входят все ранги (вызовы коллективны, как и сами операции).

use anyhow::Result;
use log::info;

use crate::comm::ReduceOp;
use crate::config::{TimerMode, Verbosity};

use super::{MapReduce, StatKind};

const NHISTO: usize = 10;

impl MapReduce {
    pub(crate) fn start_timer(&mut self) {
        match self.cfg.timer {
            TimerMode::Off => {}
            TimerMode::Barrier => {
                self.comm.barrier();
                self.time_start = Some(std::time::Instant::now());
            }
            TimerMode::NoBarrier => {
                self.time_start = Some(std::time::Instant::now());
            }
        }
    }

    /// Хвост каждой операции: таймер и сводка по живому контейнеру.
    pub(crate) fn op_stats(&mut self, heading: &str, which: StatKind) -> Result<()> {
        match self.cfg.timer {
            TimerMode::Off => {}
            TimerMode::Barrier => {
                self.comm.barrier();
                if let Some(t0) = self.time_start.take() {
                    let secs = t0.elapsed().as_secs_f64();
                    if self.comm.rank() == 0 {
                        info!("{} time (secs) = {:.6}", heading, secs);
                    }
                }
            }
            TimerMode::NoBarrier => {
                if let Some(t0) = self.time_start.take() {
                    let secs = t0.elapsed().as_secs_f64();
                    let (ave, max, min, _histo) = self.histogram(secs)?;
                    if self.comm.rank() == 0 {
                        info!(
                            "{} time (secs) = {:.6} ave {:.6} max {:.6} min",
                            heading, ave, max, min
                        );
                    }
                }
            }
        }

        let level = match self.cfg.verbosity {
            Verbosity::Silent => return Ok(()),
            Verbosity::Totals => 1,
            Verbosity::Histogram => 2,
        };
        if self.comm.rank() == 0 {
            info!("{}:", heading);
        }
        match which {
            StatKind::Kv => self.kv_stats(level),
            StatKind::Kmv => self.kmv_stats(level),
        }
    }

    /// Сводка по KV: глобальные итоги, на level 2 — разбивка по рангам.
    pub fn kv_stats(&mut self, level: u32) -> Result<()> {
        let (nkv, ksize, vsize) = match self.kv.as_ref() {
            Some(kv) => (kv.nkv, kv.ksize, kv.vsize),
            None => anyhow::bail!("cannot print stats without KeyValue"),
        };
        self.container_stats("KV", level, nkv, ksize, vsize)
    }

    /// Сводка по KMV.
    pub fn kmv_stats(&mut self, level: u32) -> Result<()> {
        let (nkmv, ksize, vsize) = match self.kmv.as_ref() {
            Some(kmv) => (kmv.nkmv, kmv.ksize, kmv.vsize),
            None => anyhow::bail!("cannot print stats without KeyMultiValue"),
        };
        self.container_stats("KMV", level, nkmv, ksize, vsize)
    }

    fn container_stats(
        &mut self,
        label: &str,
        level: u32,
        n: u64,
        ksize: u64,
        vsize: u64,
    ) -> Result<()> {
        if level == 0 {
            return Ok(());
        }
        let nall = self.comm.allreduce_u64(n, ReduceOp::Sum)?;
        let kall = self.comm.allreduce_f64(ksize as f64, ReduceOp::Sum)?;
        let vall = self.comm.allreduce_f64(vsize as f64, ReduceOp::Sum)?;
        if self.comm.rank() == 0 {
            info!(
                "{} {} pairs, {:.3} Mb of key data, {:.3} Mb of value data",
                nall,
                label,
                kall / 1024.0 / 1024.0,
                vall / 1024.0 / 1024.0
            );
        }

        if level >= 2 {
            for (what, value) in [
                ("pairs", n as f64),
                ("Kdata (Mb)", ksize as f64 / 1024.0 / 1024.0),
                ("Vdata (Mb)", vsize as f64 / 1024.0 / 1024.0),
            ] {
                let (ave, max, min, histo) = self.histogram(value)?;
                if self.comm.rank() == 0 {
                    info!("  {} {}: {:.4} ave {:.4} max {:.4} min", label, what, ave, max, min);
                    info!("  histogram: {:?}", histo);
                }
            }
        }
        Ok(())
    }

    /// Распределение по рангам одного значения: среднее, максимум, минимум
    /// и NHISTO-корзинная гистограмма.
    pub(crate) fn histogram(&self, value: f64) -> Result<(f64, f64, f64, [u64; NHISTO])> {
        let np = self.comm.size() as f64;
        let sum = self.comm.allreduce_f64(value, ReduceOp::Sum)?;
        let max = self.comm.allreduce_f64(value, ReduceOp::Max)?;
        let min = self.comm.allreduce_f64(value, ReduceOp::Min)?;
        let ave = sum / np;

        let del = max - min;
        let mut bin = if del == 0.0 {
            0
        } else {
            ((value - min) / del * NHISTO as f64) as usize
        };
        if bin > NHISTO - 1 {
            bin = NHISTO - 1;
        }
        let mut bins = [0u64; NHISTO];
        bins[bin] = 1;
        self.comm.allreduce_sum_u64_slice(&mut bins)?;
        Ok((ave, max, min, bins))
    }
}
