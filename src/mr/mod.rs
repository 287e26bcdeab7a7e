//! mr — движок MapReduce: жизненный цикл, машина состояний KV/KMV и
//! коллективные операции над ними.
//!
//! Экземпляр держит не больше одного KV и одного KMV (в устойчивом
//! состоянии — ровно один контейнер). Операция потребляет входной
//! контейнер, может spill'ить страницы и обмениваться ими между рангами,
//! производит свежий KV или KMV и ставит его на место входа. Все операции
//! коллективны: каждый ранг входит в них в одном и том же порядке;
//! возвращаемое значение — глобальное число записей результата
//! (all-reduce суммой, u64).
//!
//! Вызов операции в неподходящем состоянии — ошибка с диагностикой вида
//! "cannot reduce without KeyMultiValue"; все ошибки коллективно фатальны
//! для задания, библиотека не предлагает коллбэкам путей восстановления.

mod map;
mod sort;
mod stats;

pub use map::Separator;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};

use crate::comm::{Communicator, ReduceOp, SelfComm};
use crate::config::{MrConfig, TimerMode, Verbosity};
use crate::consts::{
    KIND_KMV, KIND_KV, KIND_SPOOL, SPILL_EXT, SPILL_PREFIX, TAG_GATHER_HDR, TAG_GATHER_PAGE,
};
use crate::exchange::Irregular;
use crate::hash::key_to_rank;
use crate::kmv::{record as kmv_record, KeyMultiValue};
use crate::kv::{record as kv_record, KeyValue};
use crate::mem::{Alignment, MemSplit};
use crate::spool::Spool;

/// Пользовательская хеш-функция партиционирования: ключ → произвольное
/// число, ранг-владелец = hash mod P. Обязана быть детерминированной и
/// одинаковой на всех рангах.
pub type HashFn = dyn Fn(&[u8]) -> u64;

static INSTANCES: AtomicU64 = AtomicU64::new(0);

/// Какой контейнер описывает статистика операции.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatKind {
    Kv,
    Kmv,
}

pub struct MapReduce {
    comm: Arc<dyn Communicator>,
    cfg: MrConfig,
    split: MemSplit,
    align: Alignment,

    /// Номер экземпляра движка в процессе — входит в имена spill-файлов.
    instance: u64,
    /// Сквозной номер контейнера внутри экземпляра.
    seq: u64,

    kv: Option<KeyValue>,
    kmv: Option<KeyMultiValue>,

    time_start: Option<Instant>,
}

impl MapReduce {
    /// Движок с конфигурацией из окружения (GMR_*).
    pub fn new(comm: Arc<dyn Communicator>) -> Result<Self> {
        Self::with_config(comm, MrConfig::from_env())
    }

    pub fn with_config(comm: Arc<dyn Communicator>, cfg: MrConfig) -> Result<Self> {
        let split = MemSplit::of(cfg.memsize_bytes)?;
        let align = Alignment::new(cfg.key_align, cfg.value_align)?;
        if align.t > split.quarter {
            bail!(
                "invalid alignment setting: {} exceeds page size {}",
                align.t,
                split.quarter
            );
        }
        Ok(Self {
            comm,
            cfg,
            split,
            align,
            instance: INSTANCES.fetch_add(1, Ordering::Relaxed) + 1,
            seq: 0,
            kv: None,
            kmv: None,
            time_start: None,
        })
    }

    /// Однопроцессный движок (P = 1) — для локальных прогонов и тестов.
    pub fn serial() -> Result<Self> {
        Self::new(Arc::new(SelfComm::new()))
    }

    pub fn serial_with_config(cfg: MrConfig) -> Result<Self> {
        Self::with_config(Arc::new(SelfComm::new()), cfg)
    }

    // ---------------- интроспекция ----------------

    #[inline]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    #[inline]
    pub fn nprocs(&self) -> usize {
        self.comm.size()
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    pub fn config(&self) -> &MrConfig {
        &self.cfg
    }

    /// Политика диспетчеризации map-задач; менять можно между операциями.
    pub fn set_mapstyle(&mut self, style: crate::config::MapStyle) {
        self.cfg.mapstyle = style;
    }

    pub fn set_verbosity(&mut self, v: Verbosity) {
        self.cfg.verbosity = v;
    }

    pub fn set_timer(&mut self, t: TimerMode) {
        self.cfg.timer = t;
    }

    pub fn has_kv(&self) -> bool {
        self.kv.is_some()
    }

    pub fn has_kmv(&self) -> bool {
        self.kmv.is_some()
    }

    /// Локальный KV (например, чтобы обойти результат на этом ранге).
    pub fn kv(&mut self) -> Option<&mut KeyValue> {
        self.kv.as_mut()
    }

    pub fn kmv(&mut self) -> Option<&mut KeyMultiValue> {
        self.kmv.as_mut()
    }

    // ---------------- копия движка ----------------

    /// Полная копия: настройки и живой контейнер.
    pub fn copy(&mut self) -> Result<MapReduce> {
        let mut mrnew = MapReduce::with_config(Arc::clone(&self.comm), self.cfg.clone())?;
        if let Some(src) = self.kv.as_mut() {
            let mut kv = mrnew.fresh_kv();
            kv.copy_from(src)?;
            mrnew.kv = Some(kv);
        }
        if let Some(src) = self.kmv.as_mut() {
            let mut kmv = mrnew.fresh_kmv();
            kmv.copy_from(src)?;
            mrnew.kmv = Some(kmv);
        }
        Ok(mrnew)
    }

    // ---------------- операции KV → KV ----------------

    /// Присоединить KV другого движка к своему.
    pub fn add(&mut self, other: &mut MapReduce) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot add without KeyValue");
        }
        if other.kv.is_none() {
            bail!("MapReduce passed to add() does not have KeyValue pairs");
        }
        self.start_timer();

        let mut kv = self.kv.take().unwrap();
        kv.append()?;
        kv.add_kv(other.kv.as_mut().unwrap())?;
        kv.complete()?;
        self.kv = Some(kv);

        self.op_stats("Add", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Перераспределить KV по рангам хешем ключа: после операции все копии
    /// любого ключа живут на одном ранге. На P = 1 — no-op.
    pub fn aggregate(&mut self, hash: Option<&HashFn>) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot aggregate without KeyValue");
        }
        self.start_timer();

        let np = self.comm.size();
        if np == 1 {
            self.op_stats("Aggregate", StatKind::Kv)?;
            return self.global_kv_count();
        }

        let mut kv = self.kv.take().unwrap();
        let mut kvnew = self.fresh_kv();
        let a = kv.align();

        // каждый ранг крутит столько раундов, сколько страниц у самого
        // толстого: обмен коллективен и все входят в каждый раунд
        let npage = kv.npage();
        let maxpage = self.comm.allreduce_u64(npage as u64, ReduceOp::Max)?;

        let irregular = Irregular::new(Arc::clone(&self.comm));
        let mut dests: Vec<usize> = Vec::new();
        let mut sizes: Vec<u32> = Vec::new();
        let mut recv_payload: Vec<u8> = Vec::new();
        let mut recv_sizes: Vec<u32> = Vec::new();

        for ipage in 0..maxpage as usize {
            dests.clear();
            sizes.clear();

            let alignsize = if ipage < npage {
                let desc = kv.request_page(ipage)?;
                let page = kv.page_bytes(desc.alignsize);
                let mut off = 0usize;
                for _ in 0..desc.nkey {
                    let rec = kv_record::read_record(page, off, desc.alignsize, a)
                        .ok_or_else(|| anyhow!("malformed KeyValue page {}", ipage))?;
                    sizes.push((rec.end - rec.start) as u32);
                    let dest = match hash {
                        Some(h) => (h(rec.key) % np as u64) as usize,
                        None => key_to_rank(rec.key, np),
                    };
                    dests.push(dest);
                    off = rec.end;
                }
                desc.alignsize
            } else {
                0
            };

            let nrecv = irregular.exchange(
                &sizes,
                &dests,
                kv.page_bytes(alignsize),
                &mut recv_payload,
                &mut recv_sizes,
            )?;
            kvnew.add_packed(nrecv, &recv_payload)?;
        }

        drop(kv);
        kvnew.complete()?;
        self.kv = Some(kvnew);

        self.op_stats("Aggregate", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Собрать распределённый KV на первых numprocs рангах.
    pub fn gather(&mut self, numprocs: usize) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot gather without KeyValue");
        }
        let np = self.comm.size();
        if numprocs < 1 || numprocs > np {
            bail!("invalid proc count {} for gather (communicator size {})", numprocs, np);
        }
        self.start_timer();

        if np == 1 || numprocs == np {
            self.op_stats("Gather", StatKind::Kv)?;
            return self.global_kv_count();
        }

        let me = self.comm.rank();
        if me < numprocs {
            // младшие ранги принимают от старших с тем же (rank % numprocs)
            let mut kv = self.kv.take().unwrap();
            kv.append()?;
            let mut src = me + numprocs;
            while src < np {
                let hdr = self.comm.recv(src, TAG_GATHER_HDR)?;
                let npage_src = u64::from_le_bytes(
                    hdr.as_slice()
                        .try_into()
                        .map_err(|_| anyhow!("malformed gather header from rank {}", src))?,
                );
                for _ in 0..npage_src {
                    let msg = self.comm.recv(src, TAG_GATHER_PAGE)?;
                    if msg.len() < 32 {
                        bail!("malformed gather page from rank {}", src);
                    }
                    let nkey = u64::from_le_bytes(msg[0..8].try_into().unwrap());
                    let ks = u64::from_le_bytes(msg[8..16].try_into().unwrap());
                    let vs = u64::from_le_bytes(msg[16..24].try_into().unwrap());
                    let asz = u64::from_le_bytes(msg[24..32].try_into().unwrap()) as usize;
                    kv.add_packed_sized(nkey, &msg[32..32 + asz], ks, vs, asz)?;
                }
                src += numprocs;
            }
            kv.complete()?;
            self.kv = Some(kv);
        } else {
            let mut kv = self.kv.take().unwrap();
            let dst = me % numprocs;
            let npage = kv.npage();
            self.comm
                .send(dst, TAG_GATHER_HDR, &(npage as u64).to_le_bytes())?;
            for ipage in 0..npage {
                let desc = kv.request_page(ipage)?;
                let mut msg = Vec::with_capacity(32 + desc.alignsize);
                msg.extend_from_slice(&desc.nkey.to_le_bytes());
                msg.extend_from_slice(&desc.keysize.to_le_bytes());
                msg.extend_from_slice(&desc.valuesize.to_le_bytes());
                msg.extend_from_slice(&(desc.alignsize as u64).to_le_bytes());
                msg.extend_from_slice(kv.page_bytes(desc.alignsize));
                self.comm.send(dst, TAG_GATHER_PAGE, &msg)?;
            }
            // отправитель расстаётся со своими парами
            drop(kv);
            let mut fresh = self.fresh_kv();
            fresh.complete()?;
            self.kv = Some(fresh);
        }

        self.op_stats("Gather", StatKind::Kv)?;
        self.global_kv_count()
    }

    // ---------------- операции KV → KMV ----------------

    /// Каждая пара KV становится парой KMV с одним значением.
    #[allow(clippy::should_implement_trait)]
    pub fn clone(&mut self) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot clone without KeyValue");
        }
        self.start_timer();

        let mut kv = self.kv.take().unwrap();
        let mut kmv = self.fresh_kmv();
        kmv.clone_from(&mut kv)?;
        kmv.complete()?;
        drop(kv);
        self.kmv = Some(kmv);

        self.op_stats("Clone", StatKind::Kmv)?;
        self.global_kmv_count()
    }

    /// Весь локальный KV — одна запись KMV с заданным ключом и значениями
    /// k1,v1,k2,v2,...
    pub fn collapse(&mut self, key: &[u8]) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot collapse without KeyValue");
        }
        self.start_timer();

        let mut kv = self.kv.take().unwrap();
        let mut kmv = self.fresh_kmv();
        kmv.collapse_from(key, &mut kv)?;
        kmv.complete()?;
        drop(kv);
        self.kmv = Some(kmv);

        self.op_stats("Collapse", StatKind::Kmv)?;
        self.global_kmv_count()
    }

    /// Погрупповая сборка: дубликаты ключа схлопываются в одну запись
    /// со списком значений. Только локальные данные ранга.
    pub fn convert(&mut self) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot convert without KeyValue");
        }
        self.start_timer();

        let mut kv = self.kv.take().unwrap();
        let mut kmv = self.fresh_kmv();
        kmv.convert_from(&mut kv, self.split.half)?;
        kmv.complete()?;
        drop(kv);
        self.kmv = Some(kmv);

        self.op_stats("Convert", StatKind::Kmv)?;
        self.global_kmv_count()
    }

    /// aggregate + convert.
    pub fn collate(&mut self, hash: Option<&HashFn>) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot collate without KeyValue");
        }
        self.start_timer();

        let (verbosity, timer) = self.quiet();
        let inner = self.aggregate(hash).and_then(|_| self.convert());
        self.cfg.verbosity = verbosity;
        self.cfg.timer = timer;
        inner?;

        self.op_stats("Collate", StatKind::Kmv)?;
        self.global_kmv_count()
    }

    /// gather + collapse.
    pub fn scrunch(&mut self, numprocs: usize, key: &[u8]) -> Result<u64> {
        if self.kv.is_none() {
            bail!("cannot scrunch without KeyValue");
        }
        self.start_timer();

        let (verbosity, timer) = self.quiet();
        let inner = self.gather(numprocs).and_then(|_| self.collapse(key));
        self.cfg.verbosity = verbosity;
        self.cfg.timer = timer;
        inner?;

        self.op_stats("Scrunch", StatKind::Kmv)?;
        self.global_kmv_count()
    }

    // ---------------- операции KMV → KV ----------------

    /// Вызвать f для каждой записи KMV; f эмитит пары в новый KV.
    /// Для цепочек значения подаются через MultiValue::Blocks, ровно один
    /// вызов на ключ.
    pub fn reduce<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(&[u8], MultiValue<'_>, &mut KeyValue) -> Result<()>,
    {
        if self.kmv.is_none() {
            bail!("cannot reduce without KeyMultiValue");
        }
        self.start_timer();

        let mut kmv = self.kmv.take().unwrap();
        let mut kv = self.fresh_kv();
        run_reduce(&mut kmv, &mut kv, &mut f)?;
        kv.complete()?;
        drop(kmv);
        self.kv = Some(kv);

        self.op_stats("Reduce", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// convert + reduce без коммуникации: дубликаты ключа схлопываются
    /// в пределах ранга, результат — снова KV.
    pub fn compress<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(&[u8], MultiValue<'_>, &mut KeyValue) -> Result<()>,
    {
        if self.kv.is_none() {
            bail!("cannot compress without KeyValue");
        }
        self.start_timer();

        let mut kv_in = self.kv.take().unwrap();
        let mut kmv = self.fresh_kmv();
        kmv.convert_from(&mut kv_in, self.split.half)?;
        kmv.complete()?;
        drop(kv_in);

        let mut kv_out = self.fresh_kv();
        run_reduce(&mut kmv, &mut kv_out, &mut f)?;
        kv_out.complete()?;
        drop(kmv);
        self.kv = Some(kv_out);

        self.op_stats("Compress", StatKind::Kv)?;
        self.global_kv_count()
    }

    // ---------------- внутреннее ----------------

    /// Приглушить вывод вложенных операций (collate, scrunch, file map).
    pub(crate) fn quiet(&mut self) -> (Verbosity, TimerMode) {
        let hold = (self.cfg.verbosity, self.cfg.timer);
        self.cfg.verbosity = Verbosity::Silent;
        self.cfg.timer = TimerMode::Off;
        hold
    }

    pub(crate) fn fresh_kv(&mut self) -> KeyValue {
        KeyValue::new(self.spill_path(KIND_KV), self.split.quarter, self.align)
    }

    pub(crate) fn fresh_kmv(&mut self) -> KeyMultiValue {
        KeyMultiValue::new(self.spill_path(KIND_KMV), self.split.quarter, self.align)
    }

    pub(crate) fn fresh_spool(&mut self, pagesize: usize) -> Spool {
        Spool::new(self.spill_path(KIND_SPOOL), pagesize)
    }

    fn spill_path(&mut self, kind: &str) -> PathBuf {
        self.seq += 1;
        self.cfg.scratch_dir.join(format!(
            "{}.{}.{}.{}.{}.{}.{}",
            SPILL_PREFIX,
            kind,
            std::process::id(),
            self.instance,
            self.seq,
            self.comm.rank(),
            SPILL_EXT
        ))
    }

    pub(crate) fn global_kv_count(&self) -> Result<u64> {
        let n = self.kv.as_ref().map(|kv| kv.nkv).unwrap_or(0);
        self.comm.allreduce_u64(n, ReduceOp::Sum)
    }

    pub(crate) fn global_kmv_count(&self) -> Result<u64> {
        let n = self.kmv.as_ref().map(|kmv| kmv.nkmv).unwrap_or(0);
        self.comm.allreduce_u64(n, ReduceOp::Sum)
    }
}

// ---------------- представление multivalue в reduce/compress ----------------

/// Список значений одной записи KMV, как его видит коллбэк reduce/compress.
pub enum MultiValue<'a> {
    /// Запись целиком в странице: длины и байты значений подряд.
    Inline { sizes: &'a [u32], bytes: &'a [u8] },
    /// Цепочка блочных страниц; значения стримятся блоками.
    Blocks(BlockCursor<'a>),
}

impl MultiValue<'_> {
    /// Число значений: отрицательное -N для цепочки из N блоков
    /// (точное число значений в цепочке узнаётся обходом блоков).
    pub fn nvalues(&self) -> i64 {
        match self {
            MultiValue::Inline { sizes, .. } => sizes.len() as i64,
            MultiValue::Blocks(cursor) => -(cursor.nblocks() as i64),
        }
    }
}

/// Курсор по блочным страницам одной цепочки. Живёт только внутри вызова
/// коллбэка reduce/compress.
pub struct BlockCursor<'a> {
    kmv: &'a mut KeyMultiValue,
    header_page: usize,
    nblocks: usize,
    sizes: Vec<u32>,
}

impl BlockCursor<'_> {
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    /// Длины и байты значений блока iblock.
    pub fn block(&mut self, iblock: usize) -> Result<(&[u32], &[u8])> {
        if iblock >= self.nblocks {
            bail!("invalid multivalue block {} of {}", iblock, self.nblocks);
        }
        let desc = self.kmv.request_page(self.header_page + 1 + iblock)?;
        let a = self.kmv.align();
        let page = self.kmv.page_bytes(desc.alignsize);
        let (_nv, sizes_bytes, values) = kmv_record::read_block(page, desc.alignsize, a)
            .ok_or_else(|| anyhow!("malformed multivalue block page {}", self.header_page + 1 + iblock))?;
        kmv_record::read_sizes_into(sizes_bytes, &mut self.sizes);
        Ok((&self.sizes, values))
    }
}

/// Прогнать коллбэк по всем записям KMV, эмитя результат в kv_out.
fn run_reduce<F>(kmv: &mut KeyMultiValue, kv_out: &mut KeyValue, f: &mut F) -> Result<()>
where
    F: FnMut(&[u8], MultiValue<'_>, &mut KeyValue) -> Result<()>,
{
    let a = kmv.align();
    let npage = kmv.npage();
    let mut sizes: Vec<u32> = Vec::new();
    let mut keybuf: Vec<u8> = Vec::new();

    let mut ipage = 0usize;
    while ipage < npage {
        let desc = kmv.request_page(ipage)?;

        // заголовок цепочки всегда один на странице
        let chain = if desc.nkey == 1 {
            let page = kmv.page_bytes(desc.alignsize);
            kmv_record::read_kmv(page, 0, desc.alignsize, a)
                .map(|rec| rec.nvalues < 0)
                .unwrap_or(false)
        } else {
            false
        };

        if chain {
            let nblocks = {
                let page = kmv.page_bytes(desc.alignsize);
                let rec = kmv_record::read_kmv(page, 0, desc.alignsize, a)
                    .ok_or_else(|| anyhow!("malformed KeyMultiValue page {}", ipage))?;
                keybuf.clear();
                keybuf.extend_from_slice(rec.key);
                (-rec.nvalues) as usize
            };
            // ключ скопирован: блочные загрузки затирают страницу заголовка
            let cursor = BlockCursor {
                kmv: &mut *kmv,
                header_page: ipage,
                nblocks,
                sizes: Vec::new(),
            };
            f(&keybuf, MultiValue::Blocks(cursor), kv_out)?;
            ipage += 1 + nblocks;
        } else {
            let page = kmv.page_bytes(desc.alignsize);
            let mut off = 0usize;
            for _ in 0..desc.nkey {
                let rec = kmv_record::read_kmv(page, off, desc.alignsize, a)
                    .ok_or_else(|| anyhow!("malformed KeyMultiValue page {}", ipage))?;
                off = rec.end;
                kmv_record::read_sizes_into(rec.sizes_bytes, &mut sizes);
                f(
                    rec.key,
                    MultiValue::Inline {
                        sizes: &sizes,
                        bytes: rec.values,
                    },
                    kv_out,
                )?;
            }
            ipage += 1;
        }
    }
    Ok(())
}
