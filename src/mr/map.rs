//! mr/map — диспетчеризация map-задач: по счётчику, по файлам и по
//! существующему KV.
//!
//! Все варианты делят один диспетчер (chunk / strided / master-slave),
//! различаясь тем, что достаётся коллбэку: номер задачи, кусок файла или
//! пара ключ/значение. Master/slave: ранг 0 раздаёт задачи по запросу и
//! отвечает на каждый ack следующей задачей либо флагом завершения, так
//! что все ack'и оказываются вычитаны.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::warn;

use crate::config::MapStyle;
use crate::consts::{TAG_MAP_ACK, TAG_MAP_TASK};
use crate::kv::{record as kv_record, KeyValue};

use super::{MapReduce, StatKind};

/// Разделитель записей в file map: байт или байтовая строка.
/// Кусок с байтовым разделителем заканчивается им; кусок со строковым
/// разделителем начинается с неё.
#[derive(Debug, Clone)]
pub enum Separator {
    Byte(u8),
    Str(Vec<u8>),
}

impl Separator {
    fn find(&self, haystack: &[u8]) -> Option<usize> {
        match self {
            Separator::Byte(b) => haystack.iter().position(|x| x == b),
            Separator::Str(s) => {
                if s.is_empty() || haystack.len() < s.len() {
                    return None;
                }
                haystack.windows(s.len()).position(|w| w == s.as_slice())
            }
        }
    }
}

impl MapReduce {
    /// Выполнить nmap задач; f эмитит пары в KV. При addflag существующий
    /// KV дополняется, иначе замещается.
    pub fn map<F>(&mut self, nmap: u64, addflag: bool, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &mut KeyValue) -> Result<()>,
    {
        self.start_timer();
        self.map_tasks(nmap, addflag, &mut f)?;
        self.op_stats("Map", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Map по файлам: файлы режутся на ~nmap байтовых кусков, края куска
    /// подравниваются по разделителю в пределах delta перекрытия.
    /// Коллбэк получает номер задачи и байты куска.
    pub fn map_files<F>(
        &mut self,
        nmap: u64,
        files: &[PathBuf],
        sep: Separator,
        delta: usize,
        addflag: bool,
        mut f: F,
    ) -> Result<u64>
    where
        F: FnMut(u64, &[u8], &mut KeyValue) -> Result<()>,
    {
        if files.is_empty() {
            bail!("cannot map without files");
        }
        if files.len() as u64 > nmap {
            bail!("cannot map with more files than tasks ({} > {})", files.len(), nmap);
        }
        self.start_timer();

        let plan = self.plan_file_tasks(nmap, files, delta)?;

        let mut wrapper = |task: u64, kv: &mut KeyValue| -> Result<()> {
            let chunk = read_file_chunk(&plan, &sep, delta, task as usize)?;
            f(task, &chunk, kv)
        };
        let (verbosity, timer) = self.quiet();
        let inner = self.map_tasks(plan.whichfile.len() as u64, addflag, &mut wrapper);
        self.cfg.verbosity = verbosity;
        self.cfg.timer = timer;
        inner?;

        self.op_stats("Map", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Map по списку файлов из файла-перечня: одна задача на имя.
    /// Перечень читает ранг 0 и рассылает остальным.
    pub fn map_file_list<F>(&mut self, list: &Path, addflag: bool, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &Path, &mut KeyValue) -> Result<()>,
    {
        self.start_timer();

        let mut raw: Vec<u8> = Vec::new();
        if self.comm.rank() == 0 {
            let file = File::open(list)
                .with_context(|| format!("could not open file of file names {}", list.display()))?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                let name = line.trim();
                if name.is_empty() {
                    bail!("blank line in file of file names");
                }
                raw.extend_from_slice(name.as_bytes());
                raw.push(b'\n');
            }
        }
        self.comm.broadcast(0, &mut raw)?;

        let names: Vec<PathBuf> = raw
            .split(|b| *b == b'\n')
            .filter(|s| !s.is_empty())
            .map(|s| PathBuf::from(String::from_utf8_lossy(s).into_owned()))
            .collect();

        let mut wrapper =
            |task: u64, kv: &mut KeyValue| -> Result<()> { f(task, &names[task as usize], kv) };
        let (verbosity, timer) = self.quiet();
        let inner = self.map_tasks(names.len() as u64, addflag, &mut wrapper);
        self.cfg.verbosity = verbosity;
        self.cfg.timer = timer;
        inner?;

        self.op_stats("Map", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Map по собственному KV: f видит каждую пару и эмитит в новый KV.
    pub fn map_kv<F>(&mut self, addflag: bool, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &[u8], &[u8], &mut KeyValue) -> Result<()>,
    {
        if self.kv.is_none() {
            bail!("cannot map without KeyValue");
        }
        self.start_timer();
        self.kmv = None;

        let mut kv_src = self.kv.take().unwrap();
        let mut kv_dest = if addflag {
            // дополняем копию самих себя
            let mut copy = self.fresh_kv();
            copy.copy_from(&mut kv_src)?;
            copy.append()?;
            copy
        } else {
            self.fresh_kv()
        };

        map_over_kv(&mut kv_src, &mut kv_dest, &mut f)?;
        kv_dest.complete()?;
        drop(kv_src);
        self.kv = Some(kv_dest);

        self.op_stats("Map", StatKind::Kv)?;
        self.global_kv_count()
    }

    /// Map по KV другого движка; свой KV замещается или дополняется.
    pub fn map_kv_from<F>(&mut self, source: &mut MapReduce, addflag: bool, mut f: F) -> Result<u64>
    where
        F: FnMut(u64, &[u8], &[u8], &mut KeyValue) -> Result<()>,
    {
        if source.kv.is_none() {
            bail!("MapReduce passed to map() does not have KeyValue pairs");
        }
        self.start_timer();
        self.kmv = None;

        let mut kv_dest = if !addflag {
            self.kv = None;
            self.fresh_kv()
        } else if let Some(mut kv) = self.kv.take() {
            kv.append()?;
            kv
        } else {
            self.fresh_kv()
        };

        map_over_kv(source.kv.as_mut().unwrap(), &mut kv_dest, &mut f)?;
        kv_dest.complete()?;
        self.kv = Some(kv_dest);

        self.op_stats("Map", StatKind::Kv)?;
        self.global_kv_count()
    }

    // ---------------- диспетчер ----------------

    fn map_tasks<F>(&mut self, nmap: u64, addflag: bool, f: &mut F) -> Result<()>
    where
        F: FnMut(u64, &mut KeyValue) -> Result<()>,
    {
        self.kmv = None;
        let mut kv = if !addflag {
            self.kv = None;
            self.fresh_kv()
        } else if let Some(mut kv) = self.kv.take() {
            kv.append()?;
            kv
        } else {
            self.fresh_kv()
        };

        let np = self.comm.size() as u64;
        let me = self.comm.rank() as u64;

        if np == 1 {
            for itask in 0..nmap {
                f(itask, &mut kv)?;
            }
        } else {
            match self.cfg.mapstyle {
                MapStyle::Chunk => {
                    let lo = me * nmap / np;
                    let hi = (me + 1) * nmap / np;
                    for itask in lo..hi {
                        f(itask, &mut kv)?;
                    }
                }
                MapStyle::Strided => {
                    let mut itask = me;
                    while itask < nmap {
                        f(itask, &mut kv)?;
                        itask += np;
                    }
                }
                MapStyle::MasterSlave => self.map_master_slave(nmap, &mut kv, f)?,
            }
        }

        kv.complete()?;
        self.kv = Some(kv);
        Ok(())
    }

    /// Ранг 0 — диспетчер: задачи уходят по требованию, работники
    /// подтверждают каждую и получают следующую либо -1.
    fn map_master_slave<F>(&mut self, nmap: u64, kv: &mut KeyValue, f: &mut F) -> Result<()>
    where
        F: FnMut(u64, &mut KeyValue) -> Result<()>,
    {
        let np = self.comm.size();
        if self.comm.rank() == 0 {
            let done = (-1i64).to_le_bytes();
            let mut itask = 0u64;
            let mut ndone = 0usize;
            for iproc in 1..np {
                if itask < nmap {
                    self.comm
                        .send(iproc, TAG_MAP_TASK, &(itask as i64).to_le_bytes())?;
                    itask += 1;
                } else {
                    self.comm.send(iproc, TAG_MAP_TASK, &done)?;
                    ndone += 1;
                }
            }
            while ndone < np - 1 {
                let (iproc, _ack) = self.comm.recv_any(TAG_MAP_ACK)?;
                if itask < nmap {
                    self.comm
                        .send(iproc, TAG_MAP_TASK, &(itask as i64).to_le_bytes())?;
                    itask += 1;
                } else {
                    self.comm.send(iproc, TAG_MAP_TASK, &done)?;
                    ndone += 1;
                }
            }
        } else {
            loop {
                let msg = self.comm.recv(0, TAG_MAP_TASK)?;
                let itask = i64::from_le_bytes(
                    msg.as_slice()
                        .try_into()
                        .map_err(|_| anyhow!("malformed map task frame"))?,
                );
                if itask < 0 {
                    break;
                }
                f(itask as u64, kv)?;
                self.comm.send(0, TAG_MAP_ACK, &[])?;
            }
        }
        Ok(())
    }

    // ---------------- раскрой файлов ----------------

    /// Раздать nmap задач по файлам пропорционально размеру; у каждого
    /// файла минимум одна задача. Размеры меряет ранг 0 и рассылает всем.
    fn plan_file_tasks(&mut self, nmap: u64, files: &[PathBuf], delta: usize) -> Result<FilePlan> {
        let nfiles = files.len();

        let mut raw = vec![0u8; nfiles * 8];
        if self.comm.rank() == 0 {
            for (i, path) in files.iter().enumerate() {
                let md = std::fs::metadata(path)
                    .with_context(|| format!("could not query file size of {}", path.display()))?;
                raw[i * 8..i * 8 + 8].copy_from_slice(&md.len().to_le_bytes());
            }
        }
        self.comm.broadcast(0, &mut raw)?;
        let filesize: Vec<u64> = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let ntotal: u64 = filesize.iter().sum();
        let nideal = (ntotal / nmap).max(1);

        let mut tasksperfile: Vec<u64> = filesize.iter().map(|s| (s / nideal).max(1)).collect();
        let mut ntasks: u64 = tasksperfile.iter().sum();

        // подгонка к целевому числу задач; полный проход без прогресса
        // завершает подгонку (все кандидаты исчерпаны)
        while ntasks < nmap {
            let before = ntasks;
            for i in 0..nfiles {
                if filesize[i] > nideal {
                    tasksperfile[i] += 1;
                    ntasks += 1;
                    if ntasks == nmap {
                        break;
                    }
                }
            }
            if ntasks == before {
                break;
            }
        }
        while ntasks > nmap {
            let before = ntasks;
            for i in 0..nfiles {
                if tasksperfile[i] > 1 {
                    tasksperfile[i] -= 1;
                    ntasks -= 1;
                    if ntasks == nmap {
                        break;
                    }
                }
            }
            if ntasks == before {
                break;
            }
        }

        // куски мельче delta порождают перекрывающиеся чтения — ужимаем
        let mut shrunk = false;
        for i in 0..nfiles {
            while tasksperfile[i] > 1 && filesize[i] / tasksperfile[i] <= delta as u64 {
                tasksperfile[i] -= 1;
                ntasks -= 1;
                shrunk = true;
            }
        }
        if shrunk && self.comm.rank() == 0 {
            warn!("file(s) too small for file delta - decreased map tasks to {}", ntasks);
        }

        let mut whichfile = Vec::with_capacity(ntasks as usize);
        let mut whichtask = Vec::with_capacity(ntasks as usize);
        for (i, &t) in tasksperfile.iter().enumerate() {
            for j in 0..t {
                whichfile.push(i);
                whichtask.push(j);
            }
        }

        Ok(FilePlan {
            files: files.to_vec(),
            filesize,
            tasksperfile,
            whichfile,
            whichtask,
        })
    }
}

struct FilePlan {
    files: Vec<PathBuf>,
    filesize: Vec<u64>,
    tasksperfile: Vec<u64>,
    whichfile: Vec<usize>,
    whichtask: Vec<u64>,
}

/// Прочитать кусок файла для задачи, подровняв края по разделителю.
fn read_file_chunk(plan: &FilePlan, sep: &Separator, delta: usize, task: usize) -> Result<Vec<u8>> {
    let ifile = plan.whichfile[task];
    let itask = plan.whichtask[task];
    let filesize = plan.filesize[ifile];
    let ntask = plan.tasksperfile[ifile];

    let readstart = itask * filesize / ntask;
    let readnext = (itask + 1) * filesize / ntask;
    let readsize = ((readnext - readstart) as usize + delta).min((filesize - readstart) as usize);

    let mut buf = vec![0u8; readsize];
    let path = &plan.files[ifile];
    let mut file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    file.seek(SeekFrom::Start(readstart))
        .with_context(|| format!("seek {}", path.display()))?;
    file.read_exact(&mut buf)
        .with_context(|| format!("read {}", path.display()))?;

    // не первый кусок файла: отрезать головной фрагмент по разделителю
    let mut strstart = 0usize;
    if itask > 0 {
        let pos = sep.find(&buf);
        match pos {
            Some(p) if p <= delta => {
                strstart = match sep {
                    Separator::Byte(_) => p + 1,
                    Separator::Str(_) => p,
                };
            }
            _ => bail!("could not find separator within delta"),
        }
    }

    // не последний кусок: обрезать хвост за первым разделителем после границы
    let mut strstop = readsize;
    if itask + 1 < ntask {
        let from = (readnext - readstart) as usize;
        let pos = sep
            .find(&buf[from..])
            .ok_or_else(|| anyhow!("could not find separator within delta"))?;
        strstop = match sep {
            Separator::Byte(_) => from + pos + 1,
            Separator::Str(_) => from + pos,
        };
    }

    buf.truncate(strstop);
    buf.drain(..strstart);
    Ok(buf)
}

/// Прогнать f по всем парам источника, эмитя в kv_dest.
/// Индекс записи — в пределах страницы, с каждой страницы считается заново.
fn map_over_kv<F>(kv_src: &mut KeyValue, kv_dest: &mut KeyValue, f: &mut F) -> Result<()>
where
    F: FnMut(u64, &[u8], &[u8], &mut KeyValue) -> Result<()>,
{
    let a = kv_src.align();
    for ipage in 0..kv_src.npage() {
        let desc = kv_src.request_page(ipage)?;
        let page = kv_src.page_bytes(desc.alignsize);
        let mut off = 0usize;
        for index in 0..desc.nkey {
            let rec = kv_record::read_record(page, off, desc.alignsize, a)
                .ok_or_else(|| anyhow!("malformed KeyValue page {}", ipage))?;
            off = rec.end;
            f(index, rec.key, rec.value, kv_dest)?;
        }
    }
    Ok(())
}
