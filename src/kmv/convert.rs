//! kmv/convert — погрупповая сборка KMV из KV (каждый ключ — одна запись).
//!
//! Алгоритм в два прохода:
//! 1. По всем страницам KV строится таблица групп: ключ → список ссылок
//!    (страница, смещение значения, длина). Таблица живёт в scratch-RAM;
//!    выход за бюджет не фатален — пишем предупреждение и продолжаем.
//! 2. Обход таблицы: группа, влезающая в страницу, эмитится обычной
//!    записью; остальные — цепочкой блочных страниц. Страницы источника
//!    file-resident, их повторное чтение допустимо и ожидаемо.
//!
//! Порядок значений внутри ключа = порядок появления в KV (ссылки
//! добавляются при линейном сканировании страниц).

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use log::warn;

use crate::kv::{record as kv_record, KeyValue};
use crate::mem::align_up;

use super::{record, BlockPlanner, KeyMultiValue};

/// Ссылка на одно значение в страницах источника.
#[derive(Debug, Clone, Copy)]
struct ValueRef {
    page: u32,
    off: u32,
    len: u32,
}

struct Group {
    total: u64,
    entries: Vec<ValueRef>,
}

// грубая оценка накладных расходов таблицы, байт
const GROUP_COST: usize = 64;
const ENTRY_COST: usize = 12;

impl KeyMultiValue {
    /// Сгруппировать kv по ключу в self. scratch_limit — бюджет таблицы
    /// (half-регион движка).
    pub fn convert_from(&mut self, kv: &mut KeyValue, scratch_limit: usize) -> Result<()> {
        let a = kv.align();

        // -------- проход 1: таблица групп --------

        let mut table: HashMap<Vec<u8>, Group> = HashMap::new();
        let mut footprint = 0usize;
        let mut warned = false;

        for ipage in 0..kv.npage() {
            let desc = kv.request_page(ipage)?;
            let page = kv.page_bytes(desc.alignsize);
            let mut off = 0usize;
            for _ in 0..desc.nkey {
                let rec = kv_record::read_record(page, off, desc.alignsize, a)
                    .ok_or_else(|| anyhow!("malformed KeyValue page {}", ipage))?;
                off = rec.end;

                let koff = align_up(rec.start + kv_record::TWO_LEN_BYTES, a.k);
                let voff = align_up(koff + rec.key.len(), a.v);
                let entry = ValueRef {
                    page: ipage as u32,
                    off: voff as u32,
                    len: rec.value.len() as u32,
                };

                match table.get_mut(rec.key) {
                    Some(group) => {
                        group.total += entry.len as u64;
                        group.entries.push(entry);
                        footprint += ENTRY_COST;
                    }
                    None => {
                        footprint += rec.key.len() + GROUP_COST + ENTRY_COST;
                        table.insert(
                            rec.key.to_vec(),
                            Group {
                                total: entry.len as u64,
                                entries: vec![entry],
                            },
                        );
                    }
                }
                if !warned && footprint > scratch_limit {
                    warn!(
                        "convert group table exceeds the scratch region ({} > {} bytes)",
                        footprint, scratch_limit
                    );
                    warned = true;
                }
            }
        }

        // -------- проход 2: эмиссия --------

        let pagesize = self.pagesize;
        let align = self.align;
        let mut sizes: Vec<u32> = Vec::new();
        let mut staged: Vec<u8> = Vec::new();

        for (key, group) in table.iter() {
            let nv = group.entries.len();
            if group.total > i32::MAX as u64 || nv > i32::MAX as usize {
                bail!(
                    "single key's value list exceeds i32::MAX ({} values, {} bytes)",
                    nv,
                    group.total
                );
            }

            let inline =
                record::normal_size(key.len(), nv, group.total as usize, align) <= pagesize;
            if inline {
                sizes.clear();
                staged.clear();
                staged.reserve(group.total as usize);
                for e in &group.entries {
                    let desc = kv.request_page(e.page as usize)?;
                    let page = kv.page_bytes(desc.alignsize);
                    sizes.push(e.len);
                    staged.extend_from_slice(&page[e.off as usize..(e.off + e.len) as usize]);
                }
                self.add_record(key, &sizes, &staged)?;
            } else {
                let mut planner = BlockPlanner::new(pagesize, align);
                for e in &group.entries {
                    planner.push(e.len as usize)?;
                }
                let nblocks = planner.finish();

                self.begin_chain(key, group.total, nblocks)?;
                sizes.clear();
                staged.clear();
                for e in &group.entries {
                    let desc = kv.request_page(e.page as usize)?;
                    let start = e.off as usize;
                    let end = start + e.len as usize;
                    // stage_value укладывает в блок тем же жадным правилом,
                    // что и planner — число блоков сходится с заголовком
                    let page = kv.page_bytes(desc.alignsize);
                    self.stage_value(&page[start..end], &mut sizes, &mut staged)?;
                }
                self.finish_chain(&mut sizes, &mut staged)?;
            }
        }

        Ok(())
    }
}
