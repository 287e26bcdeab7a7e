//! Коллективные операции на потоковом коммуникаторе: P рангов в одном
//! процессе, по движку на ранг, одинаковая последовательность операций
//! на каждом. С chunk-диспетчером и nmap = P задача t попадает ровно на
//! ранг t, поэтому "каждый ранг эмитит своё" пишется как map(P, ...).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use GristMR::{MapReduce, MapStyle, MrConfig, MultiValue, Separator, ThreadComm};

type Body = Arc<dyn Fn(&mut MapReduce) -> Result<()> + Send + Sync>;

#[test]
fn aggregate_moves_all_copies_of_a_key_to_one_rank() -> Result<()> {
    run_spmd(4, 64 * 1024, |_root| {
        Arc::new(move |mr: &mut MapReduce| {
            let np = mr.nprocs();
            // каждый ранг эмитит по записи на каждый ключ 0..P
            mr.map(np as u64, false, |t, kv| {
                for k in 0..np {
                    kv.add(&[k as u8], &[t as u8])?;
                }
                Ok(())
            })?;

            let total = mr.aggregate(Some(&|key: &[u8]| key[0] as u64))?;
            assert_eq!(total, (np * np) as u64);

            // локально — только свой ключ, по одной копии от каждого ранга
            let me = mr.rank() as u8;
            let pairs = collect_pairs(mr)?;
            assert_eq!(pairs.len(), np);
            let mut senders: Vec<u8> = pairs
                .iter()
                .map(|(k, v)| {
                    assert_eq!(k.as_slice(), &[me], "foreign key after aggregate");
                    v[0]
                })
                .collect();
            senders.sort_unstable();
            let expect: Vec<u8> = (0..np as u8).collect();
            assert_eq!(senders, expect);
            Ok(())
        })
    })
}

#[test]
fn collate_equals_aggregate_then_convert() -> Result<()> {
    run_spmd(4, 64 * 1024, |root| {
        Arc::new(move |mr: &mut MapReduce| {
            let np = mr.nprocs() as u64;
            // без захватов: замыкание Copy, используется обоими движками
            let emit = |t: u64, kv: &mut GristMR::KeyValue| -> Result<()> {
                let seed = t * 1000;
                for i in 0..50u64 {
                    let k = ((seed + i * 13) % 17) as u8;
                    kv.add(&[k], &(seed + i).to_le_bytes())?;
                }
                Ok(())
            };

            // путь 1: collate
            mr.map(np, false, emit)?;
            mr.collate(None)?;
            let via_collate = collect_groups(mr)?;

            // путь 2: aggregate + convert на втором движке
            let cfg = MrConfig::default()
                .with_memsize_bytes(64 * 1024)
                .with_scratch_dir(&root);
            let mut mr2 = MapReduce::with_config(Arc::clone(mr.communicator()), cfg)?;
            mr2.map(np, false, emit)?;
            mr2.aggregate(None)?;
            mr2.convert()?;
            let via_pair = collect_groups(&mut mr2)?;

            assert_eq!(via_collate, via_pair);
            Ok(())
        })
    })
}

#[test]
fn add_is_disjoint_union() -> Result<()> {
    run_spmd(3, 64 * 1024, |root| {
        Arc::new(move |mr: &mut MapReduce| {
            let np = mr.nprocs() as u64;
            mr.map(np, false, |t, kv| {
                for i in 0..10u8 {
                    kv.add(&[b'x', t as u8, i], &[1])?;
                }
                Ok(())
            })?;

            let cfg = MrConfig::default()
                .with_memsize_bytes(64 * 1024)
                .with_scratch_dir(&root);
            let mut other = MapReduce::with_config(Arc::clone(mr.communicator()), cfg)?;
            other.map(np, false, |t, kv| {
                for i in 0..7u8 {
                    kv.add(&[b'y', t as u8, i], &[2])?;
                }
                Ok(())
            })?;

            let total = mr.add(&mut other)?;
            assert_eq!(total, 3 * 17);

            let pairs = collect_pairs(mr)?;
            assert_eq!(pairs.len(), 17);
            assert_eq!(pairs.iter().filter(|(k, _)| k[0] == b'x').count(), 10);
            assert_eq!(pairs.iter().filter(|(k, _)| k[0] == b'y').count(), 7);
            Ok(())
        })
    })
}

#[test]
fn gather_to_one_then_collapse_interleaves_everything() -> Result<()> {
    run_spmd(4, 64 * 1024, |_root| {
        Arc::new(move |mr: &mut MapReduce| {
            let np = mr.nprocs() as u64;
            mr.map(np, false, |t, kv| kv.add(&[b'k', t as u8], &[b'v', t as u8]))?;

            mr.gather(1)?;
            if mr.rank() == 0 {
                assert_eq!(mr.kv().unwrap().nkv, 4);
            } else {
                assert_eq!(mr.kv().unwrap().nkv, 0);
            }

            mr.collapse(b"g")?;
            let groups = collect_groups(mr)?;
            if mr.rank() == 0 {
                // один KMV-рекорд с чередованием k0,v0,k1,v1,...
                assert_eq!(groups.len(), 1);
                let values = &groups[&b"g".to_vec()];
                assert_eq!(values.len(), 2 * 4);
                for r in 0..4u8 {
                    assert!(values.contains(&vec![b'k', r]));
                    assert!(values.contains(&vec![b'v', r]));
                }
            } else {
                assert_eq!(groups[&b"g".to_vec()].len(), 0);
            }
            Ok(())
        })
    })
}

#[test]
fn scrunch_gathers_then_collapses() -> Result<()> {
    run_spmd(4, 64 * 1024, |_root| {
        Arc::new(move |mr: &mut MapReduce| {
            let np = mr.nprocs() as u64;
            mr.map(np, false, |t, kv| {
                for i in 0..3u8 {
                    kv.add(&[t as u8, i], &[i])?;
                }
                Ok(())
            })?;

            // собрать на два младших ранга и схлопнуть
            let nkmv = mr.scrunch(2, b"s")?;
            assert_eq!(nkmv, 4, "one collapse record per rank");

            let groups = collect_groups(mr)?;
            let values = &groups[&b"s".to_vec()];
            if mr.rank() < 2 {
                // свои 3 пары плюс пары с ранга rank+2
                assert_eq!(values.len(), 2 * 6);
            } else {
                assert_eq!(values.len(), 0);
            }
            Ok(())
        })
    })
}

#[test]
fn master_slave_dispatch_runs_every_task_once() -> Result<()> {
    run_spmd(4, 64 * 1024, |_root| {
        Arc::new(move |mr: &mut MapReduce| {
            mr.set_mapstyle(MapStyle::MasterSlave);
            let total = mr.map(13, false, |t, kv| kv.add(&t.to_le_bytes(), &[]))?;
            assert_eq!(total, 13);

            // ранг 0 — чистый диспетчер
            if mr.rank() == 0 {
                assert_eq!(mr.kv().unwrap().nkv, 0);
            }

            // каждая задача выполнена ровно один раз: собрать всё на ранг 0
            mr.gather(1)?;
            if mr.rank() == 0 {
                let mut tasks: Vec<u64> = collect_pairs(mr)?
                    .iter()
                    .map(|(k, _)| u64::from_le_bytes(k.as_slice().try_into().unwrap()))
                    .collect();
                tasks.sort_unstable();
                let expect: Vec<u64> = (0..13).collect();
                assert_eq!(tasks, expect);
            }
            Ok(())
        })
    })
}

#[test]
fn strided_dispatch_covers_task_range() -> Result<()> {
    run_spmd(4, 64 * 1024, |_root| {
        Arc::new(move |mr: &mut MapReduce| {
            mr.set_mapstyle(MapStyle::Strided);
            let me = mr.rank() as u64;
            let total = mr.map(10, false, move |t, kv| {
                assert_eq!(t % 4, me, "strided task landed on a wrong rank");
                kv.add(&t.to_le_bytes(), &[])
            })?;
            assert_eq!(total, 10);
            Ok(())
        })
    })
}

#[test]
fn word_frequency_across_three_ranks() -> Result<()> {
    // три файла, шесть слов, три различных
    let dir = tempfile::tempdir()?;
    let mut files = Vec::new();
    for (name, text) in [("a", "the cat"), ("b", "the dog"), ("c", "cat dog")] {
        let path = dir.path().join(name);
        std::fs::write(&path, text)?;
        files.push(path);
    }

    let files = Arc::new(files);
    run_spmd(3, 64 * 1024, move |_root| {
        let files = Arc::clone(&files);
        Arc::new(move |mr: &mut MapReduce| {
            mr.map_files(3, &files, Separator::Byte(b'\n'), 2, false, |_t, text, kv| {
                for word in text.split(|b: &u8| b.is_ascii_whitespace()) {
                    if !word.is_empty() {
                        kv.add(word, &[])?;
                    }
                }
                Ok(())
            })?;

            mr.collate(None)?;
            let total = mr.reduce(|key, mv, out| {
                let count = match mv {
                    MultiValue::Inline { sizes, .. } => sizes.len() as u64,
                    MultiValue::Blocks(_) => unreachable!("tiny multivalues"),
                };
                out.add(key, &count.to_le_bytes())
            })?;
            assert_eq!(total, 3, "three distinct words");

            mr.gather(1)?;
            if mr.rank() == 0 {
                let counts: HashMap<Vec<u8>, u64> = collect_pairs(mr)?
                    .into_iter()
                    .map(|(k, v)| (k, u64::from_le_bytes(v.as_slice().try_into().unwrap())))
                    .collect();
                assert_eq!(counts.len(), 3);
                for word in [&b"the"[..], b"cat", b"dog"] {
                    assert_eq!(counts[word], 2, "{:?}", std::str::from_utf8(word));
                }
            }
            Ok(())
        })
    })
}

#[test]
fn file_map_splits_one_file_into_chunks() -> Result<()> {
    // один файл, 64 строки, 8 задач: куски должны сойтись без потерь
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("lines");
    let mut content = String::new();
    for i in 0..64 {
        content.push_str(&format!("line-{:03}\n", i));
    }
    std::fs::write(&path, &content)?;

    let path = Arc::new(path);
    run_spmd(4, 64 * 1024, move |_root| {
        let path = Arc::clone(&path);
        Arc::new(move |mr: &mut MapReduce| {
            let files = [path.as_ref().clone()];
            mr.map_files(8, &files, Separator::Byte(b'\n'), 16, false, |_t, text, kv| {
                for line in text.split(|b: &u8| *b == b'\n') {
                    if !line.is_empty() {
                        kv.add(line, &[])?;
                    }
                }
                Ok(())
            })?;

            mr.gather(1)?;
            if mr.rank() == 0 {
                let mut lines: Vec<Vec<u8>> =
                    collect_pairs(mr)?.into_iter().map(|(k, _)| k).collect();
                lines.sort();
                assert_eq!(lines.len(), 64, "every line exactly once");
                for (i, line) in lines.iter().enumerate() {
                    assert_eq!(line, format!("line-{:03}", i).as_bytes());
                }
            }
            Ok(())
        })
    })
}

#[test]
fn map_file_list_runs_one_task_per_name() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut names = String::new();
    for i in 0..5 {
        let path = dir.path().join(format!("part-{}", i));
        std::fs::write(&path, vec![b'x'; i + 1])?;
        names.push_str(path.to_str().unwrap());
        names.push('\n');
    }
    let list = dir.path().join("list");
    std::fs::write(&list, names)?;

    let list = Arc::new(list);
    run_spmd(2, 64 * 1024, move |_root| {
        let list = Arc::clone(&list);
        Arc::new(move |mr: &mut MapReduce| {
            let total = mr.map_file_list(&list, false, |t, path, kv| {
                let len = std::fs::metadata(path)?.len();
                kv.add(&t.to_le_bytes(), &len.to_le_bytes())
            })?;
            assert_eq!(total, 5);

            mr.gather(1)?;
            if mr.rank() == 0 {
                let pairs = collect_pairs(mr)?;
                assert_eq!(pairs.len(), 5);
                for (k, v) in pairs {
                    let t = u64::from_le_bytes(k.as_slice().try_into().unwrap());
                    let len = u64::from_le_bytes(v.as_slice().try_into().unwrap());
                    assert_eq!(len, t + 1);
                }
            }
            Ok(())
        })
    })
}

#[test]
fn aggregate_spilled_kv_round_robin() -> Result<()> {
    // маленькая память: у рангов разное число страниц, раундов обмена
    // столько, сколько страниц у самого толстого
    run_spmd(2, 16 * 1024, |_root| {
        Arc::new(move |mr: &mut MapReduce| {
            let np = mr.nprocs() as u64;
            mr.map(np, false, |t, kv| {
                let mine = if t == 0 { 900u64 } else { 300u64 };
                for i in 0..mine {
                    kv.add(&(i * 2 + t).to_le_bytes(), &t.to_le_bytes())?;
                }
                Ok(())
            })?;

            let total = mr.aggregate(None)?;
            assert_eq!(total, 1200);

            // мультимножество сохранилось: проверить на ранге 0
            mr.gather(1)?;
            if mr.rank() == 0 {
                let mut keys: Vec<u64> = collect_pairs(mr)?
                    .iter()
                    .map(|(k, _)| u64::from_le_bytes(k.as_slice().try_into().unwrap()))
                    .collect();
                keys.sort_unstable();
                let mut expect: Vec<u64> = (0..900).map(|i| i * 2).collect();
                expect.extend((0..300).map(|i| i * 2 + 1));
                expect.sort_unstable();
                assert_eq!(keys, expect);
            }
            Ok(())
        })
    })
}

// ---------- helpers ----------

/// Запустить body на np рангах ThreadComm с общим scratch-каталогом.
fn run_spmd<B>(np: usize, memsize: u64, make_body: B) -> Result<()>
where
    B: FnOnce(PathBuf) -> Body,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let root = tempfile::tempdir()?;
    let body = make_body(root.path().to_path_buf());

    let mut handles = Vec::new();
    for comm in ThreadComm::create(np) {
        let body = Arc::clone(&body);
        let dir = root.path().to_path_buf();
        handles.push(std::thread::spawn(move || -> Result<()> {
            let cfg = MrConfig::default()
                .with_memsize_bytes(memsize)
                .with_scratch_dir(dir);
            let mut mr = MapReduce::with_config(Arc::new(comm), cfg)?;
            body(&mut mr)
        }));
    }
    for h in handles {
        h.join().expect("rank thread panicked")?;
    }
    Ok(())
}

fn collect_pairs(mr: &mut MapReduce) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let kv = mr.kv().expect("engine must hold a KeyValue");
    let mut out = Vec::new();
    for ipage in 0..kv.npage() {
        let desc = kv.request_page(ipage)?;
        for rec in kv.iter_page(&desc) {
            out.push((rec.key.to_vec(), rec.value.to_vec()));
        }
    }
    Ok(out)
}

/// Локальные группы KMV: ключ -> отсортированные значения.
fn collect_groups(mr: &mut MapReduce) -> Result<HashMap<Vec<u8>, Vec<Vec<u8>>>> {
    use GristMR::kmv::record::{read_kmv, read_sizes_into};

    let kmv = mr.kmv().expect("engine must hold a KeyMultiValue");
    let a = kmv.align();
    let mut out: HashMap<Vec<u8>, Vec<Vec<u8>>> = HashMap::new();
    let mut sizes: Vec<u32> = Vec::new();
    for ipage in 0..kmv.npage() {
        let desc = kmv.request_page(ipage)?;
        let page = kmv.page_bytes(desc.alignsize);
        let mut off = 0usize;
        for _ in 0..desc.nkey {
            let rec = read_kmv(page, off, desc.alignsize, a).expect("well-formed KMV page");
            off = rec.end;
            assert!(rec.nvalues >= 0, "collect_groups does not walk chains");
            read_sizes_into(rec.sizes_bytes, &mut sizes);
            let mut values = Vec::with_capacity(sizes.len());
            let mut voff = 0usize;
            for s in &sizes {
                values.push(rec.values[voff..voff + *s as usize].to_vec());
                voff += *s as usize;
            }
            values.sort();
            out.insert(rec.key.to_vec(), values);
        }
    }
    Ok(out)
}
