use std::collections::HashMap;

use anyhow::Result;

use GristMR::{MapReduce, MrConfig, MultiValue};

#[test]
fn convert_groups_by_key() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    // (k mod 5) -> значения k, по 40 пар
    mr.map(40, false, |t, kv| kv.add(&[(t % 5) as u8], &t.to_le_bytes()))?;
    let nkmv = mr.convert()?;
    assert_eq!(nkmv, 5);

    // у каждого ключа — мультимножество его значений
    let groups = collect_kmv(&mut mr)?;
    assert_eq!(groups.len(), 5);
    for (key, values) in groups {
        assert_eq!(values.len(), 8);
        for v in values {
            let t = u64::from_le_bytes(v.as_slice().try_into().unwrap());
            assert_eq!((t % 5) as u8, key[0]);
        }
    }
    Ok(())
}

#[test]
fn clone_is_left_inverse_under_identity_reduce() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    // рёбра (vi, vj), vi < vj — как в задаче перечисления треугольников
    let edges: &[(u64, u64)] = &[(1, 2), (2, 3), (1, 3)];
    mr.map(edges.len() as u64, false, |t, kv| {
        let (vi, vj) = edges[t as usize];
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&vi.to_le_bytes());
        key[8..].copy_from_slice(&vj.to_le_bytes());
        kv.add(&key, &[])
    })?;
    let before = collect_kv_multiset(&mut mr)?;

    let nkmv = mr.clone()?;
    assert_eq!(nkmv, 3);
    let nkv = mr.reduce(identity_emit)?;
    assert_eq!(nkv, 3);

    let after = collect_kv_multiset(&mut mr)?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn clone_reduce_roundtrip_survives_spill() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    mr.map(3000, false, |t, kv| kv.add(&t.to_le_bytes(), &(t ^ 0xff).to_le_bytes()))?;
    let before = collect_kv_multiset(&mut mr)?;

    mr.clone()?;
    mr.reduce(identity_emit)?;
    let after = collect_kv_multiset(&mut mr)?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn collapse_concatenates_pairs_under_one_key() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    mr.map(4, false, |t, kv| kv.add(&[b'k', t as u8], &[b'v', t as u8]))?;
    let nkmv = mr.collapse(b"all")?;
    assert_eq!(nkmv, 1);

    let groups = collect_kmv(&mut mr)?;
    assert_eq!(groups.len(), 1);
    let (key, values) = &groups[0];
    assert_eq!(key.as_slice(), b"all");
    // чередование k1,v1,k2,v2,...
    assert_eq!(values.len(), 8);
    for t in 0..4usize {
        assert_eq!(values[2 * t], vec![b'k', t as u8]);
        assert_eq!(values[2 * t + 1], vec![b'v', t as u8]);
    }
    Ok(())
}

#[test]
fn compress_merges_duplicates_locally() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    // 30 пар на 3 ключа, значение = 1
    mr.map(30, false, |t, kv| kv.add(&[(t % 3) as u8], &1u64.to_le_bytes()))?;
    let nkv = mr.compress(|key, mv, out| {
        let total: u64 = match &mv {
            MultiValue::Inline { sizes, bytes } => {
                let mut sum = 0u64;
                let mut off = 0usize;
                for s in sizes.iter() {
                    sum += u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
                    off += *s as usize;
                }
                sum
            }
            MultiValue::Blocks(_) => unreachable!("values fit inline"),
        };
        out.add(key, &total.to_le_bytes())
    })?;
    assert_eq!(nkv, 3);

    let result = collect_kv_multiset(&mut mr)?;
    for k in 0u8..3 {
        let count = result[&(vec![k], 10u64.to_le_bytes().to_vec())];
        assert_eq!(count, 1);
    }
    Ok(())
}

#[test]
fn aggregate_on_single_process_is_noop() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    mr.map(100, false, |t, kv| kv.add(&t.to_le_bytes(), &[]))?;
    let before = collect_kv_multiset(&mut mr)?;
    let n = mr.aggregate(None)?;
    assert_eq!(n, 100);
    let after = collect_kv_multiset(&mut mr)?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn wrong_state_is_fatal() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    // пустой движок: ни KV, ни KMV
    let err = mr.reduce(identity_emit).unwrap_err();
    assert!(err.to_string().contains("cannot reduce without KeyMultiValue"));
    let err = mr.convert().unwrap_err();
    assert!(err.to_string().contains("cannot convert without KeyValue"));
    let err = mr.aggregate(None).unwrap_err();
    assert!(err.to_string().contains("cannot aggregate without KeyValue"));

    // после convert KV потреблён — вторая группировка невозможна
    mr.map(10, false, |t, kv| kv.add(&[t as u8], &[]))?;
    mr.convert()?;
    let err = mr.convert().unwrap_err();
    assert!(err.to_string().contains("cannot convert without KeyValue"));

    // sort_keys требует KV, а живёт сейчас KMV
    let err = mr.sort_keys(|a, b| a.cmp(b)).unwrap_err();
    assert!(err.to_string().contains("cannot sort_keys without KeyValue"));
    Ok(())
}

#[test]
fn map_addflag_appends_instead_of_clearing() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    mr.map(10, false, |t, kv| kv.add(&[t as u8], b"first"))?;
    let n = mr.map(5, true, |t, kv| kv.add(&[100 + t as u8], b"second"))?;
    assert_eq!(n, 15);

    let n = mr.map(3, false, |t, kv| kv.add(&[t as u8], b"third"))?;
    assert_eq!(n, 3);
    Ok(())
}

#[test]
fn map_over_own_kv_replaces_or_appends() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    mr.map(10, false, |t, kv| kv.add(&[t as u8], &[t as u8]))?;

    // замещение: значение инкрементируется, индекс записи идёт подряд
    let mut last_index = 0u64;
    let n = mr.map_kv(false, |i, k, v, out| {
        last_index = i;
        out.add(k, &[v[0] + 1])
    })?;
    assert_eq!(n, 10);
    assert_eq!(last_index, 9);
    let result = collect_kv_multiset(&mut mr)?;
    for t in 0u8..10 {
        assert_eq!(result[&(vec![t], vec![t + 1])], 1);
    }

    // дополнение: к копии самих себя дописывается ещё по паре
    let n = mr.map_kv(true, |_i, k, v, out| out.add(k, v))?;
    assert_eq!(n, 20);
    let result = collect_kv_multiset(&mut mr)?;
    for t in 0u8..10 {
        assert_eq!(result[&(vec![t], vec![t + 1])], 2);
    }
    Ok(())
}

#[test]
fn map_over_kv_index_restarts_on_every_page() -> Result<()> {
    let root = tempfile::tempdir()?;
    let cfg = MrConfig::default()
        .with_memsize_bytes(16 * 1024)
        .with_scratch_dir(root.path());
    let mut mr = MapReduce::serial_with_config(cfg)?;

    mr.map(1000, false, |t, kv| kv.add(&t.to_le_bytes(), &[]))?;
    let nonempty = {
        let kv = mr.kv().unwrap();
        assert!(kv.npage() > 1, "need a multi-page KV, got {}", kv.npage());
        let mut nonempty = 0usize;
        for ipage in 0..kv.npage() {
            if kv.request_page(ipage)?.nkey > 0 {
                nonempty += 1;
            }
        }
        nonempty
    };

    // индекс считается внутри страницы: на каждой странице начинается с нуля
    let mut zero_indices = 0usize;
    let mut prev: Option<u64> = None;
    let n = mr.map_kv(false, |i, k, _v, out| {
        if i == 0 {
            zero_indices += 1;
        } else {
            assert_eq!(prev, Some(i - 1), "index must advance within a page");
        }
        prev = Some(i);
        out.add(k, &[])
    })?;
    assert_eq!(n, 1000);
    assert_eq!(zero_indices, nonempty);
    Ok(())
}

#[test]
fn map_kv_from_another_engine() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut src = serial(&root)?;
    let mut dst = serial(&root)?;

    src.map(6, false, |t, kv| kv.add(&[t as u8], &[100 + t as u8]))?;
    let n = dst.map_kv_from(&mut src, false, |_i, k, v, out| out.add(v, k))?;
    assert_eq!(n, 6);

    // источник не тронут, приёмник держит перевёрнутые пары
    assert!(src.has_kv());
    let swapped = collect_kv_multiset(&mut dst)?;
    for t in 0u8..6 {
        assert_eq!(swapped[&(vec![100 + t], vec![t])], 1);
    }
    Ok(())
}

#[test]
fn engine_copy_duplicates_container() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    mr.map(500, false, |t, kv| kv.add(&t.to_le_bytes(), &t.to_le_bytes()))?;
    let original = collect_kv_multiset(&mut mr)?;

    let mut dup = mr.copy()?;
    let copied = collect_kv_multiset(&mut dup)?;
    assert_eq!(original, copied);

    // копия независима: её convert не трогает оригинал
    dup.convert()?;
    assert!(mr.has_kv());
    assert_eq!(collect_kv_multiset(&mut mr)?, original);
    Ok(())
}

#[test]
fn word_frequency_single_process() -> Result<()> {
    let root = tempfile::tempdir()?;
    let mut mr = serial(&root)?;

    let texts = ["the cat", "the dog", "cat dog"];
    mr.map(3, false, |t, kv| {
        for word in texts[t as usize].split_whitespace() {
            kv.add(word.as_bytes(), &[])?;
        }
        Ok(())
    })?;
    mr.collate(None)?;
    let n = mr.reduce(|key, mv, out| {
        let count = mv.nvalues();
        out.add(key, &count.to_le_bytes())
    })?;
    assert_eq!(n, 3);

    let result = collect_kv_multiset(&mut mr)?;
    for word in ["the", "cat", "dog"] {
        let k = (word.as_bytes().to_vec(), 2i64.to_le_bytes().to_vec());
        assert_eq!(result.get(&k), Some(&1usize), "wrong count for {}", word);
    }
    Ok(())
}

// ---------- helpers ----------

fn serial(root: &tempfile::TempDir) -> Result<MapReduce> {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = MrConfig::default()
        .with_memsize_bytes(64 * 1024)
        .with_scratch_dir(root.path());
    MapReduce::serial_with_config(cfg)
}

fn identity_emit(
    key: &[u8],
    mv: MultiValue<'_>,
    out: &mut GristMR::KeyValue,
) -> Result<()> {
    match mv {
        MultiValue::Inline { sizes, bytes } => {
            let mut off = 0usize;
            for s in sizes {
                out.add(key, &bytes[off..off + *s as usize])?;
                off += *s as usize;
            }
            Ok(())
        }
        MultiValue::Blocks(mut cursor) => {
            for i in 0..cursor.nblocks() {
                let (sizes, bytes) = cursor.block(i)?;
                let mut off = 0usize;
                let mut emit: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
                for s in sizes {
                    emit.push((key.to_vec(), bytes[off..off + *s as usize].to_vec()));
                    off += *s as usize;
                }
                for (k, v) in emit {
                    out.add(&k, &v)?;
                }
            }
            Ok(())
        }
    }
}

/// Мультимножество пар локального KV.
fn collect_kv_multiset(mr: &mut MapReduce) -> Result<HashMap<(Vec<u8>, Vec<u8>), usize>> {
    let kv = mr.kv().expect("engine must hold a KeyValue");
    let mut out: HashMap<(Vec<u8>, Vec<u8>), usize> = HashMap::new();
    for ipage in 0..kv.npage() {
        let desc = kv.request_page(ipage)?;
        for rec in kv.iter_page(&desc) {
            *out.entry((rec.key.to_vec(), rec.value.to_vec())).or_default() += 1;
        }
    }
    Ok(out)
}

/// Записи локального KMV: (ключ, значения по порядку).
fn collect_kmv(mr: &mut MapReduce) -> Result<Vec<(Vec<u8>, Vec<Vec<u8>>)>> {
    use GristMR::kmv::record::{read_kmv, read_sizes_into};

    let kmv = mr.kmv().expect("engine must hold a KeyMultiValue");
    let a = kmv.align();
    let mut out = Vec::new();
    let mut sizes: Vec<u32> = Vec::new();
    for ipage in 0..kmv.npage() {
        let desc = kmv.request_page(ipage)?;
        let page = kmv.page_bytes(desc.alignsize);
        let mut off = 0usize;
        for _ in 0..desc.nkey {
            let rec = read_kmv(page, off, desc.alignsize, a).expect("well-formed KMV page");
            off = rec.end;
            assert!(rec.nvalues >= 0, "collect_kmv does not walk chains");
            read_sizes_into(rec.sizes_bytes, &mut sizes);
            let mut values = Vec::with_capacity(sizes.len());
            let mut voff = 0usize;
            for s in &sizes {
                values.push(rec.values[voff..voff + *s as usize].to_vec());
                voff += *s as usize;
            }
            out.push((rec.key.to_vec(), values));
        }
    }
    Ok(out)
}
