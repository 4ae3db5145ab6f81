//! Permutations and indexed views applied over real shard datasets.

use shardset::{
    indexing, Dataset, DatasetReader, DatasetWriter, DatasetWriterOptions, IndexedView, Record,
    ReorderOptions, Value,
};

fn ids(view: &impl Dataset<Item = shardset::LazyRecord>) -> Vec<i64> {
    view.iter()
        .map(|rec| {
            let mut rec = rec.unwrap();
            match rec.get("id").unwrap() {
                Some(Value::Int(id)) => *id,
                other => panic!("unexpected id field: {other:?}"),
            }
        })
        .collect()
}

fn write_dataset(path: &std::path::Path, n: i64) -> DatasetReader {
    let options = DatasetWriterOptions {
        shard_size: Some(1024),
        ..DatasetWriterOptions::default()
    };
    let mut writer = DatasetWriter::create_with(path, options).unwrap();
    for id in 0..n {
        let mut rec = Record::new();
        rec.insert("id".into(), Value::Int(id));
        rec.insert("rank".into(), Value::Int((n - id) % 7));
        rec.insert("payload".into(), Value::from("x".repeat(40)));
        writer.write(&rec).unwrap();
    }
    writer.close().unwrap();
    DatasetReader::open(path).unwrap()
}

#[test]
fn shuffle_and_unshuffle_a_sharded_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let reader = write_dataset(&dir.path().join("data.sds"), 500);
    assert!(reader.shards().len() >= 3);

    let perm = indexing::shuffle(reader.len(), 42);
    let shuffled = IndexedView::new(&reader, perm.clone());
    assert_eq!(shuffled.len(), 500);
    assert_ne!(ids(&shuffled), (0..500).collect::<Vec<_>>());

    let unshuffled = IndexedView::new(&shuffled, indexing::reverse(&perm).unwrap());
    assert_eq!(ids(&unshuffled), (0..500).collect::<Vec<_>>());
}

#[test]
fn sort_by_record_key_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let reader = write_dataset(&dir.path().join("data.sds"), 100);

    let order = indexing::sort_by_key(&reader, |rec| match rec.get("rank").unwrap() {
        Some(Value::Int(rank)) => *rank,
        _ => panic!("missing rank"),
    })
    .unwrap();
    let sorted = IndexedView::new(&reader, order);

    let mut previous = (i64::MIN, i64::MIN);
    for rec in sorted.iter() {
        let mut rec = rec.unwrap();
        let rank = match rec.get("rank").unwrap() {
            Some(Value::Int(rank)) => *rank,
            _ => unreachable!(),
        };
        let id = match rec.get("id").unwrap() {
            Some(Value::Int(id)) => *id,
            _ => unreachable!(),
        };
        // non-decreasing rank; ties keep original (id) order
        assert!(rank > previous.0 || (rank == previous.0 && id > previous.1));
        previous = (rank, id);
    }
}

#[test]
fn trimmed_view_subsamples_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let reader = write_dataset(&dir.path().join("data.sds"), 60);

    let indices =
        indexing::trim(indexing::identity(reader.len()), Some(3), Some(2), Some(10)).unwrap();
    let view = IndexedView::new(&reader, indices);
    assert_eq!(ids(&view), vec![6, 9, 12, 15, 18, 21, 24, 27, 30, 33]);
}

#[test]
fn permutation_files_drive_views_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let reader = write_dataset(&dir.path().join("data.sds"), 64);
    let index_path = dir.path().join("order.idx");

    let perm = indexing::shuffle(reader.len(), 7);
    indexing::save_index(&index_path, &perm).unwrap();

    let options = ReorderOptions {
        shuffle: None,
        index_file: Some(index_path),
    };
    let loaded = options.resolve(&reader).unwrap();
    assert_eq!(loaded, perm);

    let from_file = IndexedView::new(&reader, loaded);
    let direct = IndexedView::new(&reader, perm);
    assert_eq!(ids(&from_file), ids(&direct));
}

#[test]
fn out_of_range_permutation_entries_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let reader = write_dataset(&dir.path().join("data.sds"), 5);

    let view = IndexedView::new(&reader, vec![u64::MAX, 0, 4, 5, 2]);
    assert_eq!(view.len(), 3);
    assert_eq!(ids(&view), vec![0, 4, 2]);
}
