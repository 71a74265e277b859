//! Integration tests shared by every storage backend.
//!
//! Each test body runs against the in-memory, flat file and chunked
//! container storages through the `Storage` trait.

use alopex_chunkeval::codec::Codec;
use alopex_chunkeval::{
    ChunkError, ChunkRange, ChunkedOptions, ChunkedStorage, Compression, DType, FlatFileStorage,
    MemoryStorage, Storage, StorageKind, SyncMode,
};
use proptest::prelude::*;
use tempfile::TempDir;

/// Builds one storage of every kind inside `dir`.
fn all_storages(dir: &TempDir) -> Vec<Box<dyn Storage>> {
    let chunked = ChunkedOptions::new(Compression::new(Codec::Gorilla, 1).unwrap())
        .with_chunk_len(Some(64))
        .with_sync_mode(SyncMode::None);
    vec![
        Box::new(MemoryStorage::new()),
        Box::new(
            FlatFileStorage::new(dir.path().join("flat"))
                .unwrap()
                .with_sync_mode(SyncMode::None),
        ),
        Box::new(ChunkedStorage::new(dir.path().join("data.achk"), chunked)),
    ]
}

fn values(range: ChunkRange, seed: f64) -> Vec<f64> {
    range
        .as_range()
        .map(|i| seed + (i as f64 * 0.37).sin())
        .collect()
}

#[test]
fn test_roundtrip_every_backend() {
    let dir = TempDir::new().unwrap();
    for mut storage in all_storages(&dir) {
        let kind = storage.kind();
        let mut ds = storage.create("x", 1000, DType::Float64).unwrap();
        assert_eq!(ds.len(), 1000, "{kind}");

        let ranges = [
            ChunkRange::new(0, 1),
            ChunkRange::new(1, 130),
            ChunkRange::new(130, 999),
            ChunkRange::new(999, 1000),
        ];
        for range in ranges {
            ds.write_range(range, &values(range, 1.0)).unwrap();
        }
        for range in ranges {
            assert_eq!(ds.read_range(range).unwrap(), values(range, 1.0), "{kind}");
        }
        ds.close().unwrap();

        let mut ds = storage.open("x").unwrap();
        let full = ChunkRange::new(0, 1000);
        assert_eq!(ds.read_range(full).unwrap(), values(full, 1.0), "{kind}");
        ds.close().unwrap();
    }
}

#[test]
fn test_out_of_range_every_backend() {
    let dir = TempDir::new().unwrap();
    for mut storage in all_storages(&dir) {
        let kind = storage.kind();
        let mut ds = storage.create("x", 100, DType::Float64).unwrap();
        assert!(
            matches!(
                ds.write_range(ChunkRange::new(90, 101), &[0.0; 11]),
                Err(ChunkError::Range { .. })
            ),
            "{kind}"
        );
        assert!(
            matches!(
                ds.read_range(ChunkRange::new(5, 5)),
                Err(ChunkError::Range { .. })
            ),
            "{kind}"
        );
        assert!(
            matches!(
                ds.write_range(ChunkRange::new(0, 10), &[0.0; 9]),
                Err(ChunkError::LengthMismatch { .. })
            ),
            "{kind}"
        );
        ds.close().unwrap();
    }
}

#[test]
fn test_recreate_has_no_residual_data() {
    let dir = TempDir::new().unwrap();
    for mut storage in all_storages(&dir) {
        let kind = storage.kind();
        let full = ChunkRange::new(0, 200);

        let mut ds = storage.create("x", 200, DType::Float64).unwrap();
        ds.write_range(full, &values(full, 3.0)).unwrap();
        ds.close().unwrap();

        let mut ds = storage.create("x", 200, DType::Float64).unwrap();
        assert_eq!(ds.read_range(full).unwrap(), vec![0.0; 200], "{kind}");
        ds.close().unwrap();
    }
}

#[test]
fn test_open_missing_every_backend() {
    let dir = TempDir::new().unwrap();
    for mut storage in all_storages(&dir) {
        let kind = storage.kind();
        assert!(
            matches!(storage.open("nope"), Err(ChunkError::DatasetNotFound(_))),
            "{kind}"
        );
    }
}

#[test]
fn test_size_reporting() {
    let dir = TempDir::new().unwrap();
    for mut storage in all_storages(&dir) {
        let kind = storage.kind();
        let full = ChunkRange::new(0, 500);
        let mut x = storage.create("x", 500, DType::Float64).unwrap();
        x.write_range(full, &values(full, 0.0)).unwrap();
        x.close().unwrap();
        let r = storage.create("r", 500, DType::Float64).unwrap();
        r.close().unwrap();

        let size = storage.size_bytes().unwrap();
        match kind {
            StorageKind::Memory | StorageKind::FlatFile => assert_eq!(size, 8000, "{kind}"),
            StorageKind::Chunked => assert!(size > 0, "{kind}"),
        }
    }
}

#[test]
fn test_second_handle_on_locked_path_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("locked.achk");
    let options = ChunkedOptions::default().with_sync_mode(SyncMode::None);

    let mut first = ChunkedStorage::new(&path, options);
    let held = first.create("x", 10, DType::Float64).unwrap();

    let mut second = ChunkedStorage::new(&path, options);
    match second.create("x", 10, DType::Float64) {
        Err(ChunkError::Storage { path: failed, .. }) => assert_eq!(failed, path),
        other => panic!("expected storage error, got {:?}", other.map(|_| ())),
    }

    held.close().unwrap();
    second.create("x", 10, DType::Float64).unwrap().close().unwrap();
}

#[test]
fn test_chunked_reopen_from_new_storage() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("reopen.achk");
    let options = ChunkedOptions::new(Compression::none())
        .with_chunk_len(Some(100))
        .with_sync_mode(SyncMode::None);
    let full = ChunkRange::new(0, 1234);

    {
        let mut storage = ChunkedStorage::new(&path, options);
        let mut x = storage.create("x", 1234, DType::Float64).unwrap();
        x.write_range(full, &values(full, 2.0)).unwrap();
        x.close().unwrap();
    }

    let mut storage = ChunkedStorage::open_existing(&path, options);
    let mut x = storage.open("x").unwrap();
    assert_eq!(x.read_range(full).unwrap(), values(full, 2.0));
    x.close().unwrap();
}

#[cfg(feature = "zlib")]
#[test]
fn test_zlib_roundtrip_with_and_without_shuffle() {
    let dir = TempDir::new().unwrap();
    let full = ChunkRange::new(0, 3000);
    for shuffle in [true, false] {
        let options = ChunkedOptions::new(Compression::new(Codec::Zlib, 6).unwrap())
            .with_shuffle(shuffle)
            .with_sync_mode(SyncMode::None);
        let mut storage = ChunkedStorage::new(dir.path().join(format!("z{shuffle}.achk")), options);
        let mut x = storage.create("x", 3000, DType::Float64).unwrap();
        x.write_range(full, &values(full, 4.0)).unwrap();
        x.close().unwrap();

        let mut x = storage.open("x").unwrap();
        assert_eq!(x.read_range(full).unwrap(), values(full, 4.0));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Whatever was last written to a range reads back unchanged.
    #[test]
    fn test_roundtrip_law(
        len in 1usize..600,
        writes in prop::collection::vec((0usize..600, 1usize..200, -1e6f64..1e6), 1..8),
    ) {
        let dir = TempDir::new().unwrap();
        for mut storage in all_storages(&dir) {
            let mut expected = vec![0.0; len];
            let mut ds = storage.create("x", len, DType::Float64).unwrap();
            for &(start, width, seed) in &writes {
                let start = start % len;
                let end = (start + width).min(len);
                let range = ChunkRange::new(start, end);
                let vals = values(range, seed);
                ds.write_range(range, &vals).unwrap();
                expected[start..end].copy_from_slice(&vals);

                prop_assert_eq!(ds.read_range(range).unwrap(), vals);
            }
            prop_assert_eq!(ds.read_range(ChunkRange::new(0, len)).unwrap(), expected);
            ds.close().unwrap();
        }
    }
}
