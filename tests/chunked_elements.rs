//! Chunked element tests: range/chunk transparency, fill values and the
//! per-element LRU chunk cache

use std::io::SeekFrom;
use tagfile_rs::{
    ChunkSpec, CompressionConfig, Container, ContainerBuilder, HdfError, OpenMode, SpecialInfo,
    TAG_NDG,
};
use tempfile::TempDir;

fn value_at(row: u32, col: u32) -> [u8; 2] {
    ((row * 100 + col) as u16).to_be_bytes()
}

/// 5 x 7 array of u16 in 2 x 3 chunks, edge chunks partly out of bounds
fn grid_spec() -> ChunkSpec {
    ChunkSpec::new(vec![5, 7], vec![2, 3], 2).with_fill(vec![0xAB, 0xCD])
}

fn grid_bytes() -> Vec<u8> {
    let mut out = Vec::new();
    for row in 0..5 {
        for col in 0..7 {
            out.extend_from_slice(&value_at(row, col));
        }
    }
    out
}

fn create(dir: &TempDir, name: &str) -> Container {
    Container::open(dir.path().join(name), OpenMode::Create).unwrap()
}

#[test]
fn test_range_writes_match_chunk_view() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.hdf");
    let mut file = create(&dir, "grid.hdf");
    let aid = file.create_chunked(TAG_NDG, 1, grid_spec()).unwrap();
    file.write(aid, &grid_bytes()).unwrap();
    file.end_access(aid).unwrap();
    file.close().unwrap();

    let mut file = Container::open(&path, OpenMode::Read).unwrap();
    assert_eq!(file.get_element(TAG_NDG, 1).unwrap(), grid_bytes());

    let aid = file.start_read(TAG_NDG, 1).unwrap();
    file.seek(aid, SeekFrom::Start(2 * (7 * 3 + 2))).unwrap();
    let mut pair = [0u8; 4];
    assert_eq!(file.read(aid, &mut pair).unwrap(), 4);
    assert_eq!(&pair[..2], &value_at(3, 2));
    assert_eq!(&pair[2..], &value_at(3, 3));

    // Chunk (1, 1) holds rows 2..4, columns 3..6
    let mut chunk = vec![0u8; 2 * 3 * 2];
    file.read_chunk(aid, &[1, 1], &mut chunk).unwrap();
    for r in 0..2 {
        for c in 0..3 {
            let at = (r * 3 + c) * 2;
            assert_eq!(&chunk[at..at + 2], &value_at(2 + r as u32, 3 + c as u32));
        }
    }

    // Edge chunk (2, 2) has a single in-bounds value; the rest is fill
    file.read_chunk(aid, &[2, 2], &mut chunk).unwrap();
    assert_eq!(&chunk[..2], &value_at(4, 6));
    for at in (2..chunk.len()).step_by(2) {
        assert_eq!(&chunk[at..at + 2], &[0xAB, 0xCD]);
    }
}

#[test]
fn test_chunk_writes_match_range_view() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = create(&dir, "chunks.hdf");
    let aid = file.create_chunked(TAG_NDG, 2, ChunkSpec::new(vec![4, 4], vec![2, 2], 1)).unwrap();
    file.write_chunk(aid, &[0, 1], &[1, 2, 3, 4]).unwrap();
    file.write_chunk(aid, &[1, 0], &[5, 6, 7, 8]).unwrap();
    file.end_access(aid).unwrap();

    assert_eq!(
        file.get_element(TAG_NDG, 2).unwrap(),
        vec![
            0, 0, 1, 2, //
            0, 0, 3, 4, //
            5, 6, 0, 0, //
            7, 8, 0, 0,
        ]
    );
}

#[test]
fn test_unwritten_chunks_read_as_fill() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = create(&dir, "fill.hdf");
    let aid = file.create_chunked(TAG_NDG, 3, grid_spec()).unwrap();
    file.end_access(aid).unwrap();

    let data = file.get_element(TAG_NDG, 3).unwrap();
    assert_eq!(data.len(), 5 * 7 * 2);
    assert!(data.chunks(2).all(|v| v == [0xAB, 0xCD]));

    let aid = file.start_read(TAG_NDG, 3).unwrap();
    match file.special_info(aid).unwrap() {
        SpecialInfo::Chunked { chunks_written, .. } => assert_eq!(chunks_written, 0),
        other => panic!("unexpected info {:?}", other),
    }
}

#[test]
fn test_partial_write_preserves_neighbours() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = create(&dir, "partial.hdf");
    let aid = file.create_chunked(TAG_NDG, 4, grid_spec()).unwrap();
    file.write(aid, &grid_bytes()).unwrap();
    file.end_access(aid).unwrap();

    let aid = file.start_write(TAG_NDG, 4).unwrap();
    file.seek(aid, SeekFrom::Start(2 * (7 + 1))).unwrap();
    file.write(aid, &[0xFF; 6]).unwrap();
    assert!(matches!(
        file.write(aid, &[0u8; 200]),
        Err(HdfError::BadArgs(_))
    ));
    file.end_access(aid).unwrap();

    let mut expected = grid_bytes();
    expected[16..22].copy_from_slice(&[0xFF; 6]);
    assert_eq!(file.get_element(TAG_NDG, 4).unwrap(), expected);
}

#[test]
fn test_lru_eviction_writes_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lru.hdf");
    let mut file = create(&dir, "lru.hdf");
    let spec = ChunkSpec::new(vec![6, 6], vec![2, 2], 1);
    let aid = file.create_chunked(TAG_NDG, 5, spec).unwrap();
    assert_eq!(file.set_chunk_cache(aid, 2).unwrap(), 2);

    file.write_chunk(aid, &[0, 0], &[1; 4]).unwrap();
    file.write_chunk(aid, &[0, 1], &[2; 4]).unwrap();
    assert!(file.is_chunk_cached(aid, &[0, 0]).unwrap());

    // Touch (0, 0) so (0, 1) becomes least recently used
    let mut buf = [0u8; 4];
    file.read_chunk(aid, &[0, 0], &mut buf).unwrap();
    file.write_chunk(aid, &[2, 2], &[3; 4]).unwrap();

    assert!(file.is_chunk_cached(aid, &[0, 0]).unwrap());
    assert!(!file.is_chunk_cached(aid, &[0, 1]).unwrap());
    let stats = file.chunk_cache_stats(aid).unwrap();
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.writebacks, 1);
    assert_eq!(stats.resident, 2);

    // Evicted chunk comes back from the file
    file.read_chunk(aid, &[0, 1], &mut buf).unwrap();
    assert_eq!(buf, [2; 4]);
    file.close().unwrap();

    let mut file = Container::open(&path, OpenMode::Read).unwrap();
    let aid = file.start_read(TAG_NDG, 5).unwrap();
    for (coords, value) in [([0u32, 0u32], 1u8), ([0, 1], 2), ([2, 2], 3), ([1, 1], 0)] {
        file.read_chunk(aid, &coords, &mut buf).unwrap();
        assert_eq!(buf, [value; 4], "chunk {:?}", coords);
    }
}

#[test]
fn test_cache_capacity_clamped_to_budget() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = ContainerBuilder::new()
        .path(dir.path().join("budget.hdf"))
        .create()
        .chunk_cache_budget(3 * 64 * 64)
        .build()
        .unwrap();
    let spec = ChunkSpec::new(vec![256, 256], vec![64, 64], 1);
    let aid = file.create_chunked(TAG_NDG, 6, spec).unwrap();
    assert_eq!(file.set_chunk_cache(aid, 100).unwrap(), 3);
    assert!(matches!(file.set_chunk_cache(aid, 0), Err(HdfError::BadArgs(_))));
    file.end_access(aid).unwrap();
}

#[test]
fn test_compressed_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zchunks.hdf");
    let mut file = create(&dir, "zchunks.hdf");
    let spec = grid_spec().with_compression(CompressionConfig::zstd(3));
    let aid = file.create_chunked(TAG_NDG, 7, spec).unwrap();
    file.write(aid, &grid_bytes()).unwrap();
    file.end_access(aid).unwrap();
    file.close().unwrap();

    let mut file = Container::open(&path, OpenMode::Read).unwrap();
    assert_eq!(file.get_element(TAG_NDG, 7).unwrap(), grid_bytes());
}

#[test]
fn test_chunking_needs_empty_element() {
    let dir = tempfile::tempdir().unwrap();
    let mut file = create(&dir, "occupied.hdf");
    file.put_element(TAG_NDG, 8, b"occupied").unwrap();
    assert!(matches!(
        file.create_chunked(TAG_NDG, 8, grid_spec()),
        Err(HdfError::BadArgs(_))
    ));
    assert!(matches!(
        file.create_chunked(TAG_NDG, 9, ChunkSpec::new(vec![4], vec![8], 1)),
        Err(HdfError::BadArgs(_))
    ));
    assert!(!file.exists(TAG_NDG, 9));
}

#[test]
fn test_reader_and_writer_share_one_cache() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.hdf");
    let mut file = create(&dir, "shared.hdf");
    let writer = file
        .create_chunked(TAG_NDG, 1, ChunkSpec::new(vec![4, 4], vec![2, 2], 1))
        .unwrap();
    file.write_chunk(writer, &[0, 0], &[5; 4]).unwrap();

    // Nothing has been written back yet; the reader sees the cached chunk
    let reader = file.start_read(TAG_NDG, 1).unwrap();
    let mut chunk = [0u8; 4];
    file.read_chunk(reader, &[0, 0], &mut chunk).unwrap();
    assert_eq!(chunk, [5; 4]);

    let mut row = [0u8; 4];
    assert_eq!(file.read(reader, &mut row).unwrap(), 4);
    assert_eq!(row, [5, 5, 0, 0]);
    assert!(file.is_chunk_cached(reader, &[0, 0]).unwrap());
    assert_eq!(
        file.chunk_cache_stats(reader).unwrap(),
        file.chunk_cache_stats(writer).unwrap()
    );

    // Writes made after the reader opened are visible through it
    file.write_chunk(writer, &[1, 1], &[9; 4]).unwrap();
    file.read_chunk(reader, &[1, 1], &mut chunk).unwrap();
    assert_eq!(chunk, [9; 4]);
    let whole = file.get_element(TAG_NDG, 1).unwrap();
    assert_eq!(&whole[10..12], &[9, 9]);

    file.end_access(reader).unwrap();
    file.write_chunk(writer, &[0, 1], &[0; 4]).unwrap();
    file.end_access(writer).unwrap();
    file.close().unwrap();

    let mut file = Container::open(&path, OpenMode::Read).unwrap();
    let data = file.get_element(TAG_NDG, 1).unwrap();
    assert_eq!(data, vec![5, 5, 0, 0, 5, 5, 0, 0, 0, 0, 9, 9, 0, 0, 9, 9]);
}
