//! Property-based tests for container invariants
//!
//! Uses proptest to check that element contents, directory bookkeeping and
//! chunked views hold up across many random scenarios.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use tagfile_rs::{ChunkSpec, Container, ContainerBuilder, OpenMode, TAG_LUT, TAG_NDG};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_last_put_wins(
        puts in prop::collection::vec((1u16..20, prop::collection::vec(any::<u8>(), 0..300)), 1..40)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("puts.hdf");
        let mut file = ContainerBuilder::new().path(&path).create().dd_block_size(4).build().unwrap();

        let mut model = BTreeMap::new();
        for (reference, data) in &puts {
            file.put_element(TAG_LUT, *reference, data).unwrap();
            model.insert(*reference, data.clone());
        }
        file.close().unwrap();

        let mut file = Container::open(&path, OpenMode::Read).unwrap();
        prop_assert_eq!(file.elements(TAG_LUT, 0).count(), model.len());
        for (reference, data) in &model {
            prop_assert_eq!(&file.get_element(TAG_LUT, *reference).unwrap(), data);
        }
    }

    #[test]
    fn prop_refs_stay_unique(deletes in prop::collection::vec(any::<bool>(), 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = Container::open(dir.path().join("refs.hdf"), OpenMode::Create).unwrap();

        let mut live = Vec::new();
        for delete in deletes {
            let reference = file.new_ref().unwrap();
            prop_assert!(!file.exists(TAG_LUT, reference));
            file.put_element(TAG_LUT, reference, &reference.to_le_bytes()).unwrap();
            if delete {
                file.delete(TAG_LUT, reference).unwrap();
            } else {
                live.push(reference);
            }
        }
        prop_assert_eq!(file.stats().elements, live.len());
        for reference in live {
            prop_assert_eq!(file.get_element(TAG_LUT, reference).unwrap(), reference.to_le_bytes().to_vec());
        }
    }

    #[test]
    fn prop_chunked_matches_flat_model(
        rows in 1u32..12,
        cols in 1u32..12,
        chunk_rows in 1u32..5,
        chunk_cols in 1u32..5,
        writes in prop::collection::vec((any::<u16>(), prop::collection::vec(any::<u8>(), 1..40)), 1..12),
        cache in 1usize..4,
    ) {
        let chunk_rows = chunk_rows.min(rows);
        let chunk_cols = chunk_cols.min(cols);
        let len = (rows * cols) as usize;

        let dir = tempfile::tempdir().unwrap();
        let mut file = Container::open(dir.path().join("model.hdf"), OpenMode::Create).unwrap();
        let spec = ChunkSpec::new(vec![rows, cols], vec![chunk_rows, chunk_cols], 1).with_fill(vec![7]);
        let aid = file.create_chunked(TAG_NDG, 1, spec).unwrap();
        file.set_chunk_cache(aid, cache).unwrap();

        let mut model = vec![7u8; len];
        for (start, data) in writes {
            let start = start as usize % len;
            let data = &data[..data.len().min(len - start)];
            file.seek(aid, SeekFrom::Start(start as u64)).unwrap();
            file.write(aid, data).unwrap();
            model[start..start + data.len()].copy_from_slice(data);
        }

        file.seek(aid, SeekFrom::Start(0)).unwrap();
        let mut live = vec![0u8; len];
        prop_assert_eq!(file.read(aid, &mut live).unwrap(), len);
        prop_assert_eq!(&live, &model);
        file.end_access(aid).unwrap();

        prop_assert_eq!(file.get_element(TAG_NDG, 1).unwrap(), model);
    }
}
