//! SharedContainer used from several threads at once

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tagfile_rs::{ChunkSpec, Container, OpenMode, SharedContainer, TAG_LUT, TAG_NDG};

#[test]
fn test_concurrent_writers_and_readers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.hdf");
    let shared = SharedContainer::new(Container::open(&path, OpenMode::Create).unwrap());

    shared.with(|c| {
        for r in 1..=20u16 {
            c.put_element(TAG_LUT, r, &[r as u8; 64]).unwrap();
        }
    });

    let reads = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8u16)
        .map(|thread_id| {
            let shared = shared.clone();
            let reads = reads.clone();
            std::thread::spawn(move || {
                if thread_id < 2 {
                    for i in 0..50u16 {
                        let reference = 1000 + thread_id * 100 + i;
                        shared
                            .with(|c| c.put_element(TAG_LUT, reference, &reference.to_be_bytes()))
                            .unwrap();
                    }
                } else {
                    for _ in 0..200 {
                        let r = rand::random::<u16>() % 20 + 1;
                        let data = shared.with(|c| c.get_element(TAG_LUT, r)).unwrap();
                        assert_eq!(data, vec![r as u8; 64]);
                        reads.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(reads.load(Ordering::Relaxed), 6 * 200);

    let file = match shared.try_close() {
        Ok(closed) => closed,
        Err(_) => panic!("threads still hold the container"),
    };
    file.unwrap();

    let file = Container::open(&path, OpenMode::Read).unwrap();
    assert_eq!(file.number_of(TAG_LUT), 120);
}

#[test]
fn test_chunk_handles_from_many_threads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunks.hdf");
    let shared = SharedContainer::new(Container::open(&path, OpenMode::Create).unwrap());
    let aid = shared
        .with(|c| c.create_chunked(TAG_NDG, 1, ChunkSpec::new(vec![8, 8], vec![2, 2], 1)))
        .unwrap();

    let handles: Vec<_> = (0..4u32)
        .map(|row| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for col in 0..4u32 {
                    let value = (row * 4 + col) as u8;
                    shared
                        .with(|c| c.write_chunk(aid, &[row, col], &[value; 4]))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut c = shared.lock();
    c.end_access(aid).unwrap();
    let data = c.get_element(TAG_NDG, 1).unwrap();
    for row in 0..8usize {
        for col in 0..8usize {
            assert_eq!(data[row * 8 + col] as usize, (row / 2) * 4 + col / 2);
        }
    }
}
