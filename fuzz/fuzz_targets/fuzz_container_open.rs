#![no_main]
use libfuzzer_sys::fuzz_target;
use tagfile_rs::{Container, OpenMode, REF_WILDCARD, TAG_WILDCARD};

// Arbitrary bytes behind a valid magic must either fail to open or yield a
// directory whose elements can all be read without panicking.
fuzz_target!(|data: &[u8]| {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let path = dir.path().join("fuzz.hdf");
    let mut bytes = vec![0x0e, 0x03, 0x13, 0x01];
    bytes.extend_from_slice(data);
    if std::fs::write(&path, &bytes).is_err() {
        return;
    }

    let mut file = match Container::open(&path, OpenMode::Read) {
        Ok(file) => file,
        Err(_) => return,
    };
    let keys: Vec<_> = file
        .elements(TAG_WILDCARD, REF_WILDCARD)
        .map(|dd| (dd.tag, dd.reference))
        .take(64)
        .collect();
    for (tag, reference) in keys {
        if file.element_length(tag, reference).map_or(true, |len| len > 1 << 20) {
            continue;
        }
        let _ = file.get_element(tag, reference);
        if let Ok(aid) = file.start_bit_read(tag, reference) {
            let _ = file.bit_read(aid, 13);
            let _ = file.end_access(aid);
        }
    }
    let _ = file.close();
});
