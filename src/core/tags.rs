//! Tag and reference numbering
//!
//! Tags name the semantic type of an element, refs tell elements of one tag
//! apart. Tags below `0x4000` may carry the special bit, which marks the DD as
//! pointing at a special-element control block rather than raw bytes.

pub type Tag = u16;
pub type Ref = u16;

/// Matches any tag in lookups
pub const TAG_WILDCARD: Tag = 0;
/// Matches any ref in lookups; never assigned to an element
pub const REF_WILDCARD: Ref = 0;

/// Empty DD slot
pub const TAG_NULL: Tag = 1;
/// Link tables and data blocks of linked-block elements
pub const TAG_LINKED: Tag = 20;
/// Compressed payload of a compressed element
pub const TAG_COMPRESSED: Tag = 40;
/// Chunk payloads of chunked elements
pub const TAG_CHUNK: Tag = 62;
/// Chunk tables of chunked elements
pub const TAG_CHUNK_TABLE: Tag = 63;
/// Valid-bit count of the final byte of an appendable bit-written element
pub const TAG_BIT_TAIL: Tag = 64;

/// 8-bit image palette
pub const TAG_IP8: Tag = 201;
/// 8-bit raster image
pub const TAG_RI8: Tag = 202;
/// Color lookup table
pub const TAG_LUT: Tag = 301;
/// Scientific data group
pub const TAG_NDG: Tag = 720;

const SPECIAL_BIT: Tag = 0x4000;
const PRIVATE_BIT: Tag = 0x8000;

/// Whether `tag` carries the special bit
pub fn is_special_tag(tag: Tag) -> bool {
    tag & PRIVATE_BIT == 0 && tag & SPECIAL_BIT != 0
}

/// Strip the special bit, if any
pub fn base_tag(tag: Tag) -> Tag {
    if is_special_tag(tag) {
        tag & !SPECIAL_BIT
    } else {
        tag
    }
}

/// Special form of `tag`, or `None` for tags that cannot be special
pub fn special_tag(tag: Tag) -> Option<Tag> {
    if tag & (SPECIAL_BIT | PRIVATE_BIT) == 0 {
        Some(tag | SPECIAL_BIT)
    } else {
        None
    }
}

/// Tags the core itself writes; user elements should not use them
pub fn is_reserved_tag(tag: Tag) -> bool {
    matches!(
        base_tag(tag),
        TAG_NULL | TAG_LINKED | TAG_COMPRESSED | TAG_CHUNK | TAG_CHUNK_TABLE | TAG_BIT_TAIL
    )
}

/// Human-readable name of a well-known tag
pub fn tag_name(tag: Tag) -> Option<&'static str> {
    let name = match base_tag(tag) {
        TAG_NULL => "No Data",
        TAG_LINKED => "Linked Blocks Indicator",
        TAG_COMPRESSED => "Compressed Data",
        TAG_CHUNK => "Data Chunk",
        TAG_CHUNK_TABLE => "Chunk Table",
        TAG_BIT_TAIL => "Bit Tail",
        TAG_IP8 => "Image Palette-8",
        TAG_RI8 => "Raster Image-8",
        TAG_LUT => "Lookup Table",
        TAG_NDG => "Numeric Data Group",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_special_bit_round_trip() {
        let special = special_tag(TAG_IP8).unwrap();
        assert!(is_special_tag(special));
        assert!(!is_special_tag(TAG_IP8));
        assert_eq!(base_tag(special), TAG_IP8);
    }

    #[test]
    fn test_private_tags_cannot_be_special() {
        assert_eq!(special_tag(0x8001), None);
        assert!(!is_special_tag(0xC001));
        assert_eq!(base_tag(0xC001), 0xC001);
    }

    #[test]
    fn test_tag_names() {
        assert_eq!(tag_name(TAG_LUT), Some("Lookup Table"));
        assert_eq!(tag_name(special_tag(TAG_RI8).unwrap()), Some("Raster Image-8"));
        assert_eq!(tag_name(5000), None);
        assert!(is_reserved_tag(TAG_CHUNK));
        assert!(!is_reserved_tag(TAG_IP8));
    }
}
