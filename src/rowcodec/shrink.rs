//! Working-copy-to-packed transform.

use byteorder::{ByteOrder, LittleEndian};

use super::dynpart::DynWriter;
use super::expand::{CopyRow, DYN_PRESENT};
use super::{null_bit, HEADER_WORDS};
use crate::schema::TableDescriptor;
use crate::TupError;

/// Packed part sizes produced by [`shrink`], in words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PartSizes {
    /// Main-memory varpart, including its length word. Zero when the
    /// table has no variable part.
    pub mm: u32,
    /// Disk part (fixed part plus disk varpart). Zero when the table has
    /// no disk columns or the copy was expanded without them.
    pub dd: u32,
}

fn expanded_var_value<'a>(
    table: &TableDescriptor,
    buf: &'a [u8],
    attr_id: u32,
) -> Option<&'a [u8]> {
    let layout = table.layout(attr_id);
    if let Some(bit) = layout.null_bit {
        if null_bit(buf, HEADER_WORDS * 4, bit) {
            return None;
        }
    }
    let reg = layout.expanded_off as usize * 4;
    let len = LittleEndian::read_u32(&buf[reg..reg + 4]) as usize;
    Some(&buf[reg + 4..reg + 4 + len])
}

fn expanded_dyn_value<'a>(table: &TableDescriptor, buf: &'a [u8], ordinal: u16) -> Option<&'a [u8]> {
    let id = table.dyn_order[ordinal as usize];
    let reg = table.layout(id).expanded_off as usize * 4;
    let state = LittleEndian::read_u32(&buf[reg..reg + 4]);
    if state & DYN_PRESENT == 0 {
        return None;
    }
    let len = (state & !DYN_PRESENT) as usize;
    Some(&buf[reg + 4..reg + 4 + len])
}

fn expanded_disk_var_value<'a>(
    table: &TableDescriptor,
    buf: &'a [u8],
    mm_words: u32,
    attr_id: u32,
) -> Option<&'a [u8]> {
    let layout = table.layout(attr_id);
    let dd_base = mm_words as usize * 4;
    if let Some(bit) = layout.null_bit {
        if null_bit(buf, dd_base + 4, bit) {
            return None;
        }
    }
    let reg = dd_base + layout.expanded_off as usize * 4;
    let len = LittleEndian::read_u32(&buf[reg..reg + 4]) as usize;
    Some(&buf[reg + 4..reg + 4 + len])
}

/// Pack a var-offset block: `[len][u16 offsets][bytes][pad]`. Values come
/// from `get`, indexed 0..n; a None packs as a zero-length entry (its
/// null bit already says it is null). The length word covers the block's
/// own content; the caller widens it when a dynamic block follows.
fn pack_var_block<'v>(n: usize, out: &mut Vec<u8>, get: impl Fn(usize) -> Option<&'v [u8]>) {
    let start = out.len();
    out.extend_from_slice(&[0u8; 4]);
    let off_entries = n + 1;
    let off_array = out.len();
    out.resize(out.len() + off_entries * 2, 0);
    if off_entries % 2 == 1 {
        out.extend_from_slice(&[0, 0]);
    }
    let var_base = out.len();
    let mut running = 0u16;
    for i in 0..n {
        LittleEndian::write_u16(&mut out[off_array + i * 2..][..2], running);
        if let Some(v) = get(i) {
            out.extend_from_slice(v);
            running += v.len() as u16;
        }
    }
    LittleEndian::write_u16(&mut out[off_array + n * 2..][..2], running);
    while (out.len() - var_base) % 4 != 0 {
        out.push(0);
    }
    let words = ((out.len() - start) / 4 - 1) as u32;
    LittleEndian::write_u32(&mut out[start..start + 4], words);
}

/// Shrink an expanded copy back to the packed form, in place: after the
/// call the copy's buffer holds `[fixed part][packed varpart][packed disk
/// part]`. Trailing zero words of the dynamic bitmap are trimmed and the
/// varpart length word is written. Returns the packed part sizes.
pub fn shrink(table: &TableDescriptor, copy: &mut CopyRow) -> Result<PartSizes, TupError> {
    let fix_bytes = table.fix_row_words as usize * 4;
    let mut sizes = PartSizes::default();

    let mut tail: Vec<u8> = Vec::new();
    if table.has_varpart() {
        pack_var_block(table.var_order.len(), &mut tail, |i| {
            expanded_var_value(table, &copy.buf, table.var_order[i])
        });
        if table.has_dynpart() {
            DynWriter::pack(table, &mut tail, |ord| {
                expanded_dyn_value(table, &copy.buf, ord)
            });
        }
        let words = (tail.len() / 4) as u32;
        // content words, excluding the length word itself
        LittleEndian::write_u32(&mut tail[..4], words - 1);
        sizes.mm = words;
    }

    if copy.dd_words != 0 {
        let dd_start = tail.len();
        let dd_base = copy.mm_words as usize * 4;
        // disk fixed part straight from the expanded image
        let fix_part = table.disk_fix_words as usize * 4;
        tail.extend_from_slice(&copy.buf[dd_base..dd_base + fix_part]);
        if table.disk_var() {
            pack_var_block(table.disk_var_order.len(), &mut tail, |i| {
                expanded_disk_var_value(table, &copy.buf, copy.mm_words, table.disk_var_order[i])
            });
        }
        let dd_words = ((tail.len() - dd_start) / 4) as u32;
        // first disk word records the part length and the tuple version
        let version = copy.header().tuple_version() as u32;
        LittleEndian::write_u32(
            &mut tail[dd_start..dd_start + 4],
            (version << 16) | dd_words,
        );
        sizes.dd = dd_words;
    }

    let needed = fix_bytes + tail.len();
    if copy.buf.len() < needed {
        copy.buf.resize(needed, 0);
    }
    copy.buf[fix_bytes..fix_bytes + tail.len()].copy_from_slice(&tail);
    copy.packed = Some(sizes);

    Ok(sizes)
}

/// Slices of a shrunken copy's packed parts.
pub(crate) fn packed_parts<'a>(
    table: &TableDescriptor,
    copy: &'a CopyRow,
    sizes: PartSizes,
) -> (&'a [u8], Option<&'a [u8]>, Option<&'a [u8]>) {
    let fix_bytes = table.fix_row_words as usize * 4;
    let fixed = &copy.buf[..fix_bytes];
    let var = if sizes.mm > 0 {
        Some(&copy.buf[fix_bytes..fix_bytes + sizes.mm as usize * 4])
    } else {
        None
    };
    let disk = if sizes.dd > 0 {
        let start = fix_bytes + sizes.mm as usize * 4;
        Some(&copy.buf[start..start + sizes.dd as usize * 4])
    } else {
        None
    };
    (fixed, var, disk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowcodec::{expand, prepare_read, read_attr, update_attr};
    use crate::schema::{AttrDescr, AttrStorage, ColType};

    use proptest::prelude::*;

    fn table() -> TableDescriptor {
        TableDescriptor::build(
            5,
            vec![
                AttrDescr::new(0, "a", ColType::Uint32, AttrStorage::FixedMem).pk(),
                AttrDescr::new(1, "b", ColType::Varchar, AttrStorage::VarMem).max_bytes(16),
                AttrDescr::new(2, "c", ColType::Uint32, AttrStorage::FixedMem),
                AttrDescr::new(3, "d", ColType::Varbinary, AttrStorage::DynVar)
                    .max_bytes(12)
                    .nullable(),
            ],
        )
        .unwrap()
    }

    fn fresh_copy(t: &TableDescriptor, b: &[u8], c: u32, d: Option<&[u8]>) -> CopyRow {
        let mut copy = CopyRow::empty(t, false);
        let mm = copy.mm_words;
        update_attr(t, &mut copy.buf, mm, 0, 0, Some(&1u32.to_le_bytes())).unwrap();
        update_attr(t, &mut copy.buf, mm, 0, 1, Some(b)).unwrap();
        update_attr(t, &mut copy.buf, mm, 0, 2, Some(&c.to_le_bytes())).unwrap();
        update_attr(t, &mut copy.buf, mm, 0, 3, d).unwrap();
        copy
    }

    #[test]
    fn shrink_then_reexpand_preserves_values() {
        let t = table();
        let mut copy = fresh_copy(&t, b"hello", 42, Some(b"dd"));
        let sizes = shrink(&t, &mut copy).unwrap();
        assert!(sizes.mm > 0);
        assert_eq!(sizes.dd, 0);

        let (fixed, var, _) = packed_parts(&t, &copy, sizes);
        let img = prepare_read(&t, fixed, var, None).unwrap();
        assert_eq!(read_attr(&t, &img, 1).unwrap().unwrap(), b"hello");
        assert_eq!(
            read_attr(&t, &img, 2).unwrap().unwrap(),
            &42u32.to_le_bytes()
        );
        assert_eq!(read_attr(&t, &img, 3).unwrap().unwrap(), b"dd");

        let re = expand(&t, fixed, var, None, false).unwrap();
        let img2 = re.image();
        assert_eq!(read_attr(&t, &img2, 1).unwrap().unwrap(), b"hello");
        assert_eq!(read_attr(&t, &img2, 3).unwrap().unwrap(), b"dd");
    }

    #[test]
    fn varpart_len_word_matches() {
        let t = table();
        let mut copy = fresh_copy(&t, b"xy", 7, None);
        let sizes = shrink(&t, &mut copy).unwrap();
        let (_, var, _) = packed_parts(&t, &copy, sizes);
        let var = var.unwrap();
        assert_eq!(
            crate::rowcodec::varpart_len_words(var),
            sizes.mm - 1
        );
    }

    proptest! {
        /// expand(shrink(row)) preserves every attribute, for
        /// arbitrary var contents.
        #[test]
        fn packed_expanded_roundtrip(
            b in proptest::collection::vec(any::<u8>(), 0..16),
            c in any::<u32>(),
            d in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..12)),
        ) {
            let t = table();
            let mut copy = fresh_copy(&t, &b, c, d.as_deref());
            let sizes = shrink(&t, &mut copy).unwrap();
            let (fixed, var, _) = packed_parts(&t, &copy, sizes);
            let re = expand(&t, fixed, var, None, false).unwrap();
            let img = re.image();
            prop_assert_eq!(read_attr(&t, &img, 1).unwrap().unwrap(), &b[..]);
            prop_assert_eq!(read_attr(&t, &img, 2).unwrap().unwrap(), &c.to_le_bytes()[..]);
            match &d {
                None => prop_assert_eq!(read_attr(&t, &img, 3).unwrap(), None),
                Some(d) => prop_assert_eq!(read_attr(&t, &img, 3).unwrap().unwrap(), &d[..]),
            }

            // shrinking the re-expanded copy gives identical bytes
            let mut re = re;
            let sizes2 = shrink(&t, &mut re).unwrap();
            prop_assert_eq!(sizes, sizes2);
            let (f2, v2, _) = packed_parts(&t, &re, sizes2);
            let (f1, v1, _) = packed_parts(&t, &copy, sizes);
            prop_assert_eq!(v1, v2);
            // fixed parts match outside the header words the ops layer owns
            prop_assert_eq!(&f1[HEADER_WORDS * 4..], &f2[HEADER_WORDS * 4..]);
        }
    }
}
