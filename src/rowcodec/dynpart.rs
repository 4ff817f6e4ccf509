//! The dynamic block: `[bitmap_len][bitmap words][u16 offsets][dyn var
//! data, growing forward][pad][dyn fixed data, growing in reverse from the
//! block end]`.
//!
//! Each set bitmap bit marks one dynamic attribute as present; an absent
//! attribute is its null form. The offset array has one u16 entry per
//! present dynamic-var attribute plus one, byte offsets relative to the
//! var data area; the last entry is the total var byte length. Present
//! dynamic-fixed attributes pack back to front from the block end, each
//! word-aligned at its schema size. Trailing all-zero bitmap words are
//! trimmed, so `bitmap_len` is the populated word count.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ErrorKind;
use crate::schema::{AttrSlot, AttrStorage, TableDescriptor};
use crate::{fault, TupError};

/// Whether bit `ordinal` is set in a bitmap that had trailing zero words
/// trimmed.
pub fn dyn_attr_present(bitmap: &[u8], ordinal: u16) -> bool {
    let word = ordinal as usize / 32;
    if word * 4 + 4 > bitmap.len() {
        return false;
    }
    let w = LittleEndian::read_u32(&bitmap[word * 4..word * 4 + 4]);
    w & (1 << (ordinal % 32)) != 0
}

/// Parsed view of a packed dynamic block.
pub struct DynReader<'a> {
    block: &'a [u8],
    bitmap_words: usize,
    /// Byte offset of the u16 offset array.
    off_array: usize,
    /// Byte offset of the var data area.
    var_base: usize,
    /// Present dynamic ordinals, in schema order.
    present: Vec<u16>,
    n_var_present: usize,
}

impl<'a> DynReader<'a> {
    pub fn new(block: &'a [u8], table: &TableDescriptor) -> Result<Self, TupError> {
        if block.len() < 4 {
            return Err(fault!(ErrorKind::AttrInfoInconsistency));
        }
        let bitmap_words = LittleEndian::read_u32(&block[..4]) as usize;
        let bitmap_end = 4 + bitmap_words * 4;
        if bitmap_end > block.len() {
            return Err(fault!(ErrorKind::AttrInfoInconsistency));
        }
        let bitmap = &block[4..bitmap_end];

        let mut present = Vec::new();
        let mut n_var_present = 0usize;
        for (ord, &id) in table.dyn_order.iter().enumerate() {
            if dyn_attr_present(bitmap, ord as u16) {
                present.push(ord as u16);
                if table.attrs[id as usize].storage == AttrStorage::DynVar {
                    n_var_present += 1;
                }
            }
        }
        let off_array = bitmap_end;
        let off_words = ((n_var_present + 1) * 2).div_ceil(4);
        let var_base = off_array + off_words * 4;
        if n_var_present > 0 && var_base + 2 > block.len() {
            return Err(fault!(ErrorKind::AttrInfoInconsistency));
        }
        Ok(Self {
            block,
            bitmap_words,
            off_array,
            var_base,
            present,
            n_var_present,
        })
    }

    pub fn bitmap_words(&self) -> usize {
        self.bitmap_words
    }

    pub fn is_present(&self, ordinal: u16) -> bool {
        self.present.contains(&ordinal)
    }

    fn var_offset(&self, nth: usize) -> usize {
        LittleEndian::read_u16(&self.block[self.off_array + nth * 2..][..2]) as usize
    }

    /// Bytes of one present dynamic attribute, or None when absent.
    pub fn read(&self, table: &TableDescriptor, attr_id: u32) -> Result<Option<&'a [u8]>, TupError> {
        let layout = table.layout(attr_id);
        match layout.slot {
            AttrSlot::DynVar { .. } => {
                let ordinal = table
                    .dyn_order
                    .iter()
                    .position(|&id| id == attr_id)
                    .ok_or_else(|| fault!(ErrorKind::UnknownAttr(attr_id)))?
                    as u16;
                if !self.is_present(ordinal) {
                    return Ok(None);
                }
                // nth present var attr before this one
                let nth = self
                    .present
                    .iter()
                    .filter(|&&o| o < ordinal)
                    .filter(|&&o| {
                        let id = table.dyn_order[o as usize];
                        table.attrs[id as usize].storage == AttrStorage::DynVar
                    })
                    .count();
                let start = self.var_base + self.var_offset(nth);
                let end = self.var_base + self.var_offset(nth + 1);
                if end > self.block.len() || start > end {
                    return Err(fault!(ErrorKind::AttrInfoInconsistency));
                }
                Ok(Some(&self.block[start..end]))
            }
            AttrSlot::DynFix { words, .. } => {
                let ordinal = table
                    .dyn_order
                    .iter()
                    .position(|&id| id == attr_id)
                    .ok_or_else(|| fault!(ErrorKind::UnknownAttr(attr_id)))?
                    as u16;
                if !self.is_present(ordinal) {
                    return Ok(None);
                }
                // Fixed data grows in reverse: the first present fixed
                // attribute sits at the very end of the block.
                let mut back_words = 0u32;
                for &o in &self.present {
                    let id = table.dyn_order[o as usize];
                    if table.attrs[id as usize].storage != AttrStorage::DynFixed {
                        continue;
                    }
                    back_words += table.attrs[id as usize].max_words();
                    if o == ordinal {
                        break;
                    }
                }
                let end = self.block.len() - (back_words - words) as usize * 4;
                let start = end - words as usize * 4;
                let byte_len = table.attrs[attr_id as usize].max_bytes as usize;
                Ok(Some(&self.block[start..start + byte_len]))
            }
            _ => Err(fault!(ErrorKind::UnknownAttr(attr_id))),
        }
    }
}

/// Packs the dynamic attributes of an expanded copy into a block appended
/// to `out`. Returns the block length in words.
pub struct DynWriter;

impl DynWriter {
    /// `get` yields each dynamic attribute's current value by ordinal:
    /// `None` when absent.
    pub fn pack<'v>(
        table: &TableDescriptor,
        out: &mut Vec<u8>,
        get: impl Fn(u16) -> Option<&'v [u8]>,
    ) -> u32 {
        let n_dyn = table.dyn_order.len();
        let mut values: Vec<Option<&[u8]>> = Vec::with_capacity(n_dyn);
        for ord in 0..n_dyn as u16 {
            values.push(get(ord));
        }

        // Bitmap with trailing zero words trimmed.
        let mut bitmap = vec![0u32; n_dyn.div_ceil(32)];
        for (ord, v) in values.iter().enumerate() {
            if v.is_some() {
                bitmap[ord / 32] |= 1 << (ord % 32);
            }
        }
        while bitmap.last() == Some(&0) {
            bitmap.pop();
        }

        let mut var_data: Vec<u8> = Vec::new();
        let mut offsets: Vec<u16> = vec![0];
        let mut fixed_rev: Vec<&[u8]> = Vec::new();
        let mut fixed_words = 0u32;
        for (ord, v) in values.iter().enumerate() {
            let Some(v) = v else { continue };
            let id = table.dyn_order[ord];
            match table.attrs[id as usize].storage {
                AttrStorage::DynVar => {
                    var_data.extend_from_slice(v);
                    offsets.push(var_data.len() as u16);
                }
                AttrStorage::DynFixed => {
                    fixed_rev.push(v);
                    fixed_words += table.attrs[id as usize].max_words();
                }
                _ => unreachable!("non-dynamic attr in dyn order"),
            }
        }

        let start = out.len();
        out.extend_from_slice(&(bitmap.len() as u32).to_le_bytes());
        for w in &bitmap {
            out.extend_from_slice(&w.to_le_bytes());
        }
        let n_var_present = offsets.len() - 1;
        if !bitmap.is_empty() {
            for off in &offsets {
                out.extend_from_slice(&off.to_le_bytes());
            }
            // pad the offset array to a word boundary
            if (n_var_present + 1) % 2 == 1 {
                out.extend_from_slice(&[0, 0]);
            }
            out.extend_from_slice(&var_data);
            while (out.len() - start) % 4 != 0 {
                out.push(0);
            }
            // fixed data in reverse: first present attr lands at the end
            let mut tail: Vec<u8> = vec![0; fixed_words as usize * 4];
            let mut end = tail.len();
            for v in &fixed_rev {
                let words = (v.len().div_ceil(4)) * 4;
                let start_at = end - words;
                tail[start_at..start_at + v.len()].copy_from_slice(v);
                end = start_at;
            }
            out.extend_from_slice(&tail);
        }
        ((out.len() - start) / 4) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttrDescr, ColType};

    fn dyn_table() -> TableDescriptor {
        TableDescriptor::build(
            9,
            vec![
                AttrDescr::new(0, "pk", ColType::Uint32, AttrStorage::FixedMem).pk(),
                AttrDescr::new(1, "d0", ColType::Uint64, AttrStorage::DynFixed).nullable(),
                AttrDescr::new(2, "d1", ColType::Varbinary, AttrStorage::DynVar)
                    .max_bytes(20)
                    .nullable(),
                AttrDescr::new(3, "d2", ColType::Uint32, AttrStorage::DynFixed).nullable(),
                AttrDescr::new(4, "d3", ColType::Varbinary, AttrStorage::DynVar)
                    .max_bytes(20)
                    .nullable(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn pack_then_read() {
        let t = dyn_table();
        let d0 = 77u64.to_le_bytes();
        let d3 = b"xyz";
        let mut block = Vec::new();
        let words = DynWriter::pack(&t, &mut block, |ord| match ord {
            0 => Some(&d0[..]),
            3 => Some(&d3[..]),
            _ => None,
        });
        assert_eq!(block.len(), words as usize * 4);

        let r = DynReader::new(&block, &t).unwrap();
        assert_eq!(r.read(&t, 1).unwrap().unwrap(), &d0[..]);
        assert_eq!(r.read(&t, 2).unwrap(), None);
        assert_eq!(r.read(&t, 3).unwrap(), None);
        assert_eq!(r.read(&t, 4).unwrap().unwrap(), b"xyz");
    }

    #[test]
    fn all_absent_is_one_word() {
        let t = dyn_table();
        let mut block = Vec::new();
        let words = DynWriter::pack(&t, &mut block, |_| None);
        assert_eq!(words, 1);
        let r = DynReader::new(&block, &t).unwrap();
        assert_eq!(r.bitmap_words(), 0);
        for id in 1..=4 {
            assert_eq!(r.read(&t, id).unwrap(), None);
        }
    }

    #[test]
    fn two_fixed_reverse_order() {
        let t = dyn_table();
        let d0 = 0x1111_2222_3333_4444u64.to_le_bytes();
        let d2 = 0xAABB_CCDDu32.to_le_bytes();
        let mut block = Vec::new();
        DynWriter::pack(&t, &mut block, |ord| match ord {
            0 => Some(&d0[..]),
            2 => Some(&d2[..]),
            _ => None,
        });
        let r = DynReader::new(&block, &t).unwrap();
        // d0 is the first present fixed attr: it sits at the block end
        assert_eq!(&block[block.len() - 8..], &d0[..]);
        assert_eq!(r.read(&t, 1).unwrap().unwrap(), &d0[..]);
        assert_eq!(r.read(&t, 3).unwrap().unwrap(), &d2[..]);
    }
}
