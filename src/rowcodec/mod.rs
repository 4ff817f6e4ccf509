//! The packed on-page row format and its working-copy (expanded) form.
//!
//! # Packed layout
//!
//! A row's fixed part is a run of little-endian 32-bit words:
//!
//! - word 0: operation pointer (`RNIL` when no op chain is rooted here)
//! - word 1: header bits
//! - word 2: checksum
//! - word 3: GCI
//! - word 4: tuple version (low 16 bits)
//! - null bitmap words, then the fixed attribute block
//! - one var-part reference word (`page_no(16) | page_idx(16)`) when the
//!   table has a variable or dynamic part
//! - two disk reference words when the table has disk columns
//!
//! The checksum XORs words 1..fixed_end, so a clean row XORs to zero; the
//! operation pointer is the one header word mutated outside the op
//! lifecycle and is excluded.
//!
//! The var part, stored on a variable-sized page slot, is
//! `[varpart_len][u16 offsets[n_var+1]][var bytes][dynamic block]`. Under
//! `MM_GROWN` the last word of the slot carries the pre-grow length.

mod attr;
mod dynpart;
mod expand;
mod shrink;

pub use attr::{
    attr_header, parse_attr_header, push_value_words, read_attr, read_attr_into, update_attr,
    value_bytes, AttrWrite,
};
pub use dynpart::{dyn_attr_present, DynReader, DynWriter};
pub use expand::{expand, prepare_read, CopyRow, RowImage};
pub use shrink::{shrink, PartSizes};

pub(crate) use shrink::packed_parts;

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::{PageIdx, PageNo, RNIL};

/// Fixed row header size in words.
pub const HEADER_WORDS: usize = 5;
/// Var-part reference size in words.
pub const VAR_REF_WORDS: usize = 1;
/// Disk-part reference size in words.
pub const DISK_REF_WORDS: usize = 2;

pub(crate) const WORD_OP_PTR: usize = 0;
pub(crate) const WORD_BITS: usize = 1;
pub(crate) const WORD_CHECKSUM: usize = 2;
pub(crate) const WORD_GCI: usize = 3;
pub(crate) const WORD_VERSION: usize = 4;

bitflags! {
    /// Row header bits. Any change here is a persisted-format change.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HeaderBits: u32 {
        /// Slot not in use.
        const FREE          = 1 << 0;
        /// Working copy, never set on a row in its rowid slot.
        const COPY_TUPLE    = 1 << 1;
        /// Initial INSERT allocated in this transaction, not committed.
        const ALLOC         = 1 << 2;
        /// Varpart extended; pre-grow length stored as its last word.
        const MM_GROWN      = 1 << 3;
        /// A main-memory variable part exists.
        const VAR_PART      = 1 << 4;
        /// Disk attributes carried inline in the copy.
        const DISK_INLINE   = 1 << 5;
        /// Initial-insert disk allocation pending commit.
        const DISK_ALLOC    = 1 << 6;
        /// The original row has a disk part.
        const DISK_PART     = 1 << 7;
        /// The disk part is variable-sized.
        const DISK_VAR_PART = 1 << 8;
        /// Disk part moves to a new page on commit.
        const DISK_REORG    = 1 << 9;
        /// Row visible only to the moved-rows reorg scan.
        const REORG_MOVE    = 1 << 10;
        /// Row already handled by the in-progress checkpoint scan.
        const LCP_SKIP      = 1 << 11;
        /// Row created during the checkpoint scan, delete-marked for it.
        const LCP_DELETE    = 1 << 12;
    }
}

/// Read-only view of a row's fixed part.
#[derive(Clone, Copy)]
pub struct RowRef<'a>(pub &'a [u8]);

/// Mutable view of a row's fixed part.
pub struct RowMut<'a>(pub &'a mut [u8]);

macro_rules! word_accessors {
    ($ty:ident) => {
        impl<'a> $ty<'a> {
            #[inline]
            pub fn word(&self, idx: usize) -> u32 {
                LittleEndian::read_u32(&self.0[idx * 4..idx * 4 + 4])
            }

            #[inline]
            pub fn bits(&self) -> HeaderBits {
                HeaderBits::from_bits_retain(self.word(WORD_BITS))
            }

            #[inline]
            pub fn op_ptr(&self) -> u32 {
                self.word(WORD_OP_PTR)
            }

            #[inline]
            pub fn checksum_word(&self) -> u32 {
                self.word(WORD_CHECKSUM)
            }

            #[inline]
            pub fn gci(&self) -> u32 {
                self.word(WORD_GCI)
            }

            #[inline]
            pub fn tuple_version(&self) -> u16 {
                (self.word(WORD_VERSION) & 0xFFFF) as u16
            }
        }
    };
}

word_accessors!(RowRef);
word_accessors!(RowMut);

impl<'a> RowMut<'a> {
    #[inline]
    pub fn set_word(&mut self, idx: usize, value: u32) {
        LittleEndian::write_u32(&mut self.0[idx * 4..idx * 4 + 4], value);
    }

    #[inline]
    pub fn set_bits(&mut self, bits: HeaderBits) {
        self.set_word(WORD_BITS, bits.bits());
    }

    #[inline]
    pub fn set_op_ptr(&mut self, op: u32) {
        self.set_word(WORD_OP_PTR, op);
    }

    #[inline]
    pub fn set_checksum_word(&mut self, cs: u32) {
        self.set_word(WORD_CHECKSUM, cs);
    }

    #[inline]
    pub fn set_gci(&mut self, gci: u32) {
        self.set_word(WORD_GCI, gci);
    }

    #[inline]
    pub fn set_tuple_version(&mut self, v: u16) {
        self.set_word(WORD_VERSION, v as u32);
    }

    pub fn as_ref(&self) -> RowRef<'_> {
        RowRef(self.0)
    }
}

/// One-word reference from a row's fixed part to its var part slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VarRef {
    pub page_no: u16,
    pub page_idx: PageIdx,
}

impl VarRef {
    pub const NIL: VarRef = VarRef {
        page_no: u16::MAX,
        page_idx: u16::MAX,
    };

    pub fn encode(self) -> u32 {
        ((self.page_no as u32) << 16) | self.page_idx as u32
    }

    pub fn decode(word: u32) -> Self {
        Self {
            page_no: (word >> 16) as u16,
            page_idx: (word & 0xFFFF) as u16,
        }
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

/// Two-word reference from a row to its disk part.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskRef {
    pub file_no: u16,
    pub page_idx: PageIdx,
    pub page_no: PageNo,
}

impl DiskRef {
    pub const NIL: DiskRef = DiskRef {
        file_no: u16::MAX,
        page_idx: u16::MAX,
        page_no: RNIL,
    };

    pub fn write(self, dst: &mut [u8]) {
        LittleEndian::write_u32(
            &mut dst[..4],
            ((self.file_no as u32) << 16) | self.page_idx as u32,
        );
        LittleEndian::write_u32(&mut dst[4..8], self.page_no);
    }

    pub fn read(src: &[u8]) -> Self {
        let w0 = LittleEndian::read_u32(&src[..4]);
        Self {
            file_no: (w0 >> 16) as u16,
            page_idx: (w0 & 0xFFFF) as u16,
            page_no: LittleEndian::read_u32(&src[4..8]),
        }
    }

    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }
}

/// Byte offset of the var-part reference word within the packed fixed part.
pub(crate) fn var_ref_off(table: &crate::schema::TableDescriptor) -> usize {
    (HEADER_WORDS as u32 + table.null_words_mm + table.fix_block_words) as usize * 4
}

/// Byte offset of the disk reference words within the packed fixed part.
pub(crate) fn disk_ref_off(table: &crate::schema::TableDescriptor) -> usize {
    var_ref_off(table)
        + if table.has_varpart() {
            VAR_REF_WORDS * 4
        } else {
            0
        }
}

/// Read the length word a packed varpart starts with.
pub fn varpart_len_words(varpart: &[u8]) -> u32 {
    LittleEndian::read_u32(&varpart[..4])
}

/// Null bitmap helpers; `base` is the byte offset of the bitmap.
#[inline]
pub(crate) fn null_bit(buf: &[u8], base: usize, bit: u32) -> bool {
    let w = LittleEndian::read_u32(&buf[base + (bit as usize / 32) * 4..][..4]);
    w & (1 << (bit % 32)) != 0
}

#[inline]
pub(crate) fn set_null_bit(buf: &mut [u8], base: usize, bit: u32, null: bool) {
    let off = base + (bit as usize / 32) * 4;
    let mut w = LittleEndian::read_u32(&buf[off..off + 4]);
    if null {
        w |= 1 << (bit % 32);
    } else {
        w &= !(1 << (bit % 32));
    }
    LittleEndian::write_u32(&mut buf[off..off + 4], w);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut buf = vec![0u8; HEADER_WORDS * 4];
        let mut row = RowMut(&mut buf);
        row.set_op_ptr(RNIL);
        row.set_bits(HeaderBits::VAR_PART | HeaderBits::ALLOC);
        row.set_gci(77);
        row.set_tuple_version(0xFFFF);
        assert_eq!(row.op_ptr(), RNIL);
        assert!(row.bits().contains(HeaderBits::ALLOC));
        assert_eq!(row.gci(), 77);
        assert_eq!(row.tuple_version(), 0xFFFF);
    }

    #[test]
    fn var_ref_word() {
        let r = VarRef {
            page_no: 3,
            page_idx: 9,
        };
        assert_eq!(VarRef::decode(r.encode()), r);
        assert!(VarRef::NIL.is_nil());
    }

    #[test]
    fn disk_ref_words() {
        let mut buf = [0u8; 8];
        let r = DiskRef {
            file_no: 2,
            page_idx: 17,
            page_no: 123456,
        };
        r.write(&mut buf);
        assert_eq!(DiskRef::read(&buf), r);
    }

    #[test]
    fn null_bits() {
        let mut buf = vec![0u8; 8];
        set_null_bit(&mut buf, 0, 33, true);
        assert!(null_bit(&buf, 0, 33));
        assert!(!null_bit(&buf, 0, 1));
        set_null_bit(&mut buf, 0, 33, false);
        assert!(!null_bit(&buf, 0, 33));
    }
}
