//! XOR checksum discipline over a row's fixed part.
//!
//! The checksum spans words 1..fixed_end of the packed fixed part: header
//! bits, the checksum word itself, GCI, tuple version, null bitmap, fixed
//! attribute block and part references. Word 0 - the operation pointer -
//! is excluded because it is the one word mutated outside the op
//! lifecycle, during chain publish and unpublish. A clean row XORs to
//! zero.

use byteorder::{ByteOrder, LittleEndian};

use crate::config::CorruptPolicy;
use crate::error::ErrorKind;
use crate::rowcodec::WORD_CHECKSUM;
use crate::{fault, RowId, TupError};

/// XOR of words 1..`fix_row_words`. Zero on a clean row.
pub fn residue(row: &[u8], fix_row_words: u32) -> u32 {
    let mut x = 0u32;
    for w in 1..fix_row_words as usize {
        x ^= LittleEndian::read_u32(&row[w * 4..w * 4 + 4]);
    }
    x
}

/// Recompute and store the checksum word so the row verifies clean.
pub fn set(row: &mut [u8], fix_row_words: u32) {
    LittleEndian::write_u32(&mut row[WORD_CHECKSUM * 4..WORD_CHECKSUM * 4 + 4], 0);
    let cs = residue(row, fix_row_words);
    LittleEndian::write_u32(&mut row[WORD_CHECKSUM * 4..WORD_CHECKSUM * 4 + 4], cs);
}

/// Fast path when only the header-bits word changed: fold the diff into
/// the stored checksum without re-reading the row.
pub fn update(row: &mut [u8], old_bits: u32, new_bits: u32) {
    let off = WORD_CHECKSUM * 4;
    let cs = LittleEndian::read_u32(&row[off..off + 4]);
    LittleEndian::write_u32(&mut row[off..off + 4], cs ^ old_bits ^ new_bits);
}

/// Verify a row under the configured corruption policy. Must be called
/// with the row's page mutex held.
pub fn verify(
    row: &[u8],
    fix_row_words: u32,
    policy: CorruptPolicy,
    rowid: RowId,
) -> Result<(), TupError> {
    let r = residue(row, fix_row_words);
    if r == 0 {
        return Ok(());
    }
    match policy {
        CorruptPolicy::Abort => {
            log::error!(
                "row checksum mismatch at ({}, {}), residue {r:#010x}; aborting",
                rowid.page_no,
                rowid.page_idx
            );
            panic!(
                "row checksum mismatch at ({}, {})",
                rowid.page_no, rowid.page_idx
            );
        }
        CorruptPolicy::Error => {
            log::warn!(
                "row checksum mismatch at ({}, {}), residue {r:#010x}",
                rowid.page_no,
                rowid.page_idx
            );
            Err(fault!(ErrorKind::ChecksumMismatch {
                page_no: rowid.page_no,
                page_idx: rowid.page_idx,
                residue: r,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowcodec::{HeaderBits, RowMut};
    use crate::RNIL;

    use proptest::prelude::*;

    fn sample_row(words: u32) -> Vec<u8> {
        let mut buf = vec![0u8; words as usize * 4];
        let mut row = RowMut(&mut buf);
        row.set_op_ptr(RNIL);
        row.set_bits(HeaderBits::VAR_PART);
        row.set_gci(42);
        row.set_tuple_version(3);
        for w in 5..words as usize {
            LittleEndian::write_u32(&mut buf[w * 4..w * 4 + 4], w as u32 * 0x01010101);
        }
        buf
    }

    #[test]
    fn set_then_verify() {
        let mut buf = sample_row(9);
        set(&mut buf, 9);
        assert_eq!(residue(&buf, 9), 0);
        verify(&buf, 9, CorruptPolicy::Error, RowId::new(0, 0)).unwrap();
    }

    #[test]
    fn op_ptr_word_is_outside_the_span() {
        let mut buf = sample_row(9);
        set(&mut buf, 9);
        RowMut(&mut buf).set_op_ptr(12345);
        assert_eq!(residue(&buf, 9), 0);
    }

    #[test]
    fn corruption_is_typed_under_error_policy() {
        let mut buf = sample_row(9);
        set(&mut buf, 9);
        buf[6 * 4] ^= 0xFF;
        let err = verify(&buf, 9, CorruptPolicy::Error, RowId::new(1, 2)).unwrap_err();
        assert!(matches!(
            err.kind,
            ErrorKind::ChecksumMismatch { page_no: 1, page_idx: 2, .. }
        ));
    }

    #[test]
    fn header_diff_fast_path() {
        let mut buf = sample_row(9);
        set(&mut buf, 9);
        let old = HeaderBits::VAR_PART;
        let new = HeaderBits::VAR_PART | HeaderBits::MM_GROWN;
        RowMut(&mut buf).set_bits(new);
        update(&mut buf, old.bits(), new.bits());
        assert_eq!(residue(&buf, 9), 0);
    }

    proptest! {
        /// Any row with FREE and ALLOC clear that went through `set`
        /// verifies clean, whatever its payload.
        #[test]
        fn clean_rows_xor_to_zero(payload in proptest::collection::vec(any::<u32>(), 1..32)) {
            let words = 5 + payload.len() as u32;
            let mut buf = vec![0u8; words as usize * 4];
            for (i, w) in payload.iter().enumerate() {
                LittleEndian::write_u32(&mut buf[(5 + i) * 4..(6 + i) * 4], *w);
            }
            set(&mut buf, words);
            prop_assert_eq!(residue(&buf, words), 0);
        }
    }
}
