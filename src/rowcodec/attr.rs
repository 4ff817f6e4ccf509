//! Attribute access over a [`RowImage`] and the attribute-info wire form.
//!
//! An attribute-info section is a sequence of 32-bit words. Each entry
//! starts with a header word `attr_id(16) << 16 | partial(1) << 15 |
//! byte_size(15)`, followed by the value bytes padded to whole words. A
//! byte size of zero is SQL NULL; there is no separate null bit.

use byteorder::{ByteOrder, LittleEndian};

use super::dynpart::DynReader;
use super::expand::{RowImage, DYN_PRESENT};
use super::{null_bit, set_null_bit, HEADER_WORDS};
use crate::error::ErrorKind;
use crate::schema::{AttrSlot, TableDescriptor};
use crate::{fault, TupError};

const PARTIAL_FLAG: u32 = 1 << 15;
const SIZE_MASK: u32 = 0x7FFF;

/// Build an attribute-info header word. A zero byte size writes or
/// reports SQL NULL.
pub fn attr_header(attr_id: u32, byte_size: u32) -> u32 {
    debug_assert!(byte_size <= SIZE_MASK);
    (attr_id << 16) | (byte_size & SIZE_MASK)
}

/// Decode an attribute-info header word into (attr id, byte size,
/// partial flag). A byte size of zero is SQL NULL.
pub fn parse_attr_header(word: u32) -> (u32, u32, bool) {
    (word >> 16, word & SIZE_MASK, word & PARTIAL_FLAG != 0)
}

/// One parsed attribute write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttrWrite {
    pub attr_id: u32,
    /// None writes SQL NULL.
    pub value: Option<Vec<u8>>,
}

impl AttrWrite {
    /// Parse a whole attribute-info section into writes.
    pub fn parse_all(words: &[u32]) -> Result<Vec<AttrWrite>, TupError> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < words.len() {
            let (attr_id, size, partial) = parse_attr_header(words[pos]);
            pos += 1;
            if partial {
                return Err(fault!(ErrorKind::UnsupportedType(attr_id)));
            }
            if size == 0 {
                // size zero writes NULL into the column
                out.push(AttrWrite {
                    attr_id,
                    value: None,
                });
                continue;
            }
            let data_words = (size as usize).div_ceil(4);
            if pos + data_words > words.len() {
                return Err(fault!(ErrorKind::AttrInfoInconsistency));
            }
            let mut value = vec![0u8; data_words * 4];
            for (i, w) in words[pos..pos + data_words].iter().enumerate() {
                LittleEndian::write_u32(&mut value[i * 4..i * 4 + 4], *w);
            }
            value.truncate(size as usize);
            out.push(AttrWrite {
                attr_id,
                value: Some(value),
            });
            pos += data_words;
        }
        Ok(out)
    }

    /// Encode one write as attribute-info words, appended to `out`. An
    /// empty value encodes as size zero, which is the NULL form.
    pub fn encode_into(&self, out: &mut Vec<u32>) {
        match &self.value {
            None => out.push(attr_header(self.attr_id, 0)),
            Some(v) => {
                out.push(attr_header(self.attr_id, v.len() as u32));
                push_value_words(out, v);
            }
        }
    }
}

/// Append value bytes as little-endian words, zero padded.
pub fn push_value_words(out: &mut Vec<u32>, value: &[u8]) {
    for chunk in value.chunks(4) {
        let mut b = [0u8; 4];
        b[..chunk.len()].copy_from_slice(chunk);
        out.push(LittleEndian::read_u32(&b));
    }
}

/// View value words as bytes, truncated to `byte_len`.
pub fn value_bytes(words: &[u32], byte_len: usize) -> Vec<u8> {
    let mut v = vec![0u8; words.len() * 4];
    for (i, w) in words.iter().enumerate() {
        LittleEndian::write_u32(&mut v[i * 4..i * 4 + 4], *w);
    }
    v.truncate(byte_len);
    v
}

fn mm_null_base() -> usize {
    HEADER_WORDS * 4
}

fn packed_var_value<'a>(
    table: &TableDescriptor,
    varpart: &'a [u8],
    var_idx: u16,
) -> Result<&'a [u8], TupError> {
    let n_var = table.n_var() as usize;
    let off_words = ((n_var + 1) * 2).div_ceil(4);
    let var_area = 4 + off_words * 4;
    let start = LittleEndian::read_u16(&varpart[4 + var_idx as usize * 2..][..2]) as usize;
    let end = LittleEndian::read_u16(&varpart[4 + (var_idx as usize + 1) * 2..][..2]) as usize;
    if start > end || var_area + end > varpart.len() {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    Ok(&varpart[var_area + start..var_area + end])
}

fn packed_disk_var_value<'a>(
    table: &TableDescriptor,
    diskvar: &'a [u8],
    var_idx: u16,
) -> Result<&'a [u8], TupError> {
    let n = table.n_disk_var() as usize;
    let off_words = ((n + 1) * 2).div_ceil(4);
    let var_area = 4 + off_words * 4;
    let start = LittleEndian::read_u16(&diskvar[4 + var_idx as usize * 2..][..2]) as usize;
    let end = LittleEndian::read_u16(&diskvar[4 + (var_idx as usize + 1) * 2..][..2]) as usize;
    if start > end || var_area + end > diskvar.len() {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    Ok(&diskvar[var_area + start..var_area + end])
}

/// Read one attribute's current value out of a row image. `Ok(None)` is
/// SQL NULL.
pub fn read_attr<'a>(
    table: &TableDescriptor,
    image: &RowImage<'a>,
    attr_id: u32,
) -> Result<Option<&'a [u8]>, TupError> {
    let attr = table.attr(attr_id)?;
    let layout = table.layout(attr_id);
    match image {
        RowImage::Packed {
            fixed,
            varpart,
            dynblock,
            disk_fix,
            disk_var,
        } => match layout.slot {
            AttrSlot::FixWord { off, .. } => {
                if let Some(bit) = layout.null_bit {
                    if null_bit(fixed, mm_null_base(), bit) {
                        return Ok(None);
                    }
                }
                let base = (HEADER_WORDS + table.null_words_mm as usize + off as usize) * 4;
                Ok(Some(&fixed[base..base + attr.max_bytes as usize]))
            }
            AttrSlot::Var { var_idx } => {
                if let Some(bit) = layout.null_bit {
                    if null_bit(fixed, mm_null_base(), bit) {
                        return Ok(None);
                    }
                }
                let varpart =
                    varpart.ok_or_else(|| fault!(ErrorKind::AttrInfoInconsistency))?;
                Ok(Some(packed_var_value(table, varpart, var_idx)?))
            }
            AttrSlot::DynFix { .. } | AttrSlot::DynVar { .. } => match dynblock {
                None => Ok(None),
                Some(block) => {
                    let reader = DynReader::new(block, table)?;
                    reader.read(table, attr_id)
                }
            },
            AttrSlot::DiskWord { off, .. } => {
                let fix = disk_fix.ok_or_else(|| fault!(ErrorKind::AttrInfoInconsistency))?;
                if let Some(bit) = layout.null_bit {
                    if null_bit(fix, 4, bit) {
                        return Ok(None);
                    }
                }
                let base = (1 + table.null_words_dd as usize + off as usize) * 4;
                Ok(Some(&fix[base..base + attr.max_bytes as usize]))
            }
            AttrSlot::DiskVar { var_idx } => {
                let fix = disk_fix.ok_or_else(|| fault!(ErrorKind::AttrInfoInconsistency))?;
                if let Some(bit) = layout.null_bit {
                    if null_bit(fix, 4, bit) {
                        return Ok(None);
                    }
                }
                let dvar =
                    disk_var.ok_or_else(|| fault!(ErrorKind::AttrInfoInconsistency))?;
                Ok(Some(packed_disk_var_value(table, dvar, var_idx)?))
            }
        },
        RowImage::Expanded {
            buf,
            mm_words,
            dd_words,
        } => {
            let on_disk = attr.storage.on_disk();
            if on_disk && *dd_words == 0 {
                return Err(fault!(ErrorKind::AttrInfoInconsistency));
            }
            match layout.slot {
                AttrSlot::FixWord { off, .. } => {
                    if let Some(bit) = layout.null_bit {
                        if null_bit(buf, mm_null_base(), bit) {
                            return Ok(None);
                        }
                    }
                    let base = (HEADER_WORDS + table.null_words_mm as usize + off as usize) * 4;
                    Ok(Some(&buf[base..base + attr.max_bytes as usize]))
                }
                AttrSlot::Var { .. } => {
                    if let Some(bit) = layout.null_bit {
                        if null_bit(buf, mm_null_base(), bit) {
                            return Ok(None);
                        }
                    }
                    let reg = layout.expanded_off as usize * 4;
                    let len = LittleEndian::read_u32(&buf[reg..reg + 4]) as usize;
                    Ok(Some(&buf[reg + 4..reg + 4 + len]))
                }
                AttrSlot::DynFix { .. } | AttrSlot::DynVar { .. } => {
                    let reg = layout.expanded_off as usize * 4;
                    let state = LittleEndian::read_u32(&buf[reg..reg + 4]);
                    if state & DYN_PRESENT == 0 {
                        return Ok(None);
                    }
                    let len = (state & !DYN_PRESENT) as usize;
                    Ok(Some(&buf[reg + 4..reg + 4 + len]))
                }
                AttrSlot::DiskWord { .. } => {
                    let dd_base = *mm_words as usize * 4;
                    if let Some(bit) = layout.null_bit {
                        if null_bit(buf, dd_base + 4, bit) {
                            return Ok(None);
                        }
                    }
                    let base = dd_base + layout.expanded_off as usize * 4;
                    Ok(Some(&buf[base..base + attr.max_bytes as usize]))
                }
                AttrSlot::DiskVar { .. } => {
                    let dd_base = *mm_words as usize * 4;
                    if let Some(bit) = layout.null_bit {
                        if null_bit(buf, dd_base + 4, bit) {
                            return Ok(None);
                        }
                    }
                    let reg = dd_base + layout.expanded_off as usize * 4;
                    let len = LittleEndian::read_u32(&buf[reg..reg + 4]) as usize;
                    Ok(Some(&buf[reg + 4..reg + 4 + len]))
                }
            }
        }
    }
}

/// Read one attribute and emit it as attribute-info words. Returns the
/// value byte length. NULL and the empty string both emit the size-zero
/// header, which is how the wire format spells NULL.
pub fn read_attr_into(
    table: &TableDescriptor,
    image: &RowImage<'_>,
    attr_id: u32,
    out: &mut Vec<u32>,
) -> Result<u32, TupError> {
    match read_attr(table, image, attr_id)? {
        None => {
            out.push(attr_header(attr_id, 0));
            Ok(0)
        }
        Some(v) => {
            out.push(attr_header(attr_id, v.len() as u32));
            push_value_words(out, v);
            Ok(v.len() as u32)
        }
    }
}

/// Write one attribute into an expanded copy. Checks nullability and size
/// limits; fixed-size types must arrive at exactly their schema size.
pub fn update_attr(
    table: &TableDescriptor,
    buf: &mut [u8],
    mm_words: u32,
    dd_words: u32,
    attr_id: u32,
    value: Option<&[u8]>,
) -> Result<(), TupError> {
    let attr = table.attr(attr_id)?.clone();
    let layout = *table.layout(attr_id);
    if attr.storage.on_disk() && dd_words == 0 {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }

    let Some(v) = value else {
        if !attr.nullable {
            return Err(fault!(ErrorKind::NotNullViolation(attr_id)));
        }
        match layout.slot {
            AttrSlot::FixWord { .. } | AttrSlot::Var { .. } => {
                set_null_bit(buf, mm_null_base(), layout.null_bit.unwrap(), true);
                if let AttrSlot::Var { .. } = layout.slot {
                    let reg = layout.expanded_off as usize * 4;
                    LittleEndian::write_u32(&mut buf[reg..reg + 4], 0);
                }
            }
            AttrSlot::DynFix { .. } | AttrSlot::DynVar { .. } => {
                let reg = layout.expanded_off as usize * 4;
                LittleEndian::write_u32(&mut buf[reg..reg + 4], 0);
            }
            AttrSlot::DiskWord { .. } | AttrSlot::DiskVar { .. } => {
                let dd_base = mm_words as usize * 4;
                set_null_bit(buf, dd_base + 4, layout.null_bit.unwrap(), true);
                if let AttrSlot::DiskVar { .. } = layout.slot {
                    let reg = dd_base + layout.expanded_off as usize * 4;
                    LittleEndian::write_u32(&mut buf[reg..reg + 4], 0);
                }
            }
        }
        return Ok(());
    };

    if attr.col_type.is_fixed_size() {
        if v.len() != attr.max_bytes as usize {
            return Err(fault!(ErrorKind::UnsupportedType(attr_id)));
        }
    } else if v.len() > attr.max_bytes as usize {
        return Err(fault!(ErrorKind::Interp(
            crate::InterpError::WriteSizeTooBig(v.len() as u32)
        )));
    }

    match layout.slot {
        AttrSlot::FixWord { off, .. } => {
            if let Some(bit) = layout.null_bit {
                set_null_bit(buf, mm_null_base(), bit, false);
            }
            let base = (HEADER_WORDS + table.null_words_mm as usize + off as usize) * 4;
            buf[base..base + v.len()].copy_from_slice(v);
        }
        AttrSlot::Var { .. } => {
            if let Some(bit) = layout.null_bit {
                set_null_bit(buf, mm_null_base(), bit, false);
            }
            let reg = layout.expanded_off as usize * 4;
            LittleEndian::write_u32(&mut buf[reg..reg + 4], v.len() as u32);
            buf[reg + 4..reg + 4 + v.len()].copy_from_slice(v);
        }
        AttrSlot::DynFix { .. } | AttrSlot::DynVar { .. } => {
            let reg = layout.expanded_off as usize * 4;
            LittleEndian::write_u32(&mut buf[reg..reg + 4], DYN_PRESENT | v.len() as u32);
            buf[reg + 4..reg + 4 + v.len()].copy_from_slice(v);
        }
        AttrSlot::DiskWord { .. } => {
            let dd_base = mm_words as usize * 4;
            if let Some(bit) = layout.null_bit {
                set_null_bit(buf, dd_base + 4, bit, false);
            }
            let base = dd_base + layout.expanded_off as usize * 4;
            buf[base..base + v.len()].copy_from_slice(v);
        }
        AttrSlot::DiskVar { .. } => {
            let dd_base = mm_words as usize * 4;
            if let Some(bit) = layout.null_bit {
                set_null_bit(buf, dd_base + 4, bit, false);
            }
            let reg = dd_base + layout.expanded_off as usize * 4;
            LittleEndian::write_u32(&mut buf[reg..reg + 4], v.len() as u32);
            buf[reg + 4..reg + 4 + v.len()].copy_from_slice(v);
        }
    }
    Ok(())
}
