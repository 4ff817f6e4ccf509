//! Packed-to-working-copy transform and the zero-copy read-side setup.

use byteorder::{ByteOrder, LittleEndian};

use super::dynpart::DynReader;
use super::{varpart_len_words, HeaderBits, RowMut, RowRef, HEADER_WORDS};
use crate::error::ErrorKind;
use crate::schema::TableDescriptor;
use crate::{fault, TupError};

/// Expanded-region state word: present bit plus current byte length.
pub(crate) const DYN_PRESENT: u32 = 1 << 31;

/// A row image the attribute accessors can read from: either the packed
/// on-page parts captured without copying, or an expanded working copy.
pub enum RowImage<'a> {
    Packed {
        fixed: &'a [u8],
        /// `[len][u16 offsets][var bytes][pad]`, dyn block excluded.
        varpart: Option<&'a [u8]>,
        dynblock: Option<&'a [u8]>,
        disk_fix: Option<&'a [u8]>,
        disk_var: Option<&'a [u8]>,
    },
    Expanded {
        buf: &'a [u8],
        mm_words: u32,
        dd_words: u32,
    },
}

/// A working copy of one row, owned by a single operation from prepare to
/// commit or abort. Starts in the expanded form; a shrink repacks the
/// buffer in place and records the packed sizes.
#[derive(Clone, Debug)]
pub struct CopyRow {
    pub buf: Vec<u8>,
    pub mm_words: u32,
    pub dd_words: u32,
    /// Set once the copy has been shrunk back to the packed form.
    pub packed: Option<super::PartSizes>,
}

impl CopyRow {
    /// A fresh all-null copy for an initial insert: header zeroed, every
    /// nullable attribute null, every length zero, every dynamic
    /// attribute absent.
    pub fn empty(table: &TableDescriptor, with_disk: bool) -> Self {
        let mm_words = table.expanded_words_mm;
        let dd_words = if with_disk && table.has_diskpart() {
            table.expanded_words_dd
        } else {
            0
        };
        let mut buf = vec![0u8; (mm_words + dd_words) as usize * 4];
        set_all_null(table, &mut buf, mm_words, dd_words != 0);
        let mut row = RowMut(&mut buf);
        row.set_op_ptr(crate::RNIL);
        row.set_bits(HeaderBits::COPY_TUPLE);
        Self {
            buf,
            mm_words,
            dd_words,
            packed: None,
        }
    }

    /// Image of the expanded form. Invalid after a shrink.
    pub fn image(&self) -> RowImage<'_> {
        debug_assert!(self.packed.is_none());
        RowImage::Expanded {
            buf: &self.buf,
            mm_words: self.mm_words,
            dd_words: self.dd_words,
        }
    }

    /// Image of whichever form the copy currently holds.
    pub fn read_image(
        &self,
        table: &TableDescriptor,
    ) -> Result<RowImage<'_>, TupError> {
        match self.packed {
            None => Ok(RowImage::Expanded {
                buf: &self.buf,
                mm_words: self.mm_words,
                dd_words: self.dd_words,
            }),
            Some(sizes) => {
                let (fixed, var, disk) = super::packed_parts(table, self, sizes);
                prepare_read(table, fixed, var, disk)
            }
        }
    }

    pub fn header(&self) -> RowRef<'_> {
        RowRef(&self.buf)
    }

    pub fn header_mut(&mut self) -> RowMut<'_> {
        RowMut(&mut self.buf)
    }
}

fn set_all_null(table: &TableDescriptor, buf: &mut [u8], mm_words: u32, with_disk: bool) {
    let null_base = HEADER_WORDS * 4;
    for w in 0..table.null_words_mm as usize {
        LittleEndian::write_u32(&mut buf[null_base + w * 4..][..4], u32::MAX);
    }
    if with_disk && table.null_words_dd > 0 {
        let dd_null_base = (mm_words as usize + 1) * 4;
        for w in 0..table.null_words_dd as usize {
            LittleEndian::write_u32(&mut buf[dd_null_base + w * 4..][..4], u32::MAX);
        }
    }
}

/// Split a packed varpart slot into its var region and dynamic block.
///
/// Takes the whole slot; the length word bounds the content, so a
/// trailing pre-grow word under MM_GROWN is ignored here.
pub(crate) fn split_varpart<'a>(
    table: &TableDescriptor,
    slot: &'a [u8],
) -> Result<(&'a [u8], Option<&'a [u8]>), TupError> {
    let content_words = varpart_len_words(slot);
    let end = (1 + content_words as usize) * 4;
    if end > slot.len() {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    let n_var = table.n_var() as usize;
    let off_words = ((n_var + 1) * 2).div_ceil(4);
    let var_area = 4 + off_words * 4;
    if var_area > end {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    let var_total = LittleEndian::read_u16(&slot[4 + n_var * 2..][..2]) as usize;
    let var_end = var_area + var_total.div_ceil(4) * 4;
    if var_end > end {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    let dynblock = if table.has_dynpart() {
        Some(&slot[var_end..end])
    } else {
        None
    };
    Ok((&slot[..var_end], dynblock))
}

/// Split a packed disk part into its fixed part and varpart.
pub(crate) fn split_diskpart<'a>(
    table: &TableDescriptor,
    slot: &'a [u8],
) -> Result<(&'a [u8], Option<&'a [u8]>), TupError> {
    let fix_bytes = table.disk_fix_words as usize * 4;
    if fix_bytes > slot.len() {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    if !table.disk_var() {
        return Ok((&slot[..fix_bytes], None));
    }
    let rest = &slot[fix_bytes..];
    let content_words = varpart_len_words(rest);
    let end = (1 + content_words as usize) * 4;
    if end > rest.len() {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    Ok((&slot[..fix_bytes], Some(&rest[..end])))
}

/// Set up the read-side image over the packed parts without copying.
pub fn prepare_read<'a>(
    table: &TableDescriptor,
    fixed: &'a [u8],
    var_slot: Option<&'a [u8]>,
    disk_slot: Option<&'a [u8]>,
) -> Result<RowImage<'a>, TupError> {
    let (varpart, dynblock) = match var_slot {
        Some(slot) => {
            let (v, d) = split_varpart(table, slot)?;
            (Some(v), d)
        }
        None => (None, None),
    };
    let (disk_fix, disk_var) = match disk_slot {
        Some(slot) => {
            let (f, v) = split_diskpart(table, slot)?;
            (Some(f), v)
        }
        None => (None, None),
    };
    Ok(RowImage::Packed {
        fixed,
        varpart,
        dynblock,
        disk_fix,
        disk_var,
    })
}

/// Expand a packed row into a working copy: fixed part copied verbatim,
/// every variable attribute padded to its maximum so in-place updates
/// never reallocate, dynamic attributes materialised behind state words,
/// and (optionally) the disk part inlined. Sets `COPY_TUPLE` on the copy.
pub fn expand(
    table: &TableDescriptor,
    fixed: &[u8],
    var_slot: Option<&[u8]>,
    disk_slot: Option<&[u8]>,
    include_disk: bool,
) -> Result<CopyRow, TupError> {
    let mm_words = table.expanded_words_mm;
    let dd_words = if include_disk && table.has_diskpart() {
        table.expanded_words_dd
    } else {
        0
    };
    let mut buf = vec![0u8; (mm_words + dd_words) as usize * 4];

    // All-null first, then overlay the source image.
    set_all_null(table, &mut buf, mm_words, dd_words != 0);

    let fix_bytes = table.fix_row_words as usize * 4;
    if fixed.len() < fix_bytes {
        return Err(fault!(ErrorKind::AttrInfoInconsistency));
    }
    buf[..fix_bytes].copy_from_slice(&fixed[..fix_bytes]);
    {
        let mut row = RowMut(&mut buf);
        let bits = row.bits() | HeaderBits::COPY_TUPLE;
        row.set_bits(bits);
    }

    if let Some(slot) = var_slot {
        let (varpart, dynblock) = split_varpart(table, slot)?;
        let n_var = table.n_var() as usize;
        let off_words = ((n_var + 1) * 2).div_ceil(4);
        let var_area = 4 + off_words * 4;
        for (vi, &id) in table.var_order.iter().enumerate() {
            let start = LittleEndian::read_u16(&varpart[4 + vi * 2..][..2]) as usize;
            let end = LittleEndian::read_u16(&varpart[4 + (vi + 1) * 2..][..2]) as usize;
            if start > end || var_area + end > varpart.len() {
                return Err(fault!(ErrorKind::AttrInfoInconsistency));
            }
            let reg = table.layout(id).expanded_off as usize * 4;
            LittleEndian::write_u32(&mut buf[reg..reg + 4], (end - start) as u32);
            let src = &varpart[var_area + start..var_area + end];
            buf[reg + 4..reg + 4 + src.len()].copy_from_slice(src);
        }
        if let Some(dynblock) = dynblock {
            let reader = DynReader::new(dynblock, table)?;
            for &id in &table.dyn_order {
                let reg = table.layout(id).expanded_off as usize * 4;
                if let Some(v) = reader.read(table, id)? {
                    LittleEndian::write_u32(
                        &mut buf[reg..reg + 4],
                        DYN_PRESENT | v.len() as u32,
                    );
                    buf[reg + 4..reg + 4 + v.len()].copy_from_slice(v);
                } else {
                    LittleEndian::write_u32(&mut buf[reg..reg + 4], 0);
                }
            }
        }
    }

    if dd_words != 0 {
        if let Some(slot) = disk_slot {
            let (disk_fix, disk_var) = split_diskpart(table, slot)?;
            let dd_base = mm_words as usize * 4;
            buf[dd_base..dd_base + disk_fix.len()].copy_from_slice(disk_fix);
            if let Some(dvar) = disk_var {
                let n = table.n_disk_var() as usize;
                let off_words = ((n + 1) * 2).div_ceil(4);
                let var_area = 4 + off_words * 4;
                for (vi, &id) in table.disk_var_order.iter().enumerate() {
                    let start = LittleEndian::read_u16(&dvar[4 + vi * 2..][..2]) as usize;
                    let end = LittleEndian::read_u16(&dvar[4 + (vi + 1) * 2..][..2]) as usize;
                    if start > end {
                        return Err(fault!(ErrorKind::AttrInfoInconsistency));
                    }
                    let reg = dd_base + table.layout(id).expanded_off as usize * 4;
                    LittleEndian::write_u32(&mut buf[reg..reg + 4], (end - start) as u32);
                    let src = &dvar[var_area + start..var_area + end];
                    buf[reg + 4..reg + 4 + src.len()].copy_from_slice(src);
                }
            }
        }
    }

    Ok(CopyRow {
        buf,
        mm_words,
        dd_words,
        packed: None,
    })
}
