use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ErrorKind;
use crate::{fault, TupError};

/// Column value types understood by the row codec and the interpreter's
/// typed comparisons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColType {
    Uint32,
    Int32,
    Uint64,
    Int64,
    /// Fixed-length byte string.
    Binary,
    /// Fixed-length character string, space padded, collation aware.
    Char,
    /// Variable-length byte string.
    Varbinary,
    /// Variable-length character string, collation aware.
    Varchar,
}

impl ColType {
    /// Whether values of this type have a schema-fixed byte length.
    pub fn is_fixed_size(self) -> bool {
        !matches!(self, ColType::Varbinary | ColType::Varchar)
    }

    /// Whether the type compares through a character collation.
    pub fn is_character(self) -> bool {
        matches!(self, ColType::Char | ColType::Varchar)
    }
}

/// String collation for character columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Collation {
    #[default]
    Binary,
    /// ASCII case-insensitive.
    CaseInsensitive,
}

/// Where an attribute's bytes live in the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrStorage {
    /// Fixed-size block of the main-memory part.
    FixedMem,
    /// Variable-length block of the main-memory part.
    VarMem,
    /// Dynamic block, schema-fixed size.
    DynFixed,
    /// Dynamic block, variable length.
    DynVar,
    /// Fixed-size block of the disk part.
    FixedDisk,
    /// Variable-length block of the disk part.
    VarDisk,
}

impl AttrStorage {
    pub fn on_disk(self) -> bool {
        matches!(self, AttrStorage::FixedDisk | AttrStorage::VarDisk)
    }

    pub fn dynamic(self) -> bool {
        matches!(self, AttrStorage::DynFixed | AttrStorage::DynVar)
    }
}

/// One attribute of a table.
#[derive(Clone, Debug)]
pub struct AttrDescr {
    /// Attribute id; must equal the attribute's position in the table.
    pub id: u32,
    pub name: String,
    pub col_type: ColType,
    pub storage: AttrStorage,
    /// Maximum value size in bytes (exact size for fixed types).
    pub max_bytes: u32,
    pub nullable: bool,
    pub pk: bool,
    pub collation: Collation,
    /// Schema default, applied to insert copies before attribute writes.
    pub default: Option<Vec<u8>>,
}

impl AttrDescr {
    pub fn new(id: u32, name: &str, col_type: ColType, storage: AttrStorage) -> Self {
        let max_bytes = match col_type {
            ColType::Uint32 | ColType::Int32 => 4,
            ColType::Uint64 | ColType::Int64 => 8,
            _ => 0,
        };
        Self {
            id,
            name: name.to_string(),
            col_type,
            storage,
            max_bytes,
            nullable: false,
            pk: false,
            collation: Collation::default(),
            default: None,
        }
    }

    pub fn max_bytes(mut self, bytes: u32) -> Self {
        self.max_bytes = bytes;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn pk(mut self) -> Self {
        self.pk = true;
        self
    }

    pub fn collation(mut self, c: Collation) -> Self {
        self.collation = c;
        self
    }

    pub fn default_value(mut self, bytes: &[u8]) -> Self {
        self.default = Some(bytes.to_vec());
        self
    }

    /// Value size rounded up to whole 32-bit words.
    pub fn max_words(&self) -> u32 {
        self.max_bytes.div_ceil(4)
    }
}

/// Where, exactly, an attribute's bytes sit inside the packed and expanded
/// row images. All offsets are in words relative to the start of the part
/// that holds them.
#[derive(Clone, Copy, Debug)]
pub enum AttrSlot {
    /// Main-memory fixed block: word offset within the fixed part.
    FixWord { off: u32, words: u32 },
    /// Main-memory varpart: index into the var offset array.
    Var { var_idx: u16 },
    /// Dynamic block, fixed-size: dynamic ordinal and word count.
    DynFix { dyn_idx: u16, words: u32 },
    /// Dynamic block, variable-size: dynamic ordinal.
    DynVar { dyn_idx: u16 },
    /// Disk fixed block: word offset within the disk fixed part.
    DiskWord { off: u32, words: u32 },
    /// Disk varpart: index into the disk var offset array.
    DiskVar { var_idx: u16 },
}

/// Per-attribute computed layout.
#[derive(Clone, Copy, Debug)]
pub struct AttrLayout {
    pub slot: AttrSlot,
    /// Bit index in the owning part's null bitmap, when nullable.
    pub null_bit: Option<u32>,
    /// Word offset of this attribute's region in the expanded image of its
    /// part (main or disk).
    pub expanded_off: u32,
}

/// Immutable per-table schema with every offset the row codec needs,
/// computed once at build time.
#[derive(Debug)]
pub struct TableDescriptor {
    pub table_id: u32,
    pub attrs: Vec<AttrDescr>,
    pub(crate) layouts: Vec<AttrLayout>,

    /// Attribute order arrays per block, each holding attribute ids.
    pub(crate) fix_order: Vec<u32>,
    pub(crate) var_order: Vec<u32>,
    pub(crate) dyn_order: Vec<u32>,
    pub(crate) disk_fix_order: Vec<u32>,
    pub(crate) disk_var_order: Vec<u32>,
    pub(crate) pk_order: Vec<u32>,

    /// Null bitmap sizes, in words.
    pub(crate) null_words_mm: u32,
    pub(crate) null_words_dd: u32,

    /// Main-memory fixed attribute block size, in words.
    pub(crate) fix_block_words: u32,
    /// Whole packed fixed part: header + nulls + fixed block + refs.
    pub(crate) fix_row_words: u32,
    /// Disk fixed part: disk header word + nulls + disk fixed block.
    pub(crate) disk_fix_words: u32,

    /// Expanded image sizes, in words.
    pub(crate) expanded_words_mm: u32,
    pub(crate) expanded_words_dd: u32,

    /// Largest possible packed varpart, in words, incl. length word.
    pub(crate) max_varpart_words: u32,
    /// Largest possible packed disk varpart, in words.
    pub(crate) max_disk_varpart_words: u32,
}

impl TableDescriptor {
    /// Compute the full layout for a set of attributes.
    pub fn build(table_id: u32, attrs: Vec<AttrDescr>) -> Result<Self, TupError> {
        use crate::rowcodec::{DISK_REF_WORDS, HEADER_WORDS, VAR_REF_WORDS};

        for (i, a) in attrs.iter().enumerate() {
            if a.id != i as u32 {
                return Err(fault!(ErrorKind::UnknownAttr(a.id)));
            }
            // Attribute sizes travel in a 15-bit wire field.
            if a.max_bytes == 0 || a.max_bytes > 0x7FFF {
                return Err(fault!(ErrorKind::UnsupportedType(a.id)));
            }
            if a.pk && (a.nullable || a.storage != AttrStorage::FixedMem) {
                // Primary key columns live in the fixed block and are
                // never nullable.
                return Err(fault!(ErrorKind::WrongPkColumns));
            }
            if a.storage.dynamic() && !a.nullable {
                // A dynamic attribute is "present" exactly when its bitmap
                // bit is set; absence is its null form.
                return Err(fault!(ErrorKind::UnsupportedType(a.id)));
            }
            match (a.col_type.is_fixed_size(), a.storage) {
                (true, AttrStorage::VarMem | AttrStorage::DynVar | AttrStorage::VarDisk)
                | (false, AttrStorage::FixedMem | AttrStorage::DynFixed | AttrStorage::FixedDisk) => {
                    return Err(fault!(ErrorKind::UnsupportedType(a.id)));
                }
                _ => {}
            }
        }
        if !attrs.iter().any(|a| a.pk) {
            return Err(fault!(ErrorKind::WrongPkColumns));
        }

        let mut fix_order = Vec::new();
        let mut var_order = Vec::new();
        let mut dyn_order = Vec::new();
        let mut disk_fix_order = Vec::new();
        let mut disk_var_order = Vec::new();
        let mut pk_order = Vec::new();
        for a in &attrs {
            match a.storage {
                AttrStorage::FixedMem => fix_order.push(a.id),
                AttrStorage::VarMem => var_order.push(a.id),
                AttrStorage::DynFixed | AttrStorage::DynVar => dyn_order.push(a.id),
                AttrStorage::FixedDisk => disk_fix_order.push(a.id),
                AttrStorage::VarDisk => disk_var_order.push(a.id),
            }
            if a.pk {
                pk_order.push(a.id);
            }
        }

        let null_count_mm = attrs
            .iter()
            .filter(|a| a.nullable && !a.storage.on_disk() && !a.storage.dynamic())
            .count() as u32;
        let null_count_dd = attrs
            .iter()
            .filter(|a| a.nullable && a.storage.on_disk())
            .count() as u32;
        let null_words_mm = null_count_mm.div_ceil(32);
        let null_words_dd = null_count_dd.div_ceil(32);

        let mut layouts = vec![
            AttrLayout {
                slot: AttrSlot::FixWord { off: 0, words: 0 },
                null_bit: None,
                expanded_off: 0,
            };
            attrs.len()
        ];

        // Packed fixed block offsets and main null bits.
        let mut fix_off = 0u32;
        let mut null_bit_mm = 0u32;
        for &id in &fix_order {
            let a = &attrs[id as usize];
            layouts[id as usize].slot = AttrSlot::FixWord {
                off: fix_off,
                words: a.max_words(),
            };
            fix_off += a.max_words();
            if a.nullable {
                layouts[id as usize].null_bit = Some(null_bit_mm);
                null_bit_mm += 1;
            }
        }
        let fix_block_words = fix_off;
        for (vi, &id) in var_order.iter().enumerate() {
            let a = &attrs[id as usize];
            layouts[id as usize].slot = AttrSlot::Var { var_idx: vi as u16 };
            if a.nullable {
                layouts[id as usize].null_bit = Some(null_bit_mm);
                null_bit_mm += 1;
            }
        }
        let mut dyn_fix_seen = 0u16;
        let mut dyn_var_seen = 0u16;
        for &id in &dyn_order {
            let a = &attrs[id as usize];
            layouts[id as usize].slot = if a.storage == AttrStorage::DynFixed {
                let s = AttrSlot::DynFix {
                    dyn_idx: dyn_fix_seen,
                    words: a.max_words(),
                };
                dyn_fix_seen += 1;
                s
            } else {
                let s = AttrSlot::DynVar {
                    dyn_idx: dyn_var_seen,
                };
                dyn_var_seen += 1;
                s
            };
        }
        let mut disk_off = 0u32;
        let mut null_bit_dd = 0u32;
        for &id in &disk_fix_order {
            let a = &attrs[id as usize];
            layouts[id as usize].slot = AttrSlot::DiskWord {
                off: disk_off,
                words: a.max_words(),
            };
            disk_off += a.max_words();
            if a.nullable {
                layouts[id as usize].null_bit = Some(null_bit_dd);
                null_bit_dd += 1;
            }
        }
        for (vi, &id) in disk_var_order.iter().enumerate() {
            let a = &attrs[id as usize];
            layouts[id as usize].slot = AttrSlot::DiskVar { var_idx: vi as u16 };
            if a.nullable {
                layouts[id as usize].null_bit = Some(null_bit_dd);
                null_bit_dd += 1;
            }
        }

        let has_varpart = !var_order.is_empty() || !dyn_order.is_empty();
        let has_diskpart = !disk_fix_order.is_empty() || !disk_var_order.is_empty();
        let fix_row_words = HEADER_WORDS as u32
            + null_words_mm
            + fix_block_words
            + if has_varpart { VAR_REF_WORDS as u32 } else { 0 }
            + if has_diskpart { DISK_REF_WORDS as u32 } else { 0 };

        // Disk fixed part carries one length/version word up front.
        let disk_fix_words = if has_diskpart {
            1 + null_words_dd + disk_off
        } else {
            0
        };

        // Expanded image: the packed fixed part verbatim (so the copy
        // keeps its part references in place), then every var attribute
        // padded to its max, then the dynamic attributes all materialised.
        // Each region is prefixed by one word holding the current byte
        // length (dynamic: a state word with a present bit).
        let mut exp_off = fix_row_words;
        for &id in &var_order {
            layouts[id as usize].expanded_off = exp_off;
            exp_off += 1 + attrs[id as usize].max_words();
        }
        for &id in &dyn_order {
            layouts[id as usize].expanded_off = exp_off;
            exp_off += 1 + attrs[id as usize].max_words();
        }
        let expanded_words_mm = exp_off;

        let mut exp_dd = if has_diskpart {
            1 + null_words_dd + disk_off
        } else {
            0
        };
        for &id in &disk_fix_order {
            if let AttrSlot::DiskWord { off, .. } = layouts[id as usize].slot {
                layouts[id as usize].expanded_off = 1 + null_words_dd + off;
            }
        }
        for &id in &disk_var_order {
            layouts[id as usize].expanded_off = exp_dd;
            exp_dd += 1 + attrs[id as usize].max_words();
        }
        let expanded_words_dd = exp_dd;

        let n_var = var_order.len() as u32;
        let var_bytes_max: u32 = var_order
            .iter()
            .map(|&id| attrs[id as usize].max_bytes)
            .sum();
        // length word + u16 offset array (n+1 entries) + data, then the
        // dynamic block at its largest.
        let mut max_varpart_words = 0u32;
        if has_varpart {
            max_varpart_words = 1 + (n_var + 1).div_ceil(2) + var_bytes_max.div_ceil(4);
            let dyn_fix_words: u32 = dyn_order
                .iter()
                .filter(|&&id| attrs[id as usize].storage == AttrStorage::DynFixed)
                .map(|&id| attrs[id as usize].max_words())
                .sum();
            let dyn_var_bytes: u32 = dyn_order
                .iter()
                .filter(|&&id| attrs[id as usize].storage == AttrStorage::DynVar)
                .map(|&id| attrs[id as usize].max_bytes)
                .sum();
            let n_dyn_var = dyn_var_seen as u32;
            if !dyn_order.is_empty() {
                let bitmap_words = (dyn_order.len() as u32).div_ceil(32);
                max_varpart_words += 1
                    + bitmap_words
                    + (n_dyn_var + 1).div_ceil(2)
                    + dyn_var_bytes.div_ceil(4)
                    + dyn_fix_words;
            }
            // room for the pre-grow length word stored under MM_GROWN
            max_varpart_words += 1;
        }
        let n_disk_var = disk_var_order.len() as u32;
        let disk_var_bytes_max: u32 = disk_var_order
            .iter()
            .map(|&id| attrs[id as usize].max_bytes)
            .sum();
        let max_disk_varpart_words = if n_disk_var > 0 {
            1 + (n_disk_var + 1).div_ceil(2) + disk_var_bytes_max.div_ceil(4)
        } else {
            0
        };

        Ok(Self {
            table_id,
            attrs,
            layouts,
            fix_order,
            var_order,
            dyn_order,
            disk_fix_order,
            disk_var_order,
            pk_order,
            null_words_mm,
            null_words_dd,
            fix_block_words,
            fix_row_words,
            disk_fix_words,
            expanded_words_mm,
            expanded_words_dd,
            max_varpart_words,
            max_disk_varpart_words,
        })
    }

    pub fn attr(&self, id: u32) -> Result<&AttrDescr, TupError> {
        self.attrs
            .get(id as usize)
            .ok_or_else(|| fault!(ErrorKind::UnknownAttr(id)))
    }

    pub fn layout(&self, id: u32) -> &AttrLayout {
        &self.layouts[id as usize]
    }

    pub fn n_var(&self) -> u16 {
        self.var_order.len() as u16
    }

    pub fn n_dyn(&self) -> u16 {
        self.dyn_order.len() as u16
    }

    pub fn n_disk_var(&self) -> u16 {
        self.disk_var_order.len() as u16
    }

    pub fn has_varpart(&self) -> bool {
        !self.var_order.is_empty() || !self.dyn_order.is_empty()
    }

    pub fn has_dynpart(&self) -> bool {
        !self.dyn_order.is_empty()
    }

    pub fn has_diskpart(&self) -> bool {
        !self.disk_fix_order.is_empty() || !self.disk_var_order.is_empty()
    }

    pub fn disk_var(&self) -> bool {
        !self.disk_var_order.is_empty()
    }

    /// Whether the row needs an expand step before attribute access, i.e.
    /// it has anything beyond the fixed main-memory block.
    pub fn need_expand(&self, disk: bool) -> bool {
        self.has_varpart() || (disk && self.has_diskpart())
    }

    /// Verify that `attr_ids` is exactly the primary key column set.
    pub fn check_pk_set(&self, attr_ids: &[u32]) -> Result<(), TupError> {
        if attr_ids.len() != self.pk_order.len()
            || !self.pk_order.iter().all(|id| attr_ids.contains(id))
        {
            return Err(fault!(ErrorKind::WrongPkColumns));
        }
        Ok(())
    }
}

/// Ordered comparison of two values of one column type. Character types
/// fold case when the collation says so; integer types compare as their
/// little-endian numeric value; everything else is bytewise.
pub fn cmp_values(t: ColType, collation: Collation, a: &[u8], b: &[u8]) -> Ordering {
    match t {
        ColType::Uint32 => LittleEndian::read_u32(a).cmp(&LittleEndian::read_u32(b)),
        ColType::Int32 => LittleEndian::read_i32(a).cmp(&LittleEndian::read_i32(b)),
        ColType::Uint64 => LittleEndian::read_u64(a).cmp(&LittleEndian::read_u64(b)),
        ColType::Int64 => LittleEndian::read_i64(a).cmp(&LittleEndian::read_i64(b)),
        ColType::Binary | ColType::Varbinary => a.cmp(b),
        ColType::Char | ColType::Varchar => match collation {
            Collation::Binary => cmp_space_padded(a, b, false),
            Collation::CaseInsensitive => cmp_space_padded(a, b, true),
        },
    }
}

/// Space-padded string comparison: the shorter operand is treated as if
/// padded with blanks, so 'ab' == 'ab  '.
fn cmp_space_padded(a: &[u8], b: &[u8], fold: bool) -> Ordering {
    let norm = |c: u8| if fold { c.to_ascii_lowercase() } else { c };
    let n = a.len().max(b.len());
    for i in 0..n {
        let ca = norm(*a.get(i).unwrap_or(&b' '));
        let cb = norm(*b.get(i).unwrap_or(&b' '));
        match ca.cmp(&cb) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// SQL LIKE with `%` and `_` wildcards, `\` escaping, collation aware.
pub fn like_match(collation: Collation, value: &[u8], pattern: &[u8]) -> bool {
    fn inner(v: &[u8], p: &[u8], fold: bool) -> bool {
        let norm = |c: u8| if fold { c.to_ascii_lowercase() } else { c };
        match p.first() {
            None => v.is_empty(),
            Some(b'%') => {
                (0..=v.len()).any(|k| inner(&v[k..], &p[1..], fold))
            }
            Some(b'_') => !v.is_empty() && inner(&v[1..], &p[1..], fold),
            Some(b'\\') if p.len() > 1 => {
                !v.is_empty() && norm(v[0]) == norm(p[1]) && inner(&v[1..], &p[2..], fold)
            }
            Some(&c) => !v.is_empty() && norm(v[0]) == norm(c) && inner(&v[1..], &p[1..], fold),
        }
    }
    inner(value, pattern, collation == Collation::CaseInsensitive)
}
