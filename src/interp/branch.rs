//! Typed attribute comparisons for the branch instructions.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use crate::schema::{cmp_values, like_match, AttrDescr};
use crate::{fault, InterpError, TupError};

use super::opcode::{CondCode, NullSemantics};

fn le_uint(v: &[u8]) -> Result<u64, TupError> {
    if v.len() > 8 {
        return Err(fault!(InterpError::UnsupportedBranch(v.len() as u32)));
    }
    let mut b = [0u8; 8];
    b[..v.len()].copy_from_slice(v);
    Ok(LittleEndian::read_u64(&b))
}

/// Decide whether an attribute branch is taken.
///
/// `lhs` is the row attribute's current value, `rhs` the comparison
/// operand; `None` is SQL NULL. NULL resolution follows the instruction's
/// 2-bit null-semantics field: branch-out in an AND conjunction, skip in
/// an OR conjunction, or the legacy ordering that ranks NULL below every
/// value.
pub fn attr_branch_taken(
    attr: &AttrDescr,
    cond: CondCode,
    nulls: NullSemantics,
    lhs: Option<&[u8]>,
    rhs: Option<&[u8]>,
) -> Result<bool, TupError> {
    if lhs.is_none() || rhs.is_none() {
        return Ok(match nulls {
            NullSemantics::BranchIfNull => true,
            NullSemantics::SkipIfNull => false,
            NullSemantics::Legacy => {
                let ord = match (lhs, rhs) {
                    (None, None) => Ordering::Equal,
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    _ => unreachable!(),
                };
                match cond {
                    CondCode::Eq => ord == Ordering::Equal,
                    CondCode::Ne => ord != Ordering::Equal,
                    CondCode::Lt => ord == Ordering::Less,
                    CondCode::Le => ord != Ordering::Greater,
                    CondCode::Gt => ord == Ordering::Greater,
                    CondCode::Ge => ord != Ordering::Less,
                    // LIKE and mask tests on NULL never match
                    _ => false,
                }
            }
        });
    }
    let (lhs, rhs) = (lhs.unwrap(), rhs.unwrap());

    Ok(match cond {
        CondCode::Eq | CondCode::Ne | CondCode::Lt | CondCode::Le | CondCode::Gt | CondCode::Ge => {
            let ord = cmp_values(attr.col_type, attr.collation, lhs, rhs);
            match cond {
                CondCode::Eq => ord == Ordering::Equal,
                CondCode::Ne => ord != Ordering::Equal,
                CondCode::Lt => ord == Ordering::Less,
                CondCode::Le => ord != Ordering::Greater,
                CondCode::Gt => ord == Ordering::Greater,
                CondCode::Ge => ord != Ordering::Less,
                _ => unreachable!(),
            }
        }
        CondCode::Like => like_match(attr.collation, lhs, rhs),
        CondCode::NotLike => !like_match(attr.collation, lhs, rhs),
        CondCode::AndEqMask => {
            let (v, m) = (le_uint(lhs)?, le_uint(rhs)?);
            v & m == m
        }
        CondCode::AndNeMask => {
            let (v, m) = (le_uint(lhs)?, le_uint(rhs)?);
            v & m != m
        }
        CondCode::AndEqZero => {
            let (v, m) = (le_uint(lhs)?, le_uint(rhs)?);
            v & m == 0
        }
        CondCode::AndNeZero => {
            let (v, m) = (le_uint(lhs)?, le_uint(rhs)?);
            v & m != 0
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttrStorage, ColType, Collation};

    fn uint_attr() -> AttrDescr {
        AttrDescr::new(0, "n", ColType::Uint32, AttrStorage::FixedMem)
    }

    fn char_attr() -> AttrDescr {
        AttrDescr::new(1, "s", ColType::Varchar, AttrStorage::VarMem)
            .max_bytes(20)
            .collation(Collation::CaseInsensitive)
    }

    #[test]
    fn ordered_compare() {
        let a = uint_attr();
        let lo = 5u32.to_le_bytes();
        let hi = 100u32.to_le_bytes();
        assert!(attr_branch_taken(
            &a,
            CondCode::Lt,
            NullSemantics::Legacy,
            Some(&lo),
            Some(&hi)
        )
        .unwrap());
        assert!(!attr_branch_taken(
            &a,
            CondCode::Gt,
            NullSemantics::Legacy,
            Some(&lo),
            Some(&hi)
        )
        .unwrap());
    }

    #[test]
    fn null_semantics_modes() {
        let a = uint_attr();
        let v = 5u32.to_le_bytes();
        assert!(attr_branch_taken(
            &a,
            CondCode::Eq,
            NullSemantics::BranchIfNull,
            None,
            Some(&v)
        )
        .unwrap());
        assert!(!attr_branch_taken(
            &a,
            CondCode::Eq,
            NullSemantics::SkipIfNull,
            None,
            Some(&v)
        )
        .unwrap());
        // legacy: NULL sorts first
        assert!(attr_branch_taken(
            &a,
            CondCode::Lt,
            NullSemantics::Legacy,
            None,
            Some(&v)
        )
        .unwrap());
    }

    #[test]
    fn like_uses_collation() {
        let a = char_attr();
        assert!(attr_branch_taken(
            &a,
            CondCode::Like,
            NullSemantics::Legacy,
            Some(b"HelloWorld"),
            Some(b"hello%")
        )
        .unwrap());
        assert!(attr_branch_taken(
            &a,
            CondCode::NotLike,
            NullSemantics::Legacy,
            Some(b"other"),
            Some(b"hello%")
        )
        .unwrap());
    }

    #[test]
    fn mask_tests() {
        let a = uint_attr();
        let v = 0b1010u32.to_le_bytes();
        let m = 0b1000u32.to_le_bytes();
        assert!(attr_branch_taken(
            &a,
            CondCode::AndEqMask,
            NullSemantics::Legacy,
            Some(&v),
            Some(&m)
        )
        .unwrap());
        assert!(attr_branch_taken(
            &a,
            CondCode::AndNeZero,
            NullSemantics::Legacy,
            Some(&v),
            Some(&m)
        )
        .unwrap());
        let zero_mask = 0b0100u32.to_le_bytes();
        assert!(attr_branch_taken(
            &a,
            CondCode::AndEqZero,
            NullSemantics::Legacy,
            Some(&v),
            Some(&zero_mask)
        )
        .unwrap());
    }
}
