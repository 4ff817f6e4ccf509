//! The register VM used for condition pushdown on reads and scripted
//! writes on updates and inserts.
//!
//! A program arrives as five contiguous word regions behind five length
//! words: initial-read attribute ids, exec bytecode, final-update
//! attribute writes, final-read attribute ids, and the subroutine +
//! parameter area. The machine has eight null-tagged 64-bit registers, a
//! 32-deep return stack, a heap scratch area of up to 8200 words and a
//! 32-entry output array surfaced to callers as pseudo-columns.

mod branch;
mod exec;
mod opcode;

pub use exec::{AttrAccess, Interp, Outcome};
pub use opcode::{BranchAttrSrc, CondCode, Label, NullSemantics, Op, ProgramBuilder, RegOffset};

use crate::error::ErrorKind;
use crate::{fault, TupError};

/// Heap scratch size, in words.
pub const HEAP_WORDS: usize = 8_200;
/// Subroutine return-stack depth.
pub const MAX_CALL_DEPTH: usize = 32;
/// Output pseudo-column slots.
pub const OUTPUT_SLOTS: usize = 32;

/// The five regions of an interpreted payload.
#[derive(Clone, Copy, Debug, Default)]
pub struct Program<'a> {
    /// Attribute ids read before (writes) or after (reads) exec.
    pub initial_read: &'a [u32],
    /// Bytecode.
    pub exec: &'a [u32],
    /// Attribute-info writes applied after exec.
    pub final_update: &'a [u32],
    /// Attribute ids read last.
    pub final_read: &'a [u32],
    /// Subroutines and parameter constants.
    pub sub: &'a [u32],
}

impl<'a> Program<'a> {
    /// Split an interpreted attribute-info section into its regions. The
    /// section starts with the five region length words.
    pub fn parse(words: &'a [u32]) -> Result<Self, TupError> {
        if words.len() < 5 {
            return Err(fault!(ErrorKind::AttrInfoInconsistency));
        }
        let lens: [usize; 5] = [
            words[0] as usize,
            words[1] as usize,
            words[2] as usize,
            words[3] as usize,
            words[4] as usize,
        ];
        let total: usize = lens.iter().sum();
        if 5 + total > words.len() {
            return Err(fault!(ErrorKind::AttrInfoInconsistency));
        }
        let mut pos = 5;
        let mut take = |n: usize| {
            let r = &words[pos..pos + n];
            pos += n;
            r
        };
        Ok(Self {
            initial_read: take(lens[0]),
            exec: take(lens[1]),
            final_update: take(lens[2]),
            final_read: take(lens[3]),
            sub: take(lens[4]),
        })
    }

    /// Serialise regions back into one word vector with length prefix.
    pub fn assemble(
        initial_read: &[u32],
        exec: &[u32],
        final_update: &[u32],
        final_read: &[u32],
        sub: &[u32],
    ) -> Vec<u32> {
        let mut out = Vec::with_capacity(
            5 + initial_read.len() + exec.len() + final_update.len() + final_read.len() + sub.len(),
        );
        out.push(initial_read.len() as u32);
        out.push(exec.len() as u32);
        out.push(final_update.len() as u32);
        out.push(final_read.len() as u32);
        out.push(sub.len() as u32);
        out.extend_from_slice(initial_read);
        out.extend_from_slice(exec);
        out.extend_from_slice(final_update);
        out.extend_from_slice(final_read);
        out.extend_from_slice(sub);
        out
    }
}
