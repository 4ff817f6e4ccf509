use thiserror::Error;

use crate::store::pool::PoolError;

/// Source location captured at the point a fault was raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Loc {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl core::fmt::Display for Loc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Capture the current source location as a [`Loc`].
#[macro_export]
macro_rules! here {
    () => {
        $crate::error::Loc {
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}

/// Raise a [`TupError`] of the given kind, stamped with the call site.
#[macro_export]
macro_rules! fault {
    ($kind:expr) => {
        $crate::TupError::new($kind, $crate::here!())
    };
}

/// Operation-sequencing failures detected when linking an op into a row's
/// operation chain.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SeqError {
    /// The stopping op for this reader, or the chain leader for this
    /// writer, is a DELETE.
    #[error("tuple deleted")]
    TupleDeleted,
    /// INSERT on a row whose chain leader is not a DELETE.
    #[error("row already exists")]
    AlreadyExists,
    /// Any operation following a REFRESH in the same chain.
    #[error("operation after refresh")]
    RefreshFollow,
    /// The predecessor op is not in the PREPARED state.
    #[error("transaction must be aborted")]
    MustBeAborted,
}

/// Failures raised by the interpreter virtual machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InterpError {
    #[error("program counter left the exec region")]
    OutOfProgram,
    #[error("executed instruction budget exhausted")]
    TooManyInstructions,
    #[error("subroutine stack overflow")]
    StackOverflow,
    #[error("return without a pending call")]
    StackUnderflow,
    #[error("empty exec region")]
    NoInstruction,
    #[error("register r{0} used before initialisation")]
    RegisterInit(u8),
    #[error("heap access at word offset {0} out of bounds")]
    MemoryOffset(u32),
    #[error("division by zero")]
    DivByZero,
    #[error("shift amount {0} outside [0,64]")]
    ShiftOperand(u64),
    #[error("write of {0} bytes exceeds the column maximum")]
    WriteSizeTooBig(u32),
    #[error("append on a fixed-size column")]
    AppendOnFixedSizeColumn,
    #[error("append with a null length register")]
    AppendNull,
    #[error("value does not fit in an output register")]
    ValueOverflowOutputRegister,
    #[error("output register index {0} out of range")]
    OutputIndex(u32),
    #[error("unsupported branch condition {0}")]
    UnsupportedBranch(u32),
    #[error("partial read outside the attribute's bounds")]
    PartialRead,
    #[error("unknown opcode {0}")]
    BadOpcode(u32),
}

/// The error kinds the engine can report, grouped by the failure taxonomy:
/// schema violations, operation sequencing, resource exhaustion, corruption,
/// interpreter violations and storage faults.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Primary-key column set does not match the table's.
    #[error("primary key column set mismatch")]
    WrongPkColumns,
    /// Request referenced an attribute id the table does not have.
    #[error("unknown attribute id {0}")]
    UnknownAttr(u32),
    /// The operation is not defined for the attribute's type.
    #[error("unsupported operation for attribute {0}")]
    UnsupportedType(u32),
    /// A NOT NULL attribute was left unset by an insert.
    #[error("attribute {0} may not be null")]
    NotNullViolation(u32),
    /// Malformed attribute-info section.
    #[error("inconsistent attribute-info section")]
    AttrInfoInconsistency,

    /// Op-chain sequencing violation.
    #[error(transparent)]
    Seq(#[from] SeqError),
    /// Row location does not hold a live row.
    #[error("tuple not found")]
    TupleNotFound,

    /// Copy-tuple scratch memory exhausted.
    #[error("no copy tuple memory")]
    NoCopyTupleMemory,
    /// No free slot on any fixed page and no page could be added.
    #[error("fixed slot allocation failed")]
    NoFixedSlot,
    /// No var page could hold the requested size.
    #[error("variable slot allocation failed for {0} words")]
    NoVarSlot(u32),
    /// The log manager denied an UNDO space reservation.
    #[error("undo log reservation of {0} words denied")]
    NoLogSpace(u32),
    /// Disk page preallocation failed.
    #[error("disk page preallocation failed")]
    NoDiskPrealloc,

    /// Row checksum did not verify.
    #[error("row checksum mismatch at page {page_no} idx {page_idx}: residue {residue:#010x}")]
    ChecksumMismatch {
        page_no: u32,
        page_idx: u16,
        residue: u32,
    },

    /// Interpreter violation.
    #[error(transparent)]
    Interp(#[from] InterpError),

    /// No resident page under this id, or no page-map entry for this
    /// logical page.
    #[error("page {0} not resident")]
    PageNotFound(u64),
    /// The engine has no fragment under this id.
    #[error("fragment {0} not known")]
    FragmentNotFound(u64),
    /// A callback fired for a token with no parked operation.
    #[error("no parked operation for callback token {0}")]
    UnknownCallback(u64),
    /// Row id is outside the page's slot range.
    #[error("invalid row id")]
    InvalidRowId,
    /// The one-word var part reference cannot address more pages.
    #[error("fragment var page limit reached")]
    VarPartLimit,

    /// Page frame pool fault.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// An error kind plus the source location that raised it.
#[derive(Debug, Error)]
#[error("{kind} ({loc})")]
pub struct TupError {
    pub kind: ErrorKind,
    pub loc: Loc,
}

impl TupError {
    pub fn new(kind: impl Into<ErrorKind>, loc: Loc) -> Self {
        Self {
            kind: kind.into(),
            loc,
        }
    }

    /// True when the failure is an op-sequencing tag rather than a hard
    /// engine fault.
    pub fn is_sequencing(&self) -> bool {
        matches!(self.kind, ErrorKind::Seq(_) | ErrorKind::TupleNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_records_location() {
        let e = fault!(ErrorKind::TupleNotFound);
        assert!(e.loc.file.ends_with("error.rs"));
        assert!(e.to_string().contains("tuple not found"));
    }

    #[test]
    fn seq_errors_wrap() {
        let e = fault!(SeqError::TupleDeleted);
        assert!(e.is_sequencing());
        let e = fault!(InterpError::DivByZero);
        assert!(!e.is_sequencing());
    }
}
