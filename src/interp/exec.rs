//! The VM loop.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::ErrorKind;
use crate::schema::AttrDescr;
use crate::{fault, InterpError, TupError};

use super::branch::attr_branch_taken;
use super::opcode::{decode, parse_attr_branch_word, BranchAttrSrc, Op};
use super::{Program, HEAP_WORDS, MAX_CALL_DEPTH, OUTPUT_SLOTS};

/// Row access the machine executes against. The ops layer implements this
/// over the working copy, recording writes for the replication log.
pub trait AttrAccess {
    fn descr(&self, attr_id: u32) -> Result<&AttrDescr, TupError>;
    /// Current value; `None` is SQL NULL.
    fn read(&self, attr_id: u32) -> Result<Option<Vec<u8>>, TupError>;
    fn write(&mut self, attr_id: u32, value: Option<&[u8]>) -> Result<(), TupError>;
}

/// How an exec region finished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    /// Final row of the scan batch.
    OkLast,
    /// Filter miss; carries the program's 16-bit reason.
    Refuse(u16),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Region {
    Exec,
    Sub,
}

/// One interpreter activation: registers, heap, call stack, outputs and
/// the executed-instruction counter.
pub struct Interp {
    regs: [Option<u64>; 8],
    heap: Vec<u8>,
    outputs: [u32; OUTPUT_SLOTS],
    outputs_set: u32,
    executed: u32,
    max_instructions: u32,
}

impl Interp {
    pub fn new(max_instructions: u32) -> Self {
        Self {
            regs: [None; 8],
            heap: vec![0; HEAP_WORDS * 4],
            outputs: [0; OUTPUT_SLOTS],
            outputs_set: 0,
            executed: 0,
            max_instructions,
        }
    }

    pub fn executed(&self) -> u32 {
        self.executed
    }

    pub fn outputs(&self) -> &[u32; OUTPUT_SLOTS] {
        &self.outputs
    }

    /// Bitmask of output slots the program wrote.
    pub fn output_mask(&self) -> u32 {
        self.outputs_set
    }

    fn reg(&self, r: u8) -> Result<u64, TupError> {
        self.regs[r as usize].ok_or_else(|| fault!(InterpError::RegisterInit(r)))
    }

    fn heap_check(&self, off: usize, len: usize) -> Result<(), TupError> {
        if off + len > self.heap.len() {
            return Err(fault!(InterpError::MemoryOffset(off as u32)));
        }
        Ok(())
    }

    fn heap_offset(&self, imm: u16, reg_flag: bool, reg_b: u8) -> Result<usize, TupError> {
        let mut off = imm as u64;
        if reg_flag {
            off = off
                .checked_add(self.reg(reg_b)?)
                .ok_or_else(|| fault!(InterpError::MemoryOffset(u32::MAX)))?;
        }
        Ok(off as usize)
    }

    /// Run the exec region against the row. Returns how it exited; the
    /// caller applies final-update and final-read regions afterwards.
    pub fn run(
        &mut self,
        program: &Program<'_>,
        attrs: &mut dyn AttrAccess,
    ) -> Result<Outcome, TupError> {
        if program.exec.is_empty() {
            return Err(fault!(InterpError::NoInstruction));
        }
        let mut region = Region::Exec;
        let mut pc = 0usize;
        let mut stack: [(Region, usize); MAX_CALL_DEPTH] = [(Region::Exec, 0); MAX_CALL_DEPTH];
        let mut depth = 0usize;

        loop {
            let code: &[u32] = match region {
                Region::Exec => program.exec,
                Region::Sub => program.sub,
            };
            if pc >= code.len() {
                return Err(fault!(InterpError::OutOfProgram));
            }
            if self.executed >= self.max_instructions {
                return Err(fault!(InterpError::TooManyInstructions));
            }
            self.executed += 1;

            let at = pc;
            let word = code[pc];
            pc += 1;
            let (op, reg_a, reg_b, off_flag, imm) = decode(word);
            let op = op.ok_or_else(|| fault!(InterpError::BadOpcode(word & 0xFF)))?;

            // secondary-word fetch with bounds checking
            macro_rules! next {
                () => {{
                    if pc >= code.len() {
                        return Err(fault!(InterpError::OutOfProgram));
                    }
                    let w = code[pc];
                    pc += 1;
                    w
                }};
            }
            // take a signed branch delta relative to the instruction
            macro_rules! jump {
                ($delta:expr) => {{
                    let target = at as i64 + $delta as i64;
                    if target < 0 || target as usize >= code.len() {
                        return Err(fault!(InterpError::OutOfProgram));
                    }
                    pc = target as usize;
                }};
            }

            match op {
                Op::LoadConstNull => self.regs[reg_a as usize] = None,
                Op::LoadConst16 => self.regs[reg_a as usize] = Some(imm as u64),
                Op::LoadConst32 => {
                    let v = next!();
                    self.regs[reg_a as usize] = Some(v as u64);
                }
                Op::LoadConst64 => {
                    let lo = next!();
                    let hi = next!();
                    self.regs[reg_a as usize] = Some(lo as u64 | ((hi as u64) << 32));
                }
                Op::LoadConstMem => {
                    let byte_len = next!() as usize;
                    let words = byte_len.div_ceil(4);
                    let off = imm as usize * 4;
                    self.heap_check(off, byte_len)?;
                    for i in 0..words {
                        let w = next!();
                        let n = (byte_len - i * 4).min(4);
                        let bytes = w.to_le_bytes();
                        self.heap[off + i * 4..off + i * 4 + n].copy_from_slice(&bytes[..n]);
                    }
                    self.regs[reg_a as usize] = Some(byte_len as u64);
                }

                Op::ReadAttrToReg => {
                    let attr_id = next!();
                    match attrs.read(attr_id)? {
                        None => self.regs[reg_a as usize] = None,
                        Some(v) => {
                            if v.len() > 8 {
                                return Err(fault!(ErrorKind::UnsupportedType(attr_id)));
                            }
                            let mut b = [0u8; 8];
                            b[..v.len()].copy_from_slice(&v);
                            self.regs[reg_a as usize] = Some(LittleEndian::read_u64(&b));
                        }
                    }
                }
                Op::ReadAttrToMem => {
                    let attr_id = next!();
                    match attrs.read(attr_id)? {
                        None => self.regs[reg_a as usize] = None,
                        Some(v) => {
                            let off = imm as usize * 4;
                            self.heap_check(off, v.len())?;
                            self.heap[off..off + v.len()].copy_from_slice(&v);
                            self.regs[reg_a as usize] = Some(v.len() as u64);
                        }
                    }
                }
                Op::ReadPartialAttrToMem => {
                    let attr_id = next!();
                    let w = next!();
                    let (start, len) = ((w >> 16) as usize, (w & 0xFFFF) as usize);
                    let v = attrs
                        .read(attr_id)?
                        .ok_or_else(|| fault!(InterpError::PartialRead))?;
                    if start + len > v.len() {
                        return Err(fault!(InterpError::PartialRead));
                    }
                    let off = imm as usize * 4;
                    self.heap_check(off, len)?;
                    self.heap[off..off + len].copy_from_slice(&v[start..start + len]);
                    self.regs[reg_a as usize] = Some(len as u64);
                }
                Op::WriteAttrFromReg => {
                    let attr_id = next!();
                    let width = attrs.descr(attr_id)?.max_bytes as usize;
                    if width > 8 {
                        return Err(fault!(ErrorKind::UnsupportedType(attr_id)));
                    }
                    match self.regs[reg_a as usize] {
                        None => attrs.write(attr_id, None)?,
                        Some(v) => {
                            let bytes = v.to_le_bytes();
                            attrs.write(attr_id, Some(&bytes[..width]))?;
                        }
                    }
                }
                Op::WriteAttrFromMem => {
                    let attr_id = next!();
                    let len = self.reg(reg_a)? as usize;
                    let off = imm as usize * 4;
                    self.heap_check(off, len)?;
                    let v = self.heap[off..off + len].to_vec();
                    attrs.write(attr_id, Some(&v))?;
                }
                Op::AppendAttrFromMem => {
                    let attr_id = next!();
                    if attrs.descr(attr_id)?.col_type.is_fixed_size() {
                        return Err(fault!(InterpError::AppendOnFixedSizeColumn));
                    }
                    let len = match self.regs[reg_a as usize] {
                        None => return Err(fault!(InterpError::AppendNull)),
                        Some(l) => l as usize,
                    };
                    let off = imm as usize * 4;
                    self.heap_check(off, len)?;
                    let mut cur = attrs
                        .read(attr_id)?
                        .ok_or_else(|| fault!(InterpError::AppendNull))?;
                    cur.extend_from_slice(&self.heap[off..off + len]);
                    if cur.len() > attrs.descr(attr_id)?.max_bytes as usize {
                        return Err(fault!(InterpError::WriteSizeTooBig(cur.len() as u32)));
                    }
                    attrs.write(attr_id, Some(&cur))?;
                }

                Op::ReadUint8MemToReg
                | Op::ReadUint16MemToReg
                | Op::ReadUint32MemToReg
                | Op::ReadInt64MemToReg => {
                    let off = self.heap_offset(imm, off_flag, reg_b)?;
                    let v = match op {
                        Op::ReadUint8MemToReg => {
                            self.heap_check(off, 1)?;
                            self.heap[off] as u64
                        }
                        Op::ReadUint16MemToReg => {
                            self.heap_check(off, 2)?;
                            LittleEndian::read_u16(&self.heap[off..off + 2]) as u64
                        }
                        Op::ReadUint32MemToReg => {
                            self.heap_check(off, 4)?;
                            LittleEndian::read_u32(&self.heap[off..off + 4]) as u64
                        }
                        _ => {
                            self.heap_check(off, 8)?;
                            LittleEndian::read_u64(&self.heap[off..off + 8])
                        }
                    };
                    self.regs[reg_a as usize] = Some(v);
                }
                Op::WriteUint8RegToMem
                | Op::WriteUint16RegToMem
                | Op::WriteUint32RegToMem
                | Op::WriteInt64RegToMem => {
                    let off = self.heap_offset(imm, off_flag, reg_b)?;
                    let v = self.reg(reg_a)?;
                    match op {
                        Op::WriteUint8RegToMem => {
                            self.heap_check(off, 1)?;
                            self.heap[off] = v as u8;
                        }
                        Op::WriteUint16RegToMem => {
                            self.heap_check(off, 2)?;
                            LittleEndian::write_u16(&mut self.heap[off..off + 2], v as u16);
                        }
                        Op::WriteUint32RegToMem => {
                            self.heap_check(off, 4)?;
                            LittleEndian::write_u32(&mut self.heap[off..off + 4], v as u32);
                        }
                        _ => {
                            self.heap_check(off, 8)?;
                            LittleEndian::write_u64(&mut self.heap[off..off + 8], v);
                        }
                    }
                }
                Op::ConvertSize => {
                    let off = self.heap_offset(imm, off_flag, reg_b)?;
                    self.heap_check(off, 2)?;
                    self.regs[reg_a as usize] =
                        Some(LittleEndian::read_u16(&self.heap[off..off + 2]) as u64);
                }
                Op::ConvertSizeRev => {
                    let off = self.heap_offset(imm, off_flag, reg_b)?;
                    self.heap_check(off, 2)?;
                    let v = self.reg(reg_a)?;
                    LittleEndian::write_u16(&mut self.heap[off..off + 2], v as u16);
                }

                Op::AddRegReg
                | Op::SubRegReg
                | Op::MulRegReg
                | Op::DivRegReg
                | Op::ModRegReg
                | Op::AndRegReg
                | Op::OrRegReg
                | Op::XorRegReg
                | Op::LshiftRegReg
                | Op::RshiftRegReg
                | Op::NotRegReg => {
                    let dest = (imm & 7) as usize;
                    let a = self.reg(reg_a)?;
                    let v = if op == Op::NotRegReg {
                        !a
                    } else {
                        let b = self.reg(reg_b)?;
                        arith(op, a, b)?
                    };
                    self.regs[dest] = Some(v);
                }
                Op::AddConstReg
                | Op::SubConstReg
                | Op::MulConstReg
                | Op::DivConstReg
                | Op::ModConstReg
                | Op::AndConstReg
                | Op::OrConstReg
                | Op::XorConstReg
                | Op::LshiftConstReg
                | Op::RshiftConstReg => {
                    let src = self.reg(reg_b)?;
                    let v = arith(const_form_to_reg_form(op), src, imm as u64)?;
                    self.regs[reg_a as usize] = Some(v);
                }

                Op::Branch => jump!(imm as i16),
                Op::BranchRegEqNull => {
                    if self.regs[reg_a as usize].is_none() {
                        jump!(imm as i16);
                    }
                }
                Op::BranchRegNeNull => {
                    if self.regs[reg_a as usize].is_some() {
                        jump!(imm as i16);
                    }
                }
                Op::BranchEqRegReg
                | Op::BranchNeRegReg
                | Op::BranchLtRegReg
                | Op::BranchLeRegReg
                | Op::BranchGtRegReg
                | Op::BranchGeRegReg => {
                    let a = self.reg(reg_a)?;
                    let b = self.reg(reg_b)?;
                    if reg_cmp_taken(op, a, b) {
                        jump!(imm as i16);
                    }
                }
                Op::BranchEqConst
                | Op::BranchNeConst
                | Op::BranchLtConst
                | Op::BranchLeConst
                | Op::BranchGtConst
                | Op::BranchGeConst => {
                    let delta = next!() as i32;
                    let a = self.reg(reg_a)?;
                    if reg_cmp_taken(const_branch_to_reg_branch(op), a, imm as u64) {
                        jump!(delta);
                    }
                }
                Op::BranchAttrOp => {
                    let desc = next!();
                    let (attr_id, cond, nulls, src) = parse_attr_branch_word(desc)
                        .ok_or_else(|| fault!(InterpError::UnsupportedBranch(desc)))?;
                    let rhs_owned: Option<Vec<u8>> = match src {
                        BranchAttrSrc::Attr => {
                            let other = next!();
                            attrs.read(other)?
                        }
                        BranchAttrSrc::Param => {
                            let off = next!() as usize;
                            if off >= program.sub.len() {
                                return Err(fault!(InterpError::OutOfProgram));
                            }
                            let (_, size, _) =
                                crate::rowcodec::parse_attr_header(program.sub[off]);
                            if size == 0 {
                                None
                            } else {
                                let words = (size as usize).div_ceil(4);
                                if off + 1 + words > program.sub.len() {
                                    return Err(fault!(InterpError::OutOfProgram));
                                }
                                Some(crate::rowcodec::value_bytes(
                                    &program.sub[off + 1..off + 1 + words],
                                    size as usize,
                                ))
                            }
                        }
                        BranchAttrSrc::Arg => {
                            let byte_len = next!() as usize;
                            let words = byte_len.div_ceil(4);
                            let mut v = Vec::with_capacity(words * 4);
                            for _ in 0..words {
                                v.extend_from_slice(&next!().to_le_bytes());
                            }
                            v.truncate(byte_len);
                            Some(v)
                        }
                    };
                    let lhs = attrs.read(attr_id as u32)?;
                    let descr = attrs.descr(attr_id as u32)?;
                    let taken = attr_branch_taken(
                        descr,
                        cond,
                        nulls,
                        lhs.as_deref(),
                        rhs_owned.as_deref(),
                    )?;
                    if taken {
                        jump!(imm as i16);
                    }
                }
                Op::BranchAttrEqNull | Op::BranchAttrNeNull => {
                    let attr_id = next!();
                    let is_null = attrs.read(attr_id)?.is_none();
                    let taken = if op == Op::BranchAttrEqNull {
                        is_null
                    } else {
                        !is_null
                    };
                    if taken {
                        jump!(imm as i16);
                    }
                }

                Op::ExitOk => return Ok(Outcome::Ok),
                Op::ExitOkLast => return Ok(Outcome::OkLast),
                Op::ExitRefuse => {
                    log::trace!("interpreted filter refused row, reason {imm}");
                    return Ok(Outcome::Refuse(imm));
                }
                Op::Call => {
                    if depth == MAX_CALL_DEPTH {
                        return Err(fault!(InterpError::StackOverflow));
                    }
                    if imm as usize >= program.sub.len() {
                        return Err(fault!(InterpError::OutOfProgram));
                    }
                    stack[depth] = (region, pc);
                    depth += 1;
                    region = Region::Sub;
                    pc = imm as usize;
                }
                Op::Return => {
                    if depth == 0 {
                        return Err(fault!(InterpError::StackUnderflow));
                    }
                    depth -= 1;
                    (region, pc) = stack[depth];
                }
                Op::WriteOutput => {
                    let v = self.reg(reg_a)?;
                    if v > u32::MAX as u64 {
                        return Err(fault!(InterpError::ValueOverflowOutputRegister));
                    }
                    if imm as usize >= OUTPUT_SLOTS {
                        return Err(fault!(InterpError::OutputIndex(imm as u32)));
                    }
                    self.outputs[imm as usize] = v as u32;
                    self.outputs_set |= 1 << imm;
                }
            }
        }
    }
}

fn arith(op: Op, a: u64, b: u64) -> Result<u64, TupError> {
    Ok(match op {
        Op::AddRegReg => a.wrapping_add(b),
        Op::SubRegReg => a.wrapping_sub(b),
        Op::MulRegReg => a.wrapping_mul(b),
        Op::DivRegReg => {
            if b == 0 {
                return Err(fault!(InterpError::DivByZero));
            }
            a / b
        }
        Op::ModRegReg => {
            if b == 0 {
                return Err(fault!(InterpError::DivByZero));
            }
            a % b
        }
        Op::AndRegReg => a & b,
        Op::OrRegReg => a | b,
        Op::XorRegReg => a ^ b,
        Op::LshiftRegReg => {
            if b > 64 {
                return Err(fault!(InterpError::ShiftOperand(b)));
            }
            if b == 64 {
                0
            } else {
                a << b
            }
        }
        Op::RshiftRegReg => {
            if b > 64 {
                return Err(fault!(InterpError::ShiftOperand(b)));
            }
            if b == 64 {
                0
            } else {
                a >> b
            }
        }
        _ => unreachable!("not an arithmetic opcode"),
    })
}

fn const_form_to_reg_form(op: Op) -> Op {
    match op {
        Op::AddConstReg => Op::AddRegReg,
        Op::SubConstReg => Op::SubRegReg,
        Op::MulConstReg => Op::MulRegReg,
        Op::DivConstReg => Op::DivRegReg,
        Op::ModConstReg => Op::ModRegReg,
        Op::AndConstReg => Op::AndRegReg,
        Op::OrConstReg => Op::OrRegReg,
        Op::XorConstReg => Op::XorRegReg,
        Op::LshiftConstReg => Op::LshiftRegReg,
        Op::RshiftConstReg => Op::RshiftRegReg,
        _ => unreachable!(),
    }
}

fn const_branch_to_reg_branch(op: Op) -> Op {
    match op {
        Op::BranchEqConst => Op::BranchEqRegReg,
        Op::BranchNeConst => Op::BranchNeRegReg,
        Op::BranchLtConst => Op::BranchLtRegReg,
        Op::BranchLeConst => Op::BranchLeRegReg,
        Op::BranchGtConst => Op::BranchGtRegReg,
        Op::BranchGeConst => Op::BranchGeRegReg,
        _ => unreachable!(),
    }
}

fn reg_cmp_taken(op: Op, a: u64, b: u64) -> bool {
    match op {
        Op::BranchEqRegReg => a == b,
        Op::BranchNeRegReg => a != b,
        Op::BranchLtRegReg => a < b,
        Op::BranchLeRegReg => a <= b,
        Op::BranchGtRegReg => a > b,
        Op::BranchGeRegReg => a >= b,
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::{CondCode, NullSemantics, ProgramBuilder};
    use crate::schema::{AttrStorage, ColType, TableDescriptor};
    use std::collections::HashMap;

    /// Plain in-memory attribute store for machine tests.
    struct MapAttrs {
        table: TableDescriptor,
        values: HashMap<u32, Option<Vec<u8>>>,
    }

    impl MapAttrs {
        fn new() -> Self {
            let table = TableDescriptor::build(
                1,
                vec![
                    AttrDescr::new(0, "pk", ColType::Uint32, AttrStorage::FixedMem).pk(),
                    AttrDescr::new(1, "n", ColType::Uint64, AttrStorage::FixedMem).nullable(),
                    AttrDescr::new(2, "s", ColType::Varchar, AttrStorage::VarMem).max_bytes(20),
                ],
            )
            .unwrap();
            Self {
                table,
                values: HashMap::new(),
            }
        }

        fn set(&mut self, id: u32, v: Option<&[u8]>) {
            self.values.insert(id, v.map(|v| v.to_vec()));
        }
    }

    impl AttrAccess for MapAttrs {
        fn descr(&self, attr_id: u32) -> Result<&AttrDescr, TupError> {
            self.table.attr(attr_id)
        }

        fn read(&self, attr_id: u32) -> Result<Option<Vec<u8>>, TupError> {
            Ok(self.values.get(&attr_id).cloned().flatten())
        }

        fn write(&mut self, attr_id: u32, value: Option<&[u8]>) -> Result<(), TupError> {
            self.values.insert(attr_id, value.map(|v| v.to_vec()));
            Ok(())
        }
    }

    fn run_exec(exec: Vec<u32>, attrs: &mut MapAttrs) -> (Result<Outcome, TupError>, Interp) {
        let assembled = Program::assemble(&[], &exec, &[], &[], &[]);
        let program = Program::parse(&assembled).unwrap();
        let mut m = Interp::new(16_000);
        let r = m.run(&program, attrs);
        (r, m)
    }

    #[test]
    fn filter_hit_and_miss() {
        let mut attrs = MapAttrs::new();
        attrs.set(0, Some(&7u32.to_le_bytes()));

        // branch to refuse when pk > 100
        let mut b = ProgramBuilder::new();
        let refuse = b.label();
        b.read_attr_to_reg(0, 0);
        b.branch_const(Op::BranchGtConst, 0, 100, refuse);
        b.exit_ok();
        b.bind(refuse);
        b.exit_refuse(626);
        let exec = b.finish();

        let (r, _) = run_exec(exec.clone(), &mut attrs);
        assert_eq!(r.unwrap(), Outcome::Ok);

        attrs.set(0, Some(&200u32.to_le_bytes()));
        let (r, _) = run_exec(exec, &mut attrs);
        assert_eq!(r.unwrap(), Outcome::Refuse(626));
    }

    #[test]
    fn arithmetic_and_outputs() {
        let mut attrs = MapAttrs::new();
        let mut b = ProgramBuilder::new();
        b.load_const16(0, 21);
        b.arith_const(Op::MulConstReg, 1, 0, 2);
        b.write_output(1, 4);
        b.exit_ok();
        let (r, m) = run_exec(b.finish(), &mut attrs);
        assert_eq!(r.unwrap(), Outcome::Ok);
        assert_eq!(m.outputs()[4], 42);
        assert_eq!(m.output_mask(), 1 << 4);
        assert_eq!(m.executed(), 4);
    }

    #[test]
    fn div_by_zero_is_typed() {
        let mut attrs = MapAttrs::new();
        let mut b = ProgramBuilder::new();
        b.load_const16(0, 1);
        b.load_const16(1, 0);
        b.arith(Op::DivRegReg, 2, 0, 1);
        b.exit_ok();
        let (r, _) = run_exec(b.finish(), &mut attrs);
        assert!(matches!(
            r.unwrap_err().kind,
            ErrorKind::Interp(InterpError::DivByZero)
        ));
    }

    #[test]
    fn null_register_use_is_typed() {
        let mut attrs = MapAttrs::new();
        let mut b = ProgramBuilder::new();
        b.load_const_null(0);
        b.arith_const(Op::AddConstReg, 1, 0, 1);
        b.exit_ok();
        let (r, _) = run_exec(b.finish(), &mut attrs);
        assert!(matches!(
            r.unwrap_err().kind,
            ErrorKind::Interp(InterpError::RegisterInit(0))
        ));
    }

    #[test]
    fn instruction_budget_enforced() {
        let mut attrs = MapAttrs::new();
        let mut b = ProgramBuilder::new();
        let top = b.label();
        b.bind(top);
        b.branch(top);
        let assembled = Program::assemble(&[], &b.finish(), &[], &[], &[]);
        let program = Program::parse(&assembled).unwrap();
        let mut m = Interp::new(100);
        let r = m.run(&program, &mut attrs);
        assert!(matches!(
            r.unwrap_err().kind,
            ErrorKind::Interp(InterpError::TooManyInstructions)
        ));
        assert_eq!(m.executed(), 100);
    }

    #[test]
    fn heap_roundtrip_and_attr_write() {
        let mut attrs = MapAttrs::new();
        attrs.set(2, Some(b"abc"));
        let mut b = ProgramBuilder::new();
        // append "de" to s via the heap
        b.load_const_mem(0, 10, b"de");
        b.append_attr_from_mem(0, 10, 2);
        b.exit_ok();
        let (r, _) = run_exec(b.finish(), &mut attrs);
        assert_eq!(r.unwrap(), Outcome::Ok);
        assert_eq!(attrs.read(2).unwrap().unwrap(), b"abcde");
    }

    #[test]
    fn append_on_fixed_column_rejected() {
        let mut attrs = MapAttrs::new();
        attrs.set(0, Some(&1u32.to_le_bytes()));
        let mut b = ProgramBuilder::new();
        b.load_const_mem(0, 0, b"zz");
        b.append_attr_from_mem(0, 0, 0);
        b.exit_ok();
        let (r, _) = run_exec(b.finish(), &mut attrs);
        assert!(matches!(
            r.unwrap_err().kind,
            ErrorKind::Interp(InterpError::AppendOnFixedSizeColumn)
        ));
    }

    #[test]
    fn subroutine_call_and_return() {
        let mut attrs = MapAttrs::new();
        // sub at offset 0: r1 = r0 * 3; return
        let mut sb = ProgramBuilder::new();
        sb.arith_const(Op::MulConstReg, 1, 0, 3);
        sb.ret();
        let sub = sb.finish();

        let mut b = ProgramBuilder::new();
        b.load_const16(0, 5);
        b.call(0);
        b.write_output(1, 0);
        b.exit_ok();
        let assembled = Program::assemble(&[], &b.finish(), &[], &[], &sub);
        let program = Program::parse(&assembled).unwrap();
        let mut m = Interp::new(1000);
        assert_eq!(m.run(&program, &mut attrs).unwrap(), Outcome::Ok);
        assert_eq!(m.outputs()[0], 15);
    }

    #[test]
    fn return_without_call_underflows() {
        let mut attrs = MapAttrs::new();
        let mut b = ProgramBuilder::new();
        b.ret();
        let (r, _) = run_exec(b.finish(), &mut attrs);
        assert!(matches!(
            r.unwrap_err().kind,
            ErrorKind::Interp(InterpError::StackUnderflow)
        ));
    }

    #[test]
    fn typed_attr_branch_with_like() {
        let mut attrs = MapAttrs::new();
        attrs.set(2, Some(b"hello world"));
        let mut b = ProgramBuilder::new();
        let hit = b.label();
        b.branch_attr_arg(2, CondCode::Like, NullSemantics::Legacy, b"hello%", hit);
        b.exit_refuse(1);
        b.bind(hit);
        b.exit_ok();
        let (r, _) = run_exec(b.finish(), &mut attrs);
        assert_eq!(r.unwrap(), Outcome::Ok);
    }

    #[test]
    fn typed_attr_branch_null_modes() {
        let mut attrs = MapAttrs::new();
        attrs.set(1, None);
        // AND semantics: null branches out
        let mut b = ProgramBuilder::new();
        let out = b.label();
        b.branch_attr_arg(
            1,
            CondCode::Eq,
            NullSemantics::BranchIfNull,
            &0u64.to_le_bytes(),
            out,
        );
        b.exit_ok();
        b.bind(out);
        b.exit_refuse(9);
        let (r, _) = run_exec(b.finish(), &mut attrs);
        assert_eq!(r.unwrap(), Outcome::Refuse(9));
    }

    #[test]
    fn same_program_same_outputs() {
        use proptest::prelude::*;
        proptest::proptest!(|(seed in any::<u32>(), v in any::<u32>())| {
            let mut attrs = MapAttrs::new();
            attrs.set(0, Some(&v.to_le_bytes()));
            let mut b = ProgramBuilder::new();
            let refuse = b.label();
            b.read_attr_to_reg(0, 0);
            b.arith_const(Op::XorConstReg, 1, 0, (seed & 0xFFFF) as u16);
            b.branch_const(Op::BranchGtConst, 1, 100, refuse);
            b.exit_ok();
            b.bind(refuse);
            b.exit_refuse(7);
            let exec = b.finish();
            let (r1, m1) = run_exec(exec.clone(), &mut attrs);
            let (r2, m2) = run_exec(exec, &mut attrs);
            prop_assert_eq!(r1.unwrap(), r2.unwrap());
            prop_assert_eq!(m1.executed(), m2.executed());
            prop_assert_eq!(m1.outputs(), m2.outputs());
        });
    }
}
