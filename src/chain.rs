//! Per-row operation chains: arena-allocated op records, the
//! prepare/publish split, and reader visibility resolution.
//!
//! A row's header word 0 roots a singly linked list of in-flight ops,
//! newest first. Writers prepare an op (capturing the predecessor and
//! inheriting its carried state) before touching the row, and publish it
//! into the list under the row's page mutex only after the row write
//! completed. Between the two steps the op is invisible to readers.

use bitflags::bitflags;

use crate::error::ErrorKind;
use crate::rowcodec::{CopyRow, DiskRef, HeaderBits, PartSizes, RowMut};
use crate::{fault, RowId, SeqError, TransId, TupError, RNIL};

/// Stable index of an op record in its arena.
pub type OpRef = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpType {
    Read,
    Insert,
    Update,
    Delete,
    Refresh,
}

/// Lifecycle of an op record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    /// Seized and being built; not yet in any row's list.
    Building,
    /// Published; waiting for transaction commit or abort.
    Prepared,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct OpFlags: u32 {
        const IN_ACTIVE_LIST            = 1 << 0;
        const DISABLE_FK                = 1 << 1;
        const DEFERRED_CONSTRAINTS      = 1 << 2;
        const LOAD_DISKPAGE_ON_COMMIT   = 1 << 3;
        const LOAD_EXTRA_DISKPAGE_ON_COMMIT = 1 << 4;
        const WAIT_LOG_BUFFER           = 1 << 5;
        const DISK_PREALLOCATED         = 1 << 6;
        const GCI_WRITTEN               = 1 << 7;
        const DELETE_INSERT             = 1 << 8;
        const TRIGGERS                  = 1 << 9;
        const TUPLE_EXISTED_AT_START    = 1 << 10;
    }
}

/// Flags inherited from the predecessor when an op joins a chain, and
/// cleared on the predecessor because the new leader owns them.
const LEADER_FLAGS: OpFlags = OpFlags::WAIT_LOG_BUFFER
    .union(OpFlags::LOAD_DISKPAGE_ON_COMMIT)
    .union(OpFlags::LOAD_EXTRA_DISKPAGE_ON_COMMIT);

/// One in-flight DML operation on one row.
#[derive(Debug)]
pub struct OpRecord {
    pub op_type: OpType,
    pub state: OpState,
    pub tuple_location: RowId,
    /// The working copy this op produced; carries the image readers at
    /// this op's savepoint see.
    pub copy: Option<CopyRow>,
    pub tup_version: u16,
    pub savepoint_id: u64,
    pub trans: TransId,
    pub user_ptr: u64,
    pub any_value: u32,
    /// Toward older ops.
    pub prev_in_row: OpRef,
    /// Toward newer ops; RNIL on the chain leader.
    pub next_in_row: OpRef,
    /// Resolved page for the deferred disk write at commit.
    pub disk_callback_page: u64,
    /// Resolved page for the DISK_REORG target.
    pub disk_extra_callback_page: u64,
    /// Words reserved on the UNDO log; never released mid-transaction.
    pub undo_buffer_space: u32,
    /// Words preallocated on the original disk page.
    pub uncommitted_used_space: u32,
    pub flags: OpFlags,
    /// Packed sizes recorded after shrink.
    pub sizes: PartSizes,
    /// New disk location after a DISK_REORG transition.
    pub disk_reorg_ref: Option<DiskRef>,
    /// Header bits of the base row before this op touched it, for abort.
    pub bits_before: HeaderBits,
    /// GCI of the base row before this op touched it, for abort.
    pub gci_before: u32,
}

impl OpRecord {
    fn new(op_type: OpType, tuple_location: RowId, trans: TransId, savepoint_id: u64) -> Self {
        Self {
            op_type,
            state: OpState::Building,
            tuple_location,
            copy: None,
            tup_version: 0,
            savepoint_id,
            trans,
            user_ptr: 0,
            any_value: 0,
            prev_in_row: RNIL,
            next_in_row: RNIL,
            disk_callback_page: 0,
            disk_extra_callback_page: 0,
            undo_buffer_space: 0,
            uncommitted_used_space: 0,
            flags: OpFlags::empty(),
            sizes: PartSizes::default(),
            disk_reorg_ref: None,
            bits_before: HeaderBits::empty(),
            gci_before: 0,
        }
    }
}

enum Slot {
    Occupied(Box<OpRecord>),
    Free(u32),
}

/// Arena of op records keyed by stable indices; no raw pointers anywhere
/// in the chain structure.
pub struct OpArena {
    slots: Vec<Slot>,
    free_head: u32,
    live: usize,
}

impl Default for OpArena {
    fn default() -> Self {
        Self::new()
    }
}

impl OpArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: RNIL,
            live: 0,
        }
    }

    pub fn live_ops(&self) -> usize {
        self.live
    }

    /// Seize a fresh op record.
    pub fn seize(
        &mut self,
        op_type: OpType,
        tuple_location: RowId,
        trans: TransId,
        savepoint_id: u64,
    ) -> OpRef {
        let rec = Box::new(OpRecord::new(op_type, tuple_location, trans, savepoint_id));
        self.live += 1;
        if self.free_head != RNIL {
            let idx = self.free_head;
            match self.slots[idx as usize] {
                Slot::Free(next) => self.free_head = next,
                Slot::Occupied(_) => unreachable!("free list points at a live op"),
            }
            self.slots[idx as usize] = Slot::Occupied(rec);
            idx
        } else {
            self.slots.push(Slot::Occupied(rec));
            (self.slots.len() - 1) as OpRef
        }
    }

    /// Release an op record back to the arena.
    pub fn release(&mut self, op: OpRef) {
        debug_assert!(matches!(self.slots[op as usize], Slot::Occupied(_)));
        self.slots[op as usize] = Slot::Free(self.free_head);
        self.free_head = op;
        self.live -= 1;
    }

    pub fn get(&self, op: OpRef) -> &OpRecord {
        match &self.slots[op as usize] {
            Slot::Occupied(rec) => rec,
            Slot::Free(_) => panic!("dangling op reference {op}"),
        }
    }

    pub fn get_mut(&mut self, op: OpRef) -> &mut OpRecord {
        match &mut self.slots[op as usize] {
            Slot::Occupied(rec) => rec,
            Slot::Free(_) => panic!("dangling op reference {op}"),
        }
    }

    pub fn is_live(&self, op: OpRef) -> bool {
        op != RNIL
            && (op as usize) < self.slots.len()
            && matches!(self.slots[op as usize], Slot::Occupied(_))
    }
}

/// Capture the predecessor and inherit its carried state. Returns the
/// predecessor ref (RNIL for the first op on the row). The op is NOT yet
/// visible to readers; call [`publish`] after the row write completed.
pub fn prepare(arena: &mut OpArena, op: OpRef, base_op_ptr: OpRef) -> Result<OpRef, TupError> {
    debug_assert!(!arena.get(op).flags.contains(OpFlags::IN_ACTIVE_LIST));
    arena.get_mut(op).prev_in_row = base_op_ptr;
    arena.get_mut(op).undo_buffer_space = 0;
    if base_op_ptr == RNIL {
        return Ok(RNIL);
    }

    let (prev_state, prev_type, inherited, undo, uncommitted, any_value) = {
        let prev = arena.get(base_op_ptr);
        (
            prev.state,
            prev.op_type,
            prev.flags
                & (LEADER_FLAGS | OpFlags::GCI_WRITTEN | OpFlags::TUPLE_EXISTED_AT_START),
            prev.undo_buffer_space,
            prev.uncommitted_used_space,
            prev.any_value,
        )
    };

    {
        let rec = arena.get_mut(op);
        rec.flags |= inherited;
        rec.undo_buffer_space = undo;
        rec.uncommitted_used_space = uncommitted;
        rec.any_value = any_value;
    }
    // the new leader owns the commit-time page loads and log waits
    arena.get_mut(base_op_ptr).flags &= !LEADER_FLAGS;

    if prev_state != OpState::Prepared {
        return Err(fault!(SeqError::MustBeAborted));
    }

    let op_type = arena.get(op).op_type;
    match (prev_type, op_type) {
        (OpType::Delete, OpType::Insert) => {
            arena.get_mut(base_op_ptr).flags |= OpFlags::DELETE_INSERT;
            arena.get_mut(op).flags |= OpFlags::DELETE_INSERT;
        }
        (OpType::Delete, OpType::Refresh) => {}
        (OpType::Delete, _) => return Err(fault!(SeqError::TupleDeleted)),
        (_, OpType::Insert) => return Err(fault!(SeqError::AlreadyExists)),
        (OpType::Refresh, _) => return Err(fault!(SeqError::RefreshFollow)),
        _ => {}
    }
    Ok(base_op_ptr)
}

/// Undo a [`prepare`] that will not reach [`publish`]: hand the
/// commit-time obligations back to the predecessor before the op record
/// is released.
pub fn unprepare(arena: &mut OpArena, op: OpRef) {
    let prev = arena.get(op).prev_in_row;
    if prev != RNIL && arena.is_live(prev) {
        let restored = arena.get(op).flags & LEADER_FLAGS;
        arena.get_mut(prev).flags |= restored;
    }
}

/// Link a prepared op into the row's list, under the row's page mutex.
/// The operation-pointer word is outside the checksum span, so no
/// checksum maintenance happens here.
pub fn publish(arena: &mut OpArena, op: OpRef, row: &mut RowMut<'_>) {
    let prev = {
        let rec = arena.get_mut(op);
        rec.flags |= OpFlags::IN_ACTIVE_LIST;
        rec.state = OpState::Prepared;
        rec.prev_in_row
    };
    row.set_op_ptr(op);
    if prev != RNIL {
        arena.get_mut(prev).next_in_row = op;
    }
}

/// Take a published op back out of the row's list (abort of the chain
/// leader). Under the row's page mutex.
pub fn unpublish(arena: &mut OpArena, op: OpRef, row: &mut RowMut<'_>) {
    let prev = arena.get(op).prev_in_row;
    debug_assert_eq!(row.op_ptr(), op, "only the leader can unpublish");
    row.set_op_ptr(prev);
    if prev != RNIL {
        let p = arena.get_mut(prev);
        p.next_in_row = RNIL;
        // the old leader takes back the commit-time obligations
        let restored = arena.get(op).flags & LEADER_FLAGS;
        arena.get_mut(prev).flags |= restored;
    }
    let rec = arena.get_mut(op);
    rec.flags.remove(OpFlags::IN_ACTIVE_LIST);
    rec.state = OpState::Building;
}

/// What a reader resolved a row to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visible {
    /// The committed base row image.
    Base,
    /// The working copy of this op.
    Op(OpRef),
    /// Nothing: deleted at this savepoint, or an uncommitted insert seen
    /// from outside its transaction.
    Invisible,
}

/// Reader identity and mode.
#[derive(Clone, Copy, Debug)]
pub struct ReadCtx {
    pub savepoint: u64,
    pub trans: TransId,
    pub dirty: bool,
}

/// Resolve which image of a row a reader sees.
///
/// Same-transaction readers stop at the newest op whose savepoint
/// precedes theirs; everyone else sees only the committed image. A
/// same-transaction dirty read degrades to a savepoint read; a
/// foreign dirty read sees committed state only.
pub fn find_visible(arena: &OpArena, head: OpRef, base_bits: HeaderBits, ctx: &ReadCtx) -> Visible {
    if head == RNIL {
        return Visible::Base;
    }
    let same_trans = arena.get(head).trans == ctx.trans;
    // Foreign readers see committed state only, dirty or not; a
    // same-transaction dirty read degrades to a savepoint read.
    let (savepoint, dirty) = if same_trans {
        (ctx.savepoint, false)
    } else {
        (0, true)
    };

    let mut stop = RNIL;
    let mut cur = head;
    while cur != RNIL {
        let op = arena.get(cur);
        if op.savepoint_id < savepoint {
            stop = cur;
            break;
        }
        cur = op.prev_in_row;
    }
    let found = stop != RNIL;
    let is_insert = base_bits.contains(HeaderBits::ALLOC);

    if (found && arena.get(stop).op_type == OpType::Delete) || ((dirty || !found) && is_insert) {
        return Visible::Invisible;
    }
    if dirty || !found {
        return Visible::Base;
    }
    Visible::Op(stop)
}

/// Walk the chain newest-first, yielding op refs. For invariant checks
/// and the abort path.
pub fn chain_iter(arena: &OpArena, head: OpRef) -> impl Iterator<Item = OpRef> + '_ {
    let mut cur = head;
    std::iter::from_fn(move || {
        if cur == RNIL {
            return None;
        }
        let this = cur;
        cur = arena.get(cur).prev_in_row;
        Some(this)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seize_published(
        arena: &mut OpArena,
        row: &mut Vec<u8>,
        op_type: OpType,
        sp: u64,
    ) -> OpRef {
        let trans = TransId::new(1, 1);
        let op = arena.seize(op_type, RowId::new(0, 0), trans, sp);
        let head = RowMut(row).op_ptr();
        prepare(arena, op, head).unwrap();
        let mut rm = RowMut(row);
        publish(arena, op, &mut rm);
        op
    }

    fn empty_row() -> Vec<u8> {
        let mut row = vec![0u8; 20];
        RowMut(&mut row).set_op_ptr(RNIL);
        row
    }

    #[test]
    fn chain_links_in_publication_order() {
        let mut arena = OpArena::new();
        let mut row = empty_row();
        let a = seize_published(&mut arena, &mut row, OpType::Insert, 1);
        let b = seize_published(&mut arena, &mut row, OpType::Update, 2);
        let c = seize_published(&mut arena, &mut row, OpType::Update, 3);
        assert_eq!(RowMut(&mut row).op_ptr(), c);
        let refs: Vec<_> = chain_iter(&arena, c).collect();
        assert_eq!(refs, vec![c, b, a]);
        // head's next is nil, prev links consistent
        assert_eq!(arena.get(c).next_in_row, RNIL);
        assert_eq!(arena.get(b).next_in_row, c);
        assert_eq!(arena.get(a).next_in_row, b);
    }

    #[test]
    fn forbidden_sequences() {
        let mut arena = OpArena::new();
        let mut row = empty_row();
        let trans = TransId::new(1, 1);

        let upd = seize_published(&mut arena, &mut row, OpType::Update, 1);
        let ins = arena.seize(OpType::Insert, RowId::new(0, 0), trans, 2);
        let err = prepare(&mut arena, ins, upd).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Seq(SeqError::AlreadyExists)));
        arena.release(ins);

        let del = seize_published(&mut arena, &mut row, OpType::Delete, 2);
        let upd2 = arena.seize(OpType::Update, RowId::new(0, 0), trans, 3);
        let err = prepare(&mut arena, upd2, del).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Seq(SeqError::TupleDeleted)));
        arena.release(upd2);

        // insert after delete is the refresh pattern; both get marked
        let ins2 = arena.seize(OpType::Insert, RowId::new(0, 0), trans, 3);
        prepare(&mut arena, ins2, del).unwrap();
        assert!(arena.get(ins2).flags.contains(OpFlags::DELETE_INSERT));
        assert!(arena.get(del).flags.contains(OpFlags::DELETE_INSERT));
    }

    #[test]
    fn refresh_terminates_chain() {
        let mut arena = OpArena::new();
        let mut row = empty_row();
        let trans = TransId::new(1, 1);
        let rf = seize_published(&mut arena, &mut row, OpType::Refresh, 1);
        let upd = arena.seize(OpType::Update, RowId::new(0, 0), trans, 2);
        let err = prepare(&mut arena, upd, rf).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Seq(SeqError::RefreshFollow)));
    }

    #[test]
    fn leader_flags_move_with_the_head() {
        let mut arena = OpArena::new();
        let mut row = empty_row();
        let a = seize_published(&mut arena, &mut row, OpType::Update, 1);
        arena.get_mut(a).flags |= OpFlags::LOAD_DISKPAGE_ON_COMMIT | OpFlags::WAIT_LOG_BUFFER;
        arena.get_mut(a).undo_buffer_space = 40;

        let b = seize_published(&mut arena, &mut row, OpType::Update, 2);
        assert!(arena.get(b).flags.contains(OpFlags::LOAD_DISKPAGE_ON_COMMIT));
        assert!(!arena.get(a).flags.contains(OpFlags::LOAD_DISKPAGE_ON_COMMIT));
        assert_eq!(arena.get(b).undo_buffer_space, 40);

        // abort of the leader hands the obligations back
        let mut rm = RowMut(&mut row);
        unpublish(&mut arena, b, &mut rm);
        assert!(arena.get(a).flags.contains(OpFlags::LOAD_DISKPAGE_ON_COMMIT));
        assert_eq!(rm.op_ptr(), a);
    }

    #[test]
    fn visibility_savepoint_rule() {
        let mut arena = OpArena::new();
        let mut row = empty_row();
        let trans = TransId::new(1, 1);
        let a = seize_published(&mut arena, &mut row, OpType::Update, 2);
        let b = seize_published(&mut arena, &mut row, OpType::Update, 5);
        let head = b;

        let see = |sp: u64, trans: TransId, dirty: bool| {
            find_visible(
                &arena,
                head,
                HeaderBits::empty(),
                &ReadCtx {
                    savepoint: sp,
                    trans,
                    dirty,
                },
            )
        };

        // each savepoint sees the op preceding it
        assert_eq!(see(1, trans, false), Visible::Base);
        assert_eq!(see(3, trans, false), Visible::Op(a));
        assert_eq!(see(6, trans, false), Visible::Op(b));
        // another transaction sees committed state only
        assert_eq!(see(6, TransId::new(9, 9), false), Visible::Base);
        assert_eq!(see(6, TransId::new(9, 9), true), Visible::Base);
    }

    #[test]
    fn uncommitted_insert_invisible_outside_its_transaction() {
        let mut arena = OpArena::new();
        let mut row = empty_row();
        let trans = TransId::new(1, 1);
        let ins = seize_published(&mut arena, &mut row, OpType::Insert, 2);
        let bits = HeaderBits::ALLOC;

        let own = find_visible(
            &arena,
            ins,
            bits,
            &ReadCtx {
                savepoint: 3,
                trans,
                dirty: false,
            },
        );
        assert_eq!(own, Visible::Op(ins));

        let foreign = find_visible(
            &arena,
            ins,
            bits,
            &ReadCtx {
                savepoint: 3,
                trans: TransId::new(2, 2),
                dirty: true,
            },
        );
        assert_eq!(foreign, Visible::Invisible);
    }

    #[test]
    fn chain_shape_and_savepoint_visibility() {
        use proptest::prelude::*;
        proptest::proptest!(|(sps in proptest::collection::vec(1u64..50, 1..8))| {
            let mut sps = sps;
            sps.sort_unstable();
            sps.dedup();
            let trans = TransId::new(1, 1);
            let mut arena = OpArena::new();
            let mut row = empty_row();
            let mut published: Vec<(u64, OpRef)> = Vec::new();
            for (i, &sp) in sps.iter().enumerate() {
                let ty = if i == 0 { OpType::Insert } else { OpType::Update };
                let op = seize_published(&mut arena, &mut row, ty, sp);
                published.push((sp, op));
            }
            let head = RowMut(&mut row).op_ptr();

            // acyclic, head's next nil, prev links in publication order
            let refs: Vec<_> = chain_iter(&arena, head).collect();
            prop_assert_eq!(refs.len(), published.len());
            prop_assert_eq!(arena.get(head).next_in_row, RNIL);
            for w in refs.windows(2) {
                prop_assert_eq!(arena.get(w[1]).next_in_row, w[0]);
                prop_assert_eq!(arena.get(w[0]).prev_in_row, w[1]);
            }

            // a savepoint-k read sees the image of the newest op
            // before k; before the insert the row does not exist
            for probe in 0..52u64 {
                let v = find_visible(
                    &arena,
                    head,
                    HeaderBits::ALLOC,
                    &ReadCtx {
                        savepoint: probe,
                        trans,
                        dirty: false,
                    },
                );
                match published.iter().rev().find(|(sp, _)| *sp < probe) {
                    None => prop_assert_eq!(v, Visible::Invisible),
                    Some((_, op)) => prop_assert_eq!(v, Visible::Op(*op)),
                }
            }
        });
    }

    #[test]
    fn delete_hides_the_row_at_later_savepoints() {
        let mut arena = OpArena::new();
        let mut row = empty_row();
        let trans = TransId::new(1, 1);
        let _upd = seize_published(&mut arena, &mut row, OpType::Update, 1);
        let del = seize_published(&mut arena, &mut row, OpType::Delete, 4);
        let v = find_visible(
            &arena,
            del,
            HeaderBits::empty(),
            &ReadCtx {
                savepoint: 9,
                trans,
                dirty: false,
            },
        );
        assert_eq!(v, Visible::Invisible);
    }
}
