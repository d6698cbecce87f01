//! The worker slot: the binary ABI between coordinator and one worker. §3,
//! §4.5.
//!
//! Instruction and state are separate atomics with an explicit
//! release/acquire pairing (§5): the coordinator's `Release` store to
//! `sorter_instruction` publishes every other field it wrote beforehand
//! (`mid_point`, the working table handle); the worker's matching
//! `Acquire` load sees all of it. Symmetrically, the worker's `Release`
//! store to `compressor_state` publishes its outcome to the coordinator's
//! `Acquire` load. No other cross-slot ordering is required — each slot is
//! single-writer-per-field.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::bitfield::SortedBitFields;
use crate::cancel::CancelToken;
use crate::table::RoutingTable;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressorState {
    Unused = 0,
    Prepared = 1,
    Compressing = 2,
    Successful = 3,
    FailedMalloc = 4,
    FailedNoMerges = 5,
    /// Reserved: the worker's own internal tick-based budget is not
    /// implemented separately from coordinator-issued `ForceStop` in this
    /// port (§5: "no wall-clock timeout inside the minimiser"), so nothing
    /// currently produces this state. Kept so the taxonomy in §3 round-trips.
    FailedTimeout = 6,
    ForcedStop = 7,
}

impl CompressorState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unused,
            1 => Self::Prepared,
            2 => Self::Compressing,
            3 => Self::Successful,
            4 => Self::FailedMalloc,
            5 => Self::FailedNoMerges,
            6 => Self::FailedTimeout,
            7 => Self::ForcedStop,
            other => unreachable!("invalid CompressorState encoding {other}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Successful
                | Self::FailedMalloc
                | Self::FailedNoMerges
                | Self::FailedTimeout
                | Self::ForcedStop
        )
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SorterInstruction {
    NotCompressor = 0,
    ToBePrepared = 1,
    Prepare = 2,
    Run = 3,
    ForceStop = 4,
    DoNotUse = 5,
}

impl SorterInstruction {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotCompressor,
            1 => Self::ToBePrepared,
            2 => Self::Prepare,
            3 => Self::Run,
            4 => Self::ForceStop,
            5 => Self::DoNotUse,
            other => unreachable!("invalid SorterInstruction encoding {other}"),
        }
    }
}

/// One per worker, owned by the coordinator for its lifetime, never freed
/// (§3 "Lifecycle"). Workers mutate only `compressor_state` and the bytes
/// inside their own `working_table`.
#[derive(Debug)]
pub struct WorkerSlot {
    pub id: usize,
    compressor_state: AtomicU8,
    sorter_instruction: AtomicU8,
    /// Which `N` this worker is attempting; -1 when idle.
    mid_point: AtomicI64,
    /// The working table memory for the current attempt. Allocated by the
    /// coordinator before dispatch, owned by the worker while Compressing,
    /// reclaimed by the coordinator on outcome.
    pub working_table: Mutex<Option<RoutingTable>>,
    pub uncompressed_table: Arc<RoutingTable>,
    pub sorted_bitfields: Arc<SortedBitFields>,
    pub cancel: CancelToken,
}

impl WorkerSlot {
    pub fn new(
        id: usize,
        uncompressed_table: Arc<RoutingTable>,
        sorted_bitfields: Arc<SortedBitFields>,
    ) -> Self {
        Self {
            id,
            compressor_state: AtomicU8::new(CompressorState::Unused as u8),
            sorter_instruction: AtomicU8::new(SorterInstruction::NotCompressor as u8),
            mid_point: AtomicI64::new(-1),
            working_table: Mutex::new(None),
            uncompressed_table,
            sorted_bitfields,
            cancel: CancelToken::new(),
        }
    }

    #[inline]
    pub fn state(&self) -> CompressorState {
        CompressorState::from_u8(self.compressor_state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: CompressorState) {
        self.compressor_state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn instruction(&self) -> SorterInstruction {
        SorterInstruction::from_u8(self.sorter_instruction.load(Ordering::Acquire))
    }

    #[inline]
    pub fn mid_point(&self) -> i64 {
        self.mid_point.load(Ordering::Relaxed)
    }

    /// Dispatch this worker onto `n`, handing it `table` to compress.
    /// `mid_point` is written with `Relaxed` ordering but is published by
    /// the following `Release` store to `sorter_instruction`.
    pub fn dispatch(&self, n: i64, table: RoutingTable) {
        *self.working_table.lock() = Some(table);
        self.mid_point.store(n, Ordering::Relaxed);
        self.cancel.reset();
        self.sorter_instruction
            .store(SorterInstruction::Run as u8, Ordering::Release);
    }

    pub fn request_prepare(&self) {
        self.mid_point.store(-1, Ordering::Relaxed);
        self.sorter_instruction
            .store(SorterInstruction::ToBePrepared as u8, Ordering::Release);
    }

    pub fn recycle(&self) {
        self.mid_point.store(-1, Ordering::Relaxed);
        self.sorter_instruction
            .store(SorterInstruction::Prepare as u8, Ordering::Release);
    }

    /// Advisory: the worker may complete naturally before observing this.
    pub fn force_stop(&self) {
        self.cancel.set();
        self.sorter_instruction
            .store(SorterInstruction::ForceStop as u8, Ordering::Release);
    }

    pub fn retire(&self) {
        self.sorter_instruction
            .store(SorterInstruction::DoNotUse as u8, Ordering::Release);
    }

    pub fn take_working_table(&self) -> Option<RoutingTable> {
        self.working_table.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> WorkerSlot {
        WorkerSlot::new(
            0,
            Arc::new(RoutingTable::new()),
            Arc::new(SortedBitFields::new(vec![], vec![], vec![])),
        )
    }

    #[test]
    fn new_slot_starts_unused_and_idle() {
        let s = slot();
        assert_eq!(s.state(), CompressorState::Unused);
        assert_eq!(s.instruction(), SorterInstruction::NotCompressor);
        assert_eq!(s.mid_point(), -1);
    }

    #[test]
    fn request_prepare_resets_mid_point_and_asks_to_be_prepared() {
        let s = slot();
        s.dispatch(3, RoutingTable::new());
        s.request_prepare();
        assert_eq!(s.instruction(), SorterInstruction::ToBePrepared);
        assert_eq!(s.mid_point(), -1);
    }

    #[test]
    fn dispatch_publishes_mid_point_table_and_run_instruction() {
        let s = slot();
        s.dispatch(7, RoutingTable::from_entries(vec![]));
        assert_eq!(s.mid_point(), 7);
        assert_eq!(s.instruction(), SorterInstruction::Run);
        assert!(s.working_table.lock().is_some());
    }

    #[test]
    fn recycle_clears_mid_point_without_touching_state() {
        let s = slot();
        s.set_state(CompressorState::Successful);
        s.dispatch(2, RoutingTable::new());
        s.recycle();
        assert_eq!(s.instruction(), SorterInstruction::Prepare);
        assert_eq!(s.mid_point(), -1);
        // recycle() is the coordinator's half of the handshake; state only
        // moves once the worker itself re-prepares.
        assert_eq!(s.state(), CompressorState::Successful);
    }

    #[test]
    fn force_stop_sets_cancel_and_instruction_but_not_state() {
        let s = slot();
        s.set_state(CompressorState::Compressing);
        s.force_stop();
        assert!(s.cancel.is_set());
        assert_eq!(s.instruction(), SorterInstruction::ForceStop);
        assert_eq!(s.state(), CompressorState::Compressing);
    }

    #[test]
    fn retire_marks_do_not_use() {
        let s = slot();
        s.retire();
        assert_eq!(s.instruction(), SorterInstruction::DoNotUse);
    }

    #[test]
    fn take_working_table_empties_the_slot() {
        let s = slot();
        s.dispatch(1, RoutingTable::from_entries(vec![]));
        assert!(s.take_working_table().is_some());
        assert!(s.working_table.lock().is_none());
    }
}
