//! Compressor worker: consumes a slot's instruction, runs the minimiser,
//! reports an outcome. §4.5.

use std::sync::Arc;
use std::time::Duration;

use crate::minimiser::{self, AlwaysAvailable, MinimiseOutcome};
use crate::slot::{CompressorState, SorterInstruction, WorkerSlot};

const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Runs until the slot is retired (`DoNotUse`). Intended to be spawned as
/// its own thread, standing in for the original's independent compressor
/// process.
pub fn run_worker(slot: Arc<WorkerSlot>, capacity: usize) {
    run_worker_with_allocator(slot, capacity, Box::new(AlwaysAvailable))
}

/// Same as [`run_worker`], but with the scratch allocator pluggable so
/// tests can inject spurious `FailedMalloc` outcomes (§8 scenario f).
pub fn run_worker_with_allocator(
    slot: Arc<WorkerSlot>,
    capacity: usize,
    mut alloc: Box<dyn minimiser::ScratchAllocator + Send>,
) {
    loop {
        match slot.instruction() {
            SorterInstruction::DoNotUse => return,

            SorterInstruction::NotCompressor => {}

            SorterInstruction::ToBePrepared | SorterInstruction::Prepare => {
                if !matches!(slot.state(), CompressorState::Compressing) {
                    slot.set_state(CompressorState::Prepared);
                }
            }

            SorterInstruction::Run => {
                if slot.state() == CompressorState::Prepared {
                    run_one_attempt(&slot, capacity, alloc.as_mut());
                }
            }

            // Usually observed through the shared cancel token inside
            // `run_one_attempt`'s call to `minimise`, which is synchronous.
            // But `ForceStop` can also overtake `Run` before this thread
            // ever reads it (dispatch-then-immediately-cancel); in that
            // case the attempt never starts, so nothing will otherwise
            // move the slot out of `Prepared`. Settle it here instead.
            SorterInstruction::ForceStop => {
                if slot.state() == CompressorState::Prepared {
                    slot.set_state(CompressorState::ForcedStop);
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn run_one_attempt(slot: &WorkerSlot, capacity: usize, alloc: &mut dyn minimiser::ScratchAllocator) {
    slot.set_state(CompressorState::Compressing);

    let outcome = {
        let mut guard = slot.working_table.lock();
        let table = guard
            .as_mut()
            .expect("Run instruction dispatched without a working table");
        minimiser::minimise(table, capacity, &slot.cancel, alloc)
    };

    let final_state = match outcome {
        MinimiseOutcome::Successful => CompressorState::Successful,
        MinimiseOutcome::FailedNoMerges => CompressorState::FailedNoMerges,
        MinimiseOutcome::FailedMalloc => CompressorState::FailedMalloc,
        MinimiseOutcome::Cancelled => CompressorState::ForcedStop,
    };
    tracing::debug!(
        slot = slot.id,
        mid_point = slot.mid_point(),
        ?final_state,
        "worker finished attempt"
    );
    slot.set_state(final_state);
}
