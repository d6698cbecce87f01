//! The coordinator: drives the parallel binary search over how many
//! bit-fields to fold in, owns worker lifecycle, and installs the winning
//! table. §4.6.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use hashbrown::HashMap as FastHashMap;

use crate::bitfield::{self, SortedBitFields};
use crate::config::{CompressionMode, SorterConfig};
use crate::errors::{ExitStatus, SorterError, SorterResult};
use crate::minimiser::{AlwaysAvailable, ScratchAllocator};
use crate::router_install::RouterInstaller;
use crate::slot::{CompressorState, SorterInstruction, WorkerSlot};
use crate::table::RoutingTable;
use crate::worker;

/// Builds a fresh [`ScratchAllocator`] per worker thread. Defaults to
/// always-succeeding; tests substitute a flaky factory to exercise the
/// retry-with-retirement semantics of §8 scenario f.
type AllocFactory = Arc<dyn Fn() -> Box<dyn ScratchAllocator + Send> + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Echoed to the host on completion (§6 Outputs).
#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchReport {
    pub best_success: i64,
    pub tested_mid_points: Vec<bool>,
    pub exit_status: ExitStatus,
    pub n_merged_filters: FastHashMap<u32, u32>,
}

pub struct Sorter {
    config: SorterConfig,
    uncompressed_table: Arc<RoutingTable>,
    sorted_bitfields: Arc<SortedBitFields>,
    slots: Vec<Arc<WorkerSlot>>,
    handles: Vec<JoinHandle<()>>,
    m: usize,
    /// Largest N verified to produce a table that fits: the adoption /
    /// reporting target, preferring more filters folded in when several
    /// feasible N have been tried (§4.6 finalisation).
    best_success: i64,
    /// Smallest N verified to succeed: the generator (§4.3) only ever
    /// drops entries as N grows, so success is upward-closed — this is
    /// the upper edge of the still-unknown search gap.
    lowest_success: i64,
    /// Largest N verified to fail: failure is downward-closed (a bigger
    /// candidate table can only get harder to fit, never easier), so
    /// this is the lower edge of the still-unknown search gap.
    highest_failure: i64,
    tested: Vec<bool>,
    last_compressed_table: Option<RoutingTable>,
    malloc_streak: FastHashMap<i64, u32>,
    distinct_defeated: u32,
    alloc_factory: AllocFactory,
}

impl Sorter {
    pub fn new(
        config: SorterConfig,
        uncompressed_table: Arc<RoutingTable>,
        sorted_bitfields: Arc<SortedBitFields>,
    ) -> Self {
        Self::with_allocator_factory(
            config,
            uncompressed_table,
            sorted_bitfields,
            Arc::new(|| Box::new(AlwaysAvailable) as Box<dyn ScratchAllocator + Send>),
        )
    }

    /// Same as [`Sorter::new`], but with the per-worker scratch allocator
    /// pluggable. Lets tests inject spurious `FailedMalloc` outcomes to
    /// verify the coordinator's retry-with-retirement semantics still
    /// converge on the true feasibility boundary (§8 scenario f).
    pub fn with_allocator_factory(
        config: SorterConfig,
        uncompressed_table: Arc<RoutingTable>,
        sorted_bitfields: Arc<SortedBitFields>,
        alloc_factory: AllocFactory,
    ) -> Self {
        let m = sorted_bitfields.len();
        Self {
            best_success: -1,
            lowest_success: m as i64 + 1,
            highest_failure: -1,
            tested: vec![false; m + 1],
            last_compressed_table: None,
            malloc_streak: FastHashMap::new(),
            distinct_defeated: 0,
            slots: Vec::with_capacity(config.n_workers),
            handles: Vec::with_capacity(config.n_workers),
            m,
            config,
            uncompressed_table,
            sorted_bitfields,
            alloc_factory,
        }
    }

    pub fn best_success(&self) -> i64 {
        self.best_success
    }

    pub fn tested_mid_points(&self) -> &[bool] {
        &self.tested
    }

    fn tested_set(&mut self, n: i64, value: bool) {
        self.tested[n as usize] = value;
    }

    /// Run the whole search to completion and install the winning table.
    pub fn run(mut self, installer: &mut dyn RouterInstaller, app_id: u32) -> SorterResult<SearchReport> {
        if self.config.mode.contains(CompressionMode::ONLY_IF_NEEDED)
            && self.uncompressed_table.n_entries() <= self.config.capacity
        {
            tracing::info!("table already fits capacity; skipping search");
            self.best_success = 0;
            self.lowest_success = 0;
            self.last_compressed_table = Some((*self.uncompressed_table).clone());
            self.tested_set(0, true);
            return self.finalize(installer, app_id);
        }

        self.spawn_workers();
        self.bootstrap_all();
        self.run_baseline()?;
        self.seed_initial();

        loop {
            let mut progressed = self.drain_outcomes();

            if self.should_keep_searching() {
                while self.try_dispatch() {
                    progressed = true;
                }
            }

            let any_busy = self.slots.iter().any(|s| is_dispatched(s));
            let no_usable_workers = self
                .slots
                .iter()
                .all(|s| s.instruction() == SorterInstruction::DoNotUse);
            let exhausted = self.next_midpoint().is_none() || !self.should_keep_searching();

            if !any_busy && (exhausted || no_usable_workers) {
                break;
            }
            if !progressed {
                std::thread::sleep(POLL_INTERVAL);
            }
        }

        self.finalize(installer, app_id)
    }

    fn should_keep_searching(&self) -> bool {
        self.config.mode.contains(CompressionMode::AS_MUCH_AS_POSSIBLE) || self.best_success < 0
    }

    fn spawn_workers(&mut self) {
        for i in 0..self.config.n_workers {
            let slot = Arc::new(WorkerSlot::new(
                i,
                Arc::clone(&self.uncompressed_table),
                Arc::clone(&self.sorted_bitfields),
            ));
            let worker_slot = Arc::clone(&slot);
            let capacity = self.config.capacity;
            let alloc = (self.alloc_factory)();
            self.handles.push(std::thread::spawn(move || {
                worker::run_worker_with_allocator(worker_slot, capacity, alloc)
            }));
            self.slots.push(slot);
        }
    }

    /// Poll freshly-spawned workers for `Prepared` with bounded retries;
    /// a worker that never arrives is retired rather than blocking forever.
    fn bootstrap_all(&mut self) {
        for slot in &self.slots {
            slot.request_prepare();
        }
        for slot in &self.slots {
            let mut ready = false;
            for _ in 0..self.config.bootstrap_retries {
                if slot.state() == CompressorState::Prepared {
                    ready = true;
                    break;
                }
                std::thread::sleep(self.config.bootstrap_retry_delay);
            }
            if !ready {
                tracing::warn!(slot = slot.id, "worker did not bootstrap in time; retiring");
                slot.retire();
            }
        }
    }

    /// A slot is actually free for a new assignment only once *both*
    /// sides agree it's idle: `state() == Prepared` lags `dispatch()`'s
    /// `instruction = Run` until the worker thread wakes up and notices
    /// it, so checking state alone can hand out a slot that already has
    /// a pending (unobserved) attempt, clobbering it before the worker
    /// ever sees it.
    fn find_prepared_worker(&self) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.state() == CompressorState::Prepared
                && matches!(
                    s.instruction(),
                    SorterInstruction::ToBePrepared | SorterInstruction::Prepare
                )
        })
    }

    /// Baseline attempt (N=0, no bit-fields applied): the largest and
    /// hardest-to-fit candidate table, since every bit-field from here on
    /// can only drop entries (§4.3). Its failure is ordinary information
    /// for the search, not fatal on its own — only the absence of *any*
    /// successful midpoint by the time the search exhausts itself is
    /// (detected in `finalize`). Malloc failures at N=0 are always
    /// retried (never accepted as defeat), since losing the baseline
    /// attempt to noise would otherwise needlessly narrow the search.
    fn run_baseline(&mut self) -> SorterResult<()> {
        loop {
            let Some(worker_idx) = self.find_prepared_worker() else {
                return Ok(());
            };
            self.tested_set(0, true);
            let candidate = bitfield::generate_table_for_midpoint(&self.uncompressed_table, &self.sorted_bitfields, 0);
            self.slots[worker_idx].dispatch(0, candidate);

            while !self.slots[worker_idx].state().is_terminal() {
                std::thread::sleep(POLL_INTERVAL);
            }

            match self.slots[worker_idx].state() {
                CompressorState::Successful => {
                    let table = self.slots[worker_idx].take_working_table().unwrap();
                    self.best_success = 0;
                    self.lowest_success = 0;
                    self.last_compressed_table = Some(table);
                    self.slots[worker_idx].recycle();
                    return Ok(());
                }
                CompressorState::FailedNoMerges | CompressorState::FailedTimeout => {
                    let _ = self.slots[worker_idx].take_working_table();
                    self.highest_failure = 0;
                    self.slots[worker_idx].recycle();
                    return Ok(());
                }
                CompressorState::FailedMalloc => {
                    let _ = self.slots[worker_idx].take_working_table();
                    self.handle_malloc_failure(0);
                    self.slots[worker_idx].retire();
                    // loop: try again on a different worker
                }
                CompressorState::ForcedStop => {
                    let _ = self.slots[worker_idx].take_working_table();
                    self.slots[worker_idx].recycle();
                }
                _ => unreachable!("terminal state expected"),
            }
        }
    }

    /// Seed up to `n_workers` additional attempts spaced evenly down from
    /// `M`, in steps of `max(1, M / W)`.
    fn seed_initial(&mut self) {
        let w = self.config.n_workers.max(1);
        let step = (self.m / w).max(1) as i64;
        let mut n = self.m as i64;
        while n > 0 {
            if !self.tested[n as usize]
                && let Some(worker_idx) = self.find_prepared_worker()
            {
                self.tested_set(n, true);
                let candidate = bitfield::generate_table_for_midpoint(&self.uncompressed_table, &self.sorted_bitfields, n as usize);
                self.slots[worker_idx].dispatch(n, candidate);
            }
            n -= step;
        }
    }

    /// Process every slot sitting on a terminal outcome the coordinator
    /// hasn't consumed yet. Returns whether anything changed.
    fn drain_outcomes(&mut self) -> bool {
        let mut progressed = false;
        for i in 0..self.slots.len() {
            if is_dispatched(&self.slots[i]) && self.slots[i].state().is_terminal() {
                self.handle_outcome(i);
                progressed = true;
            }
        }
        progressed
    }

    fn handle_outcome(&mut self, slot_idx: usize) {
        let n = self.slots[slot_idx].mid_point();
        match self.slots[slot_idx].state() {
            CompressorState::Successful => {
                let table = self.slots[slot_idx].take_working_table().unwrap();
                if n > self.best_success {
                    tracing::info!(n, "adopted new best table");
                    self.best_success = n;
                    self.last_compressed_table = Some(table);
                }
                if n < self.lowest_success {
                    tracing::debug!(n, "new lowest known success");
                    self.lowest_success = n;
                    // Success is upward-closed (§4.3): every N' > n is
                    // already guaranteed to succeed too, so those workers
                    // are dominated.
                    for other in &self.slots {
                        let mid = other.mid_point();
                        if other.id != slot_idx && other.state() == CompressorState::Compressing && mid > n {
                            other.force_stop();
                        }
                    }
                }
                self.tested_set(n, true);
                self.slots[slot_idx].recycle();
            }
            CompressorState::FailedNoMerges | CompressorState::FailedTimeout => {
                let _ = self.slots[slot_idx].take_working_table();
                if n > self.highest_failure {
                    tracing::debug!(n, "new highest failure");
                    self.highest_failure = n;
                    // Failure is downward-closed: every N' < n is already
                    // guaranteed to fail too, so those workers are
                    // dominated.
                    for other in &self.slots {
                        let mid = other.mid_point();
                        if other.id != slot_idx
                            && other.state() == CompressorState::Compressing
                            && mid >= 0
                            && mid < n
                        {
                            other.force_stop();
                        }
                    }
                }
                self.tested_set(n, true);
                self.slots[slot_idx].recycle();
            }
            CompressorState::FailedMalloc => {
                let _ = self.slots[slot_idx].take_working_table();
                self.handle_malloc_failure(n);
                self.slots[slot_idx].retire();
            }
            CompressorState::ForcedStop => {
                let _ = self.slots[slot_idx].take_working_table();
                self.slots[slot_idx].recycle();
            }
            _ => unreachable!("handle_outcome called on a non-terminal slot"),
        }
    }

    /// §9 open question: the original's "multiple malloc detected" third
    /// branch is a heuristic of unclear optimality. Preserved verbatim as
    /// a tuning parameter: a midpoint accepts defeat (no retry) after two
    /// consecutive malloc failures, except N=0 which always retries; a
    /// third *distinct* midpoint hitting that threshold resets the whole
    /// throttle so the search cannot livelock by retiring every worker.
    fn handle_malloc_failure(&mut self, n: i64) {
        let streak = self.malloc_streak.entry(n).or_insert(0);
        *streak += 1;
        let streak_val = *streak;

        if n == 0 {
            self.tested_set(0, false);
            return;
        }

        if streak_val >= self.config.malloc_retry_threshold {
            self.distinct_defeated += 1;
            if self.distinct_defeated >= 3 {
                tracing::debug!("malloc throttle reset after three distinct defeats");
                self.malloc_streak.clear();
                self.distinct_defeated = 0;
                self.tested_set(n, false);
            }
            // else: accept defeat, tested[n] stays true.
        } else {
            self.tested_set(n, false);
        }
    }

    fn try_dispatch(&mut self) -> bool {
        let Some(n) = self.next_midpoint() else {
            return false;
        };
        let Some(worker_idx) = self.find_prepared_worker() else {
            return false;
        };
        self.tested_set(n, true);
        let candidate = bitfield::generate_table_for_midpoint(&self.uncompressed_table, &self.sorted_bitfields, n as usize);
        tracing::debug!(n, worker = worker_idx, "dispatching midpoint");
        self.slots[worker_idx].dispatch(n, candidate);
        true
    }

    /// Longest maximal run of untested indices within
    /// `(highest_failure, lowest_success)`; ties favour the later (higher
    /// N) run. Returns the midpoint of that run: `end - length / 2`.
    fn next_midpoint(&self) -> Option<i64> {
        let lo = self.highest_failure;
        let hi = self.lowest_success;
        if lo + 1 >= hi {
            return None;
        }

        let mut best: Option<(i64, i64)> = None;
        let mut run_start: Option<i64> = None;
        let mut idx = lo + 1;
        while idx < hi {
            if !self.tested[idx as usize] {
                if run_start.is_none() {
                    run_start = Some(idx);
                }
            } else if let Some(s) = run_start.take() {
                consider_run(&mut best, s, idx - 1);
            }
            idx += 1;
        }
        if let Some(s) = run_start {
            consider_run(&mut best, s, hi - 1);
        }

        best.map(|(start, end)| {
            let len = end - start + 1;
            end - len / 2
        })
    }

    fn finalize(mut self, installer: &mut dyn RouterInstaller, app_id: u32) -> SorterResult<SearchReport> {
        for slot in &self.slots {
            slot.retire();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }

        let best = self
            .last_compressed_table
            .take()
            .ok_or(SorterError::BaselineFailed)?;
        let requested = best.n_entries();

        installer
            .install(&best, app_id)
            .map_err(|_| SorterError::RouterAllocFailed {
                requested,
                capacity: self.config.capacity,
            })?;

        let n_merged_filters = self
            .sorted_bitfields
            .n_merged_filters_per_core(self.best_success.max(0) as usize);

        tracing::info!(best_success = self.best_success, requested, "search finalised");

        Ok(SearchReport {
            best_success: self.best_success,
            tested_mid_points: self.tested,
            exit_status: ExitStatus::ExitedCleanly,
            n_merged_filters,
        })
    }
}

/// Whether `slot` carries an attempt that has been dispatched but whose
/// outcome the coordinator hasn't consumed (recycled or retired) yet.
/// `ForceStop` can overtake `Run` before the worker ever observes the
/// latter, so both instructions count.
fn is_dispatched(slot: &WorkerSlot) -> bool {
    matches!(
        slot.instruction(),
        SorterInstruction::Run | SorterInstruction::ForceStop
    )
}

fn consider_run(best: &mut Option<(i64, i64)>, start: i64, end: i64) {
    let len = end - start + 1;
    match best {
        Some((bs, be)) => {
            let blen = *be - *bs + 1;
            if len >= blen {
                *best = Some((start, end));
            }
        }
        None => *best = Some((start, end)),
    }
}
