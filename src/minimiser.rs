//! Pair-merge-by-route table minimiser. §4.4.
//!
//! Ported from `original_source/pair_minimize.h`'s `minimise_run`: a route
//! frequency histogram, insertion sort of routes by frequency, an in-place
//! cycle-following permutation grouping the table by route, then a
//! per-group single-pass pair merge.

use hashbrown::HashMap as FastHashMap;
use smallvec::SmallVec;

use crate::cancel::CancelToken;
use crate::config::MAX_ROUTES;
use crate::entry::LinkSet;
use crate::table::RoutingTable;

/// Simulates the SDRAM allocator the real firmware draws scratch memory
/// from (§1: out-of-scope external collaborator). Defaults to always
/// succeeding; tests substitute a flaky one to exercise `FailedMalloc`
/// handling (§8 scenario f).
pub trait ScratchAllocator: std::fmt::Debug {
    fn try_reserve(&mut self, words: usize) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAvailable;

impl ScratchAllocator for AlwaysAvailable {
    fn try_reserve(&mut self, _words: usize) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinimiseOutcome {
    Successful,
    FailedNoMerges,
    FailedMalloc,
    Cancelled,
}

/// Compress `table` in place to at most `capacity` entries.
pub fn minimise(
    table: &mut RoutingTable,
    capacity: usize,
    cancel: &CancelToken,
    alloc: &mut dyn ScratchAllocator,
) -> MinimiseOutcome {
    let n = table.n_entries();
    if n <= 1 {
        return MinimiseOutcome::Successful;
    }

    if !alloc.try_reserve(n) {
        return MinimiseOutcome::FailedMalloc;
    }

    // --- 1. frequency histogram, in order of first appearance ---
    let mut routes: SmallVec<[(LinkSet, u32); 64]> = SmallVec::new();
    let mut rank_of: FastHashMap<LinkSet, usize> = FastHashMap::new();
    for i in 0..n {
        let route = table.get(i).route;
        if let Some(&idx) = rank_of.get(&route) {
            routes[idx].1 += 1;
        } else {
            if routes.len() >= MAX_ROUTES {
                tracing::debug!(distinct_routes = routes.len(), "too many distinct routes");
                return MinimiseOutcome::FailedNoMerges;
            }
            rank_of.insert(route, routes.len());
            routes.push((route, 1));
        }
    }

    if cancel.is_set() {
        return MinimiseOutcome::Cancelled;
    }

    // --- 2. insertion sort ascending by frequency ---
    insertion_sort_by_frequency(&mut routes);
    rank_of.clear();
    for (rank, (route, _freq)) in routes.iter().enumerate() {
        rank_of.insert(*route, rank);
    }

    if cancel.is_set() {
        return MinimiseOutcome::Cancelled;
    }

    if !alloc.try_reserve(routes.len()) {
        return MinimiseOutcome::FailedMalloc;
    }

    // --- 3. cycle-following permutation, grouping the table by route ---
    let mut group_starts: SmallVec<[usize; 64]> = SmallVec::with_capacity(routes.len());
    let mut acc = 0usize;
    for (_route, freq) in &routes {
        group_starts.push(acc);
        acc += *freq as usize;
    }
    let mut cursor = group_starts.clone();
    sort_table_into_groups(table, &rank_of, &mut cursor);

    if cancel.is_set() {
        return MinimiseOutcome::Cancelled;
    }

    // --- 4. compress each contiguous route group ---
    let mut write_index = 0usize;
    for (g, (_route, freq)) in routes.iter().enumerate() {
        let left0 = group_starts[g];
        let right0 = left0 + (*freq as usize) - 1;
        let remaining = right0 + 1;
        compress_group(table, &mut write_index, left0, right0, remaining);

        if write_index > capacity {
            tracing::debug!(write_index, capacity, "exceeded capacity mid-compression");
            return MinimiseOutcome::FailedNoMerges;
        }
        if cancel.is_set() {
            return MinimiseOutcome::Cancelled;
        }
    }

    // --- 5. tail removal ---
    table.remove_tail(n - write_index);

    if table.n_entries() > capacity {
        return MinimiseOutcome::FailedNoMerges;
    }

    MinimiseOutcome::Successful
}

fn insertion_sort_by_frequency(routes: &mut [(LinkSet, u32)]) {
    for i in 1..routes.len() {
        let taken = routes[i];
        let mut j = i;
        while j > 0 && routes[j - 1].1 > taken.1 {
            routes[j] = routes[j - 1];
            j -= 1;
        }
        routes[j] = taken;
    }
}

/// Groups the table in place so every route's entries are contiguous, in
/// the order given by `rank_of`/`cursor` (group `g`'s region starts at
/// `cursor[g]`'s initial value and has exactly as many slots as that
/// route's frequency). Implemented as a cycle-following permutation:
/// follow the chain of "this slot's rightful occupant displaces whatever
/// is already in its target slot" until the chain closes, using one
/// `cursor` entry per distinct route (O(k) extra bookkeeping) plus an
/// O(n) visited marker, for O(n) total swaps.
fn sort_table_into_groups(
    table: &mut RoutingTable,
    rank_of: &FastHashMap<LinkSet, usize>,
    cursor: &mut [usize],
) {
    let n = table.n_entries();
    let mut visited = vec![false; n];
    for start in 0..n {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut entry = *table.get(start);
        loop {
            let group = rank_of[&entry.route];
            let target = cursor[group];
            cursor[group] += 1;
            // The cycle closes back on the slot this chain began at, not
            // necessarily on its immediately preceding position.
            if target == start {
                table.put(start, entry);
                break;
            }
            debug_assert!(
                !visited[target],
                "cycle-following permutation revisited an already-settled slot"
            );
            visited[target] = true;
            let displaced = *table.get(target);
            table.put(target, entry);
            entry = displaced;
        }
    }
}

/// Compress the contiguous group `[left, right]` (inclusive, all sharing a
/// route) into `write_index`. `remaining` is the index of the first entry
/// belonging to a route group not yet compressed — merges may never
/// produce a keymask that intersects one of those.
fn compress_group(
    table: &mut RoutingTable,
    write_index: &mut usize,
    mut left: usize,
    mut right: usize,
    remaining: usize,
) {
    while left < right {
        let mut merged = false;
        // `right` is adjusted inside the loop but only on a branch that
        // immediately `break`s, so the range itself is never re-evaluated
        // mid-iteration.
        #[allow(clippy::mut_range_bound)]
        for index in (left + 1)..=right {
            if try_merge_into(table, left, index, remaining) {
                table.copy(right, index);
                right -= 1;
                merged = true;
                break;
            }
        }
        if !merged {
            table.copy(left, *write_index);
            *write_index += 1;
            left += 1;
        }
    }
    if left == right {
        table.copy(left, *write_index);
        *write_index += 1;
    }
}

/// Try merging the entries at `left` and `index`. On success the merged
/// entry is written into `left` and `true` is returned; on failure
/// (the merge would alias a key owned by a different, not-yet-compressed
/// route) the table is left untouched.
fn try_merge_into(table: &mut RoutingTable, left: usize, index: usize, remaining: usize) -> bool {
    let merged = table.get(left).merge_with(table.get(index));
    for check in remaining..table.n_entries() {
        if table.get(check).keymask.intersects(merged.keymask) {
            return false;
        }
    }
    table.put(left, merged);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::keymask::KeyMask;

    fn run(table: &mut RoutingTable, capacity: usize) -> MinimiseOutcome {
        minimise(table, capacity, &CancelToken::new(), &mut AlwaysAvailable)
    }

    #[test]
    fn empty_table_succeeds_at_zero() {
        let mut t = RoutingTable::new();
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        assert_eq!(t.n_entries(), 0);
    }

    #[test]
    fn single_entry_table_is_unchanged() {
        let mut t = RoutingTable::from_entries(vec![Entry::new(KeyMask::new(0x10, 0xF0), 1, 1)]);
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        assert_eq!(t.n_entries(), 1);
    }

    #[test]
    fn already_minimal_table_is_unchanged() {
        // Scenario (b): three entries, distinct routes, no possible merge.
        let mut t = RoutingTable::from_entries(vec![
            Entry::new(KeyMask::new(0x10, 0xF0), 1, 1),
            Entry::new(KeyMask::new(0x20, 0xF0), 2, 1),
            Entry::new(KeyMask::new(0x30, 0xF0), 4, 1),
        ]);
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        assert_eq!(t.n_entries(), 3);
        let mut keys: Vec<_> = t.entries().iter().map(|e| e.keymask.key).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn two_entries_differing_only_in_one_bit_merge() {
        // Scenario (c).
        let mut t = RoutingTable::from_entries(vec![
            Entry::new(KeyMask::new(0x00, 0xFF), 1, 1),
            Entry::new(KeyMask::new(0x01, 0xFF), 1, 1),
        ]);
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        assert_eq!(t.n_entries(), 1);
        assert_eq!(t.get(0).keymask, KeyMask::new(0x00, 0xFE));
        assert_eq!(t.get(0).route, 1);
    }

    #[test]
    fn merge_blocked_by_aliasing_a_different_route() {
        // Scenario (d). Route 1's pair would merge into (0x00, 0xFE),
        // covering both 0x00 and 0x01 — but route 2 also claims 0x01, so
        // the merge must be refused. Route 2 is given the same frequency
        // as route 1 (two identical entries) so it sorts after route 1 and
        // is still "not yet compressed" when route 1's group runs.
        let mut t = RoutingTable::from_entries(vec![
            Entry::new(KeyMask::new(0x00, 0xFF), 1, 1),
            Entry::new(KeyMask::new(0x01, 0xFF), 1, 1),
            Entry::new(KeyMask::new(0x01, 0xFF), 2, 1),
            Entry::new(KeyMask::new(0x01, 0xFF), 2, 1),
        ]);
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        assert_eq!(t.n_entries(), 3);
        let mut keys: Vec<_> = t.entries().iter().map(|e| e.keymask.key).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![0x00, 0x01, 0x01]);
    }

    #[test]
    fn too_many_distinct_routes_fails_no_merges() {
        let entries: Vec<Entry> = (0..(MAX_ROUTES + 1) as u32)
            .map(|i| Entry::new(KeyMask::new(i, 0xFFFF_FFFF), i + 1, 1))
            .collect();
        let mut t = RoutingTable::from_entries(entries);
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::FailedNoMerges);
    }

    #[test]
    fn over_capacity_after_compression_fails_no_merges() {
        let mut t = RoutingTable::from_entries(vec![
            Entry::new(KeyMask::new(0x00, 0xFF), 1, 1),
            Entry::new(KeyMask::new(0x01, 0xFF), 2, 1),
            Entry::new(KeyMask::new(0x02, 0xFF), 3, 1),
        ]);
        assert_eq!(run(&mut t, 2), MinimiseOutcome::FailedNoMerges);
    }

    #[test]
    fn malloc_failure_is_reported() {
        #[derive(Debug)]
        struct AlwaysFails;
        impl ScratchAllocator for AlwaysFails {
            fn try_reserve(&mut self, _: usize) -> bool {
                false
            }
        }
        let mut t = RoutingTable::from_entries([Entry::new(KeyMask::new(0, 0), 1, 1); 2].to_vec());
        let outcome = minimise(&mut t, 1023, &CancelToken::new(), &mut AlwaysFails);
        assert_eq!(outcome, MinimiseOutcome::FailedMalloc);
    }

    #[test]
    fn cancellation_is_observed_between_phases() {
        let cancel = CancelToken::new();
        cancel.set();
        let mut t = RoutingTable::from_entries(vec![
            Entry::new(KeyMask::new(0x00, 0xFE), 1, 1),
            Entry::new(KeyMask::new(0x01, 0xFE), 1, 1),
        ]);
        let outcome = minimise(&mut t, 1023, &cancel, &mut AlwaysAvailable);
        assert_eq!(outcome, MinimiseOutcome::Cancelled);
    }

    #[test]
    fn idempotent_on_already_minimised_table() {
        let mut t = RoutingTable::from_entries(vec![
            Entry::new(KeyMask::new(0x00, 0xFE), 1, 1),
            Entry::new(KeyMask::new(0x01, 0xFE), 1, 1),
        ]);
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        let first = t.entries().to_vec();
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        assert_eq!(t.entries(), first.as_slice());
    }

    #[test]
    fn compression_never_claims_a_source_it_did_not_have() {
        let mut t = RoutingTable::from_entries(vec![
            Entry::new(KeyMask::new(0x00, 0xFE), 1, 0b001),
            Entry::new(KeyMask::new(0x01, 0xFE), 1, 0b010),
        ]);
        assert_eq!(run(&mut t, 1023), MinimiseOutcome::Successful);
        assert_eq!(t.n_entries(), 1);
        assert_eq!(t.get(0).source, 0);
    }
}
