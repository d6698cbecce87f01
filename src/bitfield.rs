//! Per-source bit-field filters, and the generator that folds the first
//! `N` of them into a candidate table. §3, §4.3.

use hashbrown::HashMap as FastHashMap;

use crate::entry::LinkSet;
use crate::keymask::Key;
use crate::table::RoutingTable;

/// Identifies the source core that owns a filter. Source links in an
/// [`crate::entry::Entry`] are a bitset over these same small integers: bit
/// `i` of `source` means "this entry may arrive from processor `i`".
pub type ProcessorId = u32;

/// Per-source-core filter: which atoms for `key` are actually consumed
/// downstream. Word-packed bitmap, following `original_source`'s
/// `bit_set_t` layout (`n_words = ceil(n_elements / 32)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    pub key: Key,
    n_atoms: u32,
    bitmap: Vec<u32>,
}

impl BitField {
    pub fn new(key: Key, n_atoms: u32) -> Self {
        let n_words = n_atoms.div_ceil(32) as usize;
        Self {
            key,
            n_atoms,
            bitmap: vec![0; n_words],
        }
    }

    pub fn from_words(key: Key, n_atoms: u32, bitmap: Vec<u32>) -> Self {
        Self {
            key,
            n_atoms,
            bitmap,
        }
    }

    pub fn n_atoms(&self) -> u32 {
        self.n_atoms
    }

    #[inline]
    pub fn set(&mut self, atom: u32) {
        if atom >= self.n_atoms {
            return;
        }
        let word = (atom / 32) as usize;
        let bit = 1u32 << (atom % 32);
        self.bitmap[word] |= bit;
    }

    #[inline]
    pub fn contains(&self, atom: u32) -> bool {
        if atom >= self.n_atoms {
            return false;
        }
        let word = (atom / 32) as usize;
        let bit = 1u32 << (atom % 32);
        (self.bitmap[word] & bit) != 0
    }

    /// Whether this filter still maps any live atom.
    #[inline]
    pub fn any_live(&self) -> bool {
        self.bitmap.iter().any(|w| *w != 0)
    }
}

/// Parallel arrays over every bit-field discovered on this chip, ordered by
/// merge priority (`sort_order[i]`, lower merges first).
#[derive(Debug, Default)]
pub struct SortedBitFields {
    filters: Vec<BitField>,
    owner: Vec<ProcessorId>,
    sort_order: Vec<usize>,
    by_owner_key: FastHashMap<(ProcessorId, Key), usize>,
}

impl SortedBitFields {
    pub fn new(filters: Vec<BitField>, owner: Vec<ProcessorId>, sort_order: Vec<usize>) -> Self {
        assert_eq!(filters.len(), owner.len());
        assert_eq!(filters.len(), sort_order.len());
        let mut by_owner_key = FastHashMap::with_capacity(filters.len());
        for (i, filter) in filters.iter().enumerate() {
            by_owner_key.insert((owner[i], filter.key), i);
        }
        Self {
            filters,
            owner,
            sort_order,
            by_owner_key,
        }
    }

    /// `M`: total number of bit-fields discovered on this chip.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filter(&self, index: usize) -> &BitField {
        &self.filters[index]
    }

    pub fn owner(&self, index: usize) -> ProcessorId {
        self.owner[index]
    }

    pub fn sort_order(&self, index: usize) -> usize {
        self.sort_order[index]
    }

    fn lookup(&self, owner: ProcessorId, key: Key) -> Option<usize> {
        self.by_owner_key.get(&(owner, key)).copied()
    }

    /// Count, per source core, how many of its filters have `sort_order < n`
    /// (§4.6 finalisation: `n_merged_filters`).
    pub fn n_merged_filters_per_core(&self, n: usize) -> FastHashMap<ProcessorId, u32> {
        let mut counts: FastHashMap<ProcessorId, u32> = FastHashMap::new();
        for i in 0..self.filters.len() {
            *counts.entry(self.owner[i]).or_insert(0) += u32::from(self.sort_order[i] < n);
        }
        counts
    }
}

fn source_cores(source: LinkSet) -> impl Iterator<Item = ProcessorId> {
    (0..LinkSet::BITS).filter(move |bit| (source & (1 << bit)) != 0)
}

/// Upper bound on the length of [`generate_table_for_midpoint`]'s output:
/// the generator only ever keeps or drops entries, never duplicates one, so
/// the uncompressed table's own length is always safe.
pub fn max_size(table: &RoutingTable, _n: usize) -> usize {
    table.n_entries()
}

/// Build the candidate table for midpoint `n`: every entry whose source
/// indicates a core with a filter among the first `n` bit-fields is kept
/// only if that filter still maps some live atom for the entry's key;
/// entries unaffected by any of the first `n` filters pass through
/// unchanged. Deterministic: byte-identical output for identical inputs.
pub fn generate_table_for_midpoint(
    table: &RoutingTable,
    bitfields: &SortedBitFields,
    n: usize,
) -> RoutingTable {
    let mut out = RoutingTable::with_capacity(table.n_entries());
    for entry in table.entries() {
        let mut constrained = false;
        let mut any_live = false;
        for core in source_cores(entry.source) {
            if let Some(idx) = bitfields.lookup(core, entry.keymask.key)
                && bitfields.sort_order(idx) < n
            {
                constrained = true;
                if bitfields.filter(idx).any_live() {
                    any_live = true;
                }
            }
        }
        if !constrained || any_live {
            out.push(*entry);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Entry;
    use crate::keymask::KeyMask;

    fn entry(key: u32, source: u32) -> Entry {
        Entry::new(KeyMask::new(key, 0xFFFF_FFFF), 1, source)
    }

    #[test]
    fn entry_unaffected_by_any_filter_is_kept() {
        let table = RoutingTable::from_entries(vec![entry(5, 0b1)]);
        let bitfields = SortedBitFields::new(vec![], vec![], vec![]);
        let out = generate_table_for_midpoint(&table, &bitfields, 0);
        assert_eq!(out.n_entries(), 1);
    }

    #[test]
    fn entry_dropped_when_filter_has_no_live_atoms() {
        let table = RoutingTable::from_entries(vec![entry(5, 0b1)]);
        let filter = BitField::new(5, 4); // all zero
        let bitfields = SortedBitFields::new(vec![filter], vec![0], vec![0]);
        let out = generate_table_for_midpoint(&table, &bitfields, 1);
        assert_eq!(out.n_entries(), 0);
    }

    #[test]
    fn entry_kept_when_filter_has_a_live_atom() {
        let table = RoutingTable::from_entries(vec![entry(5, 0b1)]);
        let mut filter = BitField::new(5, 4);
        filter.set(2);
        let bitfields = SortedBitFields::new(vec![filter], vec![0], vec![0]);
        let out = generate_table_for_midpoint(&table, &bitfields, 1);
        assert_eq!(out.n_entries(), 1);
    }

    #[test]
    fn filter_beyond_midpoint_not_yet_applied() {
        let table = RoutingTable::from_entries(vec![entry(5, 0b1)]);
        let filter = BitField::new(5, 4); // no live atoms
        let bitfields = SortedBitFields::new(vec![filter], vec![0], vec![0]);
        // sort_order 0 is not < n=0, so it isn't applied yet.
        let out = generate_table_for_midpoint(&table, &bitfields, 0);
        assert_eq!(out.n_entries(), 1);
    }

    #[test]
    fn generator_is_deterministic() {
        let table = RoutingTable::from_entries(vec![entry(5, 0b1), entry(6, 0b10)]);
        let mut f1 = BitField::new(5, 4);
        f1.set(1);
        let f2 = BitField::new(6, 4);
        let bitfields = SortedBitFields::new(vec![f1, f2], vec![0, 1], vec![0, 1]);
        let a = generate_table_for_midpoint(&table, &bitfields, 2);
        let b = generate_table_for_midpoint(&table, &bitfields, 2);
        assert_eq!(a.entries(), b.entries());
    }

    #[test]
    fn max_size_bounds_any_midpoint() {
        let table = RoutingTable::from_entries(vec![entry(1, 1), entry(2, 1)]);
        assert_eq!(max_size(&table, 0), 2);
        assert_eq!(max_size(&table, 100), 2);
    }
}
