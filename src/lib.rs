//! Multicast routing-table compression for a many-core neuromorphic
//! fabric: given a chip's uncompressed routing table and the per-core
//! bit-field filters discovered at load time, search for the largest
//! prefix of filters that lets the table compress into the hardware
//! router's capacity, and install the winning table.

pub mod bitfield;
pub mod cancel;
pub mod config;
pub mod context;
pub mod entry;
pub mod errors;
pub mod keymask;
pub mod minimiser;
pub mod router_install;
pub mod slot;
pub mod sorter;
pub mod table;
pub mod worker;

pub use context::Context;
pub use errors::{ExitStatus, SorterError, SorterErrorCode, SorterResult};
pub use router_install::RouterInstaller;
pub use sorter::{SearchReport, Sorter};

/// Entry point: run the full search over `ctx` and install the winning
/// table through `installer`.
pub fn run(ctx: Context, installer: &mut dyn RouterInstaller) -> SorterResult<SearchReport> {
    let sorter = Sorter::new(ctx.config, ctx.uncompressed_table, ctx.sorted_bitfields);
    sorter.run(installer, ctx.app_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitfield::{BitField, SortedBitFields};
    use crate::entry::Entry;
    use crate::keymask::KeyMask;
    use crate::router_install::FakeRouter;
    use crate::table::RoutingTable;

    #[test]
    fn end_to_end_search_installs_a_table_within_capacity() {
        let entries: Vec<Entry> = (0..40)
            .map(|i| Entry::new(KeyMask::new(i, 0xFFFF_FFFF), (i % 4) + 1, 1 << (i % 3)))
            .collect();
        let table = RoutingTable::from_entries(entries);

        let mut filters = Vec::new();
        let mut owner = Vec::new();
        for core in 0..3u32 {
            let mut f = BitField::new(0, 40);
            for atom in 0..40u32 {
                if atom % 4 != 0 {
                    f.set(atom);
                }
            }
            filters.push(f);
            owner.push(core);
        }
        let sort_order: Vec<usize> = (0..filters.len()).collect();
        let bitfields = SortedBitFields::new(filters, owner, sort_order);

        let config = crate::config::SorterConfig {
            capacity: 40,
            ..Default::default()
        };
        let ctx = Context::new(config, table, bitfields, 7);
        let mut router = FakeRouter::with_capacity(40);

        let report = run(ctx, &mut router).unwrap();
        assert!(report.best_success >= 0);
        assert!(!router.installed().is_empty());
    }
}
