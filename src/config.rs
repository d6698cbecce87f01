//! Tunables the original hard-codes as constants. §9 Design Notes: "Global
//! registers" become a value constructed once and passed by reference — no
//! ambient mutable state.

use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// The two compression-mode flags carried in the uncompressed-table
    /// input region (§6.1) but left unexplained by the distilled prose;
    /// `original_source/routing_table.h`'s `header_t` names them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CompressionMode: u8 {
        /// Skip the search entirely when the uncompressed table already
        /// fits in `capacity`.
        const ONLY_IF_NEEDED = 0b0000_0001;
        /// Keep searching for higher N even after the first success,
        /// instead of stopping at the first feasible midpoint.
        const AS_MUCH_AS_POSSIBLE = 0b0000_0010;
    }
}

/// Hardware router capacity: the absolute maximum number of routes
/// that may be produced (`MAX_NUM_ROUTES` in `pair_minimize.h`).
pub const MAX_ROUTES: usize = 1023;

#[derive(Debug, Clone)]
pub struct SorterConfig {
    /// Hardware-imposed maximum table size.
    pub capacity: usize,
    /// Number of workers to seed during initial dispatch.
    pub n_workers: usize,
    /// Bounded retries while polling a freshly-spawned worker for
    /// `Prepared` (§4.6 "Bootstrap race").
    pub bootstrap_retries: u32,
    /// Delay between bootstrap polls.
    pub bootstrap_retry_delay: Duration,
    /// A midpoint is abandoned (not retried) after this many consecutive
    /// `FailedMalloc` outcomes, except N=0 which is always retried.
    pub malloc_retry_threshold: u32,
    pub mode: CompressionMode,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            capacity: MAX_ROUTES,
            n_workers: 4,
            bootstrap_retries: 20,
            bootstrap_retry_delay: Duration::from_micros(50),
            malloc_retry_threshold: 2,
            mode: CompressionMode::AS_MUCH_AS_POSSIBLE,
        }
    }
}
