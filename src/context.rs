//! §9 Design Notes: "Global registers" in the original become a single
//! value constructed once at the entry point and passed by reference —
//! no ambient mutable state shared implicitly across modules.

use std::sync::Arc;

use crate::bitfield::SortedBitFields;
use crate::config::SorterConfig;
use crate::table::RoutingTable;

/// Everything a search run needs, gathered once by the host before calling
/// [`crate::run`].
#[derive(Debug, Clone)]
pub struct Context {
    pub config: SorterConfig,
    pub uncompressed_table: Arc<RoutingTable>,
    pub sorted_bitfields: Arc<SortedBitFields>,
    pub app_id: u32,
}

impl Context {
    pub fn new(
        config: SorterConfig,
        uncompressed_table: RoutingTable,
        sorted_bitfields: SortedBitFields,
        app_id: u32,
    ) -> Self {
        Self {
            config,
            uncompressed_table: Arc::new(uncompressed_table),
            sorted_bitfields: Arc::new(sorted_bitfields),
            app_id,
        }
    }
}
