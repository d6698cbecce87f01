//! Routing table entries: a keymask paired with a route and a conservative
//! source-link record.

use crate::keymask::KeyMask;

/// Bitset of router links. Used for both `route` (outputs) and `source`
/// (permitted inputs).
pub type LinkSet = u32;

/// A single routing-table row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Entry {
    pub keymask: KeyMask,
    pub route: LinkSet,
    pub source: LinkSet,
}

impl Entry {
    pub const fn new(keymask: KeyMask, route: LinkSet, source: LinkSet) -> Self {
        Self {
            keymask,
            route,
            source,
        }
    }

    /// Merge two entries that share a route. The merged source is the
    /// intersection record: if the inputs disagree we conservatively claim
    /// no particular source link (0), never claiming one that wasn't a
    /// source for both halves.
    #[inline]
    pub fn merge_with(&self, other: &Entry) -> Entry {
        debug_assert_eq!(
            self.route, other.route,
            "entries may only be merged when their routes are identical"
        );
        Entry {
            keymask: self.keymask.merge(other.keymask),
            route: self.route,
            source: if self.source == other.source {
                self.source
            } else {
                0
            },
        }
    }
}
