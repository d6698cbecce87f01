//! Writing the chosen compressed table into hardware. §4.7.
//!
//! The real router programming interface is an opaque, out-of-scope
//! collaborator (§1); this crate depends on it only through the
//! [`RouterInstaller`] trait, with an in-memory double for tests.

use crate::table::RoutingTable;

#[derive(Debug, thiserror::Error)]
pub enum RouterInstallError {
    #[error("router rejected the reservation of {requested} entries")]
    AllocFailed { requested: usize },
}

/// Installs a finalised table. Implementations must make the whole install
/// atomic: a partial install is never visible to the dataplane.
pub trait RouterInstaller {
    fn install(&mut self, table: &RoutingTable, app_id: u32) -> Result<(), RouterInstallError>;
}

/// A single hardware router entry as written to the device: `route` has
/// the application id folded into its top byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledEntry {
    pub key: u32,
    pub mask: u32,
    pub route: u32,
}

/// In-memory stand-in for the hardware router, used by tests and by hosts
/// without real silicon attached.
#[derive(Debug, Default)]
pub struct FakeRouter {
    capacity: Option<usize>,
    installed: Vec<InstalledEntry>,
}

impl FakeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            installed: Vec::new(),
        }
    }

    pub fn installed(&self) -> &[InstalledEntry] {
        &self.installed
    }
}

impl RouterInstaller for FakeRouter {
    fn install(&mut self, table: &RoutingTable, app_id: u32) -> Result<(), RouterInstallError> {
        if let Some(capacity) = self.capacity
            && table.n_entries() > capacity
        {
            return Err(RouterInstallError::AllocFailed {
                requested: table.n_entries(),
            });
        }

        // Build the whole batch before publishing it, so a reservation
        // failure partway through never leaves a half-installed table
        // visible.
        let batch: Vec<InstalledEntry> = table
            .entries()
            .iter()
            .map(|e| InstalledEntry {
                key: e.keymask.key,
                mask: e.keymask.mask,
                route: e.route | (app_id << 24),
            })
            .collect();
        self.installed = batch;
        Ok(())
    }
}
