use std::sync::Arc;

use incur_core::CanonicalSnapshot;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("table handle moved: expected version {expected}, found {found}")]
pub struct VersionMismatch {
    pub expected: u64,
    pub found: u64,
}

/// The live canonical version for this process. Readers take an `Arc` and
/// keep a complete snapshot for as long as they hold it; the writer advances
/// the pointer with [`TableHandle::compare_and_swap`].
#[derive(Debug)]
pub struct TableHandle {
    current: RwLock<Arc<CanonicalSnapshot>>,
}

impl TableHandle {
    pub fn new(snapshot: CanonicalSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn load(&self) -> Arc<CanonicalSnapshot> {
        Arc::clone(&self.current.read())
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    pub fn compare_and_swap(
        &self,
        expected_version: u64,
        next: Arc<CanonicalSnapshot>,
    ) -> Result<Arc<CanonicalSnapshot>, VersionMismatch> {
        let mut current = self.current.write();
        if current.version() != expected_version {
            return Err(VersionMismatch {
                expected: expected_version,
                found: current.version(),
            });
        }
        Ok(std::mem::replace(&mut *current, next))
    }

    /// Unconditionally replaces the current snapshot, returning the old one.
    pub fn store(&self, next: Arc<CanonicalSnapshot>) -> Arc<CanonicalSnapshot> {
        std::mem::replace(&mut *self.current.write(), next)
    }
}
