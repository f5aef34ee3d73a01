//! Address spaces shared between threads.

use alloc::sync::Arc;
use core::fmt;

/// Identifies an address space within the address-space manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpaceId(pub usize);

/// The flavor of a freshly created address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    /// The kernel's own space.
    System,
    /// A driver or service space.
    Service,
    /// A user application space.
    Application,
}

/// Creates and destroys address spaces.
pub trait AddressSpaceManager: Send + Sync {
    fn create_space(&self, kind: SpaceKind) -> SpaceId;
    fn release_space(&self, space: SpaceId);
}

/// An address space that is released when the last thread sharing it drops its handle.
///
/// Threads hold an `Arc<MemorySpace>`: sharing a space clones the `Arc`,
/// cleaning a thread up drops its clone.
pub struct MemorySpace {
    id: SpaceId,
    kind: SpaceKind,
    manager: Arc<dyn AddressSpaceManager>,
}

impl MemorySpace {
    /// Asks `manager` for a new space of the given `kind`.
    pub fn create(manager: Arc<dyn AddressSpaceManager>, kind: SpaceKind) -> Arc<MemorySpace> {
        let id = manager.create_space(kind);
        Arc::new(MemorySpace { id, kind, manager })
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }
}

impl Drop for MemorySpace {
    fn drop(&mut self) {
        log::trace!("releasing address space {:?} ({:?})", self.id, self.kind);
        self.manager.release_space(self.id);
    }
}

impl fmt::Debug for MemorySpace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemorySpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}
