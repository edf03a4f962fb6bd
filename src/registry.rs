//! Exclusive ownership of display resources.

use std::fmt::{self, Display, Formatter};

/// Maximum number of resources tracked per kind.
pub const MAX_RESOURCES: usize = u64::BITS as usize;

/// Kind of claimable display resource.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ResourceKind {
    Connector,
    Encoder,
    Crtc,
    Plane,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connector => write!(f, "connector"),
            Self::Encoder => write!(f, "encoder"),
            Self::Crtc => write!(f, "crtc"),
            Self::Plane => write!(f, "plane"),
        }
    }
}

/// Inventory of claimed resources.
///
/// Every resource kind is tracked as a bitset over the resource's index in the
/// backend's resource lists. A bit is set while a pipe holds the resource.
#[derive(Default, Debug)]
pub struct ResourceRegistry {
    connectors: u64,
    encoders: u64,
    crtcs: u64,
    planes: u64,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the resource at `index` is claimed.
    pub fn is_claimed(&self, kind: ResourceKind, index: usize) -> bool {
        index < MAX_RESOURCES && self.mask(kind) & (1 << index) != 0
    }

    /// Claim the resource at `index`.
    ///
    /// Returns `false` without modifying the registry if the resource is
    /// already claimed or cannot be tracked.
    pub fn claim(&mut self, kind: ResourceKind, index: usize) -> bool {
        if index >= MAX_RESOURCES || self.is_claimed(kind, index) {
            return false;
        }

        *self.mask_mut(kind) |= 1 << index;
        true
    }

    /// Release the resource at `index`.
    pub fn release(&mut self, kind: ResourceKind, index: usize) {
        if index < MAX_RESOURCES {
            *self.mask_mut(kind) &= !(1 << index);
        }
    }

    /// Bitset of all claimed resources of one kind.
    pub fn mask(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Connector => self.connectors,
            ResourceKind::Encoder => self.encoders,
            ResourceKind::Crtc => self.crtcs,
            ResourceKind::Plane => self.planes,
        }
    }

    fn mask_mut(&mut self, kind: ResourceKind) -> &mut u64 {
        match kind {
            ResourceKind::Connector => &mut self.connectors,
            ResourceKind::Encoder => &mut self.encoders,
            ResourceKind::Crtc => &mut self.crtcs,
            ResourceKind::Plane => &mut self.planes,
        }
    }
}
