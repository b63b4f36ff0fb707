// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The slice of the hypervisor's memory model this crate listens to.
//!
//! The hypervisor describes each guest address space as a flat list of [`MemorySection`]s, each
//! one a window onto a [`MemoryRegion`]. Regions come in a few flavours that the mapping layer
//! treats differently: plain RAM, device memory exposed as RAM, regions translated by a virtual
//! IOMMU ([`GuestIommu`]) and emulated I/O. RAM regions may additionally be fronted by a
//! [`RamDiscardManager`] that populates and discards memory at runtime.
//!
//! The current flat view of an [`AddressSpace`] is published RCU-style through an `ArcSwap`, so
//! the dirty tracker can take a consistent snapshot without blocking the publisher.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bitflags::bitflags;

use crate::address::{Address, HostAddr, RamAddr};

/// Errors reported by memory model collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A guest IOMMU entry could not be translated to guest RAM.
    #[error("Cannot translate IOVA {iova:#x}: {reason}")]
    Translate {
        /// IOVA of the entry.
        iova: u64,
        /// Human-readable specifics.
        reason: String,
    },
    /// The entry translates into an address space other than system memory.
    #[error("Wrong target address space \"{0}\", only system memory is allowed")]
    WrongTargetAddressSpace(String),
    /// A guest IOMMU refused to register a translation notifier.
    #[error("Cannot register IOMMU notifier on {region}: {reason}")]
    NotifierRejected {
        /// Region name.
        region: String,
        /// Human-readable specifics.
        reason: String,
    },
}

/// Result of memory model operations.
pub type Result<T> = std::result::Result<T, Error>;

bitflags! {
    /// Attributes of a [`MemoryRegion`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// The guest cannot write the region.
        const READONLY = 1 << 0;
        /// Confidential memory that must never be exposed to a device.
        const PROTECTED = 1 << 1;
        /// Region known to be host-page misaligned without harm (e.g. TPM CRB buffers).
        const KNOWN_SAFE_MISALIGNMENT = 1 << 2;
    }
}

bitflags! {
    /// Access permissions of an IOTLB entry. An empty set means the entry is an unmap.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IommuAccess: u8 {
        /// Device may read.
        const READ = 1 << 0;
        /// Device may write.
        const WRITE = 1 << 1;
    }
}

/// Stable identity of a [`MemoryRegion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionId(u64);

impl RegionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RegionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What backs a [`MemoryRegion`].
#[derive(Clone)]
pub enum RegionKind {
    /// Ordinary guest RAM.
    Ram {
        /// Host virtual address of the start of the region.
        host_addr: HostAddr,
        /// RAM block offset of the start of the region.
        ram_addr: RamAddr,
    },
    /// Device memory (typically a passthrough BAR) exposed to the guest as RAM.
    RamDevice {
        /// Host virtual address of the start of the region.
        host_addr: HostAddr,
        /// RAM block offset of the start of the region.
        ram_addr: RamAddr,
    },
    /// A region translated by a virtual IOMMU.
    Iommu(Arc<dyn GuestIommu>),
    /// Emulated I/O, never DMA-mapped.
    Mmio,
}

impl Debug for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::Ram {
                host_addr,
                ram_addr,
            } => f
                .debug_struct("Ram")
                .field("host_addr", host_addr)
                .field("ram_addr", ram_addr)
                .finish(),
            RegionKind::RamDevice {
                host_addr,
                ram_addr,
            } => f
                .debug_struct("RamDevice")
                .field("host_addr", host_addr)
                .field("ram_addr", ram_addr)
                .finish(),
            RegionKind::Iommu(_) => f.write_str("Iommu"),
            RegionKind::Mmio => f.write_str("Mmio"),
        }
    }
}

/// A contiguous piece of the hypervisor's memory model.
#[derive(Debug)]
pub struct MemoryRegion {
    id: RegionId,
    name: String,
    kind: RegionKind,
    flags: RegionFlags,
    owner: Option<String>,
    discard_manager: Option<Arc<dyn RamDiscardManager>>,
}

impl MemoryRegion {
    /// Create a region of the given kind.
    pub fn new(name: &str, kind: RegionKind) -> Self {
        MemoryRegion {
            id: RegionId::next(),
            name: name.to_owned(),
            kind,
            flags: RegionFlags::empty(),
            owner: None,
            discard_manager: None,
        }
    }

    /// Set the region attributes.
    pub fn with_flags(mut self, flags: RegionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Record the name of the device that owns the region (e.g. the passthrough device whose
    /// BAR this is).
    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_owned());
        self
    }

    /// Put the region under the control of a discard manager.
    pub fn with_discard_manager(mut self, rdm: Arc<dyn RamDiscardManager>) -> Self {
        self.discard_manager = Some(rdm);
        self
    }

    /// Stable identity of the region.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Name of the region.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing of the region.
    pub fn kind(&self) -> &RegionKind {
        &self.kind
    }

    /// Attributes of the region.
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    /// Owning device, if any.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Discard manager, if any.
    pub fn discard_manager(&self) -> Option<&Arc<dyn RamDiscardManager>> {
        self.discard_manager.as_ref()
    }

    /// RAM and RAM-device regions.
    pub fn is_ram(&self) -> bool {
        matches!(
            self.kind,
            RegionKind::Ram { .. } | RegionKind::RamDevice { .. }
        )
    }

    /// Device memory exposed as RAM.
    pub fn is_ram_device(&self) -> bool {
        matches!(self.kind, RegionKind::RamDevice { .. })
    }

    /// Region translated by a virtual IOMMU.
    pub fn iommu(&self) -> Option<&Arc<dyn GuestIommu>> {
        match &self.kind {
            RegionKind::Iommu(iommu) => Some(iommu),
            _ => None,
        }
    }

    /// Host virtual address and RAM block offset of the start of a RAM region.
    pub fn ram_base(&self) -> Option<(HostAddr, RamAddr)> {
        match self.kind {
            RegionKind::Ram {
                host_addr,
                ram_addr,
            }
            | RegionKind::RamDevice {
                host_addr,
                ram_addr,
            } => Some((host_addr, ram_addr)),
            _ => None,
        }
    }
}

/// A window onto a [`MemoryRegion`] placed in an address space.
#[derive(Clone, Debug)]
pub struct MemorySection {
    /// The region.
    pub mr: Arc<MemoryRegion>,
    /// Offset of the window inside the region.
    pub offset_within_region: u64,
    /// Guest address of the window.
    pub offset_within_address_space: u64,
    /// Size of the window. A whole 64-bit address space has a size of `1 << 64`.
    pub size: u128,
    /// Whether the window is read-only.
    pub readonly: bool,
}

impl MemorySection {
    /// Create a section covering `size` bytes of `mr` at `offset_within_region`, placed at
    /// guest address `gpa`.
    pub fn new(mr: Arc<MemoryRegion>, offset_within_region: u64, gpa: u64, size: u128) -> Self {
        let readonly = mr.flags().contains(RegionFlags::READONLY);
        MemorySection {
            mr,
            offset_within_region,
            offset_within_address_space: gpa,
            size,
            readonly,
        }
    }

    /// Size truncated to 64 bits.
    pub fn size64(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(u64::MAX)
    }

    /// Host virtual address of guest address `gpa` inside the section, for RAM sections.
    pub fn host_addr_of(&self, gpa: u64) -> Option<HostAddr> {
        let (base, _) = self.mr.ram_base()?;
        let offset = gpa.checked_sub(self.offset_within_address_space)?;
        base.checked_add(self.offset_within_region.checked_add(offset)?)
    }

    /// RAM block offset of the start of the section, for RAM sections.
    pub fn ram_addr(&self) -> Option<RamAddr> {
        let (_, ram) = self.mr.ram_base()?;
        ram.checked_add(self.offset_within_region)
    }
}

/// One translation event or replayed translation of a virtual IOMMU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IotlbEntry {
    /// IOVA inside the IOMMU region.
    pub iova: u64,
    /// Size of the entry minus one.
    pub addr_mask: u64,
    /// Translated guest physical address.
    pub translated_addr: u64,
    /// Access permissions; empty for an invalidation.
    pub perm: IommuAccess,
    /// Name of the target address space; `None` means system memory.
    pub target_as: Option<String>,
}

impl IotlbEntry {
    /// Number of bytes covered by the entry.
    pub fn size(&self) -> u64 {
        self.addr_mask.wrapping_add(1)
    }
}

/// Where an IOTLB entry lands in guest RAM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Host virtual address backing the translated range.
    pub host_addr: HostAddr,
    /// RAM block offset of the translated range.
    pub ram_addr: RamAddr,
    /// Whether the backing RAM is read-only.
    pub readonly: bool,
    /// Whether the backing RAM is fronted by a discard manager.
    pub discard_managed: bool,
}

/// Identifier handed to collaborators when registering a notifier or listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifierId(pub u64);

/// A virtual IOMMU that translates a region of the address space.
pub trait GuestIommu: Send + Sync {
    /// Resolve an IOTLB entry to the RAM backing it.
    fn translate(&self, entry: &IotlbEntry) -> Result<Translation>;

    /// Return all current translations in `[start, end]` (offsets inside the region).
    fn replay(&self, start: u64, end: u64) -> Vec<IotlbEntry>;

    /// Start delivering map/unmap events for `[start, end]` to the notifier `id`.
    fn register_notifier(&self, id: NotifierId, start: u64, end: u64) -> Result<()>;

    /// Stop delivering events to `id`.
    fn unregister_notifier(&self, id: NotifierId);
}

/// Coordinates populating and discarding of a sparse RAM region (e.g. virtio-mem).
pub trait RamDiscardManager: Send + Sync + Debug {
    /// Minimum granularity at which memory is populated or discarded.
    fn min_granularity(&self, mr: &MemoryRegion) -> u64;

    /// Start delivering populate/discard events for `section` to the listener `id`.
    fn register_listener(&self, id: NotifierId, section: &MemorySection);

    /// Stop delivering events to `id`.
    fn unregister_listener(&self, id: NotifierId);

    /// Return the currently populated parts of `section`.
    fn populated_parts(&self, section: &MemorySection) -> Vec<MemorySection>;
}

/// Identity of an [`AddressSpace`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

/// The flat list of sections making up an address space at one point in time.
#[derive(Clone, Debug, Default)]
pub struct FlatView {
    sections: Vec<MemorySection>,
}

impl FlatView {
    /// Build a view out of `sections`.
    pub fn new(mut sections: Vec<MemorySection>) -> Self {
        sections.sort_by_key(|s| s.offset_within_address_space);
        FlatView { sections }
    }

    /// Sections of the view ordered by guest address.
    pub fn sections(&self) -> &[MemorySection] {
        &self.sections
    }
}

/// A guest address space as seen by passthrough devices.
#[derive(Debug)]
pub struct AddressSpace {
    id: AddressSpaceId,
    name: String,
    system_memory: bool,
    view: ArcSwap<FlatView>,
}

impl AddressSpace {
    /// Create an empty address space. `system_memory` marks the guest's physical address space
    /// (as opposed to one behind a virtual IOMMU).
    pub fn new(name: &str, system_memory: bool) -> Arc<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Arc::new(AddressSpace {
            id: AddressSpaceId(NEXT.fetch_add(1, Ordering::Relaxed)),
            name: name.to_owned(),
            system_memory,
            view: ArcSwap::from_pointee(FlatView::default()),
        })
    }

    /// Identity of the address space.
    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Name of the address space.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the guest's physical address space.
    pub fn is_system_memory(&self) -> bool {
        self.system_memory
    }

    /// Snapshot of the current flat view.
    pub fn flat_view(&self) -> Arc<FlatView> {
        self.view.load_full()
    }

    /// Publish a new flat view, returning the previous one.
    pub fn publish(&self, view: FlatView) -> Arc<FlatView> {
        self.view.swap(Arc::new(view))
    }
}
