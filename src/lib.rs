// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! DMA mapping, dirty page tracking and device state transfer for VFIO passthrough devices.
//!
//! A hypervisor that hands a physical device to a guest has to keep the host IOMMU in sync with
//! the guest memory map, so that the device can DMA into guest RAM at guest-visible addresses.
//! This crate provides the pieces that do so, independently of any particular VMM:
//! - [`AddressSpaceRegistry`] groups devices into [`Container`]s, one or more per guest
//!   [`AddressSpace`], and reuses a container whenever the host allows it;
//! - a [`Container`] mirrors memory map changes into one of the host IOMMU
//!   [`backend`]s, including sections translated by a guest IOMMU and RAM with discarded
//!   ranges;
//! - the [`dirty`] module tracks pages written by devices while the guest is being migrated,
//!   either through the host IOMMU or through the devices themselves;
//! - the [`migration`] module drives the device state machine and transfers device state, either
//!   inline or in parallel packets reassembled by a [`LoadPipeline`].
//!
//! The host kernel, the guest IOMMU and the hypervisor's dirty log are all reached through
//! traits, so the crate can be driven by real ioctls or by in-process test doubles.

#![deny(clippy::doc_markdown)]
#![deny(missing_docs)]

pub mod address;
pub use address::{HostAddr, Iova, RamAddr};

pub mod backend;
pub use backend::{BackendKind, HostDrivers, IommuBackend};

pub mod bitmap;
pub use bitmap::DirtyBitmap;

pub mod bql;
pub use bql::{Bql, BqlGuard};

pub mod container;
pub use container::{Container, ContainerHandle};

pub mod cpr;
pub use cpr::{CprStore, LocalCprStore};

pub mod device;
pub use device::{Device, DeviceIo, DeviceTransport};

pub mod dirty;
pub use dirty::{DirtyLog, DirtyRanges, IovaRange};

mod listener;

pub mod memory;
pub use memory::{AddressSpace, FlatView, MemoryRegion, MemorySection};

pub mod migration;
pub use migration::{DeviceState, LoadPipeline, Migration, MigrationConfig};

pub mod page;

pub mod registry;
pub use registry::AddressSpaceRegistry;

#[cfg(test)]
mod test_utils;
