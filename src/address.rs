// Copyright (C) 2019 Alibaba Cloud Computing. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Address newtypes used across the DMA mapping layer.
//!
//! Three address spaces meet in this crate, and mixing them up is the classic source of
//! mapping bugs:
//! - [`Iova`]: the device-visible I/O virtual address programmed into the host IOMMU. For a
//!   guest without a virtual IOMMU this is the guest physical address.
//! - [`HostAddr`]: the host virtual address backing a piece of guest RAM.
//! - [`RamAddr`]: the offset of a page inside the hypervisor's RAM block space, used to
//!   index the global dirty log.

use std::fmt;
use std::ops::{BitAnd, BitOr};

/// Trait for address objects, define methods to access and manipulate it.
pub trait Address:
    Sized + Default + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + BitAnd<u64> + BitOr<u64>
{
    /// Create an address from the raw value.
    fn new(value: u64) -> Self;

    /// Get the raw value of an address.
    fn raw_value(&self) -> u64;

    /// Returns the bitwise and of the address with the given mask.
    fn mask(&self, mask: u64) -> Self {
        Self::new(self.raw_value() & mask)
    }

    /// Returns the offset from this address to the given base address and None if there is
    /// underflow.
    fn checked_offset_from(&self, base: Self) -> Option<u64> {
        self.raw_value().checked_sub(base.raw_value())
    }

    /// Returns the result of the add or None if there is overflow.
    fn checked_add(&self, other: u64) -> Option<Self> {
        self.raw_value().checked_add(other).map(Self::new)
    }

    /// Returns the result of the base address + the size.
    /// Only use this when `offset` is guaranteed not to overflow.
    fn unchecked_add(&self, offset: u64) -> Self {
        Self::new(self.raw_value() + offset)
    }
}

macro_rules! impl_address_ops {
    ($T:ident) => {
        impl Address for $T {
            fn new(value: u64) -> $T {
                $T(value)
            }

            fn raw_value(&self) -> u64 {
                self.0
            }
        }

        impl BitAnd<u64> for $T {
            type Output = $T;

            fn bitand(self, other: u64) -> $T {
                $T(self.0 & other)
            }
        }

        impl BitOr<u64> for $T {
            type Output = $T;

            fn bitor(self, other: u64) -> $T {
                $T(self.0 | other)
            }
        }

        impl fmt::LowerHex for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// Represents an I/O virtual address (IOVA) as seen by a passthrough device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Iova(pub u64);
impl_address_ops!(Iova);

/// Represents a host virtual address backing guest memory.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HostAddr(pub u64);
impl_address_ops!(HostAddr);

/// Represents an offset in the hypervisor's RAM block space.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RamAddr(pub u64);
impl_address_ops!(RamAddr);
