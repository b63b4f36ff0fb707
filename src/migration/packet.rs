// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Device state packets exchanged over multifd channels.
//!
//! ```text
//! +------------+------------+------------+----------------
//! | version    | idx        | flags      | data ...
//! | be32       | be32       | be32       |
//! +------------+------------+------------+----------------
//! ```

use bitflags::bitflags;

use super::{Error, Result};

/// Current packet version.
pub const PACKET_VERSION: u32 = 0;

/// Size of the packet header in bytes.
pub const PACKET_HEADER_SIZE: usize = 12;

bitflags! {
    /// Flags of a device state packet.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        /// The packet carries the device configuration and ends the stream.
        const CONFIG = 1 << 0;
    }
}

/// One indexed chunk of device state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatePacket {
    /// Position of the chunk in the device state stream.
    pub idx: u32,
    /// Packet flags.
    pub flags: PacketFlags,
    /// Payload.
    pub data: Vec<u8>,
}

impl DeviceStatePacket {
    /// A data packet.
    pub fn data(idx: u32, data: Vec<u8>) -> Self {
        DeviceStatePacket {
            idx,
            flags: PacketFlags::empty(),
            data,
        }
    }

    /// The final packet carrying the framed device configuration.
    pub fn config(idx: u32, data: Vec<u8>) -> Self {
        DeviceStatePacket {
            idx,
            flags: PacketFlags::CONFIG,
            data,
        }
    }

    /// Whether this is the configuration packet.
    pub fn is_config(&self) -> bool {
        self.flags.contains(PacketFlags::CONFIG)
    }

    /// Serialize the packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_HEADER_SIZE + self.data.len());
        buf.extend_from_slice(&PACKET_VERSION.to_be_bytes());
        buf.extend_from_slice(&self.idx.to_be_bytes());
        buf.extend_from_slice(&self.flags.bits().to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse a packet received from a channel.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Err(Error::PacketTooShort(buf.len()));
        }
        let word = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[i * 4..i * 4 + 4]);
            u32::from_be_bytes(b)
        };

        let version = word(0);
        if version != PACKET_VERSION {
            return Err(Error::PacketVersion(version));
        }
        let idx = word(1);
        if idx == u32::MAX {
            return Err(Error::PacketIndex(idx));
        }
        let raw_flags = word(2);
        let flags = PacketFlags::from_bits(raw_flags).ok_or(Error::PacketFlags(raw_flags))?;

        Ok(DeviceStatePacket {
            idx,
            flags,
            data: buf[PACKET_HEADER_SIZE..].to_vec(),
        })
    }
}
