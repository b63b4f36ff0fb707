// Copyright (C) 2025 Red Hat. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! The source side of multifd device state transfer.

use std::io::{self, Read};
use std::sync::mpsc::Sender;

use log::debug;

use super::{encode_config, DeviceConfig, DeviceStatePacket, Error, Result};
use crate::bql::Bql;

/// Destination of outgoing device state packets.
pub trait PacketSink {
    /// Queue `packet` on a channel.
    fn send(&mut self, packet: DeviceStatePacket) -> Result<()>;
}

impl PacketSink for Vec<DeviceStatePacket> {
    fn send(&mut self, packet: DeviceStatePacket) -> Result<()> {
        self.push(packet);
        Ok(())
    }
}

impl PacketSink for Sender<DeviceStatePacket> {
    fn send(&mut self, packet: DeviceStatePacket) -> Result<()> {
        // The receiving side went away, so did the migration.
        Sender::send(self, packet).map_err(|_| Error::Cancelled)
    }
}

fn next_index(idx: u32) -> Result<u32> {
    match idx.checked_add(1) {
        Some(next) if next != u32::MAX => Ok(next),
        _ => Err(Error::PacketIndex(u32::MAX)),
    }
}

/// Read `reader` to its end in chunks of up to `chunk_size` bytes, sending one data packet per
/// chunk, followed by the configuration packet.
///
/// `should_abort` is polled before every read. Returns the number of packets sent.
pub fn send_device_state<R, M>(
    reader: &mut R,
    chunk_size: usize,
    sink: &mut dyn PacketSink,
    should_abort: &dyn Fn() -> bool,
    bql: &Bql<M>,
) -> Result<u32>
where
    R: Read + ?Sized,
    M: DeviceConfig,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut idx = 0u32;
    loop {
        if should_abort() {
            return Err(Error::Cancelled);
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        sink.send(DeviceStatePacket::data(idx, buf[..n].to_vec()))?;
        idx = next_index(idx)?;
    }

    let config = {
        let mut device = bql.lock();
        encode_config(&mut *device)?
    };
    sink.send(DeviceStatePacket::config(idx, config))?;
    debug!("sent {} device state packets", idx + 1);
    Ok(idx + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matches::assert_matches;
    use std::cell::Cell;
    use std::io::Cursor;
    use std::sync::mpsc::channel;

    use crate::migration::{decode_config, END_OF_STATE};
    use crate::test_utils::MockConfig;

    #[test]
    fn test_chunking_and_config_last() {
        let bql = Bql::new(MockConfig::new(b"cfg"));
        let mut packets = Vec::new();
        let sent = send_device_state(
            &mut Cursor::new(vec![7u8; 10]),
            4,
            &mut packets,
            &|| false,
            &bql,
        )
        .unwrap();

        assert_eq!(sent, 4);
        let lens: Vec<_> = packets.iter().map(|p| p.data.len()).collect();
        assert_eq!(&lens[..3], &[4, 4, 2]);
        assert!(packets[..3].iter().all(|p| !p.is_config()));
        assert!(packets.iter().enumerate().all(|(i, p)| p.idx == i as u32));

        let config = &packets[3];
        assert!(config.is_config());
        assert!(config.data.ends_with(&END_OF_STATE.to_be_bytes()));
        let mut loaded = MockConfig::new(b"");
        decode_config(&mut loaded, &config.data).unwrap();
        assert_eq!(loaded.loaded(), b"cfg".to_vec());
    }

    #[test]
    fn test_empty_stream_sends_only_config() {
        let bql = Bql::new(MockConfig::new(b""));
        let (tx, rx) = channel();
        let mut tx = tx;
        let sent =
            send_device_state(&mut io::empty(), 16, &mut tx, &|| false, &bql).unwrap();
        assert_eq!(sent, 1);
        let p = rx.recv().unwrap();
        assert_eq!(p.idx, 0);
        assert!(p.is_config());
    }

    #[test]
    fn test_abort_checked_before_each_read() {
        let bql = Bql::new(MockConfig::new(b""));
        let calls = Cell::new(0);
        let abort = || {
            calls.set(calls.get() + 1);
            calls.get() > 2
        };
        let mut packets = Vec::new();
        assert_matches!(
            send_device_state(
                &mut Cursor::new(vec![0u8; 100]),
                10,
                &mut packets,
                &abort,
                &bql,
            ),
            Err(Error::Cancelled)
        );
        assert_eq!(packets.len(), 2);
    }

    #[test]
    fn test_closed_channel() {
        let bql = Bql::new(MockConfig::new(b""));
        let (tx, rx) = channel();
        drop(rx);
        let mut tx = tx;
        assert_matches!(
            send_device_state(&mut Cursor::new(vec![1u8]), 16, &mut tx, &|| false, &bql),
            Err(Error::Cancelled)
        );
    }

    #[test]
    fn test_index_exhaustion() {
        assert_eq!(next_index(0).unwrap(), 1);
        assert_matches!(next_index(u32::MAX - 1), Err(Error::PacketIndex(u32::MAX)));
    }
}
