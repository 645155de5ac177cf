//! # Packet Reassembly
//!
//! Rebuilds 16-byte packets from a byte stream that may deliver partial
//! packets, several packets at once, or line noise between them.
//!
//! Two fixed slots are used: bytes land in the active slot, and a completed
//! slot stays untouched (and readable) while the next packet fills the other
//! one. No allocation happens on the hot path.

use tracing::{trace, warn};

use super::protocol::*;

/// Double-buffered streaming packet reassembler
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    slots: [RawPacket; 2],
    cursor: usize,
    active: usize,
    ready: bool,
    completed: u64,
    resyncs: u64,
    discarded: u64,
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblyBuffer {
    /// Create an empty reassembler
    pub fn new() -> Self {
        Self {
            slots: [[0u8; PACKET_LEN]; 2],
            cursor: 0,
            active: 0,
            ready: false,
            completed: 0,
            resyncs: 0,
            discarded: 0,
        }
    }

    /// Feed one byte from the wire
    ///
    /// # Returns
    ///
    /// * `Option<RawPacket>` - The completed packet when `byte` is a `>`
    ///   landing exactly at offset 15 of a packet that started with `<`
    ///
    /// A `>` at any other offset is a resync point: the partial packet is
    /// dropped and assembly restarts. A slot that fills up without a `>` at
    /// offset 15 is discarded as malformed.
    pub fn feed(&mut self, byte: u8) -> Option<RawPacket> {
        // Skip up to the next start marker
        if self.cursor == 0 && byte != PACKET_START {
            return None;
        }

        self.slots[self.active][self.cursor] = byte;

        if byte == PACKET_END {
            if self.cursor == PACKET_LEN - 1 {
                let packet = self.slots[self.active];
                self.ready = true;
                self.completed += 1;
                self.cursor = 0;
                self.active ^= 1;
                return Some(packet);
            }

            trace!("End marker at offset {}, resynchronizing", self.cursor);
            self.resyncs += 1;
            self.cursor = 0;
            // Never flip onto a slot still holding an unconsumed packet
            if !self.ready {
                self.active ^= 1;
            }
            return None;
        }

        self.cursor += 1;
        if self.cursor == PACKET_LEN {
            warn!("Clearing malformed packet (no end marker at offset 15)");
            self.discarded += 1;
            self.cursor = 0;
        }
        None
    }

    /// Feed a run of bytes, returning the last packet completed by them
    pub fn feed_slice(&mut self, bytes: &[u8]) -> Option<RawPacket> {
        let mut last = None;
        for &byte in bytes {
            if let Some(packet) = self.feed(byte) {
                last = Some(packet);
            }
        }
        last
    }

    /// The most recently completed packet, if it has not been consumed yet
    pub fn ready_packet(&self) -> Option<&RawPacket> {
        if self.ready {
            Some(&self.slots[self.active ^ 1])
        } else {
            None
        }
    }

    /// Mark the ready packet as consumed
    pub fn clear_ready(&mut self) {
        self.ready = false;
    }

    /// Drop any partial packet and the ready flag
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.active = 0;
        self.ready = false;
    }

    /// Bytes accumulated towards the packet currently being assembled
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Packets completed since creation
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Out-of-position end markers seen since creation
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Full slots thrown away for lacking an end marker
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}
