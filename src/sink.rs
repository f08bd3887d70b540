//! Outbound packet sink

use parking_lot::Mutex;

use crate::error::Result;

/// Destination for synthesized client-bound packets, typically the tun
/// device write side.
pub trait PacketSink: Send + Sync {
    fn write_packet(&self, packet: &[u8]) -> Result<()>;
}

/// In-memory sink collecting packets, used by tests and diagnostics
#[derive(Default)]
pub struct BufferSink {
    packets: Mutex<Vec<Vec<u8>>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.packets.lock())
    }
}

impl PacketSink for BufferSink {
    fn write_packet(&self, packet: &[u8]) -> Result<()> {
        self.packets.lock().push(packet.to_vec());
        Ok(())
    }
}
