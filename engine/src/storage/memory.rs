use super::{check_transfer, DurableStorage};
use crate::errors::Result;

/// Volatile arena standing in for NVM.
///
/// Contents survive as long as the value does, which is what a simulated
/// reboot needs: drop the controller, keep the storage.
#[derive(Debug, Clone)]
pub struct MemStorage {
    bytes: Vec<u8>,
    max_transfer: u32,
    writes: u64,
}

impl MemStorage {
    pub fn new(capacity: u32, max_transfer: u32) -> Self {
        Self {
            bytes: vec![0u8; capacity as usize],
            max_transfer,
            writes: 0,
        }
    }

    /// Number of successful `write` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl DurableStorage for MemStorage {
    fn capacity(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn max_transfer(&self) -> u32 {
        self.max_transfer
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        check_transfer(self.capacity(), self.max_transfer, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        check_transfer(self.capacity(), self.max_transfer, offset, data.len())?;
        let start = offset as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        self.bytes.fill(0);
        Ok(())
    }
}
