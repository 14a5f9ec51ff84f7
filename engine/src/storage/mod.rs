//! Durable storage primitive
//!
//! The engine treats non-volatile memory as a flat byte arena accessed through
//! synchronous, size-bounded transfers. Three implementations exist:
//! - [`MemStorage`]: a `Vec<u8>` arena, used by tests
//! - [`FileStorage`]: a fixed-size file, the reference platform's NVM
//! - [`PowerCut`]: wraps another storage and cuts power after N writes

mod fault;
mod file;
mod memory;

pub use fault::PowerCut;
pub use file::FileStorage;
pub use memory::MemStorage;

use crate::errors::{EngineError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Pattern written below the bulk region to check the storage link at boot.
pub const SELF_TEST_PATTERN: [u8; 16] = [
    0xA5, 0x5A, 0x00, 0xFF, 0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0xC3, 0x3C, 0x69, 0x96,
];

/// Byte-addressed, synchronous non-volatile memory.
///
/// A single `read`/`write` must not exceed [`max_transfer`](Self::max_transfer)
/// bytes; the `*_segmented` helpers split larger transfers. An aligned write of
/// at most `max_transfer` bytes may still be torn by power loss at 2-byte
/// granularity, so callers that need atomicity must arrange it themselves.
pub trait DurableStorage {
    /// Total size of the arena in bytes.
    fn capacity(&self) -> u32;

    /// Largest single transfer in bytes.
    fn max_transfer(&self) -> u32;

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()>;

    /// Reset the whole arena to zero.
    fn erase(&mut self) -> Result<()>;

    /// Read an arbitrarily long range in bounded chunks.
    fn read_segmented(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let chunk = self.max_transfer() as usize;
        let mut done = 0usize;
        while done < buf.len() {
            let len = chunk.min(buf.len() - done);
            self.read(offset + done as u32, &mut buf[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    /// Write an arbitrarily long range in bounded chunks, lowest offset first.
    fn write_segmented(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let chunk = self.max_transfer() as usize;
        let mut done = 0usize;
        while done < data.len() {
            let len = chunk.min(data.len() - done);
            self.write(offset + done as u32, &data[done..done + len])?;
            done += len;
        }
        Ok(())
    }

    fn read_vec(&mut self, offset: u32, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_segmented(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_u16(&mut self, offset: u32) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn write_u16(&mut self, offset: u32, value: u16) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    fn read_i16(&mut self, offset: u32) -> Result<i16> {
        let mut buf = [0u8; 2];
        self.read(offset, &mut buf)?;
        Ok(i16::from_le_bytes(buf))
    }

    fn write_i16(&mut self, offset: u32, value: i16) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl<S: DurableStorage + ?Sized> DurableStorage for &mut S {
    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn max_transfer(&self) -> u32 {
        (**self).max_transfer()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        (**self).read(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        (**self).write(offset, data)
    }

    fn erase(&mut self) -> Result<()> {
        (**self).erase()
    }
}

/// Reject transfers that fall outside the arena or exceed the transfer bound.
pub(crate) fn check_transfer(capacity: u32, max_transfer: u32, offset: u32, len: usize) -> Result<()> {
    if len > max_transfer as usize {
        return Err(EngineError::Storage(format!(
            "transfer of {} bytes exceeds the {} byte limit",
            len, max_transfer
        )));
    }
    let end = offset as u64 + len as u64;
    if end > capacity as u64 {
        return Err(EngineError::Storage(format!(
            "transfer {}..{} outside arena of {} bytes",
            offset, end, capacity
        )));
    }
    Ok(())
}

/// Write and read back [`SELF_TEST_PATTERN`], retrying with a short back-off.
///
/// Gives up with [`EngineError::SelfTest`] after `retries` attempts; the caller
/// treats that as a hard reset. Power loss is passed through untouched.
pub fn self_test<S: DurableStorage + ?Sized>(storage: &mut S, retries: u32) -> Result<()> {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        match probe(storage) {
            Ok(true) => {
                debug!(attempt, "Storage self-test passed");
                return Ok(());
            }
            Ok(false) => {
                warn!(attempt, attempts, "Storage self-test pattern mismatch");
            }
            Err(e) if e.is_power_loss() => return Err(e),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "Storage self-test transfer failed");
            }
        }
        if attempt < attempts {
            std::thread::sleep(Duration::from_millis(5 * attempt as u64));
        }
    }
    Err(EngineError::SelfTest { attempts })
}

fn probe<S: DurableStorage + ?Sized>(storage: &mut S) -> Result<bool> {
    storage.write_segmented(0, &SELF_TEST_PATTERN)?;
    let mut back = [0u8; SELF_TEST_PATTERN.len()];
    storage.read_segmented(0, &mut back)?;
    Ok(back == SELF_TEST_PATTERN)
}
