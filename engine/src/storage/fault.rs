use super::DurableStorage;
use crate::errors::{EngineError, Result};
use tracing::warn;

/// Fault-injecting wrapper that simulates power loss.
///
/// After `budget` successful writes the next write fails with
/// [`EngineError::PowerLoss`], optionally after persisting a prefix of it
/// (a torn write, 2-byte granular). Every transfer after the cut fails the same
/// way until [`revive`](Self::revive) restores power.
#[derive(Debug)]
pub struct PowerCut<S> {
    inner: S,
    budget: Option<u64>,
    writes: u64,
    torn: bool,
    dead: bool,
}

impl<S: DurableStorage> PowerCut<S> {
    /// Wrap `inner` with power that never fails.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            budget: None,
            writes: 0,
            torn: false,
            dead: false,
        }
    }

    /// Cut power once `writes` more writes have completed.
    pub fn cut_after(mut self, writes: u64) -> Self {
        self.arm(writes);
        self
    }

    /// Make the failing write persist its first half before dying.
    pub fn torn(mut self) -> Self {
        self.torn = true;
        self
    }

    pub fn arm(&mut self, writes: u64) {
        self.budget = Some(self.writes + writes);
    }

    /// Restore power and disarm the cut.
    pub fn revive(&mut self) {
        self.dead = false;
        self.budget = None;
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Writes that completed since construction.
    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn lost(&self) -> EngineError {
        EngineError::PowerLoss {
            writes: self.writes,
        }
    }
}

impl<S: DurableStorage> DurableStorage for PowerCut<S> {
    fn capacity(&self) -> u32 {
        self.inner.capacity()
    }

    fn max_transfer(&self) -> u32 {
        self.inner.max_transfer()
    }

    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<()> {
        if self.dead {
            return Err(self.lost());
        }
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        if self.dead {
            return Err(self.lost());
        }
        if self.budget.is_some_and(|budget| self.writes >= budget) {
            if self.torn && data.len() >= 4 {
                let keep = (data.len() / 2) & !1;
                self.inner.write(offset, &data[..keep])?;
            }
            self.dead = true;
            warn!(
                writes = self.writes,
                offset,
                len = data.len(),
                torn = self.torn,
                "Simulated power loss"
            );
            return Err(self.lost());
        }
        self.inner.write(offset, data)?;
        self.writes += 1;
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        if self.dead {
            return Err(self.lost());
        }
        self.inner.erase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    #[test]
    fn test_cut_after_budget() {
        let mut storage = PowerCut::new(MemStorage::new(256, 64)).cut_after(2);
        storage.write(0, &[1, 1]).unwrap();
        storage.write(2, &[2, 2]).unwrap();

        let err = storage.write(4, &[3, 3]).unwrap_err();
        assert!(err.is_power_loss());
        assert!(storage.is_dead());
        assert!(storage.read_u16(0).unwrap_err().is_power_loss());
        assert_eq!(storage.inner().as_bytes()[4], 0);
    }

    #[test]
    fn test_torn_write_keeps_prefix() {
        let mut storage = PowerCut::new(MemStorage::new(256, 64)).cut_after(0).torn();
        assert!(storage.write(0, &[9u8; 8]).is_err());
        assert_eq!(&storage.inner().as_bytes()[..8], &[9, 9, 9, 9, 0, 0, 0, 0]);
    }

    #[test]
    fn test_revive_restores_power() {
        let mut storage = PowerCut::new(MemStorage::new(256, 64)).cut_after(0);
        assert!(storage.write(0, &[1]).is_err());
        storage.revive();
        storage.write(0, &[1]).unwrap();
        assert_eq!(storage.writes(), 1);

        storage.arm(1);
        storage.write(1, &[1]).unwrap();
        assert!(storage.write(2, &[1]).is_err());
    }
}
