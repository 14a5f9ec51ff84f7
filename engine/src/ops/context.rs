use crate::checkpoint::{CommitLog, DurableState};
use crate::errors::{ensure_invariant, EngineError, Result};
use crate::layout::{NvmLayout, SlotRegion, TensorDescriptor};
use crate::recovery::encoding::saturate;
use crate::recovery::RecoveryStrategy;
use crate::storage::DurableStorage;
use crate::tensor::{read_raw, read_tensor, Tensor};
use tracing::warn;

/// Everything an executing operation may touch, lent by the controller.
pub struct ExecEnv<'a> {
    pub storage: &'a mut dyn DurableStorage,
    pub layout: &'a NvmLayout,
    pub strategy: &'a dyn RecoveryStrategy,
    pub log: &'a mut CommitLog,
    pub state: &'a mut DurableState,
}

/// Result of one operation's write pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSummary {
    /// Physical elements the output covers, footprints included
    pub written: u32,
    /// Logical elements computed in this attempt
    pub computed: u32,
    /// Logical elements found already written by an earlier attempt
    pub skipped: u32,
}

/// Execution context handed to operation handlers.
///
/// Reads go straight to storage. Writes must come in increasing element order
/// starting at [`resume`](Self::resume); they are encoded by the recovery
/// strategy, interleaved with footprints, and batched into bounded transfers.
pub struct OpContext<'a> {
    env: ExecEnv<'a>,
    sample_idx: u16,
    output: TensorDescriptor,
    slot: usize,
    region: SlotRegion,
    resume: u32,
    next: u32,
    pending: Vec<u8>,
    pending_start: u32,
}

impl<'a> OpContext<'a> {
    pub fn new(
        env: ExecEnv<'a>,
        sample_idx: u16,
        output: TensorDescriptor,
        resume: u32,
    ) -> Result<Self> {
        let slot = output.slot.intermediate().ok_or_else(|| {
            EngineError::Invariant(format!("operation output placed in {:?}", output.slot))
        })?;
        ensure_invariant!(
            (slot as usize) < env.state.slots.len(),
            "output slot {} out of range",
            slot
        );
        ensure_invariant!(
            resume <= output.element_count(),
            "resume point {} beyond output of {} values",
            resume,
            output.element_count()
        );
        let region = env.layout.slot(slot);
        Ok(Self {
            env,
            sample_idx,
            output,
            slot: slot as usize,
            region,
            resume,
            next: resume,
            pending: Vec::new(),
            pending_start: 0,
        })
    }

    /// First output element the handler has to compute.
    pub fn resume(&self) -> u32 {
        self.resume
    }

    pub fn sample_idx(&self) -> u16 {
        self.sample_idx
    }

    pub fn load(&mut self, desc: &TensorDescriptor) -> Result<Tensor> {
        read_tensor(self.env.storage, self.env.layout, desc, self.sample_idx)
    }

    pub fn load_raw(&mut self, desc: &TensorDescriptor) -> Result<Vec<i64>> {
        read_raw(self.env.storage, self.env.layout, desc, self.sample_idx)
    }

    /// Write output element `idx`, saturated into the legal range.
    pub fn write(&mut self, idx: u32, value: i32) -> Result<()> {
        ensure_invariant!(
            idx < self.output.element_count(),
            "write to element {} of a {}-element output",
            idx,
            self.output.element_count()
        );
        if idx != self.next {
            self.break_order(idx)?;
        }

        let info = &self.env.state.slots[self.slot];
        let phys = self.output.physical_index(idx);
        let stored = self.env.strategy.encode(info, phys, saturate(value));
        let marker = self.env.strategy.footprint(info);
        self.push(phys, stored)?;

        let fp = self.output.footprints();
        if fp > 0 && (idx + 1) % self.output.tile_c.max(1) as u32 == 0 {
            let marker = marker.ok_or_else(|| {
                EngineError::Invariant("footprint output under a scheme without markers".into())
            })?;
            for j in 1..=fp as u32 {
                self.push(phys + j, marker)?;
            }
        }
        self.next = idx + 1;
        Ok(())
    }

    /// An out-of-order write voids the prefix the strategies rely on: mark the
    /// slot untrusted durably before the write can land.
    fn break_order(&mut self, idx: u32) -> Result<()> {
        self.flush()?;
        let info = &mut self.env.state.slots[self.slot];
        if !info.untrusted {
            info.untrusted = true;
            warn!(
                slot = self.slot,
                expected = self.next,
                got = idx,
                "Out-of-order write, slot will be recomputed in full after a reset"
            );
            self.env.log.commit(self.env.storage, self.env.state)?;
        }
        Ok(())
    }

    fn push(&mut self, phys: u32, stored: i16) -> Result<()> {
        let contiguous = self.pending_start + (self.pending.len() / 2) as u32 == phys;
        if !self.pending.is_empty() && !contiguous {
            self.flush()?;
        }
        if self.pending.is_empty() {
            self.pending_start = phys;
        }
        self.pending.extend_from_slice(&stored.to_le_bytes());
        if self.pending.len() >= self.env.storage.max_transfer() as usize {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let offset = self.region.base + self.output.params_offset + self.pending_start * 2;
        self.env.storage.write_segmented(offset, &self.pending)?;
        self.pending.clear();
        Ok(())
    }

    /// Flush outstanding writes and check that the whole output was produced.
    pub fn finish(mut self) -> Result<OpSummary> {
        self.flush()?;
        let count = self.output.element_count();
        ensure_invariant!(
            self.next == count,
            "handler stopped at element {} of {}",
            self.next,
            count
        );
        Ok(OpSummary {
            written: self.output.physical_count(),
            computed: count - self.resume,
            skipped: self.resume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecoveryMode;
    use crate::layout::SlotId;
    use crate::ops::test_support::Bench;
    use crate::recovery::encoding::fold;

    fn output(len: u16) -> TensorDescriptor {
        TensorDescriptor {
            params_offset: 0,
            params_len: len as u32 * 2,
            bitwidth: 16,
            slot: SlotId::Intermediate(1),
            tile_c: 1,
            dims: [1, len, 0, 0],
            flags: 0,
        }
    }

    fn env(bench: &mut Bench) -> ExecEnv<'_> {
        ExecEnv {
            storage: &mut bench.storage,
            layout: &bench.layout,
            strategy: bench.strategy.as_ref(),
            log: &mut bench.log,
            state: &mut bench.state,
        }
    }

    #[test]
    fn test_writes_are_encoded_with_opposite_polarity() {
        let mut bench = Bench::new(RecoveryMode::TurningPoints);
        let out = output(4);
        let mut ctx = OpContext::new(env(&mut bench), 0, out, 0).unwrap();
        for i in 0..4 {
            ctx.write(i, 100 * i as i32).unwrap();
        }
        let summary = ctx.finish().unwrap();
        assert_eq!(summary.computed, 4);

        let base = bench.layout.slot(1).base;
        assert_eq!(bench.storage.read_i16(base + 2).unwrap(), fold(100, true));
    }

    #[test]
    fn test_values_saturate() {
        let mut bench = Bench::new(RecoveryMode::Footprints);
        let out = output(2);
        let mut ctx = OpContext::new(env(&mut bench), 0, out, 0).unwrap();
        ctx.write(0, 1 << 20).unwrap();
        ctx.write(1, -(1 << 20)).unwrap();
        ctx.finish().unwrap();
        let t = bench.read(&out);
        assert_eq!(t.values, vec![0x1FFF, -0x1FFF]);
    }

    #[test]
    fn test_incomplete_output_is_invariant_violation() {
        let mut bench = Bench::new(RecoveryMode::TurningPoints);
        let mut ctx = OpContext::new(env(&mut bench), 0, output(4), 0).unwrap();
        ctx.write(0, 1).unwrap();
        let err = ctx.finish().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_out_of_order_write_marks_slot_untrusted_durably() {
        let mut bench = Bench::new(RecoveryMode::TurningPoints);
        let mut ctx = OpContext::new(env(&mut bench), 0, output(4), 0).unwrap();
        ctx.write(0, 1).unwrap();
        ctx.write(2, 1).unwrap();
        ctx.write(1, 1).unwrap();
        ctx.write(3, 1).unwrap();
        ctx.finish().unwrap();

        assert!(bench.state.slots[1].untrusted);
        let committed = bench.log.load(&mut bench.storage).unwrap().unwrap();
        assert!(committed.slots[1].untrusted);
    }

    #[test]
    fn test_write_past_end_rejected() {
        let mut bench = Bench::new(RecoveryMode::TurningPoints);
        let mut ctx = OpContext::new(env(&mut bench), 0, output(2), 0).unwrap();
        assert!(ctx.write(2, 0).is_err());
    }
}
