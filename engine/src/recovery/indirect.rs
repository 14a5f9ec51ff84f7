use super::encoding::{embedded_bit, fold};
use super::{fill_slot, first_pending, RecoveryStrategy};
use crate::config::RecoveryMode;
use crate::errors::Result;
use crate::layout::{SlotInfo, SlotRegion, TensorDescriptor};
use crate::storage::DurableStorage;
use tracing::{debug, warn};

/// Indirect recovery through bits embedded in the values themselves.
///
/// `SlotInfo::polarity(x)` is the bit committed data at `x` carries. A writer
/// stores the opposite bit, so an element is already written by the current
/// attempt iff its stored bit differs from the committed polarity. Committing a
/// write of length `L` flips `state_bit` and toggles a turning point at `L`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurningPointStrategy;

fn stored_at(storage: &mut dyn DurableStorage, base: u32, phys: u32) -> Result<i16> {
    storage.read_i16(base + phys * 2)
}

impl RecoveryStrategy for TurningPointStrategy {
    fn mode(&self) -> RecoveryMode {
        RecoveryMode::TurningPoints
    }

    fn needs_normalize(&self, info: &SlotInfo) -> bool {
        info.untrusted
    }

    fn normalize(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        info: &mut SlotInfo,
    ) -> Result<()> {
        fill_slot(storage, region, fold(0, info.state_bit))?;
        info.turning_points.clear();
        info.untrusted = false;
        debug!(
            base = region.base,
            state_bit = info.state_bit,
            "Slot normalized to uniform polarity"
        );
        Ok(())
    }

    fn progress(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        desc: &TensorDescriptor,
        info: &SlotInfo,
    ) -> Result<u32> {
        if info.untrusted {
            return Ok(0);
        }
        let base = region.base + desc.params_offset;
        first_pending(desc.physical_count(), |x| {
            Ok(embedded_bit(stored_at(storage, base, x)?) != info.polarity(x))
        })
    }

    fn is_fresh(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        desc: &TensorDescriptor,
        info: &SlotInfo,
        idx: u32,
    ) -> Result<bool> {
        if info.untrusted {
            return Ok(false);
        }
        let phys = desc.physical_index(idx);
        let stored = stored_at(storage, region.base + desc.params_offset, phys)?;
        Ok(embedded_bit(stored) == info.polarity(phys))
    }

    fn encode(&self, info: &SlotInfo, phys: u32, value: i16) -> i16 {
        fold(value, !info.polarity(phys))
    }

    fn footprint(&self, _info: &SlotInfo) -> Option<i16> {
        None
    }

    fn complete(&self, info: &mut SlotInfo, written: u32, region: SlotRegion) {
        info.state_bit = !info.state_bit;
        if info.untrusted {
            info.turning_points.clear();
            return;
        }
        if written >= region.elements() {
            return;
        }
        if let Err(e) = info.turning_points.toggle(written as u16) {
            warn!(
                base = region.base,
                written,
                error = %e,
                "Turning point list rejected, slot falls back to full recomputation"
            );
            info.untrusted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SlotId;
    use crate::recovery::TurningPoints;
    use crate::storage::MemStorage;
    use proptest::prelude::*;

    const REGION: SlotRegion = SlotRegion { base: 64, size: 64 };

    fn desc(len: u16) -> TensorDescriptor {
        TensorDescriptor {
            params_offset: 0,
            params_len: len as u32 * 2,
            bitwidth: 16,
            slot: SlotId::Intermediate(0),
            tile_c: 1,
            dims: [1, len, 0, 0],
            flags: 0,
        }
    }

    /// Write `values[..upto]` the way an operation does.
    fn write_prefix(storage: &mut MemStorage, info: &SlotInfo, values: &[i16], upto: usize) {
        let strategy = TurningPointStrategy;
        for (i, &v) in values.iter().enumerate().take(upto) {
            let stored = strategy.encode(info, i as u32, v);
            storage.write_i16(REGION.base + 2 * i as u32, stored).unwrap();
        }
    }

    fn normalized(storage: &mut MemStorage) -> SlotInfo {
        let mut info = SlotInfo::untrusted();
        TurningPointStrategy
            .normalize(storage, REGION, &mut info)
            .unwrap();
        info
    }

    #[test]
    fn test_progress_tracks_partial_write() {
        let mut storage = MemStorage::new(256, 64);
        let info = normalized(&mut storage);
        let values = [5, -3, 0, 100, -200, 7, 7, 1];

        for upto in 0..=values.len() {
            write_prefix(&mut storage, &info, &values, upto);
            let resume = TurningPointStrategy
                .progress(&mut storage, REGION, &desc(8), &info)
                .unwrap();
            assert_eq!(resume, upto as u32);
        }
    }

    #[test]
    fn test_commit_makes_written_prefix_fresh() {
        let mut storage = MemStorage::new(256, 64);
        let strategy = TurningPointStrategy;
        let mut info = normalized(&mut storage);
        let values = [1, 2, 3, 4, 5, 6];

        write_prefix(&mut storage, &info, &values, 6);
        strategy.complete(&mut info, 6, REGION);
        assert_eq!(info.turning_points.as_slice(), &[6]);

        for i in 0..6 {
            assert!(strategy
                .is_fresh(&mut storage, REGION, &desc(6), &info, i)
                .unwrap());
        }
        // next writer of the same slot starts from scratch
        assert_eq!(
            strategy
                .progress(&mut storage, REGION, &desc(6), &info)
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_full_slot_write_adds_no_turning_point() {
        let mut info = SlotInfo::default();
        TurningPointStrategy.complete(&mut info, REGION.elements(), REGION);
        assert!(info.state_bit);
        assert!(info.turning_points.is_empty());
    }

    #[test]
    fn test_overflow_marks_untrusted_without_touching_list() {
        let points: Vec<u16> = (1..=8).map(|i| i * 2).collect();
        let mut info = SlotInfo {
            turning_points: TurningPoints::from_sorted(&points).unwrap(),
            ..SlotInfo::default()
        };
        TurningPointStrategy.complete(&mut info, 3, REGION);
        assert!(info.untrusted);
        assert_eq!(info.turning_points.as_slice(), points.as_slice());
        assert!(TurningPointStrategy.needs_normalize(&info));
    }

    #[test]
    fn test_untrusted_slot_reads_stale() {
        let mut storage = MemStorage::new(256, 64);
        let info = SlotInfo::untrusted();
        assert!(!TurningPointStrategy
            .is_fresh(&mut storage, REGION, &desc(4), &info, 0)
            .unwrap());
    }

    proptest! {
        /// Simulate a sequence of committed writes of varying length against a
        /// per-element reference bitmap, interrupting the last one part way.
        #[test]
        fn test_polarity_matches_reference_bitmap(
            lengths in proptest::collection::vec(1u32..=32, 1..12),
            cut in 0u32..=32,
        ) {
            let strategy = TurningPointStrategy;
            let mut storage = MemStorage::new(256, 64);
            let mut info = normalized(&mut storage);
            let mut reference = vec![info.state_bit; REGION.elements() as usize];

            for &len in &lengths {
                if strategy.needs_normalize(&info) {
                    strategy.normalize(&mut storage, REGION, &mut info).unwrap();
                    reference.iter_mut().for_each(|b| *b = info.state_bit);
                }
                for x in 0..len {
                    let stored = strategy.encode(&info, x, (x as i16) - 5);
                    storage.write_i16(REGION.base + 2 * x, stored).unwrap();
                    reference[x as usize] = !reference[x as usize];
                }
                strategy.complete(&mut info, len, REGION);
                if !info.untrusted {
                    for x in 0..REGION.elements() {
                        prop_assert_eq!(info.polarity(x), reference[x as usize]);
                    }
                }
            }

            if !strategy.needs_normalize(&info) {
                let len = *lengths.last().unwrap();
                let upto = cut.min(len);
                for x in 0..upto {
                    let stored = strategy.encode(&info, x, 9);
                    storage.write_i16(REGION.base + 2 * x, stored).unwrap();
                }
                let resume = strategy.progress(&mut storage, REGION, &desc(len as u16), &info).unwrap();
                prop_assert_eq!(resume, upto);
            }
        }
    }
}
