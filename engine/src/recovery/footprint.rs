use super::{fill_slot, first_pending, RecoveryStrategy};
use crate::config::RecoveryMode;
use crate::errors::Result;
use crate::layout::{SlotInfo, SlotRegion, TensorDescriptor};
use crate::storage::DurableStorage;
use tracing::debug;

/// Largest write epoch; the next commit would wrap and forces a normalize.
pub const FOOTPRINT_EPOCH_MAX: u16 = 0x3FFF;

/// Markers live above the legal value range so stale values never match.
const MARKER_BASE: i16 = 0x4000;

fn marker(epoch: u16) -> i16 {
    MARKER_BASE | (epoch & FOOTPRINT_EPOCH_MAX) as i16
}

/// Explicit progress markers after each group of `tile_c` values.
///
/// The committed epoch `E` sits in `SlotInfo::footprint_epoch`; the writer
/// stamps groups with `E + 1`. Epochs only grow between normalizations, so no
/// leftover marker can carry the writer's epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FootprintStrategy;

impl FootprintStrategy {
    /// Physical position of the last footprint of group `g`.
    fn marker_index(desc: &TensorDescriptor, g: u32) -> u32 {
        (g + 1) * desc.group_stride() - 1
    }

    fn marker_at(
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        desc: &TensorDescriptor,
        g: u32,
    ) -> Result<i16> {
        storage.read_i16(region.base + desc.params_offset + 2 * Self::marker_index(desc, g))
    }
}

impl RecoveryStrategy for FootprintStrategy {
    fn mode(&self) -> RecoveryMode {
        RecoveryMode::Footprints
    }

    fn needs_normalize(&self, info: &SlotInfo) -> bool {
        info.untrusted || info.footprint_epoch >= FOOTPRINT_EPOCH_MAX
    }

    fn normalize(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        info: &mut SlotInfo,
    ) -> Result<()> {
        fill_slot(storage, region, 0)?;
        info.footprint_epoch = 0;
        info.turning_points.clear();
        info.untrusted = false;
        debug!(base = region.base, "Slot footprints cleared");
        Ok(())
    }

    fn progress(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        desc: &TensorDescriptor,
        info: &SlotInfo,
    ) -> Result<u32> {
        if info.untrusted || desc.footprints() == 0 {
            return Ok(0);
        }
        let current = marker(info.footprint_epoch + 1);
        let groups = first_pending(desc.group_count(), |g| {
            Ok(Self::marker_at(storage, region, desc, g)? == current)
        })?;
        Ok(groups * desc.tile_c.max(1) as u32)
    }

    fn is_fresh(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        desc: &TensorDescriptor,
        info: &SlotInfo,
        idx: u32,
    ) -> Result<bool> {
        if info.untrusted || info.footprint_epoch == 0 || desc.footprints() == 0 {
            return Ok(false);
        }
        let g = idx / desc.tile_c.max(1) as u32;
        Ok(Self::marker_at(storage, region, desc, g)? == marker(info.footprint_epoch))
    }

    fn encode(&self, _info: &SlotInfo, _phys: u32, value: i16) -> i16 {
        value
    }

    fn footprint(&self, info: &SlotInfo) -> Option<i16> {
        Some(marker(info.footprint_epoch + 1))
    }

    fn complete(&self, info: &mut SlotInfo, _written: u32, _region: SlotRegion) {
        info.footprint_epoch = (info.footprint_epoch + 1).min(FOOTPRINT_EPOCH_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SlotId;
    use crate::recovery::encoding::LEGAL_MAX;
    use crate::storage::MemStorage;

    const REGION: SlotRegion = SlotRegion { base: 32, size: 64 };

    fn eight_channels() -> TensorDescriptor {
        let mut desc = TensorDescriptor {
            params_offset: 0,
            params_len: 20,
            bitwidth: 16,
            slot: SlotId::Intermediate(0),
            tile_c: 4,
            dims: [1, 8, 1, 1],
            flags: 0,
        };
        desc.set_footprints(1);
        desc
    }

    /// Write logical values `0..upto` with their footprints.
    fn write_groups(storage: &mut MemStorage, info: &SlotInfo, desc: &TensorDescriptor, upto: u32) {
        let strategy = FootprintStrategy;
        for i in 0..upto {
            let phys = desc.physical_index(i);
            let value = strategy.encode(info, phys, i as i16 * 100);
            storage.write_i16(REGION.base + 2 * phys, value).unwrap();
            if (i + 1) % desc.tile_c as u32 == 0 {
                let m = strategy.footprint(info).unwrap();
                storage.write_i16(REGION.base + 2 * (phys + 1), m).unwrap();
            }
        }
    }

    #[test]
    fn test_marker_outside_legal_range() {
        assert!(marker(1) > LEGAL_MAX);
        assert!(marker(FOOTPRINT_EPOCH_MAX) > LEGAL_MAX);
        assert_ne!(marker(1), 0);
    }

    #[test]
    fn test_eight_channels_two_footprints() {
        let strategy = FootprintStrategy;
        let mut storage = MemStorage::new(256, 64);
        let mut info = SlotInfo::untrusted();
        strategy.normalize(&mut storage, REGION, &mut info).unwrap();
        let desc = eight_channels();

        write_groups(&mut storage, &info, &desc, 8);
        let raw: Vec<i16> = (0..desc.physical_count())
            .map(|p| storage.read_i16(REGION.base + 2 * p).unwrap())
            .collect();
        let expected_marker = marker(1);
        assert_eq!(raw.iter().filter(|&&v| v == expected_marker).count(), 2);
        assert_eq!(raw[4], expected_marker);
        assert_eq!(raw[9], expected_marker);

        assert_eq!(strategy.progress(&mut storage, REGION, &desc, &info).unwrap(), 8);
        strategy.complete(&mut info, desc.physical_count(), REGION);
        assert_eq!(info.footprint_epoch, 1);
        for i in 0..8 {
            assert!(strategy.is_fresh(&mut storage, REGION, &desc, &info, i).unwrap());
        }
    }

    #[test]
    fn test_progress_counts_whole_groups_only() {
        let strategy = FootprintStrategy;
        let mut storage = MemStorage::new(256, 64);
        let mut info = SlotInfo::untrusted();
        strategy.normalize(&mut storage, REGION, &mut info).unwrap();
        let desc = eight_channels();

        write_groups(&mut storage, &info, &desc, 6);
        assert_eq!(strategy.progress(&mut storage, REGION, &desc, &info).unwrap(), 4);

        write_groups(&mut storage, &info, &desc, 3);
        assert_eq!(strategy.progress(&mut storage, REGION, &desc, &info).unwrap(), 4);
    }

    #[test]
    fn test_previous_epoch_is_not_progress() {
        let strategy = FootprintStrategy;
        let mut storage = MemStorage::new(256, 64);
        let mut info = SlotInfo::untrusted();
        strategy.normalize(&mut storage, REGION, &mut info).unwrap();
        let desc = eight_channels();

        write_groups(&mut storage, &info, &desc, 8);
        strategy.complete(&mut info, desc.physical_count(), REGION);

        // the next writer of this slot finds nothing done
        assert_eq!(strategy.progress(&mut storage, REGION, &desc, &info).unwrap(), 0);
    }

    #[test]
    fn test_epoch_exhaustion_requires_normalize() {
        let mut info = SlotInfo {
            footprint_epoch: FOOTPRINT_EPOCH_MAX - 1,
            ..SlotInfo::default()
        };
        assert!(!FootprintStrategy.needs_normalize(&info));
        FootprintStrategy.complete(&mut info, 0, REGION);
        assert!(FootprintStrategy.needs_normalize(&info));
    }
}
