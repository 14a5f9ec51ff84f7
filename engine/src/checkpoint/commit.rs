//! Double-buffered commit record
//!
//! The durable execution position and every slot's recovery metadata are
//! written together as one record: `RunState ‖ SlotInfo × N ‖ seq ‖ crc32`.
//! Two copies live in the control region. A commit always overwrites the copy
//! that is not current, so a torn commit leaves the previous record intact and
//! boot picks the CRC-valid copy with the newest sequence number.

use crate::errors::{EngineError, Result};
use crate::layout::{NvmLayout, RunState, SlotInfo, SLOT_INFO_SIZE};
use crate::storage::DurableStorage;
use tracing::{debug, warn};

/// Everything a commit makes durable in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableState {
    pub run_state: RunState,
    pub slots: Vec<SlotInfo>,
}

impl DurableState {
    /// Fresh state with every slot untrusted.
    pub fn new(nodes_len: u16, n_input: u16, num_slots: u8) -> Self {
        Self {
            run_state: RunState::new(nodes_len, n_input, num_slots as usize),
            slots: vec![SlotInfo::untrusted(); num_slots as usize],
        }
    }

    fn encode(&self, seq: u32) -> Vec<u8> {
        let mut out = self.run_state.encode();
        for info in &self.slots {
            out.extend_from_slice(&info.encode());
        }
        out.extend_from_slice(&seq.to_le_bytes());
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode one record copy. `Ok(None)` when the checksum does not match.
    fn decode(bytes: &[u8], num_slots: usize) -> Result<Option<(u32, Self)>> {
        let Some(body_len) = bytes.len().checked_sub(4) else {
            return Ok(None);
        };
        let (body, crc) = bytes.split_at(body_len);
        let stored_crc = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != stored_crc {
            return Ok(None);
        }

        let run_len = RunState::encoded_len(num_slots);
        let slots_end = run_len + num_slots * SLOT_INFO_SIZE;
        if body.len() != slots_end + 4 {
            return Err(EngineError::Corrupt(format!(
                "commit record of {} bytes, expected {}",
                bytes.len(),
                slots_end + 8
            )));
        }
        let run_state = RunState::decode(&body[..run_len], num_slots)?;
        let slots = body[run_len..slots_end]
            .chunks_exact(SLOT_INFO_SIZE)
            .map(SlotInfo::decode)
            .collect::<Result<Vec<_>>>()?;
        let seq = u32::from_le_bytes([
            body[slots_end],
            body[slots_end + 1],
            body[slots_end + 2],
            body[slots_end + 3],
        ]);
        Ok(Some((seq, Self { run_state, slots })))
    }
}

/// `a` is newer than `b` in wrapping sequence order.
fn newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Writer side of the two record copies.
#[derive(Debug, Clone)]
pub struct CommitLog {
    offsets: [u32; 2],
    record_len: u32,
    num_slots: usize,
    /// Copy holding the newest valid record, if any
    current: Option<usize>,
    seq: u32,
}

impl CommitLog {
    pub fn new(layout: &NvmLayout) -> Self {
        Self {
            offsets: layout.commit_offsets,
            record_len: layout.commit_len,
            num_slots: layout.num_slots as usize,
            current: None,
            seq: 0,
        }
    }

    /// Sequence number of the last record loaded or committed.
    pub fn sequence(&self) -> u32 {
        self.seq
    }

    /// Read both copies and return the newest valid one.
    pub fn load(&mut self, storage: &mut dyn DurableStorage) -> Result<Option<DurableState>> {
        let mut best: Option<(usize, u32, DurableState)> = None;
        for (copy, &offset) in self.offsets.iter().enumerate() {
            let bytes = storage.read_vec(offset, self.record_len as usize)?;
            match DurableState::decode(&bytes, self.num_slots)? {
                Some((seq, state)) => {
                    if best.as_ref().map_or(true, |(_, s, _)| newer(seq, *s)) {
                        best = Some((copy, seq, state));
                    }
                }
                None => debug!(copy, offset, "Commit record copy invalid"),
            }
        }

        match best {
            Some((copy, seq, state)) => {
                debug!(copy, seq, "Loaded commit record");
                self.current = Some(copy);
                self.seq = seq;
                Ok(Some(state))
            }
            None => {
                warn!("No valid commit record found");
                self.current = None;
                Ok(None)
            }
        }
    }

    /// Make `state` the durable resume point.
    ///
    /// On power loss the previous record stays current.
    pub fn commit(&mut self, storage: &mut dyn DurableStorage, state: &DurableState) -> Result<()> {
        if state.slots.len() != self.num_slots
            || state.run_state.state_bits.len() != self.num_slots
        {
            return Err(EngineError::Invariant(format!(
                "commit of {} slot(s) into a log for {}",
                state.slots.len(),
                self.num_slots
            )));
        }
        let target = match self.current {
            Some(copy) => 1 - copy,
            None => 0,
        };
        let seq = self.seq.wrapping_add(1);
        let bytes = state.encode(seq);
        storage.write_segmented(self.offsets[target], &bytes)?;
        self.current = Some(target);
        self.seq = seq;
        debug!(
            seq,
            copy = target,
            layer_idx = state.run_state.layer_idx,
            sample_idx = state.run_state.sample_idx,
            "Committed"
        );
        Ok(())
    }

    /// Destroy both copies so no earlier run can be resumed.
    pub fn invalidate(&mut self, storage: &mut dyn DurableStorage) -> Result<()> {
        let zeros = vec![0u8; self.record_len as usize];
        for &offset in &self.offsets {
            storage.write_segmented(offset, &zeros)?;
        }
        self.current = None;
        self.seq = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutInputs;
    use crate::storage::{MemStorage, PowerCut};

    fn layout() -> NvmLayout {
        NvmLayout::compute(&LayoutInputs {
            nvm_size: 8192,
            num_slots: 2,
            max_intermediate_bytes: 64,
            params_len: 0,
            sample_len: 0,
            n_samples: 0,
            nodes_len: 3,
            n_input: 2,
            n_input_refs: 4,
        })
        .unwrap()
    }

    fn state(layer_idx: u16) -> DurableState {
        let mut state = DurableState::new(3, 2, 2);
        state.run_state.layer_idx = layer_idx;
        state.run_state.running = true;
        state.slots[0].untrusted = false;
        state.slots[0].turning_points.push(7).unwrap();
        state
    }

    #[test]
    fn test_empty_storage_has_no_record() {
        let layout = layout();
        let mut storage = MemStorage::new(8192, 64);
        assert!(CommitLog::new(&layout).load(&mut storage).unwrap().is_none());
    }

    #[test]
    fn test_commit_then_load() {
        let layout = layout();
        let mut storage = MemStorage::new(8192, 64);
        let mut log = CommitLog::new(&layout);
        log.commit(&mut storage, &state(1)).unwrap();
        log.commit(&mut storage, &state(2)).unwrap();

        let mut reader = CommitLog::new(&layout);
        assert_eq!(reader.load(&mut storage).unwrap(), Some(state(2)));
        assert_eq!(reader.sequence(), 2);
    }

    #[test]
    fn test_commits_alternate_copies() {
        let layout = layout();
        let mut storage = MemStorage::new(8192, 64);
        let mut log = CommitLog::new(&layout);
        log.commit(&mut storage, &state(1)).unwrap();
        log.commit(&mut storage, &state(2)).unwrap();

        let bytes = storage.as_bytes();
        let len = layout.commit_len as usize;
        let [a, b] = layout.commit_offsets.map(|o| o as usize);
        let decode = |at: usize| DurableState::decode(&bytes[at..at + len], 2).unwrap();
        assert_eq!(decode(a).unwrap().1, state(1));
        assert_eq!(decode(b).unwrap().1, state(2));
    }

    #[test]
    fn test_torn_commit_keeps_previous_record() {
        let layout = layout();
        let mut log = CommitLog::new(&layout);
        let mut storage = PowerCut::new(MemStorage::new(8192, 64));
        log.commit(&mut storage, &state(1)).unwrap();
        log.commit(&mut storage, &state(2)).unwrap();

        storage = storage.torn();
        storage.arm(0);
        let err = log.commit(&mut storage, &state(3)).unwrap_err();
        assert!(err.is_power_loss());

        storage.revive();
        let mut reader = CommitLog::new(&layout);
        assert_eq!(reader.load(&mut storage).unwrap(), Some(state(2)));
    }

    #[test]
    fn test_corrupted_copy_is_ignored() {
        let layout = layout();
        let mut storage = MemStorage::new(8192, 64);
        let mut log = CommitLog::new(&layout);
        log.commit(&mut storage, &state(1)).unwrap();
        log.commit(&mut storage, &state(2)).unwrap();

        // flip a byte inside the newer copy
        let at = layout.commit_offsets[1];
        let byte = storage.as_bytes()[at as usize + 3];
        storage.write(at + 3, &[byte ^ 0xFF]).unwrap();

        let mut reader = CommitLog::new(&layout);
        assert_eq!(reader.load(&mut storage).unwrap(), Some(state(1)));
    }

    #[test]
    fn test_sequence_wraps() {
        assert!(newer(1, 0));
        assert!(newer(0, u32::MAX));
        assert!(!newer(u32::MAX, 0));
        assert!(!newer(5, 5));
    }

    #[test]
    fn test_invalidate_forgets_everything() {
        let layout = layout();
        let mut storage = MemStorage::new(8192, 64);
        let mut log = CommitLog::new(&layout);
        log.commit(&mut storage, &state(1)).unwrap();
        log.invalidate(&mut storage).unwrap();
        assert!(CommitLog::new(&layout).load(&mut storage).unwrap().is_none());
    }
}
