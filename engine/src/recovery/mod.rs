//! Progress recovery for intermediate tensors
//!
//! After a reset, the engine must tell which output elements of the
//! interrupted operation were already written. Two schemes are available,
//! selected at startup:
//!
//! - [`TurningPointStrategy`]: every stored value embeds one bit; the slot's
//!   [`SlotInfo`] records the committed polarity map as turning points, and the
//!   current writer always writes the opposite polarity.
//! - [`FootprintStrategy`]: each group of `tile_c` values is followed by marker
//!   elements holding the slot's write epoch.
//!
//! In both schemes an operation writes its output in increasing element order,
//! so the written part is a prefix and [`RecoveryStrategy::progress`] finds its
//! end by binary search.

pub mod encoding;
mod footprint;
mod indirect;
mod turning_points;

pub use footprint::{FootprintStrategy, FOOTPRINT_EPOCH_MAX};
pub use indirect::TurningPointStrategy;
pub use turning_points::{TurningPointError, TurningPoints};

use crate::config::RecoveryMode;
use crate::errors::Result;
use crate::layout::{SlotInfo, SlotRegion, TensorDescriptor};
use crate::storage::DurableStorage;

pub trait RecoveryStrategy {
    fn mode(&self) -> RecoveryMode;

    /// Whether the slot must be normalized before the next operation writes it.
    fn needs_normalize(&self, info: &SlotInfo) -> bool;

    /// Overwrite the whole slot with a pattern that decodes as committed data
    /// and reset `info` to match. Prior slot contents are dead.
    fn normalize(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        info: &mut SlotInfo,
    ) -> Result<()>;

    /// First logical element of `desc` not written by an interrupted attempt.
    fn progress(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        desc: &TensorDescriptor,
        info: &SlotInfo,
    ) -> Result<u32>;

    /// Whether logical element `idx` holds data committed into the slot.
    fn is_fresh(
        &self,
        storage: &mut dyn DurableStorage,
        region: SlotRegion,
        desc: &TensorDescriptor,
        info: &SlotInfo,
        idx: u32,
    ) -> Result<bool>;

    /// Stored form of a legal `value` written at physical element `phys`.
    fn encode(&self, info: &SlotInfo, phys: u32, value: i16) -> i16;

    /// Marker written after every group of values, if the scheme uses one.
    fn footprint(&self, info: &SlotInfo) -> Option<i16>;

    /// Fold a finished write of `written` physical elements into the metadata.
    fn complete(&self, info: &mut SlotInfo, written: u32, region: SlotRegion);
}

pub fn strategy_for(mode: RecoveryMode) -> Box<dyn RecoveryStrategy> {
    match mode {
        RecoveryMode::TurningPoints => Box::new(TurningPointStrategy),
        RecoveryMode::Footprints => Box::new(FootprintStrategy),
    }
}

/// Binary search for the first `i` in `0..n` where `done(i)` is false,
/// assuming `done` holds on a prefix.
pub(crate) fn first_pending<F>(n: u32, mut done: F) -> Result<u32>
where
    F: FnMut(u32) -> Result<bool>,
{
    let (mut lo, mut hi) = (0u32, n);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if done(mid)? {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Fill a slot with one repeated 16-bit value.
pub(crate) fn fill_slot(
    storage: &mut dyn DurableStorage,
    region: SlotRegion,
    value: i16,
) -> Result<()> {
    let bytes: Vec<u8> = std::iter::repeat(value.to_le_bytes())
        .take(region.elements() as usize)
        .flatten()
        .collect();
    storage.write_segmented(region.base, &bytes)
}
