//! Checkpointing and recovery of inference progress
//!
//! Inference runs on harvested energy: power can disappear after any NVM
//! write. This module keeps a durable execution position and replays the
//! graph from it at every boot.
//!
//! ## Architecture
//!
//! ```text
//!        power-on
//!           │
//!           ▼
//! ┌─────────────────────┐   first-run word set
//! │     Controller      │──────────────────────► fresh DurableState
//! │  • self-test        │
//! │  • verify image     │   otherwise
//! │  • reconcile slots  │──────────────────────► CommitLog::load
//! └─────────────────────┘
//!           │ step()
//!           ▼
//! ┌─────────────────────┐
//! │ normalize? progress │  resume point from the recovery strategy
//! │ handler → finish    │  writes encoded values into the output slot
//! │ complete + commit   │  RunState ‖ SlotInfo × N, double-buffered
//! └─────────────────────┘
//! ```

mod commit;
mod controller;
mod types;

pub use commit::{CommitLog, DurableState};
pub use controller::{inspect, Controller, Snapshot};
pub use types::{BootKind, BootOptions, Phase, Step};
