//! Controller states and step results

use crate::config::{EngineConfig, RecoveryMode};
use crate::observability::SampleReport;
use std::fmt;

/// Where the controller is in its boot/run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Power just came up; nothing has been read yet
    ColdBoot,
    /// Storage was never used with this image; durable state is being created
    FirstRun,
    /// A commit record exists and is being reconciled
    Resuming,
    /// Executing operations of the current sample
    Running,
    /// The last operation of a sample has committed
    SampleDone,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::ColdBoot => "COLD_BOOT",
            Phase::FirstRun => "FIRST_RUN",
            Phase::Resuming => "RESUMING",
            Phase::Running => "RUNNING",
            Phase::SampleDone => "SAMPLE_DONE",
        };
        f.write_str(name)
    }
}

/// How boot found the durable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootKind {
    FirstRun,
    Resumed {
        layer_idx: u16,
        sample_idx: u16,
        /// A sample was in progress when power went away
        interrupted: bool,
        /// Slots whose polarity disagreed with the run state
        reconciled: Vec<u8>,
    },
}

/// Outcome of one [`Controller::step`](super::Controller::step).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Operation `layer` committed
    Layer {
        layer: u16,
        /// Output elements computed in this attempt
        computed: u32,
        /// Output elements recovered from an interrupted attempt
        skipped: u32,
    },
    /// A whole sample committed
    Sample(SampleReport),
}

/// Boot parameters taken from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    pub mode: RecoveryMode,
    pub self_test_retries: u32,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            mode: RecoveryMode::default(),
            self_test_retries: 3,
        }
    }
}

impl From<&EngineConfig> for BootOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            mode: config.recovery.mode,
            self_test_retries: config.storage.self_test_retries,
        }
    }
}
