pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod layout;
pub mod model;
pub mod observability;
pub mod ops;
pub mod recovery;
pub mod slots;
pub mod storage;
pub mod tensor;

pub use checkpoint::{BootKind, BootOptions, Controller, Phase, Step};
pub use config::{EngineConfig, RecoveryMode};
pub use errors::{EngineError, Result};
pub use model::{GraphOptions, ModelGraph, ModelSpec};
pub use observability::{
    init_production_logging, init_simple_logging, CompletionSink, LogSink, RecordingSink,
    SampleReport,
};
pub use storage::{DurableStorage, FileStorage, MemStorage, PowerCut};
pub use tensor::Tensor;
