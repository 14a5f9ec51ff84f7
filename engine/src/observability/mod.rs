pub mod logging;
pub mod notify;

pub use logging::{init_production_logging, init_simple_logging};
pub use notify::{CompletionSink, LogSink, RecordingSink, SampleReport, Tee};
