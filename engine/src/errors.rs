use thiserror::Error;

/// Errors that can occur in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// IO error occurred (NVM file, config file, model file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error (model JSON, config TOML)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable storage rejected a transfer (out of range, oversized)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Storage self-test kept failing after the bounded number of retries
    #[error("Storage self-test failed after {attempts} attempt(s)")]
    SelfTest { attempts: u32 },

    /// Power was cut in the middle of a transfer (simulated)
    #[error("Power lost after {writes} NVM write(s)")]
    PowerLoss { writes: u64 },

    /// The model does not fit into the NVM arena
    #[error("Layout error: {0}")]
    Layout(String),

    /// The model graph was rejected at load time
    #[error("Model validation error: {0}")]
    Validation(String),

    /// The NVM image was written for a different model or configuration
    #[error("NVM image mismatch: {0}")]
    ImageMismatch(String),

    /// Durable control state is unreadable where it must exist
    #[error("Corrupt durable state: {0}")]
    Corrupt(String),

    /// Internal consistency check failed; continuing could corrupt results
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Whether execution must halt instead of continuing best-effort.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Invariant(_)
                | EngineError::SelfTest { .. }
                | EngineError::Corrupt(_)
                | EngineError::Storage(_)
        )
    }

    /// Power loss is the normal operating mode, not a failure.
    pub fn is_power_loss(&self) -> bool {
        matches!(self, EngineError::PowerLoss { .. })
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<toml::ser::Error> for EngineError {
    fn from(e: toml::ser::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

/// Bail out with [`EngineError::Invariant`] when `cond` does not hold.
macro_rules! ensure_invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::errors::EngineError::Invariant(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_invariant;
