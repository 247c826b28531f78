use thiserror::Error;

/// Engine-level error taxonomy. Recoverable conditions inside the decision
/// pipeline are expressed as signal rejections, not errors; these variants
/// cover what must surface to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("unknown strategy id '{0}'")]
    UnknownStrategy(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
