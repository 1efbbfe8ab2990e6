use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event stream transport failed: {0}")]
    Transport(String),

    #[error("malformed `{event}` event: {reason}")]
    MalformedEvent { event: String, reason: String },

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("audio unavailable for step {0}")]
    AudioUnavailable(String),

    #[error("no decision is awaiting approval")]
    NoPendingApproval,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
