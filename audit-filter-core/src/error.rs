use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditFilterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("event decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("policy parse error: {0}")]
    PolicyParse(#[from] serde_yaml::Error),

    #[error("file watcher init failed: {0}")]
    WatcherInit(#[from] notify::Error),

    #[error("invalid policy file path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, AuditFilterError>;
