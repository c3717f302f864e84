use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Hydration failed: {0}")]
    Hydration(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Already closed")]
    Closed,

    #[error("Invalid registration path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if the error means the target node was not there.
    pub fn is_no_node(&self) -> bool {
        matches!(self, Self::NoNode(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
