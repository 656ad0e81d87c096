use thiserror::Error;

/// Failures surfaced to callers of the pool
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Failed to create dispatcher for {endpoint}: {source}")]
    ResourceCreationFailed {
        endpoint: String,
        #[source]
        source: FactoryError,
    },

    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Borrow cancelled: {0}")]
    Cancelled(String),
}

/// Failures reported by a dispatcher factory
#[derive(Error, Debug)]
pub enum FactoryError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dispatcher rejected: {0}")]
    Rejected(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
