use thiserror::Error;

/// Every failure the client surfaces to its caller. Only `Config` is fatal,
/// and only at startup; after any other error the engine stays usable.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("{0}")]
    State(String),

    #[error("failed persisting client info: {0}")]
    Persist(String),

    #[error("generic error response code (9000) received from server")]
    Server,
}
