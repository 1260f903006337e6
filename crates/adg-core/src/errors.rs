/// Core error type for the ads guard.
///
/// Adapter crates map their specific errors into this type so the guard
/// pipeline can decide uniformly between "log and fall back" and "surface".
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    /// The platform refused an edit because the content is unchanged.
    #[error("message is not modified")]
    NotModified,
}

pub type Result<T> = std::result::Result<T, Error>;
