use std::panic::Location;
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Any(#[from] anyhow::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("guest range out of bounds: ptr={ptr}, len={len}, memory size={size}")]
    OutOfBounds { ptr: u64, len: u64, size: u64 },
    #[error("guest string is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("application name is not initialized")]
    NoAppName,
    #[error("invalid application name {0:?}: must not contain '/'")]
    InvalidAppName(String),
    #[error("empty key")]
    EmptyKey,
    #[error("invalid method: {0}")]
    InvalidMethod(String),
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },
    #[error("request {0} is already in flight")]
    DuplicateRequest(u32),
    #[error("request {0} not found")]
    RequestNotFound(u32),
    #[error("request {0} is not ready")]
    RequestPending(u32),
    #[error("buffer length {got} != result length {expected} for request {id}")]
    LengthMismatch { id: u32, expected: u32, got: u32 },
    #[error("timeout: request exceeded {0}ms")]
    Timeout(u64),
    #[error("storage error: {error}, context {context:?}, at {location}")]
    Storage {
        #[source]
        error: kv::Error,
        context: &'static str,
        location: &'static Location<'static>,
    },
    #[error("failed to read config: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    pub fn custom<E: Into<anyhow::Error>>(e: E) -> Self {
        Error::Any(e.into())
    }

    /// Error from the `kv` storage backend.
    #[track_caller]
    pub fn storage(context: &'static str) -> impl FnOnce(kv::Error) -> Self {
        let location = Location::caller();

        move |error: kv::Error| Error::Storage {
            context,
            location,
            error,
        }
    }
}
