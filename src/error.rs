//! error handling stuff
use thiserror::Error;

#[derive(Debug, Error)]
/// An error
pub enum SaverError {
    /// an IO error
    #[error("i/o error: {0}")]
    IO(#[from] std::io::Error),

    /// a reqwest error
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// a json error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// a feed parse error
    #[error("feed parse error: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),

    /// an image decode error
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    /// a toml serialization error
    #[error("toml serialization error: {0}")]
    TOMLSer(#[from] toml::ser::Error),

    /// a system time error
    #[error("system time error: {0}")]
    SystemTime(#[from] std::time::SystemTimeError),

    /// a tokio task join error
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// a report from color_eyre
    #[error("{0}")]
    EyreReport(#[from] color_eyre::Report),

    /// an engine state transition that is not allowed
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),

    /// a custom error
    #[error("error: {0}")]
    Other(String),
}

impl From<String> for SaverError {
    fn from(value: String) -> Self {
        Self::Other(value)
    }
}

/// A result using [`SaverError`] as the `Err` variant
pub type Result<T, U = SaverError> = std::result::Result<T, U>;

/// bail
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::SaverError::from(String::from($msg)))
    };

    ($err:expr $(,)?) => {
        return Err($crate::error::SaverError::from($err))
    };

    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::SaverError::from(format!($fmt, $($arg)*)))
    };
}
