use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad caller input: negative rates, zero permit counts, non-positive
    /// sizes at construction. No state change.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine was stopped; the operation made no state change.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// An on-disk structure or an internal invariant failed validation.
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Decode(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
