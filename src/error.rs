use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid sampling configuration: {0}")]
    BadConfig(String),

    #[error("The profiler is already running")]
    AlreadyAttached,

    #[error("Malformed stream: {0}")]
    MalformedStream(String),

    #[error("Digest interrupted")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the end-of-input errors the digest builder treats as a
    /// benign end of the event stream.
    pub fn is_eof(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            Error::MalformedStream(_) => true,
            _ => false,
        }
    }
}
