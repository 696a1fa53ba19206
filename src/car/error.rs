use thiserror::Error;

/// Failure to read or write an archive.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed archive: {0}")]
    Parsing(String),
    #[error("truncated archive: {0}")]
    Truncated(String),
    #[error("invalid archive: {0}")]
    InvalidFile(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to encode archive header: {0}")]
    Cbor(String),
    #[error("archive section of {0} bytes exceeds the size limit")]
    SectionTooLarge(u64),
}

impl From<cid::Error> for Error {
    fn from(err: cid::Error) -> Error {
        Error::Parsing(format!("invalid block cid: {err}"))
    }
}
