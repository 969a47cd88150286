use thiserror::Error;

#[derive(Error, Debug)]
pub enum HdfError {
    #[error("Cannot open container: {0}")]
    BadOpen(String),

    #[error("No element matches tag {tag} ref {reference}")]
    NotFound { tag: u16, reference: u16 },

    #[error("Element tag {tag} ref {reference} already exists")]
    DuplicateKey { tag: u16, reference: u16 },

    #[error("Element tag {tag} ref {reference} is already open")]
    AlreadyOpen { tag: u16, reference: u16 },

    #[error("Access id {0} is not open")]
    StaleHandle(u32),

    #[error("Corrupt special element: {0}")]
    CorruptSpecialElement(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Out of space: {0}")]
    NoSpace(String),

    #[error("Invalid argument: {0}")]
    BadArgs(String),

    #[error("Short I/O: expected {expected} bytes, transferred {actual}")]
    ShortIo { expected: usize, actual: usize },

    #[error("Cannot close container: {0}")]
    CantClose(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Copyable classification of an [`HdfError`], kept in the session's
/// last-error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadOpen,
    NotFound,
    DuplicateKey,
    AlreadyOpen,
    StaleHandle,
    CorruptSpecialElement,
    NoSpace,
    BadArgs,
    ShortIo,
    CantClose,
    Io,
    Config,
}

impl HdfError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HdfError::BadOpen(_) => ErrorKind::BadOpen,
            HdfError::NotFound { .. } => ErrorKind::NotFound,
            HdfError::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            HdfError::AlreadyOpen { .. } => ErrorKind::AlreadyOpen,
            HdfError::StaleHandle(_) => ErrorKind::StaleHandle,
            HdfError::CorruptSpecialElement(_) | HdfError::Compression(_) => {
                ErrorKind::CorruptSpecialElement
            }
            HdfError::NoSpace(_) => ErrorKind::NoSpace,
            HdfError::BadArgs(_) => ErrorKind::BadArgs,
            HdfError::ShortIo { .. } => ErrorKind::ShortIo,
            HdfError::CantClose(_) => ErrorKind::CantClose,
            HdfError::Io(_) => ErrorKind::Io,
            HdfError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn not_found(tag: u16, reference: u16) -> Self {
        HdfError::NotFound { tag, reference }
    }

    pub(crate) fn corrupt<S: Into<String>>(msg: S) -> Self {
        HdfError::CorruptSpecialElement(msg.into())
    }
}

impl From<toml::de::Error> for HdfError {
    fn from(err: toml::de::Error) -> Self {
        HdfError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HdfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_maps_to_corrupt_special() {
        let err = HdfError::Compression("bad stream".into());
        assert_eq!(err.kind(), ErrorKind::CorruptSpecialElement);
    }

    #[test]
    fn test_display_includes_key() {
        let err = HdfError::not_found(201, 7);
        assert_eq!(err.to_string(), "No element matches tag 201 ref 7");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
