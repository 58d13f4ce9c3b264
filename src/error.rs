use std::fmt;

/// Coarse classification of an [`IoError`], used by retry policies and by
/// callers that translate failures into protocol status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Recoverable,
    Timeout,
    NoSpace,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    Codec,
    Backend,
}

/// Errors surfaced by every layer of the IO stack.
///
/// Only `Recoverable` and `Timeout` are transient. Layers never rewrite an
/// error coming from below; the retry proxies are the only place a failure
/// can be absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The backend is momentarily unavailable.
    Recoverable(String),
    /// The backend did not answer in time.
    Timeout(String),
    /// The write would exceed the volume's configured capacity.
    NoSpace { volume: String, capacity: u64 },
    NotFound(String),
    AlreadyExists(String),
    InvalidArgument(String),
    /// A stored document could not be encoded or decoded.
    Codec(String),
    /// Permanent backend failure.
    Backend(String),
}

impl IoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IoError::Recoverable(_) => ErrorKind::Recoverable,
            IoError::Timeout(_) => ErrorKind::Timeout,
            IoError::NoSpace { .. } => ErrorKind::NoSpace,
            IoError::NotFound(_) => ErrorKind::NotFound,
            IoError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            IoError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            IoError::Codec(_) => ErrorKind::Codec,
            IoError::Backend(_) => ErrorKind::Backend,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, IoError::Recoverable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, IoError::Timeout(_))
    }

    pub fn is_transient(&self) -> bool {
        self.is_recoverable() || self.is_timeout()
    }

    pub(crate) fn not_found(what: impl fmt::Display) -> Self {
        IoError::NotFound(what.to_string())
    }

    pub(crate) fn invalid(what: impl Into<String>) -> Self {
        IoError::InvalidArgument(what.into())
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Recoverable(msg) => write!(f, "backend temporarily unavailable: {}", msg),
            IoError::Timeout(msg) => write!(f, "backend timed out: {}", msg),
            IoError::NoSpace { volume, capacity } => {
                write!(f, "no space left on volume {} (capacity {} bytes)", volume, capacity)
            }
            IoError::NotFound(what) => write!(f, "not found: {}", what),
            IoError::AlreadyExists(what) => write!(f, "already exists: {}", what),
            IoError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            IoError::Codec(msg) => write!(f, "codec error: {}", msg),
            IoError::Backend(msg) => write!(f, "backend error: {}", msg),
        }
    }
}

impl std::error::Error for IoError {}

impl From<fjall::Error> for IoError {
    fn from(e: fjall::Error) -> Self {
        IoError::Backend(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for IoError {
    fn from(e: bincode::error::EncodeError) -> Self {
        IoError::Codec(format!("failed to encode: {}", e))
    }
}

impl From<bincode::error::DecodeError> for IoError {
    fn from(e: bincode::error::DecodeError) -> Self {
        IoError::Codec(format!("failed to decode: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(IoError::Recoverable("x".into()).is_transient());
        assert!(IoError::Timeout("x".into()).is_transient());
        assert!(!IoError::NotFound("x".into()).is_transient());
        assert!(!IoError::NoSpace {
            volume: "v".into(),
            capacity: 1
        }
        .is_transient());
    }

    #[test]
    fn test_kind_and_display() {
        let err = IoError::NoSpace {
            volume: "vol1".into(),
            capacity: 16,
        };
        assert_eq!(err.kind(), ErrorKind::NoSpace);
        assert_eq!(
            err.to_string(),
            "no space left on volume vol1 (capacity 16 bytes)"
        );
    }
}
