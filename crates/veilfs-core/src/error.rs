use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error kinds surfaced by the engine.
///
/// `Auth` and `Format` are never recovered silently; the sole exception
/// is the all-zero-block hole passthrough, which is part of the on-disk
/// format and handled inside the content codec.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An AEAD open rejected a block or an encoded name.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Malformed header, envelope, IV file or padding.
    #[error("format error: {0}")]
    Format(String),

    /// KDF parameters in a loaded config are below the hard floors.
    #[error("KDF parameters below minimum: {0}")]
    WeakParameters(String),

    /// The password did not unwrap the master key.
    #[error("wrong password")]
    WrongPassword,

    /// Unsupported flag or option combination, refused at init or load.
    #[error("unsupported configuration: {0}")]
    Usage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Convenience constructor for auth failures.
    pub fn auth(msg: impl Into<String>) -> Self {
        EngineError::Auth(msg.into())
    }

    /// Convenience constructor for format errors.
    pub fn format(msg: impl Into<String>) -> Self {
        EngineError::Format(msg.into())
    }

    /// True for errors that indicate tampered or corrupted ciphertext.
    pub fn is_corruption(&self) -> bool {
        matches!(self, EngineError::Auth(_) | EngineError::Format(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        assert!(EngineError::auth("bad tag").is_corruption());
        assert!(EngineError::format("short header").is_corruption());
        assert!(!EngineError::WrongPassword.is_corruption());
        assert!(!EngineError::Usage("x".into()).is_corruption());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}
