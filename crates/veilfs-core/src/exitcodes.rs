//! Stable process exit codes for host front-ends.
//!
//! The numeric assignment is frozen within a major version; hosts map
//! engine errors through [`for_error`] when terminating.

use crate::error::EngineError;

/// Bad command line or unsupported option combination.
pub const USAGE: i32 = 2;
/// The config envelope does not exist in the ciphertext directory.
pub const CONFIG_MISSING: i32 = 10;
/// The password did not unwrap the master key.
pub const WRONG_PASSWORD: i32 = 12;
/// KDF parameters in the config envelope are below the hard floors.
pub const WEAK_KDF_PARAMS: i32 = 14;
/// Authentication failure or malformed on-disk data.
pub const CORRUPT_DATA: i32 = 16;
/// The volume could not be opened for another reason.
pub const MOUNT_FAILURE: i32 = 18;

/// Maps an engine error to its exit code.
pub fn for_error(err: &EngineError) -> i32 {
    match err {
        EngineError::Usage(_) => USAGE,
        EngineError::WrongPassword => WRONG_PASSWORD,
        EngineError::WeakParameters(_) => WEAK_KDF_PARAMS,
        EngineError::Auth(_) | EngineError::Format(_) => CORRUPT_DATA,
        EngineError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => CONFIG_MISSING,
        EngineError::Io(_) => MOUNT_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_is_stable() {
        assert_eq!(for_error(&EngineError::WrongPassword), WRONG_PASSWORD);
        assert_eq!(
            for_error(&EngineError::WeakParameters("logN".into())),
            WEAK_KDF_PARAMS
        );
        assert_eq!(for_error(&EngineError::auth("tag")), CORRUPT_DATA);
        assert_eq!(for_error(&EngineError::format("header")), CORRUPT_DATA);
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gocryptfs.conf");
        assert_eq!(for_error(&EngineError::Io(nf)), CONFIG_MISSING);
    }
}
