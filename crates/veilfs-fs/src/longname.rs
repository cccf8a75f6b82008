//! Long-name spillover.
//!
//! Encoded names longer than the backing store's per-component limit
//! are replaced by a hashed stub; the full encoded name moves into a
//! companion file next to it:
//! ```text
//! gocryptfs.longname.<base64url(sha256(full encoded name))>        the entry
//! gocryptfs.longname.<...>.name                                    companion
//! ```
//! Every stub must have exactly one companion; orphans on either side
//! are consistency errors surfaced by the volume check.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use veilfs_core::{EngineError, EngineResult, LONGNAME_PREFIX, LONGNAME_SUFFIX};

/// True when the encoded name (including any MAC suffix) no longer fits
/// in one directory entry.
pub fn exceeds_limit(encoded: &str, limit: usize) -> bool {
    encoded.len() > limit
}

/// Derives the stub entry name for a too-long encoded name.
pub fn stub_name(full_encoded: &str) -> String {
    let digest = Sha256::digest(full_encoded.as_bytes());
    format!("{LONGNAME_PREFIX}{}", URL_SAFE_NO_PAD.encode(digest))
}

/// Name of the companion file holding the full encoded name.
pub fn companion_name(stub: &str) -> String {
    format!("{stub}{LONGNAME_SUFFIX}")
}

pub fn is_stub(entry: &str) -> bool {
    entry.starts_with(LONGNAME_PREFIX) && !entry.ends_with(LONGNAME_SUFFIX)
}

pub fn is_companion(entry: &str) -> bool {
    entry.starts_with(LONGNAME_PREFIX) && entry.ends_with(LONGNAME_SUFFIX)
}

fn companion_path(dir: &Path, stub: &str) -> PathBuf {
    dir.join(companion_name(stub))
}

/// Writes the companion before the stub entry is created. Overwrites a
/// stale companion from an earlier interrupted unlink.
pub fn write_companion(dir: &Path, stub: &str, full_encoded: &str) -> EngineResult<()> {
    fs::write(companion_path(dir, stub), full_encoded.as_bytes())?;
    Ok(())
}

/// Reads and verifies the companion of a stub: the stored name must
/// hash back to the stub it sits next to.
pub fn read_companion(dir: &Path, stub: &str) -> EngineResult<String> {
    let bytes = fs::read(companion_path(dir, stub))?;
    let full = String::from_utf8(bytes)
        .map_err(|_| EngineError::format(format!("companion of {stub} is not UTF-8")))?;
    if stub_name(&full) != stub {
        return Err(EngineError::format(format!(
            "companion of {stub} does not hash back to its stub"
        )));
    }
    Ok(full)
}

pub fn remove_companion(dir: &Path, stub: &str) -> EngineResult<()> {
    fs::remove_file(companion_path(dir, stub))?;
    Ok(())
}

/// True if the stub's companion exists.
pub fn has_companion(dir: &Path, stub: &str) -> bool {
    companion_path(dir, stub).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_stub_shape() {
        let stub = stub_name("some-very-long-encoded-name");
        assert!(stub.starts_with(LONGNAME_PREFIX));
        // base64url of a 32-byte digest is 43 chars.
        assert_eq!(stub.len(), LONGNAME_PREFIX.len() + 43);
        assert!(is_stub(&stub));
        assert!(!is_companion(&stub));
    }

    #[test]
    fn test_stub_is_deterministic() {
        assert_eq!(stub_name("abc"), stub_name("abc"));
        assert_ne!(stub_name("abc"), stub_name("abd"));
    }

    #[test]
    fn test_companion_classification() {
        let stub = stub_name("x");
        let companion = companion_name(&stub);
        assert!(is_companion(&companion));
        assert!(!is_stub(&companion));
        assert!(!is_stub("ordinary-entry"));
        assert!(!is_companion("ordinary-entry"));
    }

    #[test]
    fn test_companion_roundtrip() {
        let dir = tempdir().unwrap();
        let full = "Z".repeat(300);
        let stub = stub_name(&full);

        write_companion(dir.path(), &stub, &full).unwrap();
        assert!(has_companion(dir.path(), &stub));
        assert_eq!(read_companion(dir.path(), &stub).unwrap(), full);

        remove_companion(dir.path(), &stub).unwrap();
        assert!(!has_companion(dir.path(), &stub));
    }

    #[test]
    fn test_tampered_companion_rejected() {
        let dir = tempdir().unwrap();
        let full = "Y".repeat(300);
        let stub = stub_name(&full);

        write_companion(dir.path(), &stub, &full).unwrap();
        fs::write(companion_path(dir.path(), &stub), b"some-other-name").unwrap();

        assert!(matches!(
            read_companion(dir.path(), &stub),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn test_exceeds_limit() {
        assert!(!exceeds_limit(&"a".repeat(255), 255));
        assert!(exceeds_limit(&"a".repeat(256), 255));
    }
}
