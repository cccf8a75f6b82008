//! Key hierarchy: master key → purpose keys via HKDF-SHA256.
//!
//! Purpose keys are derived deterministically and never stored. Volumes
//! without the HKDF flag (legacy) use the master key directly for both
//! content and filename encryption.

use hkdf::Hkdf;
use rand::{thread_rng, RngCore};
use sha2::Sha256;

use veilfs_core::KEY_LEN;

use crate::hardening;

const HKDF_INFO_CONTENT: &[u8] = b"veilfs content encryption";
const HKDF_INFO_NAMES: &[u8] = b"veilfs filename encryption";
const HKDF_INFO_NAME_MAC: &[u8] = b"veilfs filename authentication";

/// The 256-bit volume root secret. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],
}

impl MasterKey {
    /// Fresh random master key for a new volume.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        thread_rng().fill_bytes(&mut bytes);
        MasterKey { bytes }
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        MasterKey { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        hardening::wipe(&mut self.bytes);
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit key bound to exactly one cryptographic purpose.
#[derive(Clone)]
pub struct PurposeKey {
    bytes: [u8; KEY_LEN],
}

impl PurposeKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl Drop for PurposeKey {
    fn drop(&mut self) {
        hardening::wipe(&mut self.bytes);
    }
}

impl std::fmt::Debug for PurposeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PurposeKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Content-AEAD key. With `hkdf` false (legacy volumes) the master key
/// itself is returned.
pub fn derive_content_key(master: &MasterKey, hkdf: bool) -> PurposeKey {
    if hkdf {
        hkdf_derive(master, HKDF_INFO_CONTENT)
    } else {
        PurposeKey {
            bytes: *master.as_bytes(),
        }
    }
}

/// Filename-encryption key. Same legacy rule as the content key.
pub fn derive_name_key(master: &MasterKey, hkdf: bool) -> PurposeKey {
    if hkdf {
        hkdf_derive(master, HKDF_INFO_NAMES)
    } else {
        PurposeKey {
            bytes: *master.as_bytes(),
        }
    }
}

/// Filename-MAC key. Filename authentication postdates the legacy era,
/// so there is no non-HKDF form.
pub fn derive_name_mac_key(master: &MasterKey) -> PurposeKey {
    hkdf_derive(master, HKDF_INFO_NAME_MAC)
}

fn hkdf_derive(master: &MasterKey, info: &[u8]) -> PurposeKey {
    let hk = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    // Infallible: 32 bytes is far below the HKDF-SHA256 limit.
    hk.expand(info, &mut okm).expect("HKDF expand to 32 bytes");
    PurposeKey { bytes: okm }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_master() -> MasterKey {
        MasterKey::from_bytes([42u8; KEY_LEN])
    }

    #[test]
    fn test_purposes_are_separated() {
        let mk = test_master();
        let content = derive_content_key(&mk, true);
        let name = derive_name_key(&mk, true);
        let mac = derive_name_mac_key(&mk);

        assert_ne!(content.as_bytes(), name.as_bytes());
        assert_ne!(content.as_bytes(), mac.as_bytes());
        assert_ne!(name.as_bytes(), mac.as_bytes());
        assert_ne!(content.as_bytes(), mk.as_bytes());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_content_key(&test_master(), true);
        let b = derive_content_key(&test_master(), true);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_legacy_mode_uses_master_key_directly() {
        let mk = test_master();
        assert_eq!(derive_content_key(&mk, false).as_bytes(), mk.as_bytes());
        assert_eq!(derive_name_key(&mk, false).as_bytes(), mk.as_bytes());
    }

    #[test]
    fn test_random_master_keys_differ() {
        assert_ne!(MasterKey::random().as_bytes(), MasterKey::random().as_bytes());
    }

    #[test]
    fn test_debug_is_redacted() {
        let out = format!("{:?}", test_master());
        assert!(out.contains("REDACTED"));
        assert!(!out.contains("42"));
    }
}
