//! Interchangeable AEAD backends.
//!
//! All backends expose the same surface: `seal(nonce, pt, aad)` returns
//! `ciphertext || tag`, `open` reverses it or reports an authentication
//! failure. The set is closed, so the selection is a tagged enum rather
//! than a trait object.

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit, Payload},
    aes::Aes256,
    AesGcm,
};
use aes_siv::Aes256SivAead;
use chacha20poly1305::XChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use veilfs_core::{EngineError, EngineResult, KEY_LEN};

use crate::{cpu, TAG_LEN};

/// AES-256-GCM with a 128-bit nonce (the GCMIV128 flag).
type Aes256Gcm128 = AesGcm<Aes256, U16>;
/// AES-256-GCM with the legacy 96-bit nonce.
type Aes256Gcm96 = aes_gcm::Aes256Gcm;

/// HKDF context for expanding the 256-bit content key into the 512-bit
/// key AES-SIV requires.
const SIV_EXPAND_INFO: &[u8] = b"veilfs siv key expansion";

/// Which AEAD construction a volume uses. Recorded in the config
/// envelope; loading never re-probes the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    /// AES-256-GCM, 128-bit nonce.
    AesGcm128,
    /// AES-256-GCM, 96-bit nonce (volumes without GCMIV128).
    AesGcm96,
    /// XChaCha20-Poly1305, 192-bit nonce.
    XChaCha,
    /// AES-256-SIV, 128-bit nonce, deterministic nonces permitted.
    AesSiv,
}

impl AeadKind {
    /// Picks the backend for a new volume: GCM on hardware with
    /// accelerated AES instructions, XChaCha20-Poly1305 otherwise.
    pub fn auto() -> Self {
        if cpu::accelerated_aes() {
            AeadKind::AesGcm128
        } else {
            AeadKind::XChaCha
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            AeadKind::AesGcm128 => 16,
            AeadKind::AesGcm96 => 12,
            AeadKind::XChaCha => 24,
            AeadKind::AesSiv => 16,
        }
    }

    /// Only SIV keeps its security guarantees under caller-chosen
    /// (deterministic) nonces.
    pub fn deterministic_nonces(self) -> bool {
        matches!(self, AeadKind::AesSiv)
    }
}

/// A keyed AEAD instance.
pub enum AeadBackend {
    AesGcm128(Aes256Gcm128),
    AesGcm96(Aes256Gcm96),
    XChaCha(XChaCha20Poly1305),
    AesSiv(Box<Aes256SivAead>),
}

impl AeadBackend {
    /// Keys a backend with a 256-bit content key. For SIV the key is
    /// expanded to the required 512 bits via HKDF.
    pub fn new(kind: AeadKind, key: &[u8; KEY_LEN]) -> Self {
        match kind {
            AeadKind::AesGcm128 => AeadBackend::AesGcm128(Aes256Gcm128::new(key.into())),
            AeadKind::AesGcm96 => AeadBackend::AesGcm96(Aes256Gcm96::new(key.into())),
            AeadKind::XChaCha => AeadBackend::XChaCha(XChaCha20Poly1305::new(key.into())),
            AeadKind::AesSiv => {
                let mut double_key = [0u8; 2 * KEY_LEN];
                // Infallible: 64 bytes is far below the HKDF-SHA256 limit.
                Hkdf::<Sha256>::new(None, key)
                    .expand(SIV_EXPAND_INFO, &mut double_key)
                    .expect("HKDF expand to 64 bytes");
                let cipher = Aes256SivAead::new((&double_key).into());
                double_key.zeroize();
                AeadBackend::AesSiv(Box::new(cipher))
            }
        }
    }

    pub fn kind(&self) -> AeadKind {
        match self {
            AeadBackend::AesGcm128(_) => AeadKind::AesGcm128,
            AeadBackend::AesGcm96(_) => AeadKind::AesGcm96,
            AeadBackend::XChaCha(_) => AeadKind::XChaCha,
            AeadBackend::AesSiv(_) => AeadKind::AesSiv,
        }
    }

    pub fn nonce_len(&self) -> usize {
        self.kind().nonce_len()
    }

    pub fn tag_len(&self) -> usize {
        TAG_LEN
    }

    /// Encrypts and authenticates, returning `ciphertext || tag`.
    pub fn seal(&self, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> EngineResult<Vec<u8>> {
        self.check_nonce(nonce)?;
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let res = match self {
            AeadBackend::AesGcm128(c) => c.encrypt(nonce.into(), payload),
            AeadBackend::AesGcm96(c) => c.encrypt(nonce.into(), payload),
            AeadBackend::XChaCha(c) => c.encrypt(nonce.into(), payload),
            AeadBackend::AesSiv(c) => c.encrypt(nonce.into(), payload),
        };
        res.map_err(|_| EngineError::format("AEAD seal failed"))
    }

    /// Verifies and decrypts `ciphertext || tag`.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> EngineResult<Vec<u8>> {
        self.check_nonce(nonce)?;
        if ciphertext.len() < TAG_LEN {
            return Err(EngineError::format(format!(
                "ciphertext shorter than tag: {} bytes",
                ciphertext.len()
            )));
        }
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let res = match self {
            AeadBackend::AesGcm128(c) => c.decrypt(nonce.into(), payload),
            AeadBackend::AesGcm96(c) => c.decrypt(nonce.into(), payload),
            AeadBackend::XChaCha(c) => c.decrypt(nonce.into(), payload),
            AeadBackend::AesSiv(c) => c.decrypt(nonce.into(), payload),
        };
        res.map_err(|_| EngineError::auth("AEAD open rejected ciphertext"))
    }

    fn check_nonce(&self, nonce: &[u8]) -> EngineResult<()> {
        if nonce.len() != self.nonce_len() {
            return Err(EngineError::format(format!(
                "wrong nonce length: got {}, want {}",
                nonce.len(),
                self.nonce_len()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AeadBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AeadBackend").field(&self.kind()).finish()
    }
}
