//! Filename encryption and decryption.
//!
//! Names are padded to a multiple of 16 bytes, encrypted with
//! AES-256-SIV using the parent directory's IV as associated data, and
//! base64url-encoded without padding. SIV is deterministic, so the same
//! (name, directory IV) pair always yields the same encoded name and
//! rename-in-place stays cheap; a different directory IV yields an
//! unrelated ciphertext.
//!
//! With filename authentication enabled, an HMAC-SHA256 over the
//! encoded name is appended after a dot:
//! `<base64url(siv-ct)>.<base64url(mac)>`.

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead, Nonce,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use veilfs_core::{EngineError, EngineResult, DIRIV_LEN};
use veilfs_crypto::PurposeKey;

/// HKDF context for expanding the 256-bit name key into the 512-bit
/// key AES-SIV requires.
const SIV_EXPAND_INFO: &[u8] = b"veilfs name siv expansion";

/// Default per-component limit of common backing stores.
pub const DEFAULT_NAME_LIMIT: usize = 255;

const PAD_BLOCK: usize = 16;

/// Encrypts and decrypts filename components.
pub struct NameTransform {
    cipher: Aes256SivAead,
    mac_key: Option<PurposeKey>,
    name_limit: usize,
}

impl NameTransform {
    /// `mac_key` enables the authentication suffix (FILENAMEAUTH).
    pub fn new(name_key: &PurposeKey, mac_key: Option<PurposeKey>) -> Self {
        let mut double_key = [0u8; 64];
        // Infallible: 64 bytes is far below the HKDF-SHA256 limit.
        Hkdf::<Sha256>::new(None, name_key.as_bytes())
            .expand(SIV_EXPAND_INFO, &mut double_key)
            .expect("HKDF expand to 64 bytes");
        let cipher = Aes256SivAead::new((&double_key).into());
        double_key.zeroize();
        NameTransform {
            cipher,
            mac_key,
            name_limit: DEFAULT_NAME_LIMIT,
        }
    }

    /// Longest encoded name the backing store accepts per component.
    /// Platform-dependent, so settable by the host.
    pub fn name_limit(&self) -> usize {
        self.name_limit
    }

    pub fn set_name_limit(&mut self, limit: usize) {
        self.name_limit = limit;
    }

    pub fn auth_enabled(&self) -> bool {
        self.mac_key.is_some()
    }

    /// Encrypts one path component under the parent's directory IV.
    pub fn encrypt_name(&self, name: &str, diriv: &[u8; DIRIV_LEN]) -> EngineResult<String> {
        validate_plain_name(name)?;
        let padded = pad16(name.as_bytes());
        let ct = self.seal(&padded, diriv)?;
        let mut encoded = URL_SAFE_NO_PAD.encode(ct);
        if let Some(mac_key) = &self.mac_key {
            let tag = name_mac(mac_key, encoded.as_bytes());
            encoded.push('.');
            encoded.push_str(&URL_SAFE_NO_PAD.encode(tag));
        }
        Ok(encoded)
    }

    /// Decrypts one encoded component. With authentication enabled the
    /// MAC suffix is verified before the ciphertext is touched.
    pub fn decrypt_name(&self, encoded: &str, diriv: &[u8; DIRIV_LEN]) -> EngineResult<String> {
        let encoded = if let Some(mac_key) = &self.mac_key {
            let (name_part, mac_part) = encoded.rsplit_once('.').ok_or_else(|| {
                EngineError::auth(format!("entry {encoded:?} carries no name MAC"))
            })?;
            let tag = URL_SAFE_NO_PAD
                .decode(mac_part)
                .map_err(|_| EngineError::format(format!("undecodable name MAC on {encoded:?}")))?;
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(mac_key.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(name_part.as_bytes());
            mac.verify_slice(&tag)
                .map_err(|_| EngineError::auth(format!("name MAC mismatch on {encoded:?}")))?;
            name_part
        } else {
            encoded
        };

        let ct = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| EngineError::format(format!("undecodable name {encoded:?}")))?;
        let padded = self.open(&ct, diriv)?;
        let plain = unpad16(padded)?;
        let name = String::from_utf8(plain)
            .map_err(|_| EngineError::format("decrypted name is not UTF-8"))?;
        validate_plain_name(&name)?;
        Ok(name)
    }

    fn seal(&self, padded: &[u8], diriv: &[u8; DIRIV_LEN]) -> EngineResult<Vec<u8>> {
        // SIV with a fixed nonce stays deterministic; the directory IV
        // enters as associated data, tweaking the ciphertext per dir.
        self.cipher
            .encrypt(
                &Nonce::default(),
                Payload {
                    msg: padded,
                    aad: diriv,
                },
            )
            .map_err(|_| EngineError::format("name encryption failed"))
    }

    fn open(&self, ct: &[u8], diriv: &[u8; DIRIV_LEN]) -> EngineResult<Vec<u8>> {
        self.cipher
            .decrypt(
                &Nonce::default(),
                Payload {
                    msg: ct,
                    aad: diriv,
                },
            )
            .map_err(|_| EngineError::auth("name ciphertext rejected"))
    }
}

/// HMAC-SHA256 over an encoded ciphertext name.
fn name_mac(key: &PurposeKey, encoded: &[u8]) -> Vec<u8> {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
    mac.update(encoded);
    mac.finalize().into_bytes().to_vec()
}

/// Rejects components the plaintext tree cannot contain.
pub fn validate_plain_name(name: &str) -> EngineResult<()> {
    if name.is_empty() {
        return Err(EngineError::format("empty name"));
    }
    if name == "." || name == ".." {
        return Err(EngineError::format(format!(
            "{name:?} must appear unencrypted only"
        )));
    }
    if name.bytes().any(|b| b == b'/' || b == 0) {
        return Err(EngineError::format(format!(
            "name {name:?} contains a path separator or NUL"
        )));
    }
    Ok(())
}

/// Appends 1..=16 pad bytes, each holding the pad length, so the result
/// is a multiple of 16 bytes.
fn pad16(data: &[u8]) -> Vec<u8> {
    let pad = PAD_BLOCK - data.len() % PAD_BLOCK;
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.resize(data.len() + pad, pad as u8);
    out
}

/// Strips and validates the pad written by [`pad16`].
fn unpad16(mut data: Vec<u8>) -> EngineResult<Vec<u8>> {
    let len = data.len();
    if len == 0 || len % PAD_BLOCK != 0 {
        return Err(EngineError::format(format!(
            "padded name has invalid length {len}"
        )));
    }
    let pad = data[len - 1] as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > len {
        return Err(EngineError::format(format!("invalid pad byte {pad}")));
    }
    if data[len - pad..].iter().any(|&b| b as usize != pad) {
        return Err(EngineError::format("inconsistent pad bytes"));
    }
    if pad == len {
        return Err(EngineError::format("name is empty after unpadding"));
    }
    data.truncate(len - pad);
    Ok(data)
}
