//! The config envelope: `gocryptfs.conf` in the ciphertext root.
//!
//! A JSON record holding the creator tag, the AEAD-wrapped master key,
//! the password-KDF parameters, the feature flags and the block size.
//! Loading it fully determines every algorithm and size in use; nothing
//! is ever inferred from data files.
//!
//! The master key is wrapped with the volume's own content codec at
//! block 0 with an empty file ID, under a key derived from the password.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::{thread_rng, RngCore};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::warn;

use veilfs_core::{
    valid_block_size, EngineError, EngineResult, FeatureFlag, FeatureFlags, CONFIG_NAME,
    DEFAULT_BLOCK_SIZE, KEY_LEN,
};
use veilfs_crypto::{
    AeadBackend, AeadKind, Argon2idKdf, ContentCodec, MasterKey, PasswordKdf, ScryptKdf,
};

/// On-disk envelope. Binary fields are base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEnvelope {
    pub creator: String,
    #[serde(with = "b64")]
    pub encrypted_key: Vec<u8>,
    pub kdf: PasswordKdf,
    pub feature_flags: FeatureFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
}

impl ConfigEnvelope {
    /// The content AEAD the flag set selects.
    pub fn content_aead(&self) -> AeadKind {
        if self.feature_flags.contains(FeatureFlag::AESSIV) {
            AeadKind::AesSiv
        } else if self.feature_flags.contains(FeatureFlag::XCHACHAPOLY) {
            AeadKind::XChaCha
        } else if self.feature_flags.contains(FeatureFlag::GCMIV128) {
            AeadKind::AesGcm128
        } else {
            AeadKind::AesGcm96
        }
    }

    /// The plaintext block size in effect.
    pub fn block_size(&self) -> u32 {
        if self.feature_flags.contains(FeatureFlag::CONFIGURABLEBLOCKSIZE) {
            self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
        } else {
            DEFAULT_BLOCK_SIZE
        }
    }

    pub fn hkdf(&self) -> bool {
        self.feature_flags.contains(FeatureFlag::HKDF)
    }

    /// Full load-time validation: flag combinations, KDF floors, block
    /// size whitelist.
    pub fn validate(&self) -> EngineResult<()> {
        if self.creator.is_empty() {
            return Err(EngineError::format("empty creator tag"));
        }
        self.feature_flags.validate()?;
        self.kdf.validate()?;
        if self.block_size.is_some()
            && !self
                .feature_flags
                .contains(FeatureFlag::CONFIGURABLEBLOCKSIZE)
        {
            return Err(EngineError::Usage(
                "block_size set without CONFIGURABLEBLOCKSIZE".into(),
            ));
        }
        if !valid_block_size(self.block_size()) {
            return Err(EngineError::format(format!(
                "unsupported block size {}",
                self.block_size()
            )));
        }
        Ok(())
    }

    /// Derives the wrap key from the password and unwraps the master
    /// key. An authentication failure here means a wrong password.
    pub fn unwrap_master_key(&self, password: &SecretString) -> EngineResult<MasterKey> {
        let wrap_key = self.kdf.derive(password)?;
        let codec = wrap_codec(self.content_aead(), &wrap_key);
        let plain = codec
            .decrypt_block(&self.encrypted_key, 0, b"")
            .map_err(|e| match e {
                EngineError::Auth(_) => EngineError::WrongPassword,
                other => other,
            })?;
        let bytes: [u8; KEY_LEN] = plain
            .as_slice()
            .try_into()
            .map_err(|_| EngineError::format(format!("master key of {} bytes", plain.len())))?;
        if bytes.iter().all(|&b| b == 0) {
            return Err(EngineError::format("all-zero master key"));
        }
        Ok(MasterKey::from_bytes(bytes))
    }

    fn wrap_master_key(
        kind: AeadKind,
        wrap_key: &[u8; KEY_LEN],
        master: &MasterKey,
    ) -> EngineResult<Vec<u8>> {
        let codec = wrap_codec(kind, wrap_key);
        codec.encrypt_block(master.as_bytes(), 0, b"")
    }
}

/// A one-block codec over the wrap key, used only for the master key.
fn wrap_codec(kind: AeadKind, wrap_key: &[u8; KEY_LEN]) -> ContentCodec {
    ContentCodec::new(AeadBackend::new(kind, wrap_key), KEY_LEN)
}

fn config_path(cipher_dir: &Path) -> PathBuf {
    cipher_dir.join(CONFIG_NAME)
}

/// Creates a fresh envelope for a new volume and persists it. The
/// caller picks the flags and block size; the KDF kind follows the
/// ARGON2ID flag. `scrypt_log_n` overrides the default scrypt cost
/// (still subject to the floors).
pub fn create(
    cipher_dir: &Path,
    password: &SecretString,
    flags: FeatureFlags,
    block_size: u32,
    scrypt_log_n: Option<u8>,
) -> EngineResult<()> {
    flags.validate()?;
    if !valid_block_size(block_size) {
        return Err(EngineError::Usage(format!(
            "unsupported block size {block_size}"
        )));
    }
    if block_size != DEFAULT_BLOCK_SIZE && !flags.contains(FeatureFlag::CONFIGURABLEBLOCKSIZE) {
        return Err(EngineError::Usage(
            "non-default block size requires CONFIGURABLEBLOCKSIZE".into(),
        ));
    }

    let kdf = if flags.contains(FeatureFlag::ARGON2ID) {
        PasswordKdf::Argon2id(Argon2idKdf::new())
    } else {
        PasswordKdf::Scrypt(match scrypt_log_n {
            Some(log_n) => ScryptKdf::with_log_n(log_n),
            None => ScryptKdf::new(),
        })
    };
    let master = MasterKey::random();
    let wrap_key = kdf.derive(password)?;

    let mut envelope = ConfigEnvelope {
        creator: format!("veilfs {}", env!("CARGO_PKG_VERSION")),
        encrypted_key: Vec::new(),
        kdf,
        feature_flags: flags,
        block_size: None,
    };
    envelope.encrypted_key =
        ConfigEnvelope::wrap_master_key(envelope.content_aead(), &wrap_key, &master)?;
    if envelope
        .feature_flags
        .contains(FeatureFlag::CONFIGURABLEBLOCKSIZE)
    {
        envelope.block_size = Some(block_size);
    }

    save(cipher_dir, &envelope)
}

/// Loads and validates the envelope. A missing file surfaces as an
/// `Io(NotFound)` so hosts can report config-missing distinctly.
pub fn load(cipher_dir: &Path) -> EngineResult<ConfigEnvelope> {
    let bytes = fs::read(config_path(cipher_dir))?;
    let envelope: ConfigEnvelope = serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::format(format!("config envelope: {e}")))?;
    envelope.validate()?;
    Ok(envelope)
}

/// Persists the envelope crash-safely:
/// 1. serialize to a randomized temp file in the same directory,
/// 2. fsync it,
/// 3. atomically rename it over the destination,
/// 4. fsync the directory (best effort).
/// A failure before the rename leaves the previous envelope intact.
pub fn save(cipher_dir: &Path, envelope: &ConfigEnvelope) -> EngineResult<()> {
    let target = config_path(cipher_dir);
    let json = serde_json::to_vec_pretty(envelope)
        .map_err(|e| EngineError::format(format!("config envelope: {e}")))?;

    let mut rnd = [0u8; 8];
    thread_rng().fill_bytes(&mut rnd);
    let tmp = cipher_dir.join(format!(
        "{CONFIG_NAME}.tmp.{}",
        rnd.iter().map(|b| format!("{b:02x}")).collect::<String>()
    ));

    let write_tmp = || -> EngineResult<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    };
    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, &target) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    // Some backing stores cannot sync a directory handle; the rename
    // itself already succeeded, so only durability is at stake.
    match File::open(cipher_dir).and_then(|dir| dir.sync_all()) {
        Ok(()) => {}
        Err(e) => warn!("directory sync on {} failed: {e}", cipher_dir.display()),
    }
    Ok(())
}

/// Re-wraps the master key under a new password with a fresh salt.
/// The caller serializes concurrent rewrites.
pub fn change_password(
    cipher_dir: &Path,
    old: &SecretString,
    new: &SecretString,
) -> EngineResult<()> {
    let mut envelope = load(cipher_dir)?;
    let master = envelope.unwrap_master_key(old)?;

    envelope.kdf = match &envelope.kdf {
        PasswordKdf::Scrypt(s) => PasswordKdf::Scrypt(ScryptKdf::with_log_n(s.log_n)),
        PasswordKdf::Argon2id(a) => {
            let mut fresh = Argon2idKdf::new();
            fresh.memory_kib = a.memory_kib;
            fresh.iterations = a.iterations;
            fresh.parallelism = a.parallelism;
            PasswordKdf::Argon2id(fresh)
        }
    };
    let wrap_key = envelope.kdf.derive(new)?;
    envelope.encrypted_key =
        ConfigEnvelope::wrap_master_key(envelope.content_aead(), &wrap_key, &master)?;
    save(cipher_dir, &envelope)
}

/// Base64 (standard alphabet) serde adapter for binary envelope fields.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
