//! Password key derivation: scrypt or Argon2id → 256-bit wrap key.
//!
//! Parameter floors are enforced on every derivation, including
//! parameters loaded from disk, so a rewritten config envelope cannot
//! downgrade the brute-force cost.

use argon2::{Algorithm, Argon2, Params as Argon2Params, Version};
use rand::{thread_rng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use veilfs_core::{EngineError, EngineResult, KEY_LEN};

/// scrypt logN below this is too cheap to make sense.
pub const SCRYPT_MIN_LOG_N: u8 = 10;
pub const SCRYPT_MIN_R: u32 = 8;
pub const SCRYPT_MIN_P: u32 = 1;
pub const SCRYPT_MIN_SALT_LEN: usize = 32;
/// Default scrypt cost: N=2^17, 128 MiB.
pub const SCRYPT_DEFAULT_LOG_N: u8 = 17;

/// Argon2id memory floor: 16 MiB.
pub const ARGON2ID_MIN_MEMORY_KIB: u32 = 16 * 1024;
pub const ARGON2ID_MIN_ITERATIONS: u32 = 1;
pub const ARGON2ID_MIN_PARALLELISM: u32 = 1;
pub const ARGON2ID_MIN_SALT_LEN: usize = 16;
/// Default Argon2id cost: 64 MiB, 3 passes, 4 lanes.
pub const ARGON2ID_DEFAULT_MEMORY_KIB: u32 = 64 * 1024;
pub const ARGON2ID_DEFAULT_ITERATIONS: u32 = 3;
pub const ARGON2ID_DEFAULT_PARALLELISM: u32 = 4;

/// The password KDF recorded in the config envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PasswordKdf {
    Scrypt(ScryptKdf),
    Argon2id(Argon2idKdf),
}

impl PasswordKdf {
    /// Validates parameters against the floors, then derives the
    /// 256-bit wrap key.
    pub fn derive(&self, password: &SecretString) -> EngineResult<Zeroizing<[u8; KEY_LEN]>> {
        self.validate()?;
        match self {
            PasswordKdf::Scrypt(s) => s.derive(password),
            PasswordKdf::Argon2id(a) => a.derive(password),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self {
            PasswordKdf::Scrypt(s) => s.validate(),
            PasswordKdf::Argon2id(a) => a.validate(),
        }
    }
}

/// scrypt (RFC 7914) parameters. N is stored as log2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScryptKdf {
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
}

impl ScryptKdf {
    /// Fresh parameters with secure defaults and a random salt.
    pub fn new() -> Self {
        Self::with_log_n(SCRYPT_DEFAULT_LOG_N)
    }

    pub fn with_log_n(log_n: u8) -> Self {
        ScryptKdf {
            salt: random_salt(KEY_LEN),
            log_n,
            r: 8,
            p: 1,
        }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.log_n < SCRYPT_MIN_LOG_N {
            return Err(EngineError::WeakParameters(format!(
                "scrypt logN={} below minimum {}",
                self.log_n, SCRYPT_MIN_LOG_N
            )));
        }
        if self.r < SCRYPT_MIN_R {
            return Err(EngineError::WeakParameters(format!(
                "scrypt r={} below minimum {}",
                self.r, SCRYPT_MIN_R
            )));
        }
        if self.p < SCRYPT_MIN_P {
            return Err(EngineError::WeakParameters(format!(
                "scrypt p={} below minimum {}",
                self.p, SCRYPT_MIN_P
            )));
        }
        if self.salt.len() < SCRYPT_MIN_SALT_LEN {
            return Err(EngineError::WeakParameters(format!(
                "scrypt salt length {} below minimum {}",
                self.salt.len(),
                SCRYPT_MIN_SALT_LEN
            )));
        }
        Ok(())
    }

    fn derive(&self, password: &SecretString) -> EngineResult<Zeroizing<[u8; KEY_LEN]>> {
        let params = scrypt::Params::new(self.log_n, self.r, self.p, KEY_LEN)
            .map_err(|e| EngineError::WeakParameters(format!("scrypt parameters: {e}")))?;
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        scrypt::scrypt(
            password.expose_secret().as_bytes(),
            &self.salt,
            &params,
            &mut key[..],
        )
        .map_err(|e| EngineError::format(format!("scrypt derivation: {e}")))?;
        Ok(key)
    }
}

impl Default for ScryptKdf {
    fn default() -> Self {
        Self::new()
    }
}

/// Argon2id (RFC 9106) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Argon2idKdf {
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2idKdf {
    /// Fresh parameters with secure defaults and a random salt.
    pub fn new() -> Self {
        Argon2idKdf {
            salt: random_salt(KEY_LEN),
            memory_kib: ARGON2ID_DEFAULT_MEMORY_KIB,
            iterations: ARGON2ID_DEFAULT_ITERATIONS,
            parallelism: ARGON2ID_DEFAULT_PARALLELISM,
        }
    }

    fn validate(&self) -> EngineResult<()> {
        if self.memory_kib < ARGON2ID_MIN_MEMORY_KIB {
            return Err(EngineError::WeakParameters(format!(
                "Argon2id memory {} KiB below minimum {} KiB",
                self.memory_kib, ARGON2ID_MIN_MEMORY_KIB
            )));
        }
        if self.iterations < ARGON2ID_MIN_ITERATIONS {
            return Err(EngineError::WeakParameters(format!(
                "Argon2id iterations {} below minimum {}",
                self.iterations, ARGON2ID_MIN_ITERATIONS
            )));
        }
        if self.parallelism < ARGON2ID_MIN_PARALLELISM {
            return Err(EngineError::WeakParameters(format!(
                "Argon2id parallelism {} below minimum {}",
                self.parallelism, ARGON2ID_MIN_PARALLELISM
            )));
        }
        if self.salt.len() < ARGON2ID_MIN_SALT_LEN {
            return Err(EngineError::WeakParameters(format!(
                "Argon2id salt length {} below minimum {}",
                self.salt.len(),
                ARGON2ID_MIN_SALT_LEN
            )));
        }
        Ok(())
    }

    fn derive(&self, password: &SecretString) -> EngineResult<Zeroizing<[u8; KEY_LEN]>> {
        let params = Argon2Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| EngineError::WeakParameters(format!("Argon2id parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(
                password.expose_secret().as_bytes(),
                &self.salt,
                &mut key[..],
            )
            .map_err(|e| EngineError::format(format!("Argon2id derivation: {e}")))?;
        Ok(key)
    }
}

impl Default for Argon2idKdf {
    fn default() -> Self {
        Self::new()
    }
}

fn random_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    thread_rng().fill_bytes(&mut salt);
    salt
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
