//! Volume feature flags.
//!
//! Each flag is either present or absent in the config envelope. The
//! envelope is the single source of truth: loading it fully determines
//! which algorithms and sizes are in use.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// Purpose keys are derived from the master key via HKDF. Volumes
    /// without this flag use the master key directly (legacy).
    HKDF,
    /// 128-bit GCM nonces (96-bit when absent).
    GCMIV128,
    /// AES-SIV content encryption (deterministic nonces, reverse mounts).
    AESSIV,
    /// XChaCha20-Poly1305 content encryption.
    XCHACHAPOLY,
    /// Argon2id password KDF instead of scrypt.
    ARGON2ID,
    /// HMAC suffix on every encoded filename.
    FILENAMEAUTH,
    /// The block_size field is honored; absent means 4096.
    CONFIGURABLEBLOCKSIZE,
    /// Filenames are stored unencrypted.
    PLAINTEXTNAMES,
}

/// The set of flags recorded in a config envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(BTreeSet<FeatureFlag>);

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, flag: FeatureFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn insert(&mut self, flag: FeatureFlag) {
        self.0.insert(flag);
    }

    pub fn iter(&self) -> impl Iterator<Item = FeatureFlag> + '_ {
        self.0.iter().copied()
    }

    /// Rejects flag combinations the format does not support.
    pub fn validate(&self) -> EngineResult<()> {
        if self.contains(FeatureFlag::FILENAMEAUTH) && self.contains(FeatureFlag::PLAINTEXTNAMES) {
            return Err(EngineError::Usage(
                "FILENAMEAUTH cannot be combined with PLAINTEXTNAMES".into(),
            ));
        }
        if self.contains(FeatureFlag::FILENAMEAUTH) && !self.contains(FeatureFlag::HKDF) {
            return Err(EngineError::Usage(
                "FILENAMEAUTH requires HKDF key derivation".into(),
            ));
        }
        if self.contains(FeatureFlag::AESSIV) && self.contains(FeatureFlag::XCHACHAPOLY) {
            return Err(EngineError::Usage(
                "AESSIV and XCHACHAPOLY are mutually exclusive".into(),
            ));
        }
        Ok(())
    }
}

impl FromIterator<FeatureFlag> for FeatureFlags {
    fn from_iter<I: IntoIterator<Item = FeatureFlag>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
