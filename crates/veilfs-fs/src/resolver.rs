//! Plaintext-path ↔ ciphertext-path translation.
//!
//! The forward walk encrypts one component at a time under the IV of
//! each intermediate ciphertext directory; too-long encoded names are
//! replaced by their spillover stubs. The reverse walk decrypts a
//! ciphertext directory listing, skipping the volume's own bookkeeping
//! files and dropping (with a warning) any entry that fails MAC
//! verification, padding validation or spillover lookup. One bad entry
//! must not take the rest of the listing down.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use veilfs_core::{EngineError, EngineResult, CONFIG_NAME, DIRIV_NAME};

use crate::diriv::DirIvCache;
use crate::longname;
use crate::names::{validate_plain_name, NameTransform};

/// One encrypted path component, with its spillover translation.
#[derive(Debug, Clone)]
pub struct EncodedName {
    /// Full encoded name, including a MAC suffix when enabled.
    full: String,
    /// Directory entry actually stored: the full name, or a stub.
    stored: String,
}

impl EncodedName {
    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn stored(&self) -> &str {
        &self.stored
    }

    /// True when the entry goes through long-name spillover.
    pub fn is_long(&self) -> bool {
        self.full != self.stored
    }
}

/// Walks paths between the plaintext and ciphertext views.
pub struct PathResolver {
    cipher_root: PathBuf,
    /// None in PLAINTEXTNAMES mode.
    names: Option<NameTransform>,
    dirivs: DirIvCache,
}

impl PathResolver {
    pub fn new(cipher_root: PathBuf, names: Option<NameTransform>) -> Self {
        PathResolver {
            cipher_root,
            names,
            dirivs: DirIvCache::new(),
        }
    }

    pub fn cipher_root(&self) -> &Path {
        &self.cipher_root
    }

    pub fn plaintext_names(&self) -> bool {
        self.names.is_none()
    }

    pub fn dirivs(&self) -> &DirIvCache {
        &self.dirivs
    }

    /// Encrypts a single component in the context of `cipher_dir`.
    pub fn encrypt_component(
        &self,
        cipher_dir: &Path,
        name: &str,
    ) -> EngineResult<EncodedName> {
        let Some(transform) = &self.names else {
            validate_plain_name(name)?;
            return Ok(EncodedName {
                full: name.to_string(),
                stored: name.to_string(),
            });
        };
        let iv = self.dirivs.get(cipher_dir)?;
        let full = transform.encrypt_name(name, &iv)?;
        let stored = if longname::exceeds_limit(&full, transform.name_limit()) {
            longname::stub_name(&full)
        } else {
            full.clone()
        };
        Ok(EncodedName { full, stored })
    }

    /// Decrypts a single directory entry of `cipher_dir`. Stubs resolve
    /// through their companion file.
    pub fn decrypt_component(&self, cipher_dir: &Path, entry: &str) -> EngineResult<String> {
        let Some(transform) = &self.names else {
            validate_plain_name(entry)?;
            return Ok(entry.to_string());
        };
        if longname::is_companion(entry) {
            return Err(EngineError::format(format!(
                "{entry} is a spillover companion, not an entry"
            )));
        }
        let full = if longname::is_stub(entry) {
            longname::read_companion(cipher_dir, entry)?
        } else {
            entry.to_string()
        };
        let iv = self.dirivs.get(cipher_dir)?;
        transform.decrypt_name(&full, &iv)
    }

    /// Translates a relative plaintext path to the absolute ciphertext
    /// path of its entry.
    pub fn encrypt_path(&self, plain_rel: &str) -> EngineResult<PathBuf> {
        let mut dir = self.cipher_root.clone();
        for comp in components(plain_rel) {
            let encoded = self.encrypt_component(&dir, comp)?;
            dir = dir.join(encoded.stored());
        }
        Ok(dir)
    }

    /// Like [`encrypt_path`](Self::encrypt_path), but also returns the
    /// final component's encoding so entry-creating operations can
    /// maintain the spillover companion.
    pub fn encrypt_path_parts(
        &self,
        plain_rel: &str,
    ) -> EngineResult<(PathBuf, Option<EncodedName>)> {
        let comps: Vec<&str> = components(plain_rel).collect();
        let Some((last, parents)) = comps.split_last() else {
            return Ok((self.cipher_root.clone(), None));
        };
        let mut dir = self.cipher_root.clone();
        for comp in parents {
            let encoded = self.encrypt_component(&dir, comp)?;
            dir = dir.join(encoded.stored());
        }
        let encoded = self.encrypt_component(&dir, last)?;
        Ok((dir, Some(encoded)))
    }

    /// Translates a relative ciphertext path back to the plaintext
    /// path.
    pub fn decrypt_path(&self, cipher_rel: &str) -> EngineResult<PathBuf> {
        let mut dir = self.cipher_root.clone();
        let mut plain = PathBuf::new();
        for comp in components(cipher_rel) {
            plain.push(self.decrypt_component(&dir, comp)?);
            dir = dir.join(comp);
        }
        Ok(plain)
    }

    /// Lists a ciphertext directory as plaintext names, sorted.
    /// Undecryptable entries are logged and omitted.
    pub fn list_dir(&self, cipher_dir: &Path) -> EngineResult<Vec<String>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(cipher_dir)? {
            let entry = entry?;
            let raw = entry.file_name();
            let Some(name) = raw.to_str() else {
                warn!("skipping non-UTF-8 entry in {}", cipher_dir.display());
                continue;
            };
            if name == CONFIG_NAME || name == DIRIV_NAME || longname::is_companion(name) {
                continue;
            }
            match self.decrypt_component(cipher_dir, name) {
                Ok(plain) => out.push(plain),
                Err(e) => {
                    warn!("rejecting entry {name} in {}: {e}", cipher_dir.display());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

fn components(rel: &str) -> impl Iterator<Item = &str> {
    rel.split('/').filter(|c| !c.is_empty() && *c != ".")
}
