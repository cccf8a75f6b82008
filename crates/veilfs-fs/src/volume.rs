//! Volume lifecycle and the engine's operation surface.
//!
//! A volume is a ciphertext directory tree plus the keys unwrapped from
//! its config envelope. `init` lays down the envelope and the root
//! directory IV; `open` unwraps the master key, derives the purpose
//! keys, pins them in memory and builds the codec and resolver.
//! Dropping the volume wipes the keys and releases the pinned pages.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::SecretString;
use tracing::debug;

use veilfs_core::{
    EngineError, EngineResult, FeatureFlag, FeatureFlags, CONFIG_NAME, DEFAULT_BLOCK_SIZE,
    DIRIV_NAME,
};
use veilfs_crypto::hardening::Hardening;
use veilfs_crypto::{keys, AeadBackend, AeadKind, ContentCodec, PurposeKey};

use crate::configfile::{self, ConfigEnvelope};
use crate::diriv;
use crate::file::{self, FileHandle};
use crate::longname;
use crate::names::NameTransform;
use crate::resolver::{EncodedName, PathResolver};

/// Choices made once, at volume creation.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// Content AEAD; `None` probes the CPU.
    pub aead: Option<AeadKind>,
    /// Argon2id password KDF instead of scrypt.
    pub argon2id: bool,
    /// MAC suffix on every encoded filename.
    pub filename_auth: bool,
    /// Store filenames unencrypted.
    pub plaintext_names: bool,
    /// Plaintext block size.
    pub block_size: u32,
    /// Override the scrypt cost (still subject to the floors).
    pub scrypt_log_n: Option<u8>,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        VolumeOptions {
            aead: None,
            argon2id: false,
            filename_auth: false,
            plaintext_names: false,
            block_size: DEFAULT_BLOCK_SIZE,
            scrypt_log_n: None,
        }
    }
}

/// Purpose keys kept pinned for the volume's lifetime.
struct VolumeKeys {
    content: PurposeKey,
    name: Option<PurposeKey>,
    mac: Option<PurposeKey>,
}

/// An opened encrypted volume.
pub struct Volume {
    cipher_root: PathBuf,
    /// Snapshot of the loaded envelope; the mutex is the single writer
    /// lock for password changes.
    envelope: Mutex<ConfigEnvelope>,
    codec: Arc<ContentCodec>,
    resolver: PathResolver,
    keys: VolumeKeys,
    hardening: Hardening,
}

/// A problem found by [`Volume::check`].
#[derive(Debug)]
pub struct CheckIssue {
    pub path: PathBuf,
    pub problem: String,
}

impl Volume {
    /// Creates a new volume in `cipher_dir` (which must be empty or
    /// absent): writes the config envelope and the root directory IV.
    pub fn init(
        cipher_dir: &Path,
        password: &SecretString,
        options: &VolumeOptions,
    ) -> EngineResult<()> {
        if cipher_dir.exists() {
            if fs::read_dir(cipher_dir)?.next().is_some() {
                return Err(EngineError::Usage(format!(
                    "{} is not empty",
                    cipher_dir.display()
                )));
            }
        } else {
            fs::create_dir_all(cipher_dir)?;
        }

        let aead = options.aead.unwrap_or_else(AeadKind::auto);
        let mut flags: FeatureFlags = [FeatureFlag::HKDF].into_iter().collect();
        match aead {
            AeadKind::AesGcm128 => flags.insert(FeatureFlag::GCMIV128),
            AeadKind::AesGcm96 => {}
            AeadKind::XChaCha => flags.insert(FeatureFlag::XCHACHAPOLY),
            AeadKind::AesSiv => flags.insert(FeatureFlag::AESSIV),
        }
        if options.argon2id {
            flags.insert(FeatureFlag::ARGON2ID);
        }
        if options.filename_auth {
            flags.insert(FeatureFlag::FILENAMEAUTH);
        }
        if options.plaintext_names {
            flags.insert(FeatureFlag::PLAINTEXTNAMES);
        }
        if options.block_size != DEFAULT_BLOCK_SIZE {
            flags.insert(FeatureFlag::CONFIGURABLEBLOCKSIZE);
        }

        configfile::create(
            cipher_dir,
            password,
            flags,
            options.block_size,
            options.scrypt_log_n,
        )?;
        if !options.plaintext_names {
            diriv::create(cipher_dir)?;
        }
        debug!("initialized volume at {}", cipher_dir.display());
        Ok(())
    }

    /// Opens an existing volume: loads and validates the envelope,
    /// unwraps the master key and derives the purpose keys.
    pub fn open(cipher_dir: &Path, password: &SecretString) -> EngineResult<Self> {
        let envelope = configfile::load(cipher_dir)?;
        let master = envelope.unwrap_master_key(password)?;
        let hkdf = envelope.hkdf();

        let content = keys::derive_content_key(&master, hkdf);
        let plaintext_names = envelope
            .feature_flags
            .contains(FeatureFlag::PLAINTEXTNAMES);
        let (name, mac) = if plaintext_names {
            (None, None)
        } else {
            let name = keys::derive_name_key(&master, hkdf);
            let mac = envelope
                .feature_flags
                .contains(FeatureFlag::FILENAMEAUTH)
                .then(|| keys::derive_name_mac_key(&master));
            (Some(name), mac)
        };

        let hardening = Hardening::init();
        hardening.lock_key(content.as_bytes());
        if let Some(k) = &name {
            hardening.lock_key(k.as_bytes());
        }
        if let Some(k) = &mac {
            hardening.lock_key(k.as_bytes());
        }

        let backend = AeadBackend::new(envelope.content_aead(), content.as_bytes());
        let codec = Arc::new(ContentCodec::new(backend, envelope.block_size() as usize));
        let names = name
            .as_ref()
            .map(|k| NameTransform::new(k, mac.clone()));
        let resolver = PathResolver::new(cipher_dir.to_path_buf(), names);

        debug!("opened volume at {}", cipher_dir.display());
        Ok(Volume {
            cipher_root: cipher_dir.to_path_buf(),
            envelope: Mutex::new(envelope),
            codec,
            resolver,
            keys: VolumeKeys { content, name, mac },
            hardening,
        })
    }

    /// Wipes keys and releases pinned pages. Equivalent to dropping the
    /// volume, spelled out for hosts that unmount explicitly.
    pub fn unmount(self) {
        drop(self);
    }

    pub fn cipher_root(&self) -> &Path {
        &self.cipher_root
    }

    pub fn block_size(&self) -> u32 {
        self.envelope.lock().expect("envelope lock").block_size()
    }

    // ---- control-surface hooks -------------------------------------

    /// Pure hook: relative plaintext path → relative ciphertext path.
    pub fn encrypt_path(&self, plain_rel: &str) -> EngineResult<PathBuf> {
        let abs = self.resolver.encrypt_path(plain_rel)?;
        Ok(abs
            .strip_prefix(&self.cipher_root)
            .expect("resolver stays under the root")
            .to_path_buf())
    }

    /// Pure hook: relative ciphertext path → relative plaintext path.
    pub fn decrypt_path(&self, cipher_rel: &str) -> EngineResult<PathBuf> {
        self.resolver.decrypt_path(cipher_rel)
    }

    // ---- file operations -------------------------------------------

    /// Creates a new file. The spillover companion, if needed, is
    /// written before the entry itself.
    pub fn create_file(&self, plain_rel: &str) -> EngineResult<FileHandle> {
        let (parent, encoded) = self.resolve_entry(plain_rel)?;
        if encoded.is_long() {
            longname::write_companion(&parent, encoded.stored(), encoded.full())?;
        }
        FileHandle::create(&parent.join(encoded.stored()), self.codec.clone())
    }

    pub fn open_file(&self, plain_rel: &str) -> EngineResult<FileHandle> {
        let path = self.resolver.encrypt_path(plain_rel)?;
        FileHandle::open(&path, self.codec.clone())
    }

    pub fn unlink(&self, plain_rel: &str) -> EngineResult<()> {
        let (parent, encoded) = self.resolve_entry(plain_rel)?;
        fs::remove_file(parent.join(encoded.stored()))?;
        if encoded.is_long() {
            longname::remove_companion(&parent, encoded.stored())?;
        }
        Ok(())
    }

    // ---- directory operations --------------------------------------

    pub fn mkdir(&self, plain_rel: &str) -> EngineResult<()> {
        let (parent, encoded) = self.resolve_entry(plain_rel)?;
        if encoded.is_long() {
            longname::write_companion(&parent, encoded.stored(), encoded.full())?;
        }
        let dir = parent.join(encoded.stored());
        fs::create_dir(&dir)?;
        if !self.resolver.plaintext_names() {
            // The IV precedes every other entry in the new directory.
            diriv::create(&dir)?;
        }
        Ok(())
    }

    pub fn rmdir(&self, plain_rel: &str) -> EngineResult<()> {
        let (parent, encoded) = self.resolve_entry(plain_rel)?;
        let dir = parent.join(encoded.stored());
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_name().to_str() != Some(DIRIV_NAME) {
                return Err(EngineError::Io(std::io::Error::other(format!(
                    "{plain_rel} is not empty"
                ))));
            }
        }
        let _ = fs::remove_file(dir.join(DIRIV_NAME));
        fs::remove_dir(&dir)?;
        self.resolver.dirivs().invalidate(&dir);
        if encoded.is_long() {
            longname::remove_companion(&parent, encoded.stored())?;
        }
        Ok(())
    }

    /// Lists a plaintext directory.
    pub fn read_dir(&self, plain_rel: &str) -> EngineResult<Vec<String>> {
        let dir = self.resolver.encrypt_path(plain_rel)?;
        self.resolver.list_dir(&dir)
    }

    /// Renames an entry. Moving across directories re-encrypts the name
    /// under the destination parent's IV.
    pub fn rename(&self, old_plain: &str, new_plain: &str) -> EngineResult<()> {
        let (old_parent, old_enc) = self.resolve_entry(old_plain)?;
        let (new_parent, new_enc) = self.resolve_entry(new_plain)?;
        if new_enc.is_long() {
            longname::write_companion(&new_parent, new_enc.stored(), new_enc.full())?;
        }
        fs::rename(
            old_parent.join(old_enc.stored()),
            new_parent.join(new_enc.stored()),
        )?;
        if old_enc.is_long() {
            longname::remove_companion(&old_parent, old_enc.stored())?;
        }
        // A moved directory subtree invalidates cache keys wholesale.
        self.resolver.dirivs().clear();
        Ok(())
    }

    // ---- symlinks ---------------------------------------------------

    /// Encrypts a symlink target: one block 0 with an empty file ID,
    /// base64url-encoded.
    pub fn encrypt_symlink_target(&self, target: &str) -> EngineResult<String> {
        let ct = self.codec.encrypt_block(target.as_bytes(), 0, b"")?;
        Ok(URL_SAFE_NO_PAD.encode(ct))
    }

    pub fn decrypt_symlink_target(&self, encoded: &str) -> EngineResult<String> {
        let ct = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| EngineError::format("undecodable symlink target"))?;
        let pt = self.codec.decrypt_block(&ct, 0, b"")?;
        String::from_utf8(pt).map_err(|_| EngineError::format("symlink target is not UTF-8"))
    }

    #[cfg(unix)]
    pub fn symlink(&self, target: &str, plain_rel: &str) -> EngineResult<()> {
        let (parent, encoded) = self.resolve_entry(plain_rel)?;
        if encoded.is_long() {
            longname::write_companion(&parent, encoded.stored(), encoded.full())?;
        }
        let enc_target = self.encrypt_symlink_target(target)?;
        std::os::unix::fs::symlink(enc_target, parent.join(encoded.stored()))?;
        Ok(())
    }

    #[cfg(unix)]
    pub fn readlink(&self, plain_rel: &str) -> EngineResult<String> {
        let path = self.resolver.encrypt_path(plain_rel)?;
        let raw = fs::read_link(path)?;
        let encoded = raw
            .to_str()
            .ok_or_else(|| EngineError::format("symlink target is not UTF-8"))?;
        self.decrypt_symlink_target(encoded)
    }

    // ---- maintenance ------------------------------------------------

    /// Re-wraps the master key under a new password.
    pub fn change_password(&self, old: &SecretString, new: &SecretString) -> EngineResult<()> {
        let mut envelope = self.envelope.lock().expect("envelope lock");
        configfile::change_password(&self.cipher_root, old, new)?;
        *envelope = configfile::load(&self.cipher_root)?;
        Ok(())
    }

    /// Walks the ciphertext tree and reports consistency problems:
    /// spillover orphans, missing directory IVs, malformed headers.
    pub fn check(&self) -> EngineResult<Vec<CheckIssue>> {
        let mut issues = Vec::new();
        let mut stack = vec![self.cipher_root.clone()];
        let plaintext_names = self.resolver.plaintext_names();

        while let Some(dir) = stack.pop() {
            let mut saw_diriv = false;
            let mut stubs: BTreeSet<String> = BTreeSet::new();
            let mut companions: BTreeSet<String> = BTreeSet::new();

            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    issues.push(CheckIssue {
                        path,
                        problem: "non-UTF-8 entry name".into(),
                    });
                    continue;
                };
                if name == DIRIV_NAME {
                    saw_diriv = true;
                    if let Err(e) = diriv::read(&dir) {
                        issues.push(CheckIssue {
                            path,
                            problem: e.to_string(),
                        });
                    }
                    continue;
                }
                if dir == self.cipher_root && name == CONFIG_NAME {
                    continue;
                }
                if longname::is_companion(&name) {
                    let stub = name
                        .strip_suffix(veilfs_core::LONGNAME_SUFFIX)
                        .expect("companion names carry the suffix")
                        .to_owned();
                    companions.insert(stub);
                    continue;
                }
                if longname::is_stub(&name) {
                    stubs.insert(name.clone());
                }
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if let Err(e) = check_header(&path) {
                        issues.push(CheckIssue {
                            path,
                            problem: e.to_string(),
                        });
                    }
                }
            }

            if !plaintext_names && !saw_diriv {
                issues.push(CheckIssue {
                    path: dir.clone(),
                    problem: format!("missing {DIRIV_NAME}"),
                });
            }
            for stub in &stubs {
                if !companions.contains(stub) {
                    issues.push(CheckIssue {
                        path: dir.join(stub),
                        problem: "long-name stub without companion".into(),
                    });
                }
            }
            for companion in &companions {
                if !stubs.contains(companion) {
                    issues.push(CheckIssue {
                        path: dir.join(longname::companion_name(companion)),
                        problem: "long-name companion without stub".into(),
                    });
                }
            }
        }
        Ok(issues)
    }

    fn resolve_entry(&self, plain_rel: &str) -> EngineResult<(PathBuf, EncodedName)> {
        let (parent, encoded) = self.resolver.encrypt_path_parts(plain_rel)?;
        let encoded = encoded
            .ok_or_else(|| EngineError::Usage("the volume root is not an entry".into()))?;
        Ok((parent, encoded))
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.hardening.unlock_key(self.keys.content.as_bytes());
        if let Some(k) = &self.keys.name {
            self.hardening.unlock_key(k.as_bytes());
        }
        if let Some(k) = &self.keys.mac {
            self.hardening.unlock_key(k.as_bytes());
        }
    }
}

/// Header sanity for the consistency check: empty files are fine,
/// anything else needs a well-formed 18-byte header.
fn check_header(path: &Path) -> EngineResult<()> {
    let file = fs::File::open(path)?;
    file::read_header(&file).map(|_| ())
}
