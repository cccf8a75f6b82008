//! Per-directory IVs.
//!
//! Every ciphertext directory, the root included, holds a 16-byte
//! random tweak in `gocryptfs.diriv`, written at directory creation
//! before any other entry. IVs never rotate, so the process-local cache
//! needs no cross-mount coherence; it is rebuilt from the backing store
//! after a remount.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::{thread_rng, RngCore};
use tracing::{debug, warn};

use veilfs_core::{EngineError, EngineResult, DIRIV_LEN, DIRIV_NAME};

/// Creates a fresh IV file in `cipher_dir`. Fails if one already
/// exists.
pub fn create(cipher_dir: &Path) -> EngineResult<[u8; DIRIV_LEN]> {
    let mut iv = [0u8; DIRIV_LEN];
    thread_rng().fill_bytes(&mut iv);

    let path = cipher_dir.join(DIRIV_NAME);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.write_all(&iv)?;
    if let Err(e) = file.sync_all() {
        warn!("diriv sync on {} failed: {e}", path.display());
    }
    Ok(iv)
}

/// Reads the IV file of `cipher_dir`, enforcing the exact length.
pub fn read(cipher_dir: &Path) -> EngineResult<[u8; DIRIV_LEN]> {
    let path = cipher_dir.join(DIRIV_NAME);
    let bytes = fs::read(&path)?;
    let iv: [u8; DIRIV_LEN] = bytes.as_slice().try_into().map_err(|_| {
        EngineError::format(format!(
            "{} holds {} bytes, want {DIRIV_LEN}",
            path.display(),
            bytes.len()
        ))
    })?;
    Ok(iv)
}

/// Process-local cache of directory IVs, keyed by ciphertext directory
/// path. Readers dominate; a single lock serializes writers. Stale
/// entries are harmless because IVs never change for a live directory.
pub struct DirIvCache {
    map: Mutex<HashMap<PathBuf, [u8; DIRIV_LEN]>>,
}

impl DirIvCache {
    pub fn new() -> Self {
        DirIvCache {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the IV of `cipher_dir`, reading and caching it on first
    /// access. A directory that lost its IV file gets a fresh one.
    pub fn get(&self, cipher_dir: &Path) -> EngineResult<[u8; DIRIV_LEN]> {
        if let Some(iv) = self.map.lock().expect("diriv cache lock").get(cipher_dir) {
            return Ok(*iv);
        }
        let iv = match read(cipher_dir) {
            Ok(iv) => iv,
            Err(EngineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "missing diriv in {}, creating a fresh one",
                    cipher_dir.display()
                );
                create(cipher_dir)?
            }
            Err(e) => return Err(e),
        };
        debug!("cached diriv for {}", cipher_dir.display());
        self.map
            .lock()
            .expect("diriv cache lock")
            .insert(cipher_dir.to_path_buf(), iv);
        Ok(iv)
    }

    /// Drops the cache entry after the directory is deleted.
    pub fn invalidate(&self, cipher_dir: &Path) {
        self.map
            .lock()
            .expect("diriv cache lock")
            .remove(cipher_dir);
    }

    pub fn clear(&self) {
        self.map.lock().expect("diriv cache lock").clear();
    }
}

impl Default for DirIvCache {
    fn default() -> Self {
        Self::new()
    }
}
