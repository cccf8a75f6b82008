//! Per-block content encryption and decryption.
//!
//! Ciphertext block format:
//! ```text
//! [nonce][ciphertext][16-byte tag]
//! AAD = block_number (8 bytes, big-endian) || file_id (16 bytes)
//! ```
//!
//! The AAD binds each block to its position and owning file, preventing
//! block reordering and cross-file substitution. `file_id` is empty for
//! the master key in the config envelope and for symlink targets.
//!
//! Corner case: a full-sized block of all-zero ciphertext decrypts to an
//! all-zero plaintext block without an authentication check. This is
//! file hole passthrough, matching sparse-file semantics.

use rand::{thread_rng, RngCore};
use tracing::debug;

use veilfs_core::{EngineError, EngineResult, FILE_ID_LEN};

use crate::backend::AeadBackend;
use crate::parallel;
use crate::pool::BufferPool;

/// Group buffers are sized for this many blocks; larger groups still
/// work, the buffer just grows past its pooled capacity.
const REQUEST_BLOCKS: usize = 32;

/// Encrypts and decrypts file content blocks.
pub struct ContentCodec {
    backend: AeadBackend,
    plain_bs: usize,
    cipher_bs: usize,
    /// All-zero block of cipher_bs bytes, for hole detection.
    all_zero_block: Vec<u8>,
    pt_pool: BufferPool,
    ct_pool: BufferPool,
}

impl ContentCodec {
    pub fn new(backend: AeadBackend, plain_bs: usize) -> Self {
        let cipher_bs = plain_bs + backend.nonce_len() + backend.tag_len();
        ContentCodec {
            all_zero_block: vec![0u8; cipher_bs],
            pt_pool: BufferPool::new(REQUEST_BLOCKS * plain_bs),
            ct_pool: BufferPool::new(REQUEST_BLOCKS * cipher_bs),
            backend,
            plain_bs,
            cipher_bs,
        }
    }

    /// Plaintext block size.
    pub fn plain_bs(&self) -> usize {
        self.plain_bs
    }

    /// Ciphertext block size: `plain_bs + nonce + tag`.
    pub fn cipher_bs(&self) -> usize {
        self.cipher_bs
    }

    /// Per-block ciphertext overhead.
    pub fn block_overhead(&self) -> usize {
        self.cipher_bs - self.plain_bs
    }

    pub fn backend(&self) -> &AeadBackend {
        &self.backend
    }

    /// Encrypts one block under a fresh random nonce.
    pub fn encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let mut nonce = vec![0u8; self.backend.nonce_len()];
        // The all-zero nonce is reserved as a corruption sentinel.
        while nonce.iter().all(|&b| b == 0) {
            thread_rng().fill_bytes(&mut nonce);
        }
        self.encrypt_block_inner(plaintext, block_no, file_id, &nonce)
    }

    /// Encrypts one block under a caller-chosen nonce. Deterministic
    /// nonces are only sound in SIV mode; other backends refuse.
    pub fn encrypt_block_with_nonce(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8],
        nonce: &[u8],
    ) -> EngineResult<Vec<u8>> {
        if !self.backend.kind().deterministic_nonces() {
            return Err(EngineError::Usage(
                "caller-chosen nonces require the SIV backend".into(),
            ));
        }
        self.encrypt_block_inner(plaintext, block_no, file_id, nonce)
    }

    fn encrypt_block_inner(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8],
        nonce: &[u8],
    ) -> EngineResult<Vec<u8>> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }
        if plaintext.len() > self.plain_bs {
            return Err(EngineError::format(format!(
                "plaintext block of {} bytes exceeds block size {}",
                plaintext.len(),
                self.plain_bs
            )));
        }
        let aad = build_aad(block_no, file_id)?;
        let sealed = self.backend.seal(nonce, plaintext, &aad)?;

        let mut out = Vec::with_capacity(nonce.len() + sealed.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Verifies and decrypts one block.
    pub fn decrypt_block(
        &self,
        ciphertext: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> EngineResult<Vec<u8>> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }
        // Hole passthrough: only a full-sized all-zero block qualifies.
        if ciphertext.len() == self.cipher_bs && ciphertext == self.all_zero_block {
            debug!(block_no, "file hole encountered");
            return Ok(vec![0u8; self.plain_bs]);
        }
        let nonce_len = self.backend.nonce_len();
        if ciphertext.len() < nonce_len {
            return Err(EngineError::format(format!(
                "block {block_no} is too short: {} bytes",
                ciphertext.len()
            )));
        }
        let (nonce, body) = ciphertext.split_at(nonce_len);
        // An all-zero nonce never leaves the encrypt path; seeing one
        // means the backing store handed back scribbled-over data.
        if nonce.iter().all(|&b| b == 0) {
            return Err(EngineError::format(format!("block {block_no}: all-zero nonce")));
        }
        let aad = build_aad(block_no, file_id)?;
        self.backend.open(nonce, body, &aad).map_err(|e| match e {
            EngineError::Auth(msg) => EngineError::Auth(format!("block {block_no}: {msg}")),
            other => other,
        })
    }

    /// Encrypts a run of consecutive blocks starting at
    /// `first_block_no`, returning the concatenated ciphertext in block
    /// order. The returned buffer comes from the codec's pool; hand it
    /// back with [`ContentCodec::recycle_ciphertext`] when written out.
    pub fn encrypt_blocks(
        &self,
        blocks: &[&[u8]],
        first_block_no: u64,
        file_id: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let results = parallel::process(blocks.len(), |i| {
            self.encrypt_block(blocks[i], first_block_no + i as u64, file_id)
        });

        let mut out = self.ct_pool.get();
        for result in results {
            match result {
                Ok(ct) => out.extend_from_slice(&ct),
                Err(e) => {
                    self.ct_pool.put(out);
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Decrypts a run of consecutive ciphertext blocks. The lowest
    /// failing block number determines the reported error. The returned
    /// buffer comes from the codec's pool; hand it back with
    /// [`ContentCodec::recycle_plaintext`] once consumed.
    pub fn decrypt_blocks(
        &self,
        ciphertext: &[u8],
        first_block_no: u64,
        file_id: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let chunks: Vec<&[u8]> = ciphertext.chunks(self.cipher_bs).collect();
        let results = parallel::process(chunks.len(), |i| {
            self.decrypt_block(chunks[i], first_block_no + i as u64, file_id)
        });

        let mut out = self.pt_pool.get();
        for result in results {
            match result {
                Ok(pt) => out.extend_from_slice(&pt),
                Err(e) => {
                    self.pt_pool.put(out);
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    /// Returns a buffer obtained from [`ContentCodec::decrypt_blocks`].
    pub fn recycle_plaintext(&self, buf: Vec<u8>) {
        self.pt_pool.put(buf);
    }

    /// Returns a buffer obtained from [`ContentCodec::encrypt_blocks`].
    pub fn recycle_ciphertext(&self, buf: Vec<u8>) {
        self.ct_pool.put(buf);
    }
}

/// AAD = big-endian block number || file ID. The file ID must be empty
/// (config master key, symlink targets) or exactly 16 bytes.
fn build_aad(block_no: u64, file_id: &[u8]) -> EngineResult<Vec<u8>> {
    if !file_id.is_empty() && file_id.len() != FILE_ID_LEN {
        return Err(EngineError::format(format!(
            "wrong file ID length: {}",
            file_id.len()
        )));
    }
    let mut aad = Vec::with_capacity(8 + FILE_ID_LEN);
    aad.extend_from_slice(&block_no.to_be_bytes());
    aad.extend_from_slice(file_id);
    Ok(aad)
}
