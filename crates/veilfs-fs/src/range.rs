//! Block-range arithmetic.
//!
//! A plaintext file is split into fixed-size blocks; each becomes a
//! ciphertext segment of `plain_bs + overhead` bytes. The mapping is
//! bijective: a ciphertext offset uniquely identifies its block number.
//!
//! ```text
//! plaintext:   [block 0       ][block 1       ][tail...]
//! ciphertext:  [18-byte header][nonce|ct|tag  ][nonce|ct|tag  ][nonce|ct'|tag]
//! ```

use veilfs_core::{EngineError, EngineResult, HEADER_LEN};

/// Offset and size conversions between the plaintext view and the
/// ciphertext file.
#[derive(Debug, Clone, Copy)]
pub struct BlockMath {
    plain_bs: u64,
    overhead: u64,
}

impl BlockMath {
    pub fn new(plain_bs: usize, overhead: usize) -> Self {
        BlockMath {
            plain_bs: plain_bs as u64,
            overhead: overhead as u64,
        }
    }

    pub fn plain_bs(&self) -> u64 {
        self.plain_bs
    }

    pub fn cipher_bs(&self) -> u64 {
        self.plain_bs + self.overhead
    }

    /// Block containing the plaintext offset.
    pub fn block_no(&self, plain_off: u64) -> u64 {
        plain_off / self.plain_bs
    }

    /// Offset within its block.
    pub fn block_off(&self, plain_off: u64) -> usize {
        (plain_off % self.plain_bs) as usize
    }

    /// First and last (inclusive) block numbers covering
    /// `[plain_off, plain_off + len)`. None for an empty range.
    pub fn covering(&self, plain_off: u64, len: u64) -> Option<(u64, u64)> {
        if len == 0 {
            return None;
        }
        Some((self.block_no(plain_off), self.block_no(plain_off + len - 1)))
    }

    /// Ciphertext file offset of a block.
    pub fn cipher_offset(&self, block_no: u64) -> u64 {
        HEADER_LEN as u64 + block_no * self.cipher_bs()
    }

    /// Plaintext offset where a block begins.
    pub fn plain_offset(&self, block_no: u64) -> u64 {
        block_no * self.plain_bs
    }

    /// Number of blocks a plaintext of `plain_len` bytes occupies.
    pub fn block_count(&self, plain_len: u64) -> u64 {
        plain_len.div_ceil(self.plain_bs)
    }

    /// Ciphertext file length for a plaintext length. Zero-length files
    /// carry no header.
    pub fn cipher_size(&self, plain_len: u64) -> u64 {
        if plain_len == 0 {
            return 0;
        }
        let full = plain_len / self.plain_bs;
        let tail = plain_len % self.plain_bs;
        let mut size = HEADER_LEN as u64 + full * self.cipher_bs();
        if tail > 0 {
            size += tail + self.overhead;
        }
        size
    }

    /// Plaintext length for a ciphertext file length. A trailing
    /// fragment no longer than the per-block overhead cannot have been
    /// produced by the encrypt path.
    pub fn plain_size(&self, cipher_len: u64) -> EngineResult<u64> {
        if cipher_len == 0 {
            return Ok(0);
        }
        if cipher_len < HEADER_LEN as u64 {
            return Err(EngineError::format(format!(
                "ciphertext of {cipher_len} bytes is shorter than the header"
            )));
        }
        let body = cipher_len - HEADER_LEN as u64;
        let full = body / self.cipher_bs();
        let tail = body % self.cipher_bs();
        if tail == 0 {
            return Ok(full * self.plain_bs);
        }
        if tail <= self.overhead {
            return Err(EngineError::format(format!(
                "trailing ciphertext fragment of {tail} bytes is not a valid block"
            )));
        }
        Ok(full * self.plain_bs + tail - self.overhead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 4096-byte blocks with XChaCha overhead (24 + 16).
    fn math() -> BlockMath {
        BlockMath::new(4096, 40)
    }

    #[test]
    fn test_block_no_and_offset() {
        let m = math();
        assert_eq!(m.block_no(0), 0);
        assert_eq!(m.block_no(4095), 0);
        assert_eq!(m.block_no(4096), 1);
        assert_eq!(m.block_off(4097), 1);
        assert_eq!(m.block_off(500_003), 500_003 % 4096);
    }

    #[test]
    fn test_covering_range() {
        let m = math();
        assert_eq!(m.covering(0, 0), None);
        assert_eq!(m.covering(0, 1), Some((0, 0)));
        assert_eq!(m.covering(0, 4096), Some((0, 0)));
        assert_eq!(m.covering(0, 4097), Some((0, 1)));
        assert_eq!(m.covering(4000, 200), Some((0, 1)));
        assert_eq!(m.covering(8192, 8192), Some((2, 3)));
    }

    #[test]
    fn test_cipher_offset_is_bijective() {
        let m = math();
        assert_eq!(m.cipher_offset(0), 18);
        assert_eq!(m.cipher_offset(1), 18 + 4136);
        assert_eq!(m.cipher_offset(2), 18 + 2 * 4136);
    }

    #[test]
    fn test_size_roundtrip() {
        let m = math();
        for plain_len in [0u64, 1, 100, 4095, 4096, 4097, 8192, 1_000_000] {
            let cipher = m.cipher_size(plain_len);
            assert_eq!(m.plain_size(cipher).unwrap(), plain_len, "len={plain_len}");
        }
    }

    #[test]
    fn test_empty_file_has_no_header() {
        assert_eq!(math().cipher_size(0), 0);
        assert_eq!(math().plain_size(0).unwrap(), 0);
    }

    #[test]
    fn test_invalid_cipher_sizes() {
        let m = math();
        // Shorter than the header.
        assert!(m.plain_size(17).is_err());
        // Header plus a fragment that cannot hold nonce + tag.
        assert!(m.plain_size(18 + 40).is_err());
        assert!(m.plain_size(18 + 1).is_err());
        // Header alone is a zero-block file; the encrypt path never
        // produces it, but it decodes to zero bytes.
        assert_eq!(m.plain_size(18).unwrap(), 0);
    }

    #[test]
    fn test_block_count() {
        let m = math();
        assert_eq!(m.block_count(0), 0);
        assert_eq!(m.block_count(1), 1);
        assert_eq!(m.block_count(4096), 1);
        assert_eq!(m.block_count(4097), 2);
    }
}
