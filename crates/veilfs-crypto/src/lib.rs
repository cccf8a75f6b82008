//! veilfs-crypto: the cryptographic engine behind veilfs.
//!
//! Key hierarchy:
//! ```text
//! Password ──scrypt / Argon2id──▶ Wrap Key (256-bit)
//!                                   │ AEAD-unwraps the master key
//! Master Key (256-bit, random)      ▼
//!   ├── Content Key   HKDF "veilfs content encryption"
//!   ├── Name Key      HKDF "veilfs filename encryption"
//!   └── Name MAC Key  HKDF "veilfs filename authentication"
//! ```
//!
//! Content blocks are sealed as `[nonce][ciphertext][16-byte tag]` with
//! AAD = `block_number (8 bytes, big-endian) || file_id`, binding every
//! block to its position and owning file.

pub mod backend;
pub mod content;
pub mod cpu;
pub mod hardening;
pub mod kdf;
pub mod keys;
pub mod parallel;
pub mod pool;

pub use backend::{AeadBackend, AeadKind};
pub use content::ContentCodec;
pub use kdf::{Argon2idKdf, PasswordKdf, ScryptKdf};
pub use keys::{MasterKey, PurposeKey};

/// Poly1305 and GCM tags are both 16 bytes; SIV's synthetic IV doubles
/// as a 16-byte tag. Uniform across backends.
pub const TAG_LEN: usize = 16;

pub use veilfs_core::KEY_LEN;
