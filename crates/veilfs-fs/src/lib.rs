//! veilfs-fs: the encrypted overlay filesystem engine.
//!
//! A plaintext directory tree is mirrored one-to-one onto a ciphertext
//! tree in the gocryptfs on-disk layout: a password-protected config
//! envelope (`gocryptfs.conf`), a 16-byte IV per directory
//! (`gocryptfs.diriv`), data files made of independently authenticated
//! blocks behind an 18-byte header, and hashed-stub spillover for
//! encoded names that exceed the backing store's component limit.
//!
//! The kernel bridge, CLI and control socket live in host crates; the
//! engine exposes [`Volume`] plus the pure path hooks
//! [`Volume::encrypt_path`] / [`Volume::decrypt_path`].

pub mod configfile;
pub mod diriv;
pub mod file;
pub mod longname;
pub mod names;
pub mod range;
pub mod resolver;
pub mod volume;

pub use configfile::ConfigEnvelope;
pub use file::FileHandle;
pub use names::NameTransform;
pub use resolver::PathResolver;
pub use volume::{CheckIssue, Volume, VolumeOptions};
