//! Best-effort protection of key material in process memory.
//!
//! Pins key pages into physical memory, excludes them from core dumps,
//! disables core dumps process-wide and overwrites key buffers before
//! release. All of it is advisory: a platform without these facilities
//! changes the residual exposure window, not correctness.
//!
//! The host brackets the engine's lifetime with [`Hardening::init`] and
//! [`Hardening::teardown`].

use std::sync::Mutex;

use rand::{thread_rng, RngCore};
use tracing::debug;
use zeroize::Zeroize;

/// Tracks pinned key regions for teardown.
pub struct Hardening {
    locked: Mutex<Vec<(usize, usize)>>,
}

impl Hardening {
    /// Disables core dumps for the process and returns the tracking
    /// handle for key-page pinning.
    pub fn init() -> Self {
        disable_core_dumps();
        Hardening {
            locked: Mutex::new(Vec::new()),
        }
    }

    /// Pins the pages backing `data` and excludes them from dumps.
    pub fn lock_key(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if lock_region(data) {
            let mut locked = self.locked.lock().expect("hardening lock");
            locked.push((data.as_ptr() as usize, data.len()));
        }
    }

    /// Unpins a region previously passed to [`Hardening::lock_key`].
    pub fn unlock_key(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        unlock_region(data.as_ptr() as usize, data.len());
        let mut locked = self.locked.lock().expect("hardening lock");
        locked.retain(|&(addr, len)| addr != data.as_ptr() as usize || len != data.len());
    }

    /// Unpins everything still tracked. Called at unmount.
    pub fn teardown(&self) {
        let mut locked = self.locked.lock().expect("hardening lock");
        for (addr, len) in locked.drain(..) {
            unlock_region(addr, len);
        }
    }
}

impl Drop for Hardening {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Overwrites a key buffer with random bytes, then zeros.
pub fn wipe(buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    thread_rng().fill_bytes(buf);
    buf.zeroize();
}

#[cfg(unix)]
fn disable_core_dumps() {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit with a valid rlimit struct has no memory effects.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if rc != 0 {
        debug!("setrlimit(RLIMIT_CORE, 0) failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(unix)]
fn lock_region(data: &[u8]) -> bool {
    let ptr = data.as_ptr() as *const libc::c_void;
    let len = data.len();
    // SAFETY: ptr/len describe a live allocation owned by the caller.
    let rc = unsafe { libc::mlock(ptr, len) };
    if rc != 0 {
        debug!("mlock failed: {}", std::io::Error::last_os_error());
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        // SAFETY: same region; MADV_DONTDUMP only tags the mapping.
        let rc = unsafe { libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_DONTDUMP) };
        if rc != 0 {
            debug!("madvise(MADV_DONTDUMP) failed: {}", std::io::Error::last_os_error());
        }
    }
    true
}

#[cfg(unix)]
fn unlock_region(addr: usize, len: usize) {
    // SAFETY: the region was successfully mlocked earlier and is still
    // mapped; munlock does not touch its contents.
    let rc = unsafe { libc::munlock(addr as *const libc::c_void, len) };
    if rc != 0 {
        debug!("munlock failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn disable_core_dumps() {}

#[cfg(not(unix))]
fn lock_region(_data: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unlock_region(_addr: usize, _len: usize) {}
