//! Runtime CPU feature probe for backend auto-selection.

/// True when the CPU offers accelerated AES instructions, in which case
/// AES-GCM outperforms XChaCha20-Poly1305.
pub fn accelerated_aes() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("aes")
    }
    #[cfg(target_arch = "aarch64")]
    {
        std::arch::is_aarch64_feature_detected!("aes")
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        false
    }
}
