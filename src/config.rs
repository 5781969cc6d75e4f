//! Compile-time configuration.
//!
//! Two sizing profiles exist. The default profile targets hosted systems;
//! enabling the `constrained` cargo feature selects the reduced profile used
//! on memory-limited targets.

/// Maximum total frame size (header plus payload) in bytes.
#[cfg(not(feature = "constrained"))]
pub const MAX_FRAME_SIZE: usize = 1024;
/// Maximum total frame size (header plus payload) in bytes.
#[cfg(feature = "constrained")]
pub const MAX_FRAME_SIZE: usize = 256;

/// Maximum ARQ window size. Never exceeds 32 (the pending masks are 32-bit).
#[cfg(not(feature = "constrained"))]
pub const MAX_WINDOW_SIZE: u8 = 16;
/// Maximum ARQ window size. Never exceeds 32 (the pending masks are 32-bit).
#[cfg(feature = "constrained")]
pub const MAX_WINDOW_SIZE: u8 = 4;

/// Default byte ring buffer size. Usable capacity is one byte less.
#[cfg(not(feature = "constrained"))]
pub const RINGBUF_SIZE: usize = 2048;
/// Default byte ring buffer size. Usable capacity is one byte less.
#[cfg(feature = "constrained")]
pub const RINGBUF_SIZE: usize = 512;

/// Default retransmission timeout for the reliable engine, in milliseconds.
pub const DEFAULT_RTO_MS: u32 = 1000;

/// Timed-acquire bound for the shared-memory per-endpoint locks.
pub const SHM_LOCK_TIMEOUT_MS: u64 = 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_fits_pending_mask() {
        assert!(MAX_WINDOW_SIZE as usize <= 32);
        assert!(MAX_FRAME_SIZE >= 64);
    }
}
