//! # Rotating Stamp Keys
//!
//! A 30-second time step over the shared initiation token yields the key
//! used to stamp requests. The key for a step is the keyed Blake2b of the
//! big-endian step counter under the token, truncated to 64 bits.
//! Verification accepts the previous, current, and next step so moderate
//! clock skew between peers does not reject honest traffic.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::hashing;

/// Width of one time step in seconds.
pub const STEP_SECS: u64 = 30;

/// Bytes of derived key material per step.
pub const KEY_LEN: usize = 8;

/// Derives rotating 64-bit keys from a shared 32-byte initiation token.
#[derive(Clone)]
pub struct Totp {
    token: [u8; 32],
}

impl Totp {
    pub fn new(token: [u8; 32]) -> Self {
        Self { token }
    }

    /// Key for the step containing the current wall-clock instant.
    pub fn current_key(&self) -> [u8; KEY_LEN] {
        self.key_for_step(Self::step_at(now_unix_secs()))
    }

    /// Keys for the previous, current, and next steps, in that order.
    pub fn window_keys(&self) -> [[u8; KEY_LEN]; 3] {
        let step = Self::step_at(now_unix_secs());
        [
            self.key_for_step(step.saturating_sub(1)),
            self.key_for_step(step),
            self.key_for_step(step + 1),
        ]
    }

    pub(crate) fn key_at(&self, unix_secs: u64) -> [u8; KEY_LEN] {
        self.key_for_step(Self::step_at(unix_secs))
    }

    fn key_for_step(&self, step: u64) -> [u8; KEY_LEN] {
        let digest = hashing::blake2b_keyed(&self.token, &step.to_be_bytes());
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest.as_bytes()[..KEY_LEN]);
        key
    }

    fn step_at(unix_secs: u64) -> u64 {
        unix_secs / STEP_SECS
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
