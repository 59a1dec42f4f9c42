//! Command buffers that carry a change_hat magic token.
//!
//! The buffer is sized exactly once up front so it never reallocates (a
//! reallocation would leave a copy of the token in freed memory), the token
//! is hex encoded in place without an intermediate `String`, and the bytes
//! are zeroed both on [`SecretBuffer::scrub`] and on drop.

use crate::config::types::{ArmorError, Result};
use zeroize::{Zeroize, Zeroizing};

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Fixed-capacity byte buffer that is zeroed before release
pub struct SecretBuffer {
    bytes: Zeroizing<Vec<u8>>,
}

impl SecretBuffer {
    /// Allocate room for exactly `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity)?;
        Ok(Self {
            bytes: Zeroizing::new(bytes),
        })
    }

    fn ensure_room(&self, extra: usize) -> Result<()> {
        if self.bytes.len() + extra > self.bytes.capacity() {
            return Err(ArmorError::InvalidArgument(
                "secret buffer capacity exceeded".to_string(),
            ));
        }
        Ok(())
    }

    /// Append bytes; refuses to grow past the reserved capacity.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_room(data.len())?;
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    pub fn push(&mut self, byte: u8) -> Result<()> {
        self.ensure_room(1)?;
        self.bytes.push(byte);
        Ok(())
    }

    /// Append `value` as 16 zero padded lowercase hex digits.
    pub fn push_hex_u64(&mut self, value: u64) -> Result<()> {
        self.ensure_room(16)?;
        for shift in (0..16).rev() {
            let nibble = ((value >> (shift * 4)) & 0xf) as usize;
            self.bytes.push(HEX_DIGITS[nibble]);
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Zero every byte in place, keeping the length.
    pub fn scrub(&mut self) {
        self.bytes.as_mut_slice().zeroize();
    }

    /// True once every byte is zero.
    pub fn is_scrubbed(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        #[cfg(test)]
        let was_scrubbed = self.is_scrubbed();
        self.scrub();
        #[cfg(test)]
        release_log::record(release_log::Release {
            len: self.bytes.len(),
            was_scrubbed,
            zeroed: self.is_scrubbed(),
        });
    }
}

/// Per-thread record of released buffers, for asserting scrubbing in tests.
#[cfg(test)]
pub(crate) mod release_log {
    use std::cell::RefCell;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Release {
        pub len: usize,
        /// Already zeroed by `scrub` before the drop
        pub was_scrubbed: bool,
        /// Zeroed once the drop finished
        pub zeroed: bool,
    }

    thread_local! {
        static RELEASED: RefCell<Vec<Release>> = RefCell::new(Vec::new());
    }

    pub(crate) fn record(release: Release) {
        RELEASED.with(|log| log.borrow_mut().push(release));
    }

    /// Drain everything released on this thread so far.
    pub(crate) fn take() -> Vec<Release> {
        RELEASED.with(|log| std::mem::take(&mut *log.borrow_mut()))
    }
}

impl std::fmt::Debug for SecretBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBuffer")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}
