//! Bezpieczne zeroizowanie pamięci

use rand::RngCore;
use zeroize::Zeroize;

/// Wzorce kolejnych przebiegów nadpisywania
const OVERWRITE_PATTERNS: [Option<u8>; 3] = [Some(0x00), Some(0xFF), None];

/// Wypełnia bufor wzorcem przebiegu `pass`
pub fn fill_pass(buffer: &mut [u8], pass: u32) {
    match OVERWRITE_PATTERNS[pass as usize % OVERWRITE_PATTERNS.len()] {
        Some(byte) => buffer.fill(byte),
        None => rand::thread_rng().fill_bytes(buffer),
    }
}

/// Nadpisuje bufor `passes` razy (zera, jedynki, losowe), na końcu zeroizuje
pub fn overwrite_passes(buffer: &mut [u8], passes: u32) {
    for pass in 0..passes {
        fill_pass(buffer, pass);
        // keep the writes from being elided between passes
        let _ = std::hint::black_box(&mut *buffer);
    }
    buffer.zeroize();
}

/// Bufor z automatycznym zeroizowaniem przy drop
pub struct SecureBuffer {
    data: Vec<u8>,
}

impl SecureBuffer {
    pub fn from_slice(slice: &[u8]) -> Self {
        Self {
            data: slice.to_vec(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureBuffer([REDACTED; {}])", self.data.len())
    }
}

impl std::ops::Deref for SecureBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
