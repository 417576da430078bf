// Copyright 2024 The matrix-e2ee Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-size, zero-on-release buffers for long-lived key material.

use std::{
    fmt,
    sync::{Mutex, OnceLock},
};

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Size of the process-wide budget for secure buffers.
pub const TOTAL_SECURE_HEAP_SIZE: usize = 65_536;

#[derive(Debug, Error)]
pub enum SecureBufferError {
    #[error("the secure heap is exhausted, {requested} bytes requested, {available} available")]
    Exhausted { requested: usize, available: usize },

    #[error("a secure buffer of {expected} bytes can't be filled from {got} bytes")]
    WrongLength { expected: usize, got: usize },
}

/// Process-wide accounting for secure buffer space.
///
/// There is exactly one secure heap per process, lazily initialised on the
/// first allocation. Buffers return their space on drop; [`SecureHeap::teardown`]
/// reports anything still outstanding.
#[derive(Debug)]
pub struct SecureHeap {
    used: Mutex<usize>,
}

static SECURE_HEAP: OnceLock<SecureHeap> = OnceLock::new();

impl SecureHeap {
    pub fn get() -> &'static SecureHeap {
        SECURE_HEAP.get_or_init(|| {
            debug!(bytes = TOTAL_SECURE_HEAP_SIZE, "Initialised the secure heap");
            SecureHeap { used: Mutex::new(0) }
        })
    }

    fn reserve(&self, bytes: usize) -> Result<(), SecureBufferError> {
        let mut used = self.used.lock().expect("the secure heap lock is never poisoned");

        if *used + bytes > TOTAL_SECURE_HEAP_SIZE {
            Err(SecureBufferError::Exhausted {
                requested: bytes,
                available: TOTAL_SECURE_HEAP_SIZE - *used,
            })
        } else {
            *used += bytes;
            debug!(bytes, total_used = *used, "Reserved secure heap space");
            Ok(())
        }
    }

    fn release(&self, bytes: usize) {
        let mut used = self.used.lock().expect("the secure heap lock is never poisoned");
        *used = used.saturating_sub(bytes);
    }

    /// The number of bytes currently reserved.
    pub fn used(&self) -> usize {
        *self.used.lock().expect("the secure heap lock is never poisoned")
    }

    /// Teardown hook, to be called when the process is done with all crypto
    /// state. Logs space that was never returned.
    pub fn teardown(&self) {
        let used = self.used();

        if used != 0 {
            warn!(bytes = used, "Tearing down the secure heap with space still in use");
        } else {
            debug!("Dismantled the secure heap");
        }
    }
}

/// Fill the buffer from the OS entropy source.
///
/// The bulk of the buffer is filled word by word, the remainder byte-wise.
/// There is no pseudo-random fallback; `OsRng` aborts rather than degrade.
pub fn fill_from_secure_rng(bytes: &mut [u8]) {
    let mut chunks = bytes.chunks_exact_mut(4);

    for chunk in &mut chunks {
        chunk.copy_from_slice(&OsRng.next_u32().to_ne_bytes());
    }

    let remainder = chunks.into_remainder();

    if !remainder.is_empty() {
        let word = OsRng.next_u32().to_ne_bytes();
        remainder.copy_from_slice(&word[..remainder.len()]);
    }
}

/// An owning byte buffer that is zeroed before its memory is returned.
///
/// The buffer can't be copied or cloned; moving one only exchanges the
/// pointer to the backing allocation. Space is accounted against the
/// process-wide [`SecureHeap`]; when the budget is exhausted a regular
/// buffer degrades to the ordinary heap with a warning, while buffers
/// allocated with [`FixedBuffer::sensitive`] refuse to.
pub struct FixedBuffer {
    data: Box<[u8]>,
    reserved: bool,
}

impl FixedBuffer {
    fn alloc(len: usize, must_be_secure: bool) -> Result<Self, SecureBufferError> {
        let reserved = match SecureHeap::get().reserve(len) {
            Ok(()) => true,
            Err(e) if must_be_secure => return Err(e),
            Err(e) => {
                warn!(
                    error = %e,
                    "Secure heap exhausted, the buffer will live on the ordinary heap"
                );
                false
            }
        };

        Ok(Self { data: vec![0; len].into_boxed_slice(), reserved })
    }

    /// Allocate a zero-filled buffer, degrading to the ordinary heap if the
    /// secure budget is exhausted.
    pub fn zeroed(len: usize) -> Self {
        Self::alloc(len, false).expect("a degradable allocation never fails")
    }

    /// Allocate a buffer filled from the OS entropy source.
    pub fn random(len: usize) -> Self {
        let mut buffer = Self::zeroed(len);
        fill_from_secure_rng(&mut buffer.data);
        buffer
    }

    /// Allocate a randomly filled buffer that refuses to fall back to the
    /// ordinary heap.
    pub fn sensitive(len: usize) -> Result<Self, SecureBufferError> {
        let mut buffer = Self::alloc(len, true)?;
        fill_from_secure_rng(&mut buffer.data);
        Ok(buffer)
    }

    /// Move the given bytes into a secure buffer, zeroing the source.
    pub fn from_vec(mut source: Vec<u8>) -> Result<Self, SecureBufferError> {
        let mut buffer = Self::alloc(source.len(), true)?;
        buffer.data.copy_from_slice(&source);
        source.zeroize();
        Ok(buffer)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for FixedBuffer {
    fn drop(&mut self) {
        self.data.zeroize();

        if self.reserved {
            SecureHeap::get().release(self.data.len());
        }
    }
}

impl fmt::Debug for FixedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedBuffer").field("len", &self.data.len()).finish_non_exhaustive()
    }
}

/// The 128-byte secret every pickle and encrypted blob is protected with.
///
/// Generated once per device and stored in the OS credential store, never in
/// an ordinary file. The key always lives in secure memory and refuses to
/// degrade to the ordinary heap.
pub struct PicklingKey {
    buffer: FixedBuffer,
}

impl PicklingKey {
    pub const LENGTH: usize = 128;

    /// Generate a fresh pickling key from the OS entropy source.
    pub fn generate() -> Result<Self, SecureBufferError> {
        Ok(Self { buffer: FixedBuffer::sensitive(Self::LENGTH)? })
    }

    /// Restore a pickling key from the bytes held in the credential store.
    ///
    /// The source is zeroed after the copy.
    pub fn from_bytes(source: Vec<u8>) -> Result<Self, SecureBufferError> {
        if source.len() != Self::LENGTH {
            let mut source = source;
            let got = source.len();
            source.zeroize();
            return Err(SecureBufferError::WrongLength { expected: Self::LENGTH, got });
        }

        Ok(Self { buffer: FixedBuffer::from_vec(source)? })
    }

    /// The 32-byte prefix under which pickles and blobs are encrypted.
    pub fn pickle_key(&self) -> &[u8; 32] {
        self.buffer.as_bytes()[..32].try_into().expect("the pickling key is 128 bytes long")
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_bytes()
    }
}

impl fmt::Debug for PicklingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PicklingKey").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{
        fill_from_secure_rng, FixedBuffer, PicklingKey, SecureBufferError, SecureHeap,
        TOTAL_SECURE_HEAP_SIZE,
    };

    #[test]
    fn buffers_return_their_space() {
        // Other tests share the process-wide heap, so only deltas of this
        // buffer's size are meaningful.
        const SIZE: usize = 40_000;

        let heap = SecureHeap::get();
        let before = heap.used();

        let buffer = FixedBuffer::random(SIZE);
        assert_eq!(buffer.len(), SIZE);

        let with_buffer = heap.used();
        assert!(with_buffer >= before + SIZE);

        drop(buffer);
        assert!(heap.used() <= with_buffer - SIZE);
    }

    #[test]
    fn sensitive_allocations_refuse_to_degrade() {
        let result = FixedBuffer::sensitive(TOTAL_SECURE_HEAP_SIZE + 1);
        assert_matches!(result, Err(SecureBufferError::Exhausted { .. }));

        // A degradable buffer of the same size succeeds.
        let buffer = FixedBuffer::zeroed(TOTAL_SECURE_HEAP_SIZE + 1);
        assert_eq!(buffer.len(), TOTAL_SECURE_HEAP_SIZE + 1);
    }

    #[test]
    fn random_fill_covers_the_whole_buffer() {
        // With 33 bytes the word-aligned path leaves a one-byte tail; the
        // chance of any 8 consecutive bytes staying zero is negligible.
        let mut bytes = [0u8; 33];
        fill_from_secure_rng(&mut bytes);
        assert!(bytes.chunks(8).all(|chunk| chunk.iter().any(|b| *b != 0)));
    }

    #[test]
    fn pickling_key_round_trip() {
        let key = PicklingKey::generate().unwrap();
        assert_eq!(key.as_bytes().len(), PicklingKey::LENGTH);

        let copy = key.as_bytes().to_vec();
        let restored = PicklingKey::from_bytes(copy).unwrap();

        assert_eq!(restored.as_bytes(), key.as_bytes());
        assert_eq!(restored.pickle_key(), &key.as_bytes()[..32]);
    }

    #[test]
    fn pickling_key_rejects_wrong_length() {
        let result = PicklingKey::from_bytes(vec![0; 16]);
        assert_matches!(
            result,
            Err(SecureBufferError::WrongLength { expected: PicklingKey::LENGTH, got: 16 })
        );
    }
}
