// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Reference-counted sample memory and chunk views into it.

use crate::sample::SampleSpec;
use std::sync::Arc;

/// Largest block the engine allocates for one render pass.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// A block of sample memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemBlock {
    data: Vec<u8>,
    silence: bool,
}

impl MemBlock {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            silence: false,
        }
    }

    /// A block filled with the silence pattern of `spec`, marked as silence.
    pub fn silence(spec: &SampleSpec, length: usize) -> Self {
        Self {
            data: vec![spec.format.silence_byte(); length],
            silence: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_silence(&self) -> bool {
        self.silence
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// A view of `length` bytes starting at `index` in a shared block.
#[derive(Debug, Clone)]
pub struct MemChunk {
    pub block: Arc<MemBlock>,
    pub index: usize,
    pub length: usize,
}

impl MemChunk {
    pub fn new(block: Arc<MemBlock>) -> Self {
        let length = block.len();
        Self {
            block,
            index: 0,
            length,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::new(Arc::new(MemBlock::new(data)))
    }

    pub fn silence(spec: &SampleSpec, length: usize) -> Self {
        Self::new(Arc::new(MemBlock::silence(spec, length)))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.block.data[self.index..self.index + self.length]
    }

    pub fn is_silence(&self) -> bool {
        self.block.silence
    }

    /// A view of the same block starting `offset` bytes later.
    pub fn slice(&self, offset: usize, length: usize) -> MemChunk {
        debug_assert!(offset + length <= self.length);
        MemChunk {
            block: Arc::clone(&self.block),
            index: self.index + offset,
            length,
        }
    }

    pub fn truncate(&mut self, length: usize) {
        self.length = self.length.min(length);
    }

    /// Gives exclusive access to the chunk's bytes, copying them into a
    /// fresh block if the current block is shared.
    pub fn make_writable(&mut self) -> &mut [u8] {
        if Arc::get_mut(&mut self.block).is_none() {
            let data = self.bytes().to_vec();
            self.block = Arc::new(MemBlock::new(data));
            self.index = 0;
        }

        let block = Arc::make_mut(&mut self.block);
        block.silence = false;
        &mut block.data[self.index..self.index + self.length]
    }

    /// Number of strong references to the underlying block.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.block)
    }

    pub fn shares_block_with(&self, other: &MemChunk) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::SampleFormat;

    #[test]
    fn test_silence_pattern() {
        let u8_spec = SampleSpec::new(SampleFormat::U8, 8000, 1);
        let chunk = MemChunk::silence(&u8_spec, 16);
        assert!(chunk.is_silence());
        assert!(chunk.bytes().iter().all(|b| *b == 0x80));
    }

    #[test]
    fn test_make_writable_copies_shared_block() {
        let original = MemChunk::from_vec(vec![1, 2, 3, 4, 5, 6]);
        let mut view = original.slice(2, 3);
        assert_eq!(original.ref_count(), 2);

        view.make_writable()[0] = 42;

        assert!(!view.shares_block_with(&original));
        assert_eq!(view.bytes(), &[42, 4, 5]);
        assert_eq!(original.bytes(), &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_make_writable_in_place_when_unique() {
        let mut chunk = MemChunk::from_vec(vec![0; 8]);
        let before = Arc::as_ptr(&chunk.block);
        chunk.make_writable()[1] = 9;
        assert_eq!(Arc::as_ptr(&chunk.block), before);
        assert_eq!(chunk.bytes()[1], 9);
    }
}
