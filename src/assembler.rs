use std::mem;

use crate::param::{Blob, ParameterDescriptor};

const KILOBYTE: u64 = 1024;
const MEGABYTE: u64 = 1024 * KILOBYTE;
/// Declared sizes come from the client; never reserve more than this
/// up front.
const MAX_PREALLOCATION: u64 = 64 * MEGABYTE;

#[derive(Debug, PartialEq, Eq)]
pub enum AssemblerStatus {
    Incomplete,
    Completed(Blob),
    Overflow,
}

/// Accumulates the chunks of one declared parameter.
///
/// The transport delivers frames in order and reliably, so a short chunk is
/// simply appended; there is no reordering or resend logic.
#[derive(Debug)]
pub struct ChunkAssembler {
    type_tag: String,
    name: String,
    declared_size: u64,
    buffer: Vec<u8>,
    completed: bool,
}

impl ChunkAssembler {
    pub fn new(param: &ParameterDescriptor) -> Self {
        let capacity = param.size.min(MAX_PREALLOCATION) as usize;
        Self {
            type_tag: param.type_tag.clone(),
            name: param.display_name().to_owned(),
            declared_size: param.size,
            buffer: Vec::with_capacity(capacity),
            completed: false,
        }
    }

    /// Append a chunk; yields the blob exactly once, when the declared size
    /// is reached.
    ///
    /// A chunk that would exceed the declared size, or any chunk after
    /// completion, is an `Overflow` and leaves the buffer untouched.
    pub fn append_chunk(&mut self, bytes: &[u8]) -> AssemblerStatus {
        if self.completed {
            return AssemblerStatus::Overflow;
        }

        let accumulated = self.buffer.len() as u64;
        if accumulated + bytes.len() as u64 > self.declared_size {
            log::debug!(
                "assembler/{}: {} + {} bytes exceed declared {}",
                self.name,
                accumulated,
                bytes.len(),
                self.declared_size
            );
            return AssemblerStatus::Overflow;
        }

        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() as u64 == self.declared_size {
            self.completed = true;
            log::trace!(
                "assembler/{}: all {} bytes received",
                self.name,
                self.declared_size
            );
            return AssemblerStatus::Completed(Blob {
                type_tag: self.type_tag.clone(),
                name: self.name.clone(),
                bytes: mem::take(&mut self.buffer),
            });
        }
        AssemblerStatus::Incomplete
    }

    pub fn accumulated(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_exactly_once() {
        let mut assembler =
            ChunkAssembler::new(&ParameterDescriptor::new(12, "xyz"));
        for chunk in [&b"0 0 "[..], &b"0\n1 "[..]] {
            assert_eq!(
                assembler.append_chunk(chunk),
                AssemblerStatus::Incomplete
            );
        }
        assert_eq!(assembler.accumulated(), 8);

        match assembler.append_chunk(b"1 1\n") {
            AssemblerStatus::Completed(blob) => {
                assert_eq!(blob.type_tag, "xyz");
                assert_eq!(blob.bytes, b"0 0 0\n1 1 1\n".to_vec());
            }
            other => panic!("unexpected status {:?}", other),
        }
        assert!(assembler.is_completed());
        assert_eq!(assembler.accumulated(), 0);
        assert_eq!(assembler.append_chunk(b""), AssemblerStatus::Overflow);
    }

    #[test]
    fn oversized_chunk_is_overflow() {
        let mut assembler =
            ChunkAssembler::new(&ParameterDescriptor::new(4, "xyz"));
        assert_eq!(
            assembler.append_chunk(b"not_four_bytes"),
            AssemblerStatus::Overflow
        );
        assert_eq!(assembler.accumulated(), 0);
    }

    #[test]
    fn empty_chunk_is_incomplete() {
        let mut assembler =
            ChunkAssembler::new(&ParameterDescriptor::new(4, "xyz").named("a"));
        assert_eq!(assembler.append_chunk(&[]), AssemblerStatus::Incomplete);
        assert_eq!(assembler.declared_size(), 4);
    }
}
