//! Chunking and per-buffer progress tracking.

use super::Dialect;
use crate::protocol::constants::SEQUENCE_WRAP;

/// Sequential fixed-size slices of a buffer; the last one may be shorter.
pub struct Chunks<'a> {
    data: &'a [u8],
    chunk_size: usize,
    offset: usize,
    index: usize,
}

impl<'a> Chunks<'a> {
    pub fn new(data: &'a [u8], chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
            offset: 0,
            index: 0,
        }
    }

    /// Number of chunks including a trailing partial one.
    pub fn total(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }
}

impl<'a> Iterator for Chunks<'a> {
    /// Chunk index and payload.
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let len = (self.data.len() - self.offset).min(self.chunk_size);
        let chunk = &self.data[self.offset..self.offset + len];
        let index = self.index;
        self.offset += len;
        self.index += 1;
        Some((index, chunk))
    }
}

/// `wValue` for a chunk: its index modulo the sequence space.
pub fn sequence_number(index: usize) -> u16 {
    (index % SEQUENCE_WRAP) as u16
}

/// State of one buffer transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuSession {
    pub dialect: Dialect,
    pub total_size: u64,
    /// Sum of the lengths of every chunk the device accepted.
    pub bytes_sent: u64,
    pub chunk_size: usize,
    pub chunks_sent: usize,
    pub notify: bool,
    /// End-of-image request delivered.
    pub finalized: bool,
}

impl DfuSession {
    pub fn new(dialect: Dialect, total_size: usize, notify: bool) -> Self {
        Self {
            dialect,
            total_size: total_size as u64,
            bytes_sent: 0,
            chunk_size: dialect.chunk_size(),
            chunks_sent: 0,
            notify,
            finalized: false,
        }
    }

    pub fn total_chunks(&self) -> usize {
        (self.total_size as usize).div_ceil(self.chunk_size)
    }

    pub(crate) fn record_chunk(&mut self, length: usize) {
        self.bytes_sent += length as u64;
        self.chunks_sent += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_sent == self.total_size
    }

    /// Progress as percentage.
    pub fn progress_pct(&self) -> u8 {
        if self.total_size == 0 {
            100
        } else {
            ((self.bytes_sent * 100) / self.total_size) as u8
        }
    }
}
