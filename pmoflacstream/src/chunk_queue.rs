//! FIFO of pending input chunks.
//!
//! The queue keeps a running byte total so the fill level is known without
//! walking the chunks. Consumption happens from the front and may split the
//! front chunk; `Bytes::split_to` keeps that split zero-copy.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Result of [`ChunkQueue::drain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drained {
    pub bytes: Bytes,
    /// Number of bytes actually returned. Lower than the request only when
    /// the queue held fewer bytes.
    pub available: usize,
}

#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Bytes>,
    total: usize,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk to the tail. Empty chunks are ignored.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Returns true iff fewer than `threshold` bytes are queued.
    pub fn is_below(&self, threshold: usize) -> bool {
        self.total < threshold
    }

    /// Removes up to `n` bytes from the front.
    pub fn drain(&mut self, n: usize) -> Drained {
        let wanted = n.min(self.total);
        if wanted == 0 {
            return Drained {
                bytes: Bytes::new(),
                available: 0,
            };
        }

        // Fast path: the front chunk covers the whole request.
        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= wanted {
                let bytes = if front.len() == wanted {
                    self.chunks.pop_front().unwrap_or_default()
                } else {
                    front.split_to(wanted)
                };
                self.total -= wanted;
                return Drained {
                    bytes,
                    available: wanted,
                };
            }
        }

        let mut out = BytesMut::with_capacity(wanted);
        while out.len() < wanted {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let missing = wanted - out.len();
            if front.len() <= missing {
                out.extend_from_slice(front);
                self.chunks.pop_front();
            } else {
                out.extend_from_slice(&front.split_to(missing));
            }
        }
        self.total -= out.len();
        let available = out.len();
        Drained {
            bytes: out.freeze(),
            available,
        }
    }

    /// Drops every queued chunk.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total = 0;
    }
}
