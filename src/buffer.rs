//! Tagged buffer chains.
//!
//! A `BufferChain` is an ordered sequence of byte segments carrying a small
//! set of message-level tags. Appending a segment never copies; splitting at
//! a packet boundary and making a chain contiguous are the only operations
//! that may allocate. Tags travel with the logical message: they survive
//! append, prepend and split on both halves.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// Message-level tags carried by a chain.
pub mod tags {
    /// The response to this request must be collected in full before
    /// emitting it upward.
    pub const COLLECT_RESULT: u8 = 1;
    /// Session-state should be tracked from the OK packet of the response.
    pub const TRACK_STATE: u8 = 1 << 1;
    /// The response to this request must not reach the client.
    pub const IGNORABLE: u8 = 1 << 2;
    /// The chain holds one complete, collected result.
    pub const RESULT: u8 = 1 << 3;
    /// The chain is known to consist of a single segment.
    pub const CONTIGUOUS: u8 = 1 << 4;
}

/// An append-only chain of byte segments with a tag bitset.
#[derive(Debug, Clone, Default)]
pub struct BufferChain {
    segments: VecDeque<Bytes>,
    tags: u8,
}

impl BufferChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let mut segments = VecDeque::with_capacity(1);
        if !data.is_empty() {
            segments.push_back(data);
        }
        Self { segments, tags: 0 }
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.is_empty())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn tags(&self) -> u8 {
        self.tags
    }

    pub fn set_tag(&mut self, tag: u8) {
        self.tags |= tag;
    }

    pub fn clear_tag(&mut self, tag: u8) {
        self.tags &= !tag;
    }

    pub fn has_tag(&self, tag: u8) -> bool {
        self.tags & tag != 0
    }

    /// Append another chain. The result carries the union of both tag sets.
    pub fn append(&mut self, mut other: BufferChain) {
        self.tags |= other.tags;
        self.segments.append(&mut other.segments);
    }

    /// Append raw bytes as a new segment.
    pub fn append_bytes(&mut self, data: impl Into<Bytes>) {
        let data = data.into();
        if !data.is_empty() {
            self.segments.push_back(data);
        }
    }

    /// Prepend another chain, keeping the union of both tag sets.
    pub fn prepend(&mut self, mut other: BufferChain) {
        self.tags |= other.tags;
        while let Some(seg) = other.segments.pop_back() {
            self.segments.push_front(seg);
        }
    }

    /// Split off the first `n` bytes. Both halves keep the tags.
    ///
    /// Panics if `n` exceeds the chain length, like `Bytes::split_to`.
    pub fn split_to(&mut self, n: usize) -> BufferChain {
        assert!(n <= self.len(), "split_to out of bounds");
        let mut head = BufferChain {
            segments: VecDeque::new(),
            tags: self.tags,
        };
        let mut remaining = n;
        while remaining > 0 {
            let mut seg = self
                .segments
                .pop_front()
                .expect("chain length accounted for");
            if seg.len() <= remaining {
                remaining -= seg.len();
                head.segments.push_back(seg);
            } else {
                let taken = seg.split_to(remaining);
                remaining = 0;
                head.segments.push_back(taken);
                self.segments.push_front(seg);
            }
        }
        // A split may leave either half multi-segment.
        head.tags &= !tags::CONTIGUOUS;
        self.tags &= !tags::CONTIGUOUS;
        head
    }

    /// Take the whole chain, leaving this one empty and untagged.
    pub fn take(&mut self) -> BufferChain {
        std::mem::take(self)
    }

    /// Collapse the chain into a single segment, preserving tags.
    pub fn into_contiguous(mut self) -> BufferChain {
        if self.segments.len() <= 1 {
            self.tags |= tags::CONTIGUOUS;
            return self;
        }
        let mut merged = BytesMut::with_capacity(self.len());
        for seg in &self.segments {
            merged.extend_from_slice(seg);
        }
        let mut segments = VecDeque::with_capacity(1);
        segments.push_back(merged.freeze());
        BufferChain {
            segments,
            tags: self.tags | tags::CONTIGUOUS,
        }
    }

    /// Borrow the first segment, if any.
    pub fn first_segment(&self) -> Option<&Bytes> {
        self.segments.front()
    }

    /// Copy `len` bytes starting at `offset` into a vector, crossing
    /// segment boundaries. Returns `None` if the chain is too short.
    pub fn copy_bytes(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        if offset + len > self.len() {
            return None;
        }
        let mut out = Vec::with_capacity(len);
        let mut skip = offset;
        for seg in &self.segments {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let avail = &seg[skip..];
            skip = 0;
            let want = len - out.len();
            if avail.len() >= want {
                out.extend_from_slice(&avail[..want]);
                break;
            }
            out.extend_from_slice(avail);
        }
        Some(out)
    }

    /// Peek a single byte at `offset`.
    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        let mut skip = offset;
        for seg in &self.segments {
            if skip < seg.len() {
                return Some(seg[skip]);
            }
            skip -= seg.len();
        }
        None
    }

    /// Overwrite a single byte at `offset`. Copies the affected segment if
    /// it is shared. Returns false if the chain is too short.
    pub fn set_u8(&mut self, offset: usize, value: u8) -> bool {
        let mut skip = offset;
        for seg in self.segments.iter_mut() {
            if skip < seg.len() {
                let mut owned = BytesMut::from(&seg[..]);
                owned[skip] = value;
                *seg = owned.freeze();
                return true;
            }
            skip -= seg.len();
        }
        false
    }

    /// Flatten the chain into a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for seg in &self.segments {
            out.extend_from_slice(seg);
        }
        out
    }

    /// Iterate over the segments.
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }
}

impl From<Vec<u8>> for BufferChain {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}
