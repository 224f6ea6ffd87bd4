//! KV-cache tensor
//!
//! A logical 4-D store indexed by `(sequence position, batch, kv head,
//! head element)`, laid out position-major so that for one `(batch, head)`
//! pair consecutive positions are rows at a constant stride, directly
//! usable as the B operand of the attention GEMMs.
//!
//! Within one forward pass, writes at `past + s` complete before any read at
//! a position `>= past` in the same kernel invocation; the fork-join region's
//! join is the barrier between the write and read phases.

use crate::dtype::Element;
use crate::matrix::SharedPtr;

/// Cache of past key or value projections for one layer.
#[derive(Clone)]
pub struct KvCacheTensor<T: Element> {
    data: Vec<T>,
    max_seq: usize,
    batch: usize,
    heads: usize,
    head_size: usize,
}

impl<T: Element> KvCacheTensor<T> {
    /// Allocate a zeroed cache.
    #[must_use]
    pub fn new(max_seq: usize, batch: usize, heads: usize, head_size: usize) -> Self {
        Self {
            data: vec![T::zero(); max_seq * batch * heads * head_size],
            max_seq,
            batch,
            heads,
            head_size,
        }
    }

    /// Maximum number of positions.
    #[must_use]
    pub fn max_seq(&self) -> usize {
        self.max_seq
    }

    /// Batch capacity.
    #[must_use]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// KV heads stored per position.
    #[must_use]
    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Elements per head vector.
    #[must_use]
    pub fn head_size(&self) -> usize {
        self.head_size
    }

    /// Distance in elements between the same head at consecutive positions.
    #[must_use]
    pub fn seq_stride(&self) -> usize {
        self.batch * self.heads * self.head_size
    }

    #[inline]
    fn offset(&self, pos: usize, b: usize, h: usize) -> usize {
        debug_assert!(pos < self.max_seq && b < self.batch && h < self.heads);
        ((pos * self.batch + b) * self.heads + h) * self.head_size
    }

    /// One head vector at an absolute position.
    #[must_use]
    pub fn sequence(&self, pos: usize, b: usize, h: usize) -> &[T] {
        let off = self.offset(pos, b, h);
        &self.data[off..off + self.head_size]
    }

    /// Mutable head vector at an absolute position.
    #[must_use]
    pub fn sequence_mut(&mut self, pos: usize, b: usize, h: usize) -> &mut [T] {
        let off = self.offset(pos, b, h);
        &mut self.data[off..off + self.head_size]
    }

    /// All positions of one `(batch, head)` pair: base slice plus the row
    /// stride between consecutive positions.
    #[must_use]
    pub fn head(&self, b: usize, h: usize) -> (&[T], usize) {
        let off = self.offset(0, b, h);
        (&self.data[off..], self.seq_stride())
    }

    /// Base pointer for disjoint parallel writes. Tasks must target
    /// non-overlapping `(pos, b, h)` triples.
    pub(crate) fn shared_ptr(&mut self) -> SharedPtr<T> {
        SharedPtr(self.data.as_mut_ptr())
    }

    /// Element offset of `(pos, b, h)` for pointer-based writers.
    pub(crate) fn sequence_offset(&self, pos: usize, b: usize, h: usize) -> usize {
        self.offset(pos, b, h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_sequence_roundtrip() {
        let mut cache = KvCacheTensor::<f32>::new(4, 2, 3, 8);
        cache.sequence_mut(2, 1, 0).copy_from_slice(&[1.0; 8]);
        assert_eq!(cache.sequence(2, 1, 0), &[1.0; 8]);
        assert_eq!(cache.sequence(2, 0, 0), &[0.0; 8]);
        assert_eq!(cache.sequence(1, 1, 0), &[0.0; 8]);
    }

    #[test]
    fn test_head_view_walks_positions() {
        let mut cache = KvCacheTensor::<f32>::new(3, 2, 2, 4);
        for pos in 0..3 {
            let row = [pos as f32; 4];
            cache.sequence_mut(pos, 1, 1).copy_from_slice(&row);
        }
        let (base, stride) = cache.head(1, 1);
        assert_eq!(stride, 2 * 2 * 4);
        for pos in 0..3 {
            assert_eq!(&base[pos * stride..pos * stride + 4], &[pos as f32; 4]);
        }
    }

    #[test]
    fn test_bf16_cache() {
        let mut cache = KvCacheTensor::<bf16>::new(2, 1, 1, 2);
        cache.sequence_mut(0, 0, 0)[1] = bf16::from_f32(2.5);
        assert_eq!(cache.sequence(0, 0, 0)[1].to_f32(), 2.5);
    }
}
