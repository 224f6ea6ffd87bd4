//! Rotary position embedding post-op for Q and K
//!
//! Applied in place to the query and key column ranges of the fused QKV
//! buffer, over the head ranges this replica owns. Rotation pairs element
//! `i` with element `i + D/2` of each head (the LLaMA convention).

use crate::dtype::Element;

/// Shape descriptor for one rotary application.
#[derive(Debug, Clone, Copy)]
pub struct RotaryShape {
    /// Batch size
    pub batch: usize,
    /// Input sequence length
    pub seq_len: usize,
    /// Query heads in the buffer
    pub q_heads: usize,
    /// Head size D (must be even)
    pub head_size: usize,
    /// Key/value heads in the buffer
    pub kv_heads: usize,
    /// Maximum sequence length (cache capacity)
    pub max_seq_len: usize,
    /// Past sequence length
    pub past_seq_len: usize,
}

/// Precomputed inverse frequencies for rotary embedding.
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
    max_pos: usize,
}

impl RotaryEmbedding {
    /// Standard rotary table: `inv_freq[i] = base^(-2i/D)`.
    #[must_use]
    pub fn new(head_size: usize, max_pos: usize) -> Self {
        Self::with_base(head_size, max_pos, 10000.0)
    }

    /// Rotary table with an explicit frequency base.
    #[must_use]
    pub fn with_base(head_size: usize, max_pos: usize, base: f32) -> Self {
        debug_assert!(head_size % 2 == 0);
        let half = head_size / 2;
        let inv_freq = (0..half)
            .map(|i| base.powf(-((2 * i) as f32) / head_size as f32))
            .collect();
        Self { inv_freq, max_pos }
    }

    /// Maximum position this table supports.
    #[must_use]
    pub fn max_pos(&self) -> usize {
        self.max_pos
    }

    /// Rotate Q and K rows of the fused buffer in place. The query columns
    /// start at `q_off` and the key columns at `k_off` within each row; rows
    /// advance by the given strides. `position_ids` holds one absolute
    /// position per input sequence index.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<T: Element>(
        &self,
        qk: &mut [T],
        q_off: usize,
        k_off: usize,
        q_stride: usize,
        k_stride: usize,
        shape: RotaryShape,
        position_ids: &[usize],
    ) {
        debug_assert!(position_ids.len() >= shape.seq_len);
        let half = self.inv_freq.len();
        debug_assert_eq!(half * 2, shape.head_size);

        for b in 0..shape.batch {
            for s in 0..shape.seq_len {
                let row = b * shape.seq_len + s;
                let pos = position_ids[s].min(self.max_pos.saturating_sub(1)) as f32;
                for i in 0..half {
                    let theta = pos * self.inv_freq[i];
                    let (sin, cos) = theta.sin_cos();
                    for h in 0..shape.q_heads {
                        let off = q_off + row * q_stride + h * shape.head_size;
                        rotate_pair(&mut qk[off..], i, half, sin, cos);
                    }
                    for h in 0..shape.kv_heads {
                        let off = k_off + row * k_stride + h * shape.head_size;
                        rotate_pair(&mut qk[off..], i, half, sin, cos);
                    }
                }
            }
        }
    }
}

#[inline(always)]
fn rotate_pair<T: Element>(head: &mut [T], i: usize, half: usize, sin: f32, cos: f32) {
    let x0 = head[i].to_f32();
    let x1 = head[i + half].to_f32();
    head[i] = T::from_f32(x0 * cos - x1 * sin);
    head[i + half] = T::from_f32(x0 * sin + x1 * cos);
}

/// Default position ids when the caller supplies none: `[past]` for a decode
/// step, else `past, past + 1, ...`.
#[must_use]
pub fn default_position_ids(seq_len: usize, past_seq_len: usize) -> Vec<usize> {
    if seq_len == 1 {
        vec![past_seq_len]
    } else {
        (past_seq_len..past_seq_len + seq_len).collect()
    }
}
