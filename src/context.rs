//! Decoder context: shapes, hyperparameters, parallel layout and scratch
//!
//! One context is shared by every layer of a pipeline stage. The outer loop
//! sets the per-step fields (`batch_size`, `input_seq_len`) and sizes the
//! scratch buffers through [`DecoderContext::prepare`] before driving the
//! attention and MLP blocks.

use crate::dtype::Element;
use crate::error::{InferirError, Result};
use crate::matrix::ScratchVec;

/// Activation function of the MLP block. Only SiLU has a kernel; the other
/// tags exist so misconfiguration is reported instead of silently computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// Sigmoid-weighted linear unit, `x * sigmoid(x)`
    Silu,
    /// Gaussian error linear unit (unsupported by the gated MLP)
    Gelu,
    /// Rectified linear unit (unsupported by the gated MLP)
    Relu,
}

/// Hyperparameters and per-step state for one pipeline stage.
#[derive(Debug)]
pub struct DecoderContext {
    /// Model hidden size H
    pub hidden_size: usize,
    /// Attention head size D
    pub att_head_size: usize,
    /// Number of query heads Q
    pub att_head_num: usize,
    /// Number of key/value heads K (must divide Q)
    pub kv_head_num: usize,
    /// MLP intermediate size I
    pub intermediate_size: usize,
    /// Number of decoder layers in the model
    pub layers: usize,
    /// Pipeline-parallel stage count
    pub pp_size: usize,

    /// Current batch size B
    pub batch_size: usize,
    /// Current input sequence length S
    pub input_seq_len: usize,

    /// Maximum positional embedding index (0 disables default position ids)
    pub max_pos_embed: usize,
    /// Maximum sequence length the KV cache is sized for
    pub max_seq_len: usize,

    /// Attention scaling factor applied inside softmax (typically 1/sqrt(D))
    pub att_factor: f32,
    /// Normalization epsilon
    pub epsilon: f32,

    /// Worker count for intra-op parallelism
    pub num_threads: usize,
    /// Tensor-parallel split count
    pub num_split: usize,
    /// This replica's split index, in `[0, num_split)`
    pub split_idx: usize,

    /// MLP activation
    pub act_type: ActivationKind,

    /// Memoized attention M-block size, written once per pipeline stage at
    /// the first layer of each forward pass and read by the rest.
    pub(crate) m_block_memo: usize,

    /// QKV projection output scratch
    pub(crate) qkv_scratch: ScratchVec,
    /// Attention score scratch (f32)
    pub(crate) score_scratch: Vec<f32>,
    /// Normalized-input scratch
    pub(crate) norm_scratch: ScratchVec,
    /// MLP intermediate scratch
    pub(crate) im_scratch: ScratchVec,
}

impl DecoderContext {
    /// Create a context. Validates the GQA factor and split layout.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layers: usize,
        hidden_size: usize,
        att_head_num: usize,
        kv_head_num: usize,
        att_head_size: usize,
        intermediate_size: usize,
        max_pos_embed: usize,
        max_seq_len: usize,
        epsilon: f32,
        num_threads: usize,
        num_split: usize,
        split_idx: usize,
        pp_size: usize,
        act_type: ActivationKind,
    ) -> Result<Self> {
        if att_head_num % kv_head_num != 0 {
            return Err(InferirError::UnsupportedHeadConfig {
                q_heads: att_head_num,
                kv_heads: kv_head_num,
            });
        }
        if split_idx >= num_split {
            return Err(InferirError::InvalidConfiguration(format!(
                "split index {split_idx} out of range for {num_split} splits"
            )));
        }
        if pp_size == 0 || layers % pp_size != 0 {
            return Err(InferirError::InvalidConfiguration(format!(
                "{layers} layers cannot be divided into {pp_size} pipeline stages"
            )));
        }
        Ok(Self {
            hidden_size,
            att_head_size,
            att_head_num,
            kv_head_num,
            intermediate_size,
            layers,
            pp_size,
            batch_size: 1,
            input_seq_len: 0,
            max_pos_embed,
            max_seq_len,
            att_factor: 1.0 / (att_head_size as f32).sqrt(),
            epsilon,
            num_threads: num_threads.max(1),
            num_split: num_split.max(1),
            split_idx,
            act_type,
            m_block_memo: 0,
            qkv_scratch: ScratchVec::new(),
            score_scratch: Vec::new(),
            norm_scratch: ScratchVec::new(),
            im_scratch: ScratchVec::new(),
        })
    }

    /// Set the per-step shape and size every scratch buffer for it.
    ///
    /// `Im` is the widest intermediate element type the step will use; the
    /// buffers are f32-backed so any narrower type also fits.
    pub fn prepare<Im: Element>(&mut self, batch_size: usize, input_seq_len: usize, past_seq_len: usize) {
        self.batch_size = batch_size;
        self.input_seq_len = input_seq_len;

        let rows = batch_size * input_seq_len;
        let qkv_cols = (self.att_head_num + 2 * self.kv_head_num) * self.att_head_size;
        self.qkv_scratch.reserve::<Im>(rows * qkv_cols);
        self.norm_scratch.reserve::<Im>(rows * self.hidden_size);
        // Fused gate/up needs 2x the per-split intermediate width.
        let im_cols = self.hidden_size.max(2 * self.intermediate_size);
        self.im_scratch.reserve::<Im>(rows * im_cols);

        // Score scratch covers both the per-thread tiles of the fused kernel
        // and the per-(batch, head) rows of the head-sharded kernel.
        let key_len = past_seq_len + input_seq_len;
        let score_stride = align16(key_len);
        let fused = self.num_threads * input_seq_len.max(1) * score_stride;
        let sharded = batch_size * self.att_head_num * input_seq_len.max(1) * score_stride;
        let need = fused.max(sharded);
        if self.score_scratch.len() < need {
            self.score_scratch.resize(need, 0.0);
        }
    }

    /// Capacity of the score scratch, in f32 elements.
    #[must_use]
    pub fn score_capacity(&self) -> usize {
        self.score_scratch.len()
    }
}

/// Round `n` up to a multiple of 16 (score-row alignment for the kernels).
#[inline]
#[must_use]
pub fn align16(n: usize) -> usize {
    n.div_ceil(16) * 16
}

/// Contiguous task range `[start, end)` owned by `split_idx` when dividing
/// `n` items across `splits` peers: even division with the remainder
/// distributed to the low indices.
#[must_use]
pub fn task_range(n: usize, splits: usize, split_idx: usize) -> (usize, usize) {
    let base = n / splits;
    let rem = n % splits;
    if split_idx < rem {
        let start = split_idx * (base + 1);
        (start, start + base + 1)
    } else {
        let start = rem * (base + 1) + (split_idx - rem) * base;
        (start, start + base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DecoderContext {
        DecoderContext::new(
            2,
            64,
            4,
            2,
            16,
            128,
            2048,
            2048,
            1e-5,
            4,
            1,
            0,
            1,
            ActivationKind::Silu,
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_bad_gqa_factor() {
        let err = DecoderContext::new(
            2,
            64,
            7,
            2,
            16,
            128,
            2048,
            2048,
            1e-5,
            4,
            1,
            0,
            1,
            ActivationKind::Silu,
        )
        .unwrap_err();
        assert!(matches!(err, InferirError::UnsupportedHeadConfig { .. }));
    }

    #[test]
    fn test_new_rejects_bad_split_idx() {
        let err = DecoderContext::new(
            2,
            64,
            4,
            2,
            16,
            128,
            2048,
            2048,
            1e-5,
            4,
            2,
            2,
            1,
            ActivationKind::Silu,
        )
        .unwrap_err();
        assert!(matches!(err, InferirError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_default_att_factor() {
        let c = ctx();
        assert!((c.att_factor - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_sizes_score_scratch() {
        let mut c = ctx();
        c.prepare::<f32>(2, 8, 0);
        assert!(c.score_capacity() >= c.num_threads * 8 * align16(8));
        let cap = c.score_capacity();
        c.prepare::<f32>(1, 1, 0);
        assert_eq!(c.score_capacity(), cap, "scratch never shrinks");
    }

    #[test]
    fn test_align16() {
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(17), 32);
    }

    #[test]
    fn test_task_range_tiles_exactly() {
        for n in [1usize, 7, 8, 13, 64] {
            for splits in 1..=5usize {
                let mut covered = 0;
                let mut prev_end = 0;
                let mut max_size = 0;
                let mut min_size = usize::MAX;
                for idx in 0..splits {
                    let (s, e) = task_range(n, splits, idx);
                    assert_eq!(s, prev_end, "ranges must be contiguous");
                    prev_end = e;
                    covered += e - s;
                    max_size = max_size.max(e - s);
                    min_size = min_size.min(e - s);
                }
                assert_eq!(covered, n);
                assert!(max_size - min_size <= 1, "sizes differ by at most 1");
            }
        }
    }

    #[test]
    fn test_task_range_remainder_to_low_indices() {
        assert_eq!(task_range(8, 3, 0), (0, 3));
        assert_eq!(task_range(8, 3, 1), (3, 6));
        assert_eq!(task_range(8, 3, 2), (6, 8));
    }
}
