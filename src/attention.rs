//! Grouped-query attention block
//!
//! One attention block owns the fused QKV projection, the rotary post-op,
//! three complementary attention kernels and the output projection with
//! residual folding:
//!
//! - a fused tiled kernel for short contexts (M-blocked `Q*K^T` -> softmax
//!   -> `*V` per head),
//! - a head-sharded kernel for tiny `batch x heads` decode steps, which
//!   splits the key length across workers and recombines slice softmaxes
//!   through their streaming statistics,
//! - a flash-style kernel for long prompts, which tiles both query and key
//!   dimensions and keeps online-softmax state per query row.
//!
//! Under tensor-parallel execution each replica owns a contiguous query-head
//! range and the matching KV-head range; rotary and KV-cache writes only
//! touch the owned range, and the residual is folded on split 0 only (the
//! caller all-reduces the partial outputs).

use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::trace;

use crate::context::{align16, task_range, DecoderContext};
use crate::dtype::{DataType, Element};
use crate::error::{InferirError, Result};
use crate::gemm::{small_gemm, small_gemm_transb};
use crate::kvcache::KvCacheTensor;
use crate::matmul::{MatmulEngine, PackedWeight, RawWeight};
use crate::matrix::{SharedConstPtr, SharedPtr};
use crate::norm::LayerNorm;
use crate::pool::ScratchPool;
use crate::rotary::{default_position_ids, RotaryEmbedding, RotaryShape};
use crate::softmax::{incremental_tile_attention, softmax_scaled_masked, softmax_with_stats};

/// L2 working-set assumption for the M-block derivation.
const L2_CACHE_BYTES: usize = 2 * 1024 * 1024;

/// Strategy hooks for model-specific attention behavior.
pub trait AttentionVariant: Send + Sync {
    /// Scale applied to the residual before folding (1 folds it directly).
    fn residual_scale(&self) -> f32 {
        1.0
    }

    /// Softmax scaling override; 0 means use the context's factor.
    fn scaling_coeff(&self) -> f32 {
        0.0
    }

    /// Sequence length above which prefill uses the flash kernel.
    fn flash_threshold(&self) -> usize {
        1024
    }

    /// Mask row block for one `(batch, head)`: `src_len * tgt_len` floats.
    fn mask<'a>(
        &self,
        attn_mask: &'a [f32],
        b: usize,
        _h: usize,
        src_len: usize,
        tgt_len: usize,
    ) -> &'a [f32] {
        &attn_mask[b * src_len * tgt_len..(b + 1) * src_len * tgt_len]
    }
}

/// Default hooks: unit residual scale, context scaling, batch-indexed mask.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVariant;

impl AttentionVariant for DefaultVariant {}

/// Weight bundle for [`AttentionBlock::set_weights`].
pub struct AttentionWeights<'a> {
    /// Query projection `[H, Q*D]` (or transposed)
    pub query: RawWeight<'a>,
    /// Key projection `[H, K*D]` (or transposed)
    pub key: RawWeight<'a>,
    /// Value projection `[H, K*D]` (or transposed)
    pub value: RawWeight<'a>,
    /// Output projection `[Q*D, H]` (or transposed)
    pub output: RawWeight<'a>,
    /// Query projection bias; QKV bias is carried only when all three are present
    pub query_bias: Option<&'a [f32]>,
    /// Key projection bias
    pub key_bias: Option<&'a [f32]>,
    /// Value projection bias
    pub value_bias: Option<&'a [f32]>,
    /// Output projection bias
    pub output_bias: Option<&'a [f32]>,
    /// Pre-norm gain
    pub gamma: &'a [f32],
    /// Pre-norm shift
    pub beta: Option<&'a [f32]>,
    /// Whether the sources are transposed (PyTorch `[out, in]` layout)
    pub trans: bool,
}

/// Shape and policy scalars one kernel invocation needs.
#[derive(Clone, Copy)]
struct KernelShape {
    batch: usize,
    seq_len: usize,
    past_seq_len: usize,
    head_size: usize,
    group: usize,
    num_threads: usize,
    scale: f32,
}

impl KernelShape {
    fn key_len(&self) -> usize {
        self.past_seq_len + self.seq_len
    }
}

/// Grouped-query attention block for one decoder layer.
///
/// `I`, `Im`, `O` are the input, intermediate and output element types.
pub struct AttentionBlock<I: Element, Im: Element, O: Element, V: AttentionVariant = DefaultVariant>
{
    layer_id: usize,
    start_q_head: usize,
    end_q_head: usize,
    start_kv_head: usize,
    end_kv_head: usize,

    qkv_weight: Option<PackedWeight>,
    qkv_bias: Vec<f32>,
    out_weight: Option<PackedWeight>,
    out_bias: Vec<f32>,

    norm: LayerNorm,
    rotary: RotaryEmbedding,
    variant: V,

    _elems: std::marker::PhantomData<(I, Im, O)>,
}

impl<I: Element, Im: Element, O: Element> AttentionBlock<I, Im, O, DefaultVariant> {
    /// Block with the default strategy hooks.
    pub fn new(layer_id: usize, ctx: &DecoderContext) -> Result<Self> {
        Self::with_variant(layer_id, ctx, DefaultVariant)
    }
}

impl<I: Element, Im: Element, O: Element, V: AttentionVariant> AttentionBlock<I, Im, O, V> {
    /// Block with explicit strategy hooks. Computes the owned head ranges
    /// from the context's tensor-parallel layout.
    pub fn with_variant(layer_id: usize, ctx: &DecoderContext, variant: V) -> Result<Self> {
        if ctx.att_head_num % ctx.kv_head_num != 0 {
            return Err(InferirError::UnsupportedHeadConfig {
                q_heads: ctx.att_head_num,
                kv_heads: ctx.kv_head_num,
            });
        }
        let (start_q_head, end_q_head) = task_range(ctx.att_head_num, ctx.num_split, ctx.split_idx);
        let group = ctx.att_head_num / ctx.kv_head_num;
        let start_kv_head = start_q_head / group;
        let end_kv_head = (end_q_head - 1) / group + 1;

        Ok(Self {
            layer_id,
            start_q_head,
            end_q_head,
            start_kv_head,
            end_kv_head,
            qkv_weight: None,
            qkv_bias: Vec::new(),
            out_weight: None,
            out_bias: Vec::new(),
            norm: LayerNorm::new(),
            rotary: RotaryEmbedding::new(ctx.att_head_size, ctx.max_pos_embed.max(ctx.max_seq_len)),
            variant,
            _elems: std::marker::PhantomData,
        })
    }

    /// Owned query-head range `[start, end)`.
    #[must_use]
    pub fn q_head_range(&self) -> (usize, usize) {
        (self.start_q_head, self.end_q_head)
    }

    /// Owned KV-head range `[start, end)`.
    #[must_use]
    pub fn kv_head_range(&self) -> (usize, usize) {
        (self.start_kv_head, self.end_kv_head)
    }

    fn resp_q_heads(&self) -> usize {
        self.end_q_head - self.start_q_head
    }

    fn resp_kv_heads(&self) -> usize {
        self.end_kv_head - self.start_kv_head
    }

    /// Local query head -> local KV head, through the global group mapping.
    #[inline]
    fn kv_head_of(&self, local_q: usize, group: usize) -> usize {
        (self.start_q_head + local_q) / group - self.start_kv_head
    }

    /// Slice each projection to the owned head ranges, concatenate Q/K/V
    /// horizontally, convert and pack, and slice the output projection to the
    /// owned query-head rows. The output bias is zeroed on non-master splits
    /// so replica outputs can be summed without double-counting.
    pub fn set_weights(
        &mut self,
        ctx: &DecoderContext,
        engine: &MatmulEngine,
        weights: &AttentionWeights<'_>,
    ) -> Result<()> {
        let hidden = ctx.hidden_size;
        let head_size = ctx.att_head_size;
        let q_cols = self.resp_q_heads() * head_size;
        let kv_cols = self.resp_kv_heads() * head_size;
        let resp_cols = q_cols + 2 * kv_cols;
        let q_total = ctx.att_head_num * head_size;
        let kv_total = ctx.kv_head_num * head_size;

        let q_range = (self.start_q_head * head_size, q_cols);
        let kv_range = (self.start_kv_head * head_size, kv_cols);

        // Concatenate the owned column ranges of Q, K and V in the source
        // layout, then convert the merged [hidden, resp_cols] weight once.
        let converted = match (&weights.query, &weights.key, &weights.value) {
            (RawWeight::F32(q), RawWeight::F32(k), RawWeight::F32(v)) => {
                let merged = concat_qkv_columns(
                    weights.trans,
                    hidden,
                    q,
                    k,
                    v,
                    q_total,
                    kv_total,
                    q_range,
                    kv_range,
                );
                engine.convert_weight(weights.trans, hidden, resp_cols, &RawWeight::F32(&merged))?
            }
            (
                RawWeight::Int8 {
                    data: q,
                    scale: qs,
                    zero: qz,
                },
                RawWeight::Int8 {
                    data: k,
                    scale: ks,
                    zero: kz,
                },
                RawWeight::Int8 {
                    data: v,
                    scale: vs,
                    zero: vz,
                },
            ) => {
                let merged = concat_qkv_columns(
                    weights.trans,
                    hidden,
                    q,
                    k,
                    v,
                    q_total,
                    kv_total,
                    q_range,
                    kv_range,
                );
                let scale = concat_metadata(qs, ks, vs, q_range, kv_range);
                let zero = concat_metadata(qz, kz, vz, q_range, kv_range);
                engine.convert_weight(
                    weights.trans,
                    hidden,
                    resp_cols,
                    &RawWeight::Int8 {
                        data: &merged,
                        scale: &scale,
                        zero: &zero,
                    },
                )?
            }
            _ => {
                return Err(InferirError::UnsupportedOperation {
                    operation: "set_weights".to_string(),
                    reason: "query/key/value weights must share an element type".to_string(),
                })
            }
        };
        self.qkv_weight = Some(engine.pack_weight(&converted));

        // Merged bias, only when all three projections carry one.
        self.qkv_bias.clear();
        if let (Some(qb), Some(kb), Some(vb)) =
            (weights.query_bias, weights.key_bias, weights.value_bias)
        {
            self.qkv_bias
                .extend_from_slice(&qb[q_range.0..q_range.0 + q_cols]);
            self.qkv_bias
                .extend_from_slice(&kb[kv_range.0..kv_range.0 + kv_cols]);
            self.qkv_bias
                .extend_from_slice(&vb[kv_range.0..kv_range.0 + kv_cols]);
        }

        // Output projection: slice the K dimension (attention columns) to the
        // owned query-head range.
        let out_conv = engine.convert_weight_split(
            weights.trans,
            q_total,
            hidden,
            &weights.output,
            q_range.0,
            q_cols,
            false,
        )?;
        self.out_weight = Some(engine.pack_weight(&out_conv));

        self.out_bias.clear();
        if let Some(ob) = weights.output_bias {
            if ctx.split_idx == 0 {
                self.out_bias.extend_from_slice(&ob[..hidden]);
            } else {
                self.out_bias.resize(hidden, 0.0);
            }
        }

        self.norm.set_weight(weights.gamma, weights.beta, hidden);
        Ok(())
    }

    /// Forward for the attention half of the decoder layer.
    ///
    /// `input`, `im_buf` and `output` are `[B*S, H]` row-major. On split 0
    /// the output holds `out_proj(attention(norm(input))) + residual`; other
    /// splits emit their partial contribution for the caller to all-reduce.
    /// `attn_mask` is `[B, 1, S, P+S]` additive float.
    #[allow(clippy::too_many_arguments)]
    pub fn forward<KV: Element>(
        &self,
        ctx: &mut DecoderContext,
        input: &[I],
        im_buf: &mut [Im],
        output: &mut [O],
        attn_mask: &[f32],
        present_key: &mut KvCacheTensor<KV>,
        present_value: &mut KvCacheTensor<KV>,
        input_seq_len: usize,
        past_seq_len: usize,
        use_self_attn: bool,
        do_ln_before: bool,
        position_ids: Option<&[usize]>,
    ) -> Result<()> {
        let qkv_weight = self.qkv_weight.as_ref().ok_or_else(|| {
            InferirError::InvalidConfiguration("attention weights not set".to_string())
        })?;
        let out_weight = self.out_weight.as_ref().expect("packed with qkv weight");

        let hidden = ctx.hidden_size;
        let head_size = ctx.att_head_size;
        let batch = ctx.batch_size;
        ctx.input_seq_len = input_seq_len;
        let rows = batch * input_seq_len;
        let resp_heads = self.resp_q_heads();
        let q_cols = resp_heads * head_size;
        let kv_cols = self.resp_kv_heads() * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;
        let group = ctx.att_head_num / ctx.kv_head_num;

        trace!(
            layer = self.layer_id,
            rows,
            past_seq_len,
            use_self_attn,
            "attention forward"
        );

        if do_ln_before {
            self.norm
                .forward(input, im_buf, rows, hidden, hidden, ctx.epsilon);
        }

        // Query, key and value computed together.
        let qkv = ctx.qkv_scratch.as_slice_mut::<Im>(rows * qkv_cols);
        if self.qkv_bias.is_empty() {
            if do_ln_before {
                qkv_weight.compute(rows, 1.0, &im_buf[..rows * hidden], hidden, 0.0, qkv, qkv_cols);
            } else {
                qkv_weight.compute(rows, 1.0, &input[..rows * hidden], hidden, 0.0, qkv, qkv_cols);
            }
        } else if do_ln_before {
            qkv_weight.compute_bias(
                rows,
                1.0,
                &im_buf[..rows * hidden],
                hidden,
                0.0,
                qkv,
                qkv_cols,
                &self.qkv_bias,
            );
        } else {
            qkv_weight.compute_bias(
                rows,
                1.0,
                &input[..rows * hidden],
                hidden,
                0.0,
                qkv,
                qkv_cols,
                &self.qkv_bias,
            );
        }

        // Rotary post-op on the owned Q and K ranges.
        if position_ids.is_some() || ctx.max_pos_embed > 0 {
            let shape = RotaryShape {
                batch,
                seq_len: input_seq_len,
                q_heads: resp_heads,
                head_size,
                kv_heads: self.resp_kv_heads(),
                max_seq_len: ctx.max_seq_len,
                past_seq_len,
            };
            let default_ids;
            let ids = match position_ids {
                Some(ids) => ids,
                None => {
                    default_ids = default_position_ids(input_seq_len, past_seq_len);
                    &default_ids
                }
            };
            self.rotary
                .forward(qkv, 0, q_cols, qkv_cols, qkv_cols, shape, ids);
        }

        let scale = if self.variant.scaling_coeff() != 0.0 {
            self.variant.scaling_coeff()
        } else {
            ctx.att_factor
        };
        let shape = KernelShape {
            batch,
            seq_len: input_seq_len,
            past_seq_len,
            head_size,
            group,
            num_threads: ctx.num_threads,
            scale,
        };

        // Attention result overlays the intermediate buffer: [rows, q_cols].
        let attn_split = &mut im_buf[..rows * q_cols];

        let bf16_self = past_seq_len == 0
            && I::DATA_TYPE == DataType::Bf16
            && O::DATA_TYPE == DataType::Bf16
            && Im::DATA_TYPE == DataType::Bf16;

        if past_seq_len == 0 && input_seq_len > self.variant.flash_threshold() {
            self.flash_attention(shape, qkv, attn_split, attn_mask, present_key, present_value)?;
        } else if bf16_self {
            self.self_attention_bf16(shape, qkv, attn_split, present_key, present_value)?;
        } else {
            // Fused tiled attention. The M-block size holds for every layer
            // of this pipeline stage; its first layer refreshes the memo.
            let layers_per_stage = ctx.layers / ctx.pp_size;
            if self.layer_id % layers_per_stage == 0 {
                ctx.m_block_memo = if past_seq_len == 0 {
                    self.m_block_size(input_seq_len, head_size)
                } else {
                    input_seq_len
                };
            }
            let m_block = ctx.m_block_memo.clamp(1, input_seq_len);

            // With few tasks relative to workers, shard each head's key length.
            let shard_head = input_seq_len == 1 && ctx.num_threads >= batch * resp_heads * 2;

            // The current K/V must be copied up front when multiple tasks
            // share one head's data; otherwise the copy rides in the main loop.
            let kv_copied = group > 1 || m_block != input_seq_len || shard_head;
            if kv_copied {
                self.copy_kv_cache(shape, qkv, present_key, present_value);
            }

            if shard_head {
                self.shard_head_attention(
                    shape,
                    qkv,
                    attn_split,
                    attn_mask,
                    present_key,
                    present_value,
                    &mut ctx.score_scratch,
                );
            } else {
                self.slim_attention(
                    shape,
                    m_block,
                    kv_copied,
                    qkv,
                    attn_split,
                    attn_mask,
                    present_key,
                    present_value,
                    &mut ctx.score_scratch,
                );
            }
        }

        // Output projection; only split 0 folds the residual.
        let bias = if self.out_bias.is_empty() {
            None
        } else {
            Some(self.out_bias.as_slice())
        };
        if ctx.split_idx == 0 {
            let gamma = self.variant.residual_scale();
            if (gamma - 1.0).abs() < f32::EPSILON {
                out_weight.compute_residual(
                    rows,
                    1.0,
                    &attn_split[..rows * q_cols],
                    q_cols,
                    0.0,
                    output,
                    hidden,
                    bias,
                    &input[..rows * hidden],
                    hidden,
                );
            } else {
                out_weight.compute_scaled_residual(
                    rows,
                    1.0,
                    &attn_split[..rows * q_cols],
                    q_cols,
                    0.0,
                    output,
                    hidden,
                    bias,
                    gamma,
                    &input[..rows * hidden],
                    hidden,
                );
            }
        } else if let Some(bias) = bias {
            out_weight.compute_bias(
                rows,
                1.0,
                &attn_split[..rows * q_cols],
                q_cols,
                0.0,
                output,
                hidden,
                bias,
            );
        } else {
            out_weight.compute(
                rows,
                1.0,
                &attn_split[..rows * q_cols],
                q_cols,
                0.0,
                output,
                hidden,
            );
        }

        if !do_ln_before {
            self.norm.forward_inplace(output, rows, hidden, ctx.epsilon);
        }

        Ok(())
    }

    /// M-block size so one Q block, the K rows, the score block, the V rows
    /// and the output block stay within L2 together.
    fn m_block_size(&self, input_seq_len: usize, head_size: usize) -> usize {
        if input_seq_len == 1 {
            return 1;
        }
        let capacity = L2_CACHE_BYTES / std::mem::size_of::<Im>();
        let qkv_size = input_seq_len * head_size;
        let score_size = input_seq_len * input_seq_len;
        let splits = if capacity <= 2 * qkv_size {
            1
        } else {
            (2 * qkv_size + score_size)
                .div_ceil(capacity - 2 * qkv_size)
                .max(1)
        };
        let m_block = input_seq_len.div_ceil(splits);
        m_block.clamp(input_seq_len.min(6), input_seq_len)
    }

    /// Copy the current step's K/V (owned heads) into the caches, permuting
    /// from `(batch, seq, head)` rows to the cache's `(seq, batch, head)`
    /// layout.
    fn copy_kv_cache<KV: Element>(
        &self,
        shape: KernelShape,
        qkv: &[Im],
        present_key: &mut KvCacheTensor<KV>,
        present_value: &mut KvCacheTensor<KV>,
    ) {
        let resp_kv = self.resp_kv_heads();
        let head_size = shape.head_size;
        let q_cols = self.resp_q_heads() * head_size;
        let kv_cols = resp_kv * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;
        let key_cache = CacheRef::new(present_key);
        let value_cache = CacheRef::new(present_value);
        let src = SharedConstPtr(qkv.as_ptr());

        (0..shape.batch * resp_kv).into_par_iter().for_each(|t| {
            let b = t / resp_kv;
            let h = t % resp_kv;
            for seq in 0..shape.seq_len {
                let row = (b * shape.seq_len + seq) * qkv_cols;
                unsafe {
                    let k_src = src.get().add(row + q_cols + h * head_size);
                    let v_src = src.get().add(row + q_cols + kv_cols + h * head_size);
                    key_cache.store_row(shape.past_seq_len + seq, b, h, k_src, head_size);
                    value_cache.store_row(shape.past_seq_len + seq, b, h, v_src, head_size);
                }
            }
        });
    }

    /// The main fused kernel: parallel over `(batch, head, M-block)`.
    #[allow(clippy::too_many_arguments)]
    fn slim_attention<KV: Element>(
        &self,
        shape: KernelShape,
        m_block: usize,
        kv_copied: bool,
        qkv: &[Im],
        attn_split: &mut [Im],
        attn_mask: &[f32],
        present_key: &mut KvCacheTensor<KV>,
        present_value: &mut KvCacheTensor<KV>,
        score_scratch: &mut [f32],
    ) {
        let resp_heads = self.resp_q_heads();
        let head_size = shape.head_size;
        let seq_len = shape.seq_len;
        let q_cols = resp_heads * head_size;
        let kv_cols = self.resp_kv_heads() * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;
        let key_len = shape.key_len();
        let m_blocks = seq_len.div_ceil(m_block);

        let score_stride = if shape.past_seq_len > 0 {
            align16(key_len)
        } else {
            seq_len
        };
        let workers = rayon::current_num_threads().max(1);
        let score_needed = workers * m_block * score_stride;
        let mut pool_buf;
        let score_buf: SharedPtr<f32> = if score_needed <= score_scratch.len() {
            SharedPtr(score_scratch.as_mut_ptr())
        } else {
            pool_buf = ScratchPool::instance().get_buffer("scoreBuf", score_needed * 4);
            let ptr = pool_buf.shared_ptr::<f32>();
            let _ = pool_buf.as_slice_mut::<f32>(score_needed);
            ptr
        };

        let key_cache = CacheRef::new(present_key);
        let value_cache = CacheRef::new(present_value);
        let src = SharedConstPtr(qkv.as_ptr());
        let out = SharedPtr(attn_split.as_mut_ptr());

        (0..shape.batch * resp_heads * m_blocks)
            .into_par_iter()
            .for_each(|task| {
                let b = task / (resp_heads * m_blocks);
                let rest = task % (resp_heads * m_blocks);
                let i = rest / m_blocks;
                let mb = rest % m_blocks;
                let start_seq = mb * m_block;
                let end_seq = (start_seq + m_block).min(seq_len);
                let m = end_seq - start_seq;
                let tid = rayon::current_thread_index().unwrap_or(0);

                // Copy this head's current keys when the copy rides in-block
                // (only reachable with group == 1 and one block per head).
                if !kv_copied {
                    for seq in 0..seq_len {
                        let row = (b * seq_len + seq) * qkv_cols;
                        unsafe {
                            let k_src = src.get().add(row + q_cols + i * head_size);
                            key_cache.store_row(shape.past_seq_len + seq, b, i, k_src, head_size);
                        }
                    }
                }

                let kv_head = self.kv_head_of(i, shape.group);
                let (k_base, ldb) = key_cache.head(b, kv_head);
                let score = unsafe { score_buf.get().add(tid * m_block * score_stride) };
                let q_ptr = unsafe {
                    src.get()
                        .add((b * seq_len + start_seq) * qkv_cols + i * head_size)
                };

                // Q * K^T over the full key length.
                unsafe {
                    small_gemm_transb(
                        q_ptr,
                        k_base,
                        score,
                        m,
                        key_len,
                        head_size,
                        qkv_cols,
                        ldb,
                        score_stride,
                    );
                }

                // Softmax with the mask rows of this M-block.
                let mask_block =
                    self.variant
                        .mask(attn_mask, b, self.start_q_head + i, seq_len, key_len);
                for row in 0..m {
                    let score_row = unsafe {
                        std::slice::from_raw_parts_mut(score.add(row * score_stride), key_len)
                    };
                    let mask_row = &mask_block[(start_seq + row) * key_len..][..key_len];
                    softmax_scaled_masked(score_row, mask_row, shape.scale);
                }

                // Copy this head's current values before the second GEMM.
                if !kv_copied {
                    for seq in 0..seq_len {
                        let row = (b * seq_len + seq) * qkv_cols;
                        unsafe {
                            let v_src = src.get().add(row + q_cols + kv_cols + i * head_size);
                            value_cache.store_row(shape.past_seq_len + seq, b, i, v_src, head_size);
                        }
                    }
                }

                // Softmax * V into the caller's attention output.
                let (v_base, ldv) = value_cache.head(b, kv_head);
                let out_ptr = unsafe {
                    out.get()
                        .add((b * seq_len + start_seq) * q_cols + i * head_size)
                };
                unsafe {
                    small_gemm(
                        score,
                        v_base,
                        out_ptr,
                        m,
                        head_size,
                        key_len,
                        score_stride,
                        ldv,
                        q_cols,
                    );
                }
            });
    }

    /// Head-sharded attention for decode steps with many idle workers:
    /// splits the key length into slices, softmaxes each with streaming
    /// statistics, and has the slice-0 worker revise and reduce.
    #[allow(clippy::too_many_arguments)]
    fn shard_head_attention<KV: Element>(
        &self,
        shape: KernelShape,
        qkv: &[Im],
        attn_split: &mut [Im],
        attn_mask: &[f32],
        present_key: &mut KvCacheTensor<KV>,
        present_value: &mut KvCacheTensor<KV>,
        score_scratch: &mut [f32],
    ) {
        debug_assert_eq!(shape.seq_len, 1);
        let resp_heads = self.resp_q_heads();
        let head_size = shape.head_size;
        let q_cols = resp_heads * head_size;
        let kv_cols = self.resp_kv_heads() * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;
        let key_len = shape.key_len();

        let splits = shape.num_threads / (shape.batch * resp_heads);
        assert!(splits > 1, "head sharding requires at least 2 slices per head");
        // The vector reduction walks 16-lane chunks of each head.
        assert!(
            head_size % 16 == 0,
            "head size {head_size} not supported by the sharded kernel"
        );
        let nb = key_len.div_ceil(splits);

        let score_stride = if shape.past_seq_len > 0 {
            align16(key_len)
        } else {
            shape.seq_len
        };
        let total_tasks = shape.batch * resp_heads * splits;
        debug_assert!(score_scratch.len() >= shape.batch * resp_heads * score_stride);

        // Per-slice streaming statistics: (max, exp-sum, finished flag).
        let stats: Vec<SliceStat> = (0..total_tasks).map(|_| SliceStat::new()).collect();
        let mut sharded =
            ScratchPool::instance().get_buffer("shardedOutput", total_tasks * head_size * 4);
        let sharded_out: SharedPtr<f32> = sharded.shared_ptr::<f32>();
        let _ = sharded.as_slice_mut::<f32>(total_tasks * head_size);

        let key_cache = CacheRef::new(present_key);
        let value_cache = CacheRef::new(present_value);
        let src = SharedConstPtr(qkv.as_ptr());
        let out = SharedPtr(attn_split.as_mut_ptr());
        let score_base = SharedPtr(score_scratch.as_mut_ptr());

        // Slice index varies slowest and slice 0 schedules LAST: a reducing
        // worker then only ever waits on tasks earlier in the schedule, so
        // the spin cannot starve its own siblings on a small pool.
        (0..total_tasks).into_par_iter().for_each(|task| {
            let s = splits - 1 - task / (shape.batch * resp_heads);
            let bh = task % (shape.batch * resp_heads);
            let b = bh / resp_heads;
            let i = bh % resp_heads;
            let head_start_idx = (b * resp_heads + i) * splits;
            let stat_idx = head_start_idx + s;

            let n_off = (s * nb).min(key_len);
            let n = if s < splits - 1 {
                nb.min(key_len - n_off)
            } else {
                key_len - n_off
            };
            let kv_head = self.kv_head_of(i, shape.group);
            let (k_base, ldb) = key_cache.head(b, kv_head);

            let q_ptr = unsafe { src.get().add(b * qkv_cols + i * head_size) };
            let score_ptr = unsafe {
                score_base
                    .get()
                    .add((b * resp_heads + i) * score_stride + n_off)
            };

            // This slice's Q * K^T.
            unsafe {
                small_gemm_transb(
                    q_ptr,
                    k_base.add(n_off * ldb),
                    score_ptr,
                    1,
                    n,
                    head_size,
                    qkv_cols,
                    ldb,
                    score_stride,
                );
            }

            // Slice softmax plus its statistics.
            let mask_row = self
                .variant
                .mask(attn_mask, b, self.start_q_head + i, shape.seq_len, key_len);
            let score_slice = unsafe { std::slice::from_raw_parts_mut(score_ptr, n) };
            let (slice_max, slice_sum) =
                softmax_with_stats(score_slice, &mask_row[n_off..n_off + n], shape.scale);

            // Slice softmax * slice of V into this task's partial row.
            let (v_base, ldv) = value_cache.head(b, kv_head);
            let partial = unsafe { sharded_out.get().add(stat_idx * head_size) };
            unsafe {
                small_gemm(
                    score_ptr,
                    v_base.add(n_off * ldv),
                    partial,
                    1,
                    head_size,
                    n,
                    score_stride,
                    ldv,
                    head_size,
                );
            }

            stats[stat_idx].publish(slice_max, slice_sum);

            // The slice-0 worker waits for its siblings and reduces.
            if s == 0 {
                for idx in head_start_idx + 1..head_start_idx + splits {
                    stats[idx].wait();
                }
                let mut real_max = f32::NEG_INFINITY;
                for idx in head_start_idx..head_start_idx + splits {
                    real_max = real_max.max(stats[idx].max());
                }
                let mut rev = vec![0.0f32; splits];
                let mut real_sum = 0.0f32;
                for (r, idx) in rev.iter_mut().zip(head_start_idx..head_start_idx + splits) {
                    *r = (stats[idx].max() - real_max).exp();
                    real_sum += stats[idx].sum() * *r;
                }

                let mut acc = vec![0.0f32; head_size];
                for (r, idx) in rev.iter().zip(head_start_idx..head_start_idx + splits) {
                    let factor = r * stats[idx].sum() / real_sum;
                    let p = unsafe {
                        std::slice::from_raw_parts(
                            sharded_out.get().add(idx * head_size),
                            head_size,
                        )
                    };
                    // 16-lane accumulation chunks.
                    for (a_chunk, p_chunk) in acc.chunks_mut(16).zip(p.chunks(16)) {
                        for (a, &v) in a_chunk.iter_mut().zip(p_chunk.iter()) {
                            *a += factor * v;
                        }
                    }
                }

                let out_row = unsafe {
                    std::slice::from_raw_parts_mut(
                        out.get().add(b * q_cols + i * head_size),
                        head_size,
                    )
                };
                for (o, &a) in out_row.iter_mut().zip(acc.iter()) {
                    *o = Im::from_f32(a);
                }
            }
        });
    }

    /// Flash-style attention for long prompts: outer query tiles, inner
    /// key/value tiles, online-softmax state per query row.
    fn flash_attention<KV: Element>(
        &self,
        shape: KernelShape,
        qkv: &[Im],
        attn_split: &mut [Im],
        attn_mask: &[f32],
        present_key: &mut KvCacheTensor<KV>,
        present_value: &mut KvCacheTensor<KV>,
    ) -> Result<()> {
        let resp_heads = self.resp_q_heads();
        let resp_kv = self.resp_kv_heads();
        let head_size = shape.head_size;
        let q_cols = resp_heads * head_size;
        let kv_cols = resp_kv * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;
        let src_len = shape.seq_len;
        let tgt_len = shape.key_len();

        // Attention math runs in f32; reduced-precision intermediates get
        // their K/V converted into a pooled slab first.
        let mut kv_slab;
        let (k_f32, v_f32, kv_stride): (SharedConstPtr<f32>, SharedConstPtr<f32>, usize) =
            if Im::DATA_TYPE == DataType::F32 {
                let base = qkv.as_ptr().cast::<f32>();
                (
                    SharedConstPtr(unsafe { base.add(q_cols) }),
                    SharedConstPtr(unsafe { base.add(q_cols + kv_cols) }),
                    qkv_cols,
                )
            } else {
                let slab_len = shape.batch * src_len * 2 * kv_cols;
                kv_slab = ScratchPool::instance().get_buffer("flashKVBuf", slab_len * 4);
                let slab = kv_slab.as_slice_mut::<f32>(slab_len);
                let stride = 2 * kv_cols;
                let dst = SharedPtr(slab.as_mut_ptr());
                let kv_src = SharedConstPtr(qkv.as_ptr());
                (0..shape.batch * src_len).into_par_iter().for_each(|row| unsafe {
                    let s = kv_src.get().add(row * qkv_cols + q_cols);
                    let d = dst.get().add(row * stride);
                    for c in 0..2 * kv_cols {
                        *d.add(c) = (*s.add(c)).to_f32();
                    }
                });
                (
                    SharedConstPtr(slab.as_ptr()),
                    SharedConstPtr(unsafe { slab.as_ptr().add(kv_cols) }),
                    stride,
                )
            };

        // Tile sizes: outer query block from the nearest power of two below
        // S/2, inner key/value block bounded at 512.
        let min_blk = 1usize << (src_len / 2).max(1).ilog2();
        let src_blk = min_blk.min(256);
        let tgt_blk = tgt_len.min(512);
        let m_blocks = src_len.div_ceil(src_blk);

        let workers = rayon::current_num_threads().max(1);
        let arr_stride = (4 + tgt_blk + head_size) * src_blk;
        let mut thread_buf =
            ScratchPool::instance().get_buffer("threadBuffers", workers * arr_stride * 4);
        let thread_base: SharedPtr<f32> = thread_buf.shared_ptr::<f32>();
        let _ = thread_buf.as_slice_mut::<f32>(workers * arr_stride);

        let q_src = SharedConstPtr(qkv.as_ptr());
        let out = SharedPtr(attn_split.as_mut_ptr());

        (0..shape.batch * resp_heads * m_blocks)
            .into_par_iter()
            .for_each(|task| {
                let b = task / (resp_heads * m_blocks);
                let rest = task % (resp_heads * m_blocks);
                let j = rest / m_blocks;
                let mb = rest % m_blocks;
                let m = mb * src_blk;
                let q_real = src_blk.min(src_len - m);
                let tid = rayon::current_thread_index().unwrap_or(0);

                let buf = unsafe {
                    std::slice::from_raw_parts_mut(
                        thread_base.get().add(tid * arr_stride),
                        arr_stride,
                    )
                };
                let (pre_sum, buf) = buf.split_at_mut(src_blk);
                let (sum, buf) = buf.split_at_mut(src_blk);
                let (pre_max, buf) = buf.split_at_mut(src_blk);
                let (max, buf) = buf.split_at_mut(src_blk);
                let (qk, q_arr) = buf.split_at_mut(src_blk * tgt_blk);

                // Stage the query block in f32 and reset the output rows.
                for r in 0..q_real {
                    let row = (b * src_len + m + r) * qkv_cols + j * head_size;
                    for c in 0..head_size {
                        q_arr[r * head_size + c] =
                            unsafe { (*q_src.get().add(row + c)).to_f32() };
                    }
                    let out_row = unsafe {
                        std::slice::from_raw_parts_mut(
                            out.get().add((b * src_len + m + r) * q_cols + j * head_size),
                            head_size,
                        )
                    };
                    for o in out_row.iter_mut() {
                        *o = Im::zero();
                    }
                }
                for r in 0..q_real {
                    pre_sum[r] = 0.0;
                    sum[r] = 0.0;
                    pre_max[r] = f32::MIN;
                    max[r] = f32::MIN;
                }

                let kv_head = self.kv_head_of(j, shape.group);
                let tgt_base = b * src_len * kv_stride + kv_head * head_size;
                let mask_block =
                    self.variant
                        .mask(attn_mask, b, self.start_q_head + j, src_len, tgt_len);
                let out_ptr =
                    unsafe { out.get().add((b * src_len + m) * q_cols + j * head_size) };

                let mut t = 0;
                while t < tgt_len {
                    let kv_real = tgt_blk.min(tgt_len - t);
                    unsafe {
                        incremental_tile_attention(
                            q_arr.as_ptr(),
                            k_f32.get().add(tgt_base + t * kv_stride),
                            v_f32.get().add(tgt_base + t * kv_stride),
                            mask_block.as_ptr().add(m * tgt_len + t),
                            q_real,
                            head_size,
                            kv_real,
                            tgt_len,
                            &mut pre_sum[..q_real],
                            &mut sum[..q_real],
                            &mut pre_max[..q_real],
                            &mut max[..q_real],
                            shape.scale,
                            qk,
                            out_ptr,
                            head_size,
                            kv_stride,
                            kv_stride,
                            q_cols,
                        );
                    }
                    t += tgt_blk;
                }

                // Final normalization by the accumulated exp-sum.
                for r in 0..q_real {
                    let inv = 1.0 / sum[r];
                    let out_row = unsafe {
                        std::slice::from_raw_parts_mut(
                            out.get().add((b * src_len + m + r) * q_cols + j * head_size),
                            head_size,
                        )
                    };
                    for o in out_row.iter_mut() {
                        *o = Im::from_f32(o.to_f32() * inv);
                    }
                }
            });

        // Write the current K/V back to the caches after the kernel.
        self.copy_kv_cache(shape, qkv, present_key, present_value);

        Ok(())
    }

    /// Specialized self-attention for all-bf16 layers on short prefills.
    /// Implicit causal masking; requires equal responsible Q and KV heads.
    fn self_attention_bf16<KV: Element>(
        &self,
        shape: KernelShape,
        qkv: &[Im],
        attn_split: &mut [Im],
        present_key: &mut KvCacheTensor<KV>,
        present_value: &mut KvCacheTensor<KV>,
    ) -> Result<()> {
        let resp_q = self.resp_q_heads();
        let resp_kv = self.resp_kv_heads();
        if resp_q != resp_kv {
            return Err(InferirError::UnsupportedOperation {
                operation: "self_attention_bf16".to_string(),
                reason: format!("{resp_q} query heads vs {resp_kv} KV heads per worker"),
            });
        }
        let head_size = shape.head_size;
        let seq_len = shape.seq_len;
        let q_cols = resp_q * head_size;
        let kv_cols = resp_kv * head_size;
        let qkv_cols = q_cols + 2 * kv_cols;

        let key_cache = CacheRef::new(present_key);
        let value_cache = CacheRef::new(present_value);
        let src = SharedConstPtr(qkv.as_ptr());
        let out = SharedPtr(attn_split.as_mut_ptr());

        (0..shape.batch * resp_q).into_par_iter().for_each(|task| {
            let b = task / resp_q;
            let h = task % resp_q;

            // Write this head's K/V into the caches first; the causal scan
            // below reads them back as the key/value operand.
            for seq in 0..seq_len {
                let row = (b * seq_len + seq) * qkv_cols;
                unsafe {
                    let k_src = src.get().add(row + q_cols + h * head_size);
                    let v_src = src.get().add(row + q_cols + kv_cols + h * head_size);
                    key_cache.store_row(seq, b, h, k_src, head_size);
                    value_cache.store_row(seq, b, h, v_src, head_size);
                }
            }

            let (k_base, ldk) = key_cache.head(b, h);
            let (v_base, ldv) = value_cache.head(b, h);
            let mut scores = vec![0.0f32; seq_len];
            let mut acc = vec![0.0f32; head_size];
            for s in 0..seq_len {
                let q_row = unsafe {
                    std::slice::from_raw_parts(
                        src.get().add((b * seq_len + s) * qkv_cols + h * head_size),
                        head_size,
                    )
                };
                // Causal: keys 0..=s only.
                let visible = s + 1;
                for (t, score) in scores[..visible].iter_mut().enumerate() {
                    let k_row =
                        unsafe { std::slice::from_raw_parts(k_base.add(t * ldk), head_size) };
                    let mut dot = 0.0f32;
                    for l in 0..head_size {
                        dot += q_row[l].to_f32() * k_row[l].to_f32();
                    }
                    *score = dot * shape.scale;
                }
                let row_max = scores[..visible].iter().cloned().fold(f32::MIN, f32::max);
                let mut total = 0.0f32;
                for v in scores[..visible].iter_mut() {
                    *v = (*v - row_max).exp();
                    total += *v;
                }
                let inv = 1.0 / total;

                acc.fill(0.0);
                for t in 0..visible {
                    let w = scores[t] * inv;
                    let v_row =
                        unsafe { std::slice::from_raw_parts(v_base.add(t * ldv), head_size) };
                    for (a, vv) in acc.iter_mut().zip(v_row.iter()) {
                        *a += w * vv.to_f32();
                    }
                }
                let out_row = unsafe {
                    std::slice::from_raw_parts_mut(
                        out.get().add((b * seq_len + s) * q_cols + h * head_size),
                        head_size,
                    )
                };
                for (o, &a) in out_row.iter_mut().zip(acc.iter()) {
                    *o = Im::from_f32(a);
                }
            }
        });

        Ok(())
    }
}

/// Concatenate the owned Q/K/V column ranges in the source layout.
///
/// With `trans` the sources are `[out, in]` and the owned ranges are
/// contiguous row blocks; otherwise each of the `hidden` rows interleaves its
/// three column slices.
#[allow(clippy::too_many_arguments)]
fn concat_qkv_columns<T: Copy>(
    trans: bool,
    hidden: usize,
    q: &[T],
    k: &[T],
    v: &[T],
    q_total: usize,
    kv_total: usize,
    q_range: (usize, usize),
    kv_range: (usize, usize),
) -> Vec<T> {
    let (q_off, q_cols) = q_range;
    let (kv_off, kv_cols) = kv_range;
    let resp_cols = q_cols + 2 * kv_cols;
    let mut merged = Vec::with_capacity(hidden * resp_cols);
    if trans {
        merged.extend_from_slice(&q[q_off * hidden..(q_off + q_cols) * hidden]);
        merged.extend_from_slice(&k[kv_off * hidden..(kv_off + kv_cols) * hidden]);
        merged.extend_from_slice(&v[kv_off * hidden..(kv_off + kv_cols) * hidden]);
    } else {
        for r in 0..hidden {
            merged.extend_from_slice(&q[r * q_total + q_off..r * q_total + q_off + q_cols]);
            merged.extend_from_slice(&k[r * kv_total + kv_off..r * kv_total + kv_off + kv_cols]);
            merged.extend_from_slice(&v[r * kv_total + kv_off..r * kv_total + kv_off + kv_cols]);
        }
    }
    merged
}

/// Concatenate per-column metadata slices for the merged QKV weight.
fn concat_metadata(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    q_range: (usize, usize),
    kv_range: (usize, usize),
) -> Vec<f32> {
    let mut merged = Vec::with_capacity(q_range.1 + 2 * kv_range.1);
    merged.extend_from_slice(&q[q_range.0..q_range.0 + q_range.1]);
    merged.extend_from_slice(&k[kv_range.0..kv_range.0 + kv_range.1]);
    merged.extend_from_slice(&v[kv_range.0..kv_range.0 + kv_range.1]);
    merged
}

/// Per-slice streaming statistics for the head-sharded reduction.
struct SliceStat {
    max: AtomicU32,
    sum: AtomicU32,
    finished: AtomicU32,
}

impl SliceStat {
    fn new() -> Self {
        Self {
            max: AtomicU32::new(f32::MIN.to_bits()),
            sum: AtomicU32::new(0),
            finished: AtomicU32::new(0),
        }
    }

    fn publish(&self, max: f32, sum: f32) {
        self.max.store(max.to_bits(), Ordering::Relaxed);
        self.sum.store(sum.to_bits(), Ordering::Relaxed);
        self.finished.store(1, Ordering::Release);
    }

    fn wait(&self) {
        while self.finished.load(Ordering::Acquire) == 0 {
            std::hint::spin_loop();
        }
    }

    fn max(&self) -> f32 {
        f32::from_bits(self.max.load(Ordering::Relaxed))
    }

    fn sum(&self) -> f32 {
        f32::from_bits(self.sum.load(Ordering::Relaxed))
    }
}

/// Pointer-level handle on a KV cache for disjoint parallel writes and
/// concurrent head-view reads inside one kernel.
#[derive(Clone, Copy)]
struct CacheRef<KV> {
    ptr: SharedPtr<KV>,
    batch: usize,
    heads: usize,
    head_size: usize,
}

impl<KV: Element> CacheRef<KV> {
    fn new(cache: &mut KvCacheTensor<KV>) -> Self {
        let batch = cache.batch();
        let heads = cache.heads();
        let head_size = cache.head_size();
        Self {
            ptr: cache.shared_ptr(),
            batch,
            heads,
            head_size,
        }
    }

    #[inline]
    fn offset(&self, pos: usize, b: usize, h: usize) -> usize {
        ((pos * self.batch + b) * self.heads + h) * self.head_size
    }

    #[inline]
    fn seq_stride(&self) -> usize {
        self.batch * self.heads * self.head_size
    }

    /// Base pointer and row stride spanning all positions of `(b, h)`.
    #[inline]
    fn head(&self, b: usize, h: usize) -> (*const KV, usize) {
        (
            unsafe { self.ptr.get().add(self.offset(0, b, h)).cast_const() },
            self.seq_stride(),
        )
    }

    /// Convert-store one head vector at `(pos, b, h)`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` elements and no other task may write
    /// the same `(pos, b, h)` triple concurrently.
    #[inline]
    unsafe fn store_row<S: Element>(
        &self,
        pos: usize,
        b: usize,
        h: usize,
        src: *const S,
        len: usize,
    ) {
        unsafe {
            let dst = self.ptr.get().add(self.offset(pos, b, h));
            for c in 0..len {
                *dst.add(c) = KV::from_f32((*src.add(c)).to_f32());
            }
        }
    }
}
