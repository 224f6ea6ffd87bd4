//! Softmax kernels for the attention paths
//!
//! Three flavors back the three attention kernels:
//! - [`softmax_scaled_masked`]: one full row, used between the two GEMMs of
//!   the fused tiled kernel,
//! - [`softmax_with_stats`]: one key-length slice, returning the streaming
//!   statistics the head-sharded reduction revises with,
//! - [`incremental_tile_attention`]: the online-softmax tile update of the
//!   flash kernel.
//!
//! The attention scaling factor and the additive mask are applied inside,
//! before exponentiation.

use crate::dtype::Element;

/// In-place softmax of `scale * row + mask`.
pub fn softmax_scaled_masked(row: &mut [f32], mask: &[f32], scale: f32) {
    debug_assert!(mask.len() >= row.len());
    let mut max = f32::NEG_INFINITY;
    for (v, &m) in row.iter_mut().zip(mask.iter()) {
        *v = v.mul_add(scale, m);
        if *v > max {
            max = *v;
        }
    }
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv_sum = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= inv_sum;
    }
}

/// In-place softmax of `scale * row + mask`, returning `(max, exp_sum)` of the
/// scaled-and-masked values. The row is left fully normalized; the statistics
/// let a reducer combine independently softmaxed slices of one logical row.
pub fn softmax_with_stats(row: &mut [f32], mask: &[f32], scale: f32) -> (f32, f32) {
    debug_assert!(mask.len() >= row.len());
    let mut max = f32::NEG_INFINITY;
    for (v, &m) in row.iter_mut().zip(mask.iter()) {
        *v = v.mul_add(scale, m);
        if *v > max {
            max = *v;
        }
    }
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv_sum = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= inv_sum;
    }
    (max, sum)
}

/// One tile update of the online-softmax attention recurrence.
///
/// For each of the `m` query rows, with this tile's scores
/// `S = scale * (q * k_tile^T) + mask_tile`:
///
/// ```text
/// new_max = max(pre_max, row_max(S))
/// alpha   = exp(pre_max - new_max)
/// beta_j  = exp(S_j - new_max)
/// out     = alpha * out + beta * V_tile
/// sum     = alpha * pre_sum + sum(beta)
/// ```
///
/// The caller divides `out` by `sum` after the last tile.
///
/// # Safety
///
/// `q` (`m x head_size`, stride `ldq`), `k`/`v` (`kv_blk x head_size`,
/// strides `ldk`/`ldv`), `mask` (`m` rows of stride `mask_stride`) and `out`
/// (`m x head_size`, stride `ldo`) must all be valid; `out` must not alias
/// the inputs. `qk_scratch` must hold at least `kv_blk` elements.
#[allow(clippy::too_many_arguments)]
pub unsafe fn incremental_tile_attention<TK: Element, TO: Element>(
    q: *const f32,
    k: *const TK,
    v: *const TK,
    mask: *const f32,
    m: usize,
    head_size: usize,
    kv_blk: usize,
    mask_stride: usize,
    pre_sum: &mut [f32],
    sum: &mut [f32],
    pre_max: &mut [f32],
    max: &mut [f32],
    scale: f32,
    qk_scratch: &mut [f32],
    out: *mut TO,
    ldq: usize,
    ldk: usize,
    ldv: usize,
    ldo: usize,
) {
    debug_assert!(qk_scratch.len() >= kv_blk);
    unsafe {
        for i in 0..m {
            let q_row = std::slice::from_raw_parts(q.add(i * ldq), head_size);
            let mask_row = std::slice::from_raw_parts(mask.add(i * mask_stride), kv_blk);
            let scores = &mut qk_scratch[..kv_blk];

            let mut row_max = f32::NEG_INFINITY;
            for (j, s) in scores.iter_mut().enumerate() {
                let k_row = std::slice::from_raw_parts(k.add(j * ldk), head_size);
                let mut acc = 0.0f32;
                for l in 0..head_size {
                    acc += q_row[l] * k_row[l].to_f32();
                }
                *s = acc.mul_add(scale, mask_row[j]);
                if *s > row_max {
                    row_max = *s;
                }
            }

            let new_max = pre_max[i].max(row_max);
            let alpha = (pre_max[i] - new_max).exp();

            let out_row = std::slice::from_raw_parts_mut(out.add(i * ldo), head_size);
            if alpha != 1.0 {
                for o in out_row.iter_mut() {
                    *o = TO::from_f32(o.to_f32() * alpha);
                }
            }

            let mut beta_sum = 0.0f32;
            for (j, s) in scores.iter_mut().enumerate() {
                let beta = (*s - new_max).exp();
                beta_sum += beta;
                if beta == 0.0 {
                    continue;
                }
                let v_row = std::slice::from_raw_parts(v.add(j * ldv), head_size);
                for (o, val) in out_row.iter_mut().zip(v_row.iter()) {
                    *o = TO::from_f32(beta.mul_add(val.to_f32(), o.to_f32()));
                }
            }

            sum[i] = alpha.mul_add(pre_sum[i], beta_sum);
            max[i] = new_max;
            pre_sum[i] = sum[i];
            pre_max[i] = new_max;
        }
    }
}
