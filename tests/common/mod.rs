//! Shared helpers for the integration suites: deterministic weight
//! generation, mask builders, and a naive f32 reference for one attention
//! layer (projections, rotary, per-head softmax attention, output projection
//! with residual).

#![allow(dead_code)]

use inferir::context::{ActivationKind, DecoderContext};
use inferir::rotary::RotaryEmbedding;

/// Layer hyperparameters for a test.
#[derive(Clone, Copy)]
pub struct Hp {
    pub hidden: usize,
    pub head_size: usize,
    pub q_heads: usize,
    pub kv_heads: usize,
    pub batch: usize,
    pub eps: f32,
}

impl Hp {
    pub fn q_dim(&self) -> usize {
        self.q_heads * self.head_size
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_heads * self.head_size
    }

    pub fn ctx(&self, num_threads: usize, num_split: usize, split_idx: usize) -> DecoderContext {
        DecoderContext::new(
            1,
            self.hidden,
            self.q_heads,
            self.kv_heads,
            self.head_size,
            4 * self.hidden,
            4096,
            4096,
            self.eps,
            num_threads,
            num_split,
            split_idx,
            1,
            ActivationKind::Silu,
        )
        .unwrap()
    }
}

/// Full weight set for one attention layer, untransposed layouts.
pub struct LayerWeights {
    /// `[H, Q*D]`
    pub wq: Vec<f32>,
    /// `[H, K*D]`
    pub wk: Vec<f32>,
    /// `[H, K*D]`
    pub wv: Vec<f32>,
    /// `[Q*D, H]`
    pub wo: Vec<f32>,
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub out_bias: Vec<f32>,
}

/// Small deterministic pseudo-random stream.
pub fn pseudo(seed: u64, n: usize) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // roughly uniform in [-0.1, 0.1]
            ((state % 2048) as f32 / 1024.0 - 1.0) * 0.1
        })
        .collect()
}

pub fn layer_weights(hp: &Hp, seed: u64) -> LayerWeights {
    LayerWeights {
        wq: pseudo(seed, hp.hidden * hp.q_dim()),
        wk: pseudo(seed + 1, hp.hidden * hp.kv_dim()),
        wv: pseudo(seed + 2, hp.hidden * hp.kv_dim()),
        wo: pseudo(seed + 3, hp.q_dim() * hp.hidden),
        gamma: vec![1.0; hp.hidden],
        // Nonzero shift keeps all-ones inputs meaningful after LayerNorm.
        beta: pseudo(seed + 5, hp.hidden),
        out_bias: pseudo(seed + 4, hp.hidden),
    }
}

/// Additive causal mask `[B, S, P+S]`: position `t` is visible to query `s`
/// when `t <= past + s`.
pub fn causal_mask(batch: usize, seq: usize, past: usize) -> Vec<f32> {
    let tgt = past + seq;
    let mut mask = vec![0.0f32; batch * seq * tgt];
    for b in 0..batch {
        for s in 0..seq {
            for t in 0..tgt {
                if t > past + s {
                    mask[(b * seq + s) * tgt + t] = f32::NEG_INFINITY;
                }
            }
        }
    }
    mask
}

/// Reference outputs of one full-prefill attention layer.
pub struct RefOutput {
    /// `[B*S, H]`: projection plus residual plus bias
    pub output: Vec<f32>,
    /// `[B*S, K*D]`: rotated key projections (what the cache should hold)
    pub k_proj: Vec<f32>,
    /// `[B*S, K*D]`: value projections
    pub v_proj: Vec<f32>,
}

/// Naive f32 forward of one attention layer with `past = 0`, using the same
/// rotary tables as the blocks. `with_bias` folds `out_bias`.
pub fn reference_attention(
    hp: &Hp,
    w: &LayerWeights,
    input: &[f32],
    mask: &[f32],
    seq: usize,
    scale: f32,
    with_bias: bool,
) -> RefOutput {
    let rows = hp.batch * seq;
    let h = hp.hidden;
    let qd = hp.q_dim();
    let kvd = hp.kv_dim();
    let d = hp.head_size;
    let group = hp.q_heads / hp.kv_heads;

    // LayerNorm
    let mut normed = vec![0.0f32; rows * h];
    for r in 0..rows {
        let src = &input[r * h..(r + 1) * h];
        let mean: f32 = src.iter().sum::<f32>() / h as f32;
        let var: f32 = src.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / h as f32;
        let inv = 1.0 / (var + hp.eps).sqrt();
        for j in 0..h {
            normed[r * h + j] = (src[j] - mean) * inv * w.gamma[j] + w.beta[j];
        }
    }

    // Projections
    let matmul = |a: &[f32], b: &[f32], n: usize| -> Vec<f32> {
        let mut c = vec![0.0f32; rows * n];
        for r in 0..rows {
            for j in 0..n {
                let mut acc = 0.0f32;
                for l in 0..h {
                    acc += a[r * h + l] * b[l * n + j];
                }
                c[r * n + j] = acc;
            }
        }
        c
    };
    let q = matmul(&normed, &w.wq, qd);
    let k = matmul(&normed, &w.wk, kvd);
    let v = matmul(&normed, &w.wv, kvd);

    // Rotary, through the same tables the blocks use.
    let rot = RotaryEmbedding::new(d, 4096);
    let stride = qd + kvd;
    let mut qk = vec![0.0f32; rows * stride];
    for r in 0..rows {
        qk[r * stride..r * stride + qd].copy_from_slice(&q[r * qd..(r + 1) * qd]);
        qk[r * stride + qd..(r + 1) * stride].copy_from_slice(&k[r * kvd..(r + 1) * kvd]);
    }
    let ids: Vec<usize> = (0..seq).collect();
    rot.forward(
        &mut qk,
        0,
        qd,
        stride,
        stride,
        inferir::rotary::RotaryShape {
            batch: hp.batch,
            seq_len: seq,
            q_heads: hp.q_heads,
            head_size: d,
            kv_heads: hp.kv_heads,
            max_seq_len: 4096,
            past_seq_len: 0,
        },
        &ids,
    );
    let mut q_rot = vec![0.0f32; rows * qd];
    let mut k_rot = vec![0.0f32; rows * kvd];
    for r in 0..rows {
        q_rot[r * qd..(r + 1) * qd].copy_from_slice(&qk[r * stride..r * stride + qd]);
        k_rot[r * kvd..(r + 1) * kvd].copy_from_slice(&qk[r * stride + qd..(r + 1) * stride]);
    }

    // Per-head scaled-dot attention with the supplied mask.
    let mut attn = vec![0.0f32; rows * qd];
    for b in 0..hp.batch {
        for head in 0..hp.q_heads {
            let kvh = head / group;
            for s in 0..seq {
                let q_row = &q_rot[(b * seq + s) * qd + head * d..][..d];
                let mut scores = vec![0.0f32; seq];
                for (t, sc) in scores.iter_mut().enumerate() {
                    let k_row = &k_rot[(b * seq + t) * kvd + kvh * d..][..d];
                    let dot: f32 = q_row.iter().zip(k_row.iter()).map(|(a, b)| a * b).sum();
                    *sc = dot * scale + mask[(b * seq + s) * seq + t];
                }
                let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let mut total = 0.0f32;
                for sc in scores.iter_mut() {
                    *sc = (*sc - max).exp();
                    total += *sc;
                }
                let out_row = &mut attn[(b * seq + s) * qd + head * d..][..d];
                for t in 0..seq {
                    let wgt = scores[t] / total;
                    let v_row = &v[(b * seq + t) * kvd + kvh * d..][..d];
                    for (o, vv) in out_row.iter_mut().zip(v_row.iter()) {
                        *o += wgt * vv;
                    }
                }
            }
        }
    }

    // Output projection + residual (+ bias).
    let mut output = vec![0.0f32; rows * h];
    for r in 0..rows {
        for j in 0..h {
            let mut acc = input[r * h + j];
            if with_bias {
                acc += w.out_bias[j];
            }
            for l in 0..qd {
                acc += attn[r * qd + l] * w.wo[l * h + j];
            }
            output[r * h + j] = acc;
        }
    }

    RefOutput {
        output,
        k_proj: k_rot,
        v_proj: v,
    }
}

/// Max absolute difference between two slices.
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

/// Cosine distance `1 - a.b / (|a||b|)`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    1.0 - dot / (na * nb).max(1e-20)
}
