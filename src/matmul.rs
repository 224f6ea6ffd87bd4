//! Weight conversion, packing and the fused matmul family
//!
//! Projections in the decoder layer run through a [`MatmulEngine`] that owns
//! the weight element type for a model: weights arrive as float or
//! pre-quantized int8, get converted into a canonical `[K, N]` layout
//! (quantizing per output column when the target type asks for it), then get
//! packed column-major so each output column streams contiguously against an
//! activation row.
//!
//! The compute entry points mirror the fused post-ops the layer needs:
//! plain, `+bias`, `+bias +residual`, `+bias +gamma*residual`, `silu(..)` and
//! `(..) * prev` for the gate/up multiply.

use rayon::prelude::*;

use half::{bf16, f16};

use crate::dtype::{pack_u4, unpack_u4, DataType, Element};
use crate::error::{InferirError, Result};
use crate::matrix::{SharedConstPtr, SharedPtr};

/// Output-column tile width for the parallel compute loops.
const OUTPUT_TILE: usize = 64;

/// Caller-held weight data entering conversion.
pub enum RawWeight<'a> {
    /// Float weights
    F32(&'a [f32]),
    /// Pre-quantized signed 8-bit weights with per-column scale and zero point
    Int8 {
        /// Quantized values
        data: &'a [i8],
        /// Per-column scale
        scale: &'a [f32],
        /// Per-column zero point (quantized domain)
        zero: &'a [f32],
    },
}

#[derive(Clone, Debug)]
enum Payload {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
    F16(Vec<f16>),
    Int8(Vec<i8>),
    // Row-major in ConvertedWeight (each row `bytes_for(cols)` bytes),
    // column-major in PackedWeight (each column `bytes_for(rows)` bytes).
    Uint4(Vec<u8>),
}

/// Canonical `[K, N]` row-major weight in the engine's element type, with
/// per-column quantization companions (empty for float types).
pub struct ConvertedWeight {
    rows: usize,
    cols: usize,
    dtype: DataType,
    payload: Payload,
    scale: Vec<f32>,
    zero: Vec<f32>,
    col_sum: Vec<f32>,
}

impl ConvertedWeight {
    /// K dimension.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// N dimension.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Per-column scales (empty for float weights).
    #[must_use]
    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    /// Per-column zero points (empty for float weights).
    #[must_use]
    pub fn zero(&self) -> &[f32] {
        &self.zero
    }

    /// Per-column sums of quantized values (empty for float weights).
    #[must_use]
    pub fn col_sum(&self) -> &[f32] {
        &self.col_sum
    }

    /// Concatenate two converted weights along the column dimension.
    /// Both must share the row count and element type. For nibble-packed
    /// weights the left operand's column count must be even so rows stay
    /// byte-aligned.
    pub fn concat_cols(left: &ConvertedWeight, right: &ConvertedWeight) -> Result<ConvertedWeight> {
        if left.rows != right.rows || left.dtype != right.dtype {
            return Err(InferirError::ShapeMismatch {
                expected: vec![left.rows, left.cols],
                actual: vec![right.rows, right.cols],
            });
        }
        let rows = left.rows;
        let cols = left.cols + right.cols;
        let payload = match (&left.payload, &right.payload) {
            (Payload::F32(a), Payload::F32(b)) => {
                Payload::F32(interleave_rows(a, b, rows, left.cols, right.cols))
            }
            (Payload::Bf16(a), Payload::Bf16(b)) => {
                Payload::Bf16(interleave_rows(a, b, rows, left.cols, right.cols))
            }
            (Payload::F16(a), Payload::F16(b)) => {
                Payload::F16(interleave_rows(a, b, rows, left.cols, right.cols))
            }
            (Payload::Int8(a), Payload::Int8(b)) => {
                Payload::Int8(interleave_rows(a, b, rows, left.cols, right.cols))
            }
            (Payload::Uint4(a), Payload::Uint4(b)) => {
                // Two values per byte: strides halve, so both column counts
                // must be even to keep the packed rows byte-aligned.
                if left.cols % 2 != 0 || right.cols % 2 != 0 {
                    return Err(InferirError::InvalidShape {
                        reason: format!(
                            "4-bit concat needs even column counts, got {} and {}",
                            left.cols, right.cols
                        ),
                    });
                }
                Payload::Uint4(interleave_rows(a, b, rows, left.cols / 2, right.cols / 2))
            }
            _ => {
                return Err(InferirError::UnsupportedOperation {
                    operation: "concat_cols".to_string(),
                    reason: "mismatched weight payloads".to_string(),
                })
            }
        };
        let mut scale = left.scale.clone();
        scale.extend_from_slice(&right.scale);
        let mut zero = left.zero.clone();
        zero.extend_from_slice(&right.zero);
        let mut col_sum = left.col_sum.clone();
        col_sum.extend_from_slice(&right.col_sum);
        Ok(ConvertedWeight {
            rows,
            cols,
            dtype: left.dtype,
            payload,
            scale,
            zero,
            col_sum,
        })
    }
}

fn interleave_rows<T: Copy>(a: &[T], b: &[T], rows: usize, a_cols: usize, b_cols: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(rows * (a_cols + b_cols));
    for r in 0..rows {
        out.extend_from_slice(&a[r * a_cols..(r + 1) * a_cols]);
        out.extend_from_slice(&b[r * b_cols..(r + 1) * b_cols]);
    }
    out
}

/// Matmul-ready weight: column-major payload plus quantization companions.
#[derive(Debug)]
pub struct PackedWeight {
    rows: usize,
    cols: usize,
    dtype: DataType,
    payload: Payload,
    scale: Vec<f32>,
    zero: Vec<f32>,
    col_sum: Vec<f32>,
}

/// Converts and packs weights for a fixed weight element type.
pub struct MatmulEngine {
    weight_type: DataType,
}

impl MatmulEngine {
    /// Create an engine for the given weight element type.
    pub fn new(weight_type: DataType) -> Result<Self> {
        Ok(Self { weight_type })
    }

    /// Weight element type this engine produces.
    #[must_use]
    pub fn weight_type(&self) -> DataType {
        self.weight_type
    }

    /// Convert a full weight. `trans` means the source is `[cols, rows]`
    /// (each output column's K values contiguous, the PyTorch layout);
    /// otherwise it is `[rows, cols]`.
    pub fn convert_weight(
        &self,
        trans: bool,
        rows: usize,
        cols: usize,
        src: &RawWeight<'_>,
    ) -> Result<ConvertedWeight> {
        self.convert_weight_split(trans, rows, cols, src, 0, cols, true)
    }

    /// Convert a slice of a weight. With `vertical` the slice keeps columns
    /// `[offset, offset + count)`; otherwise it keeps that range of rows.
    #[allow(clippy::too_many_arguments)]
    pub fn convert_weight_split(
        &self,
        trans: bool,
        rows: usize,
        cols: usize,
        src: &RawWeight<'_>,
        offset: usize,
        count: usize,
        vertical: bool,
    ) -> Result<ConvertedWeight> {
        let (out_rows, out_cols, row_off, col_off) = if vertical {
            if offset + count > cols {
                return Err(InferirError::InvalidShape {
                    reason: format!("column slice {offset}+{count} exceeds {cols}"),
                });
            }
            (rows, count, 0, offset)
        } else {
            if offset + count > rows {
                return Err(InferirError::InvalidShape {
                    reason: format!("row slice {offset}+{count} exceeds {rows}"),
                });
            }
            (count, cols, offset, 0)
        };

        match src {
            RawWeight::F32(data) => {
                if data.len() < rows * cols {
                    return Err(InferirError::InvalidShape {
                        reason: format!("weight buffer holds {} < {rows}x{cols}", data.len()),
                    });
                }
                // Stage the slice as canonical [out_rows, out_cols] f32.
                let mut staging = vec![0.0f32; out_rows * out_cols];
                for k in 0..out_rows {
                    for n in 0..out_cols {
                        let (sk, sn) = (k + row_off, n + col_off);
                        staging[k * out_cols + n] = if trans {
                            data[sn * rows + sk]
                        } else {
                            data[sk * cols + sn]
                        };
                    }
                }
                Ok(self.quantize_staging(out_rows, out_cols, &staging))
            }
            RawWeight::Int8 { data, scale, zero } => {
                if self.weight_type != DataType::Int8 {
                    return Err(InferirError::UnsupportedOperation {
                        operation: "convert_weight".to_string(),
                        reason: "int8 sources require an int8 weight type".to_string(),
                    });
                }
                if data.len() < rows * cols || scale.len() < cols || zero.len() < cols {
                    return Err(InferirError::InvalidShape {
                        reason: "int8 weight or metadata too small".to_string(),
                    });
                }
                let mut q = vec![0i8; out_rows * out_cols];
                for k in 0..out_rows {
                    for n in 0..out_cols {
                        let (sk, sn) = (k + row_off, n + col_off);
                        q[k * out_cols + n] = if trans {
                            data[sn * rows + sk]
                        } else {
                            data[sk * cols + sn]
                        };
                    }
                }
                let out_scale = scale[col_off..col_off + out_cols].to_vec();
                let out_zero = zero[col_off..col_off + out_cols].to_vec();
                let col_sum = int8_col_sums(&q, out_rows, out_cols);
                Ok(ConvertedWeight {
                    rows: out_rows,
                    cols: out_cols,
                    dtype: DataType::Int8,
                    payload: Payload::Int8(q),
                    scale: out_scale,
                    zero: out_zero,
                    col_sum,
                })
            }
        }
    }

    fn quantize_staging(&self, rows: usize, cols: usize, staging: &[f32]) -> ConvertedWeight {
        match self.weight_type {
            DataType::F32 => ConvertedWeight {
                rows,
                cols,
                dtype: DataType::F32,
                payload: Payload::F32(staging.to_vec()),
                scale: Vec::new(),
                zero: Vec::new(),
                col_sum: Vec::new(),
            },
            DataType::Bf16 => ConvertedWeight {
                rows,
                cols,
                dtype: DataType::Bf16,
                payload: Payload::Bf16(staging.iter().map(|&v| bf16::from_f32(v)).collect()),
                scale: Vec::new(),
                zero: Vec::new(),
                col_sum: Vec::new(),
            },
            DataType::F16 => ConvertedWeight {
                rows,
                cols,
                dtype: DataType::F16,
                payload: Payload::F16(staging.iter().map(|&v| f16::from_f32(v)).collect()),
                scale: Vec::new(),
                zero: Vec::new(),
                col_sum: Vec::new(),
            },
            DataType::Int8 => {
                let mut q = vec![0i8; rows * cols];
                let mut scale = vec![0.0f32; cols];
                let mut zero = vec![0.0f32; cols];
                for n in 0..cols {
                    let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
                    for k in 0..rows {
                        let v = staging[k * cols + n];
                        min = min.min(v);
                        max = max.max(v);
                    }
                    let range = (max - min).max(1e-8);
                    let s = range / 255.0;
                    let z = (-128.0 - min / s).round();
                    scale[n] = s;
                    zero[n] = z;
                    for k in 0..rows {
                        let v = (staging[k * cols + n] / s + z).round().clamp(-128.0, 127.0);
                        q[k * cols + n] = v as i8;
                    }
                }
                let col_sum = int8_col_sums(&q, rows, cols);
                ConvertedWeight {
                    rows,
                    cols,
                    dtype: DataType::Int8,
                    payload: Payload::Int8(q),
                    scale,
                    zero,
                    col_sum,
                }
            }
            DataType::Uint4x2 => {
                let bytes_per_row = DataType::Uint4x2.bytes_for(cols);
                let mut q = vec![0u8; rows * bytes_per_row];
                let mut scale = vec![0.0f32; cols];
                let mut zero = vec![0.0f32; cols];
                let mut col_sum = vec![0.0f32; cols];
                for n in 0..cols {
                    let (mut min, mut max) = (f32::INFINITY, f32::NEG_INFINITY);
                    for k in 0..rows {
                        let v = staging[k * cols + n];
                        min = min.min(v);
                        max = max.max(v);
                    }
                    let range = (max - min).max(1e-8);
                    let s = range / 15.0;
                    let z = (-min / s).round().clamp(0.0, 15.0);
                    scale[n] = s;
                    zero[n] = z;
                    let mut sum = 0.0f32;
                    for k in 0..rows {
                        let v = (staging[k * cols + n] / s + z).round().clamp(0.0, 15.0) as u8;
                        pack_u4(&mut q[k * bytes_per_row..(k + 1) * bytes_per_row], n, v);
                        sum += f32::from(v);
                    }
                    col_sum[n] = sum;
                }
                ConvertedWeight {
                    rows,
                    cols,
                    dtype: DataType::Uint4x2,
                    payload: Payload::Uint4(q),
                    scale,
                    zero,
                    col_sum,
                }
            }
        }
    }

    /// Re-layout a converted weight column-major so each output column
    /// streams contiguously against an activation row.
    #[must_use]
    pub fn pack_weight(&self, conv: &ConvertedWeight) -> PackedWeight {
        let (rows, cols) = (conv.rows, conv.cols);
        let payload = match &conv.payload {
            Payload::F32(w) => Payload::F32(transpose(w, rows, cols)),
            Payload::Bf16(w) => Payload::Bf16(transpose(w, rows, cols)),
            Payload::F16(w) => Payload::F16(transpose(w, rows, cols)),
            Payload::Int8(w) => Payload::Int8(transpose(w, rows, cols)),
            Payload::Uint4(w) => {
                let src_row_bytes = DataType::Uint4x2.bytes_for(cols);
                let dst_col_bytes = DataType::Uint4x2.bytes_for(rows);
                let mut out = vec![0u8; cols * dst_col_bytes];
                for n in 0..cols {
                    let col = &mut out[n * dst_col_bytes..(n + 1) * dst_col_bytes];
                    for k in 0..rows {
                        let v = unpack_u4(&w[k * src_row_bytes..(k + 1) * src_row_bytes], n);
                        pack_u4(col, k, v);
                    }
                }
                Payload::Uint4(out)
            }
        };
        PackedWeight {
            rows,
            cols,
            dtype: conv.dtype,
            payload,
            scale: conv.scale.clone(),
            zero: conv.zero.clone(),
            col_sum: conv.col_sum.clone(),
        }
    }
}

fn transpose<T: Copy + Default>(w: &[T], rows: usize, cols: usize) -> Vec<T> {
    let mut out = vec![T::default(); rows * cols];
    for k in 0..rows {
        for n in 0..cols {
            out[n * rows + k] = w[k * cols + n];
        }
    }
    out
}

fn int8_col_sums(q: &[i8], rows: usize, cols: usize) -> Vec<f32> {
    let mut sums = vec![0.0f32; cols];
    for k in 0..rows {
        for n in 0..cols {
            sums[n] += f32::from(q[k * cols + n]);
        }
    }
    sums
}

/// Elementwise finisher applied to each accumulated output value.
#[derive(Clone, Copy)]
enum Finish<TR> {
    Plain,
    Bias(SharedConstPtr<f32>),
    Residual {
        bias: Option<SharedConstPtr<f32>>,
        res: SharedConstPtr<TR>,
        ldr: usize,
        gamma: f32,
    },
    Silu,
    MulPrev,
}

impl PackedWeight {
    /// K dimension.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// N dimension.
    #[must_use]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element type of the packed payload.
    #[must_use]
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Per-column scales (empty for float weights).
    #[must_use]
    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    /// Per-column zero points (empty for float weights).
    #[must_use]
    pub fn zero(&self) -> &[f32] {
        &self.zero
    }

    /// Per-column sums of quantized values (empty for float weights).
    #[must_use]
    pub fn col_sum(&self) -> &[f32] {
        &self.col_sum
    }

    /// `C = alpha * A * W + beta * C`
    pub fn compute<TA: Element, TC: Element>(
        &self,
        m: usize,
        alpha: f32,
        a: &[TA],
        lda: usize,
        beta: f32,
        c: &mut [TC],
        ldc: usize,
    ) {
        self.run::<TA, TC, f32>(m, alpha, a, lda, beta, c, ldc, Finish::Plain);
    }

    /// `C = alpha * A * W + beta * C + bias` (bias broadcast over rows)
    #[allow(clippy::too_many_arguments)]
    pub fn compute_bias<TA: Element, TC: Element>(
        &self,
        m: usize,
        alpha: f32,
        a: &[TA],
        lda: usize,
        beta: f32,
        c: &mut [TC],
        ldc: usize,
        bias: &[f32],
    ) {
        debug_assert!(bias.len() >= self.cols);
        self.run::<TA, TC, f32>(
            m,
            alpha,
            a,
            lda,
            beta,
            c,
            ldc,
            Finish::Bias(SharedConstPtr(bias.as_ptr())),
        );
    }

    /// `C = alpha * A * W + beta * C + bias + R`
    #[allow(clippy::too_many_arguments)]
    pub fn compute_residual<TA: Element, TC: Element, TR: Element>(
        &self,
        m: usize,
        alpha: f32,
        a: &[TA],
        lda: usize,
        beta: f32,
        c: &mut [TC],
        ldc: usize,
        bias: Option<&[f32]>,
        res: &[TR],
        ldr: usize,
    ) {
        self.run::<TA, TC, TR>(
            m,
            alpha,
            a,
            lda,
            beta,
            c,
            ldc,
            Finish::Residual {
                bias: bias.map(|b| SharedConstPtr(b.as_ptr())),
                res: SharedConstPtr(res.as_ptr()),
                ldr,
                gamma: 1.0,
            },
        );
    }

    /// `C = alpha * A * W + beta * C + bias + gamma * R`
    #[allow(clippy::too_many_arguments)]
    pub fn compute_scaled_residual<TA: Element, TC: Element, TR: Element>(
        &self,
        m: usize,
        alpha: f32,
        a: &[TA],
        lda: usize,
        beta: f32,
        c: &mut [TC],
        ldc: usize,
        bias: Option<&[f32]>,
        gamma: f32,
        res: &[TR],
        ldr: usize,
    ) {
        self.run::<TA, TC, TR>(
            m,
            alpha,
            a,
            lda,
            beta,
            c,
            ldc,
            Finish::Residual {
                bias: bias.map(|b| SharedConstPtr(b.as_ptr())),
                res: SharedConstPtr(res.as_ptr()),
                ldr,
                gamma,
            },
        );
    }

    /// `C = silu(alpha * A * W + beta * C)`
    pub fn compute_silu<TA: Element, TC: Element>(
        &self,
        m: usize,
        alpha: f32,
        a: &[TA],
        lda: usize,
        beta: f32,
        c: &mut [TC],
        ldc: usize,
    ) {
        self.run::<TA, TC, f32>(m, alpha, a, lda, beta, c, ldc, Finish::Silu);
    }

    /// `C = (alpha * A * W) * C_prev`, an elementwise multiply with the values
    /// already in `C` (the gate/up fusion).
    pub fn compute_resmul<TA: Element, TC: Element>(
        &self,
        m: usize,
        alpha: f32,
        a: &[TA],
        lda: usize,
        c: &mut [TC],
        ldc: usize,
    ) {
        self.run::<TA, TC, f32>(m, alpha, a, lda, 0.0, c, ldc, Finish::MulPrev);
    }

    #[allow(clippy::too_many_arguments)]
    fn run<TA: Element, TC: Element, TR: Element>(
        &self,
        m: usize,
        alpha: f32,
        a: &[TA],
        lda: usize,
        beta: f32,
        c: &mut [TC],
        ldc: usize,
        finish: Finish<TR>,
    ) {
        let (n, k) = (self.cols, self.rows);
        debug_assert!(m == 0 || a.len() >= (m - 1) * lda + k);
        debug_assert!(m == 0 || c.len() >= (m - 1) * ldc + n);

        // Per-row activation sums feed the zero-point correction of the
        // quantized payloads.
        let row_sums: Vec<f32> = if self.dtype.is_quantized() {
            (0..m)
                .map(|i| a[i * lda..i * lda + k].iter().map(|v| v.to_f32()).sum())
                .collect()
        } else {
            Vec::new()
        };

        let c_ptr = SharedPtr(c.as_mut_ptr());
        let a_ptr = SharedConstPtr(a.as_ptr());
        let tiles = n.div_ceil(OUTPUT_TILE);

        (0..tiles).into_par_iter().for_each(|t| {
            let j0 = t * OUTPUT_TILE;
            let j1 = (j0 + OUTPUT_TILE).min(n);
            for i in 0..m {
                let a_row = unsafe { std::slice::from_raw_parts(a_ptr.get().add(i * lda), k) };
                for j in j0..j1 {
                    let dot = self.dot_col(a_row, j, row_sums.get(i).copied().unwrap_or(0.0));
                    let c_elem = unsafe { &mut *c_ptr.get().add(i * ldc + j) };
                    let prev = c_elem.to_f32();
                    let mut acc = alpha * dot;
                    if beta != 0.0 {
                        acc += beta * prev;
                    }
                    let out = match finish {
                        Finish::Plain => acc,
                        Finish::Bias(b) => acc + unsafe { *b.get().add(j) },
                        Finish::Residual {
                            bias,
                            res,
                            ldr,
                            gamma,
                        } => {
                            let mut v = acc;
                            if let Some(b) = bias {
                                v += unsafe { *b.get().add(j) };
                            }
                            v + gamma * unsafe { (*res.get().add(i * ldr + j)).to_f32() }
                        }
                        Finish::Silu => crate::activation::silu(acc),
                        Finish::MulPrev => acc * prev,
                    };
                    *c_elem = TC::from_f32(out);
                }
            }
        });
    }

    #[inline]
    fn dot_col<TA: Element>(&self, a_row: &[TA], j: usize, row_sum: f32) -> f32 {
        let k = self.rows;
        match &self.payload {
            Payload::F32(w) => {
                let col = &w[j * k..(j + 1) * k];
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += a_row[l].to_f32() * col[l];
                }
                acc
            }
            Payload::Bf16(w) => {
                let col = &w[j * k..(j + 1) * k];
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += a_row[l].to_f32() * col[l].to_f32();
                }
                acc
            }
            Payload::F16(w) => {
                let col = &w[j * k..(j + 1) * k];
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += a_row[l].to_f32() * col[l].to_f32();
                }
                acc
            }
            Payload::Int8(w) => {
                let col = &w[j * k..(j + 1) * k];
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += a_row[l].to_f32() * f32::from(col[l]);
                }
                self.scale[j] * (acc - self.zero[j] * row_sum)
            }
            Payload::Uint4(w) => {
                let col_bytes = DataType::Uint4x2.bytes_for(k);
                let col = &w[j * col_bytes..(j + 1) * col_bytes];
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += a_row[l].to_f32() * f32::from(unpack_u4(col, l));
                }
                self.scale[j] * (acc - self.zero[j] * row_sum)
            }
        }
    }
}
