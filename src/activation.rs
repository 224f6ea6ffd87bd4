//! SiLU activation kernels for the gated MLP
//!
//! The gated MLP only ever needs SiLU fused with an elementwise multiply:
//! either across two separate projection outputs (`silu(gate) * up`) or
//! across the two halves of one concatenated gate/up projection.

use crate::dtype::Element;
use crate::matrix::{Matrix, MatrixMut};

/// `x * sigmoid(x)`
#[inline(always)]
#[must_use]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// Fused SwiGLU on one row: `gate[i] = silu(gate[i]) * up[i]`.
pub fn silu_mul(gate: &mut [f32], up: &[f32]) {
    debug_assert_eq!(gate.len(), up.len());
    for (g, &u) in gate.iter_mut().zip(up.iter()) {
        *g = silu(*g) * u;
    }
}

/// Split a concatenated gate/up matmul result: read the left half of each
/// row of `cat` (`[M, 2*I]`), apply SiLU, multiply by the right half, and
/// write the product into `out` (`[M, I]`).
pub fn silu_sum<T: Element>(cat: &Matrix<'_, T>, out: &mut MatrixMut<'_, T>) {
    let half = cat.cols() / 2;
    debug_assert_eq!(cat.cols(), 2 * half);
    debug_assert_eq!(out.cols(), half);
    debug_assert_eq!(cat.rows(), out.rows());
    for r in 0..cat.rows() {
        let src = cat.row(r);
        let dst = out.row_mut(r);
        for j in 0..half {
            let g = src[j].to_f32();
            let u = src[half + j].to_f32();
            dst[j] = T::from_f32(silu(g) * u);
        }
    }
}
