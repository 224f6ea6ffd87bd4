//! Small GEMM primitives for the attention kernels
//!
//! These cover the two batched-matmul shapes inside attention: `Q * K^T`
//! (B operand accessed row-wise, i.e. transposed) and `Score * V`. Operands
//! may be any activation element type; accumulation is always f32. The
//! pointer-based signatures mirror how the kernels walk caller buffers and
//! KV-cache head views with independent leading dimensions.

use crate::dtype::Element;

/// `C[m x n] = A[m x k] * B[n x k]^T`, i.e. `c[i][j] = dot(a_row_i, b_row_j)`.
///
/// `C` is always f32 (attention scores).
///
/// # Safety
///
/// `a`, `b` and `c` must be valid for the strided extents implied by
/// `(m, n, k, lda, ldb, ldc)` and `c` must not alias `a` or `b`.
pub unsafe fn small_gemm_transb<TA: Element, TB: Element>(
    a: *const TA,
    b: *const TB,
    c: *mut f32,
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
) {
    unsafe {
        for i in 0..m {
            let a_row = std::slice::from_raw_parts(a.add(i * lda), k);
            let c_row = std::slice::from_raw_parts_mut(c.add(i * ldc), n);
            for (j, out) in c_row.iter_mut().enumerate() {
                let b_row = std::slice::from_raw_parts(b.add(j * ldb), k);
                let mut acc = 0.0f32;
                for l in 0..k {
                    acc += a_row[l].to_f32() * b_row[l].to_f32();
                }
                *out = acc;
            }
        }
    }
}

/// `C[m x n] = A[m x k] * B[k x n]`, with f32 `A` (softmax weights) and
/// element-typed `B` (value rows) and `C` (attention output).
///
/// # Safety
///
/// `a`, `b` and `c` must be valid for the strided extents implied by
/// `(m, n, k, lda, ldb, ldc)` and `c` must not alias `a` or `b`.
pub unsafe fn small_gemm<TB: Element, TC: Element>(
    a: *const f32,
    b: *const TB,
    c: *mut TC,
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
) {
    unsafe {
        let mut acc = vec![0.0f32; n];
        for i in 0..m {
            let a_row = std::slice::from_raw_parts(a.add(i * lda), k);
            acc.fill(0.0);
            for (l, &w) in a_row.iter().enumerate() {
                if w == 0.0 {
                    continue;
                }
                let b_row = std::slice::from_raw_parts(b.add(l * ldb), n);
                for (j, out) in acc.iter_mut().enumerate() {
                    *out += w * b_row[j].to_f32();
                }
            }
            let c_row = std::slice::from_raw_parts_mut(c.add(i * ldc), n);
            for (j, &v) in acc.iter().enumerate() {
                c_row[j] = TC::from_f32(v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_small_gemm_transb_identity() {
        // A = I2, B rows = [[1,2],[3,4],[5,6]] => C = B^T laid out as dots
        let a = [1.0f32, 0.0, 0.0, 1.0];
        let b = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut c = [0.0f32; 6];
        unsafe { small_gemm_transb(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), 2, 3, 2, 2, 2, 3) };
        assert_eq!(c, [1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_small_gemm_plain() {
        // A = [[1, 2]], B = [[1, 0], [0, 1]] => C = [[1, 2]]
        let a = [1.0f32, 2.0];
        let b = [1.0f32, 0.0, 0.0, 1.0];
        let mut c = [0.0f32; 2];
        unsafe { small_gemm(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), 1, 2, 2, 2, 2, 2) };
        assert_eq!(c, [1.0, 2.0]);
    }

    #[test]
    fn test_small_gemm_strided() {
        // Strides larger than the logical extents
        let a = [0.5f32, 0.5, -1.0, /* pad */ 0.0];
        let b = [2.0f32, 4.0, 0.0, 6.0, 8.0, 0.0];
        let mut c = [0.0f32; 8];
        // m=1, n=2, k=2, lda=4, ldb=3, ldc=8
        unsafe { small_gemm(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), 1, 2, 2, 4, 3, 8) };
        assert_eq!(&c[..2], &[0.5 * 2.0 + 0.5 * 6.0, 0.5 * 4.0 + 0.5 * 8.0]);
    }

    #[test]
    fn test_small_gemm_bf16_operands() {
        let a: Vec<bf16> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .map(|&v| bf16::from_f32(v))
            .collect();
        let b: Vec<bf16> = [1.0f32, 0.0, 0.0, 1.0]
            .iter()
            .map(|&v| bf16::from_f32(v))
            .collect();
        let mut c = [0.0f32; 4];
        // C = A * B^T with B = I => C == A
        unsafe { small_gemm_transb(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), 2, 2, 2, 2, 2, 2) };
        assert_eq!(c, [1.0, 2.0, 3.0, 4.0]);
    }
}
