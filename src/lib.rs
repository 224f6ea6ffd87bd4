//! # Inferir
//!
//! CPU transformer decoder-layer inference core: grouped-query attention
//! with three complementary kernels, KV-cache write-back, and a SiLU-gated
//! MLP, with quantized weight packing.
//!
//! The two blocks, [`attention::AttentionBlock`] and [`mlp::MlpBlock`],
//! compose one decoder layer. Data flows linearly:
//!
//! ```text
//! input -> norm -> QKV linear -> rotary -> attention kernel
//!       -> out linear (+residual)
//!       -> norm -> gate/up -> silu*mul -> down (+residual) -> output
//! ```
//!
//! Both blocks take caller-supplied input/intermediate/output buffers; any
//! further transient storage comes from the process-wide [`pool::ScratchPool`]
//! keyed by purpose. Under tensor-parallel execution each replica owns a
//! contiguous head range (attention) or intermediate-column range (MLP) and
//! only split 0 folds the residual; the caller all-reduces partial outputs.
//!
//! ## Example
//!
//! ```rust,ignore
//! use inferir::{
//!     attention::{AttentionBlock, AttentionWeights},
//!     context::{ActivationKind, DecoderContext},
//!     kvcache::KvCacheTensor,
//!     matmul::{MatmulEngine, RawWeight},
//! };
//!
//! let mut ctx = DecoderContext::new(/* ... */)?;
//! ctx.prepare::<f32>(batch, seq_len, 0);
//! let mut block: AttentionBlock<f32, f32, f32> = AttentionBlock::new(0, &ctx)?;
//! block.set_weights(&ctx, &engine, &weights)?;
//! block.forward(&mut ctx, &input, &mut im, &mut out, &mask,
//!               &mut key_cache, &mut value_cache, seq_len, 0, true, true, None)?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::similar_names)]

pub mod activation;
pub mod attention;
pub mod context;
pub mod dtype;
pub mod error;
pub mod gemm;
pub mod kvcache;
pub mod matmul;
pub mod matrix;
pub mod mlp;
pub mod norm;
pub mod pool;
pub mod rotary;
pub mod softmax;

// Re-exports for convenience
pub use context::{ActivationKind, DecoderContext};
pub use dtype::{DataType, Element};
pub use error::{InferirError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
