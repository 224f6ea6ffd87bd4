//! Gated-MLP integration tests: concatenated vs separate gate/up paths under
//! quantized weights and reduced precision, and tensor-parallel splits.

mod common;

use common::{cosine_distance, max_abs_diff, pseudo};
use half::bf16;
use inferir::context::{ActivationKind, DecoderContext};
use inferir::dtype::DataType;
use inferir::matmul::{MatmulEngine, RawWeight};
use inferir::mlp::{MlpBlock, MlpWeights};

struct MlpFixture {
    hidden: usize,
    im_size: usize,
    gate: Vec<f32>,
    up: Vec<f32>,
    down: Vec<f32>,
    gamma: Vec<f32>,
}

impl MlpFixture {
    fn new(hidden: usize, im_size: usize, seed: u64) -> Self {
        Self {
            hidden,
            im_size,
            gate: pseudo(seed, hidden * im_size),
            up: pseudo(seed + 1, hidden * im_size),
            down: pseudo(seed + 2, im_size * hidden),
            gamma: vec![1.0; hidden],
        }
    }

    fn weights(&self) -> MlpWeights<'_> {
        MlpWeights {
            gate: RawWeight::F32(&self.gate),
            up: RawWeight::F32(&self.up),
            down: RawWeight::F32(&self.down),
            norm_gamma: &self.gamma,
            trans: false,
        }
    }

    fn ctx(&self, num_split: usize, split_idx: usize) -> DecoderContext {
        DecoderContext::new(
            1,
            self.hidden,
            4,
            4,
            self.hidden / 4,
            self.im_size,
            1024,
            1024,
            1e-5,
            4,
            num_split,
            split_idx,
            1,
            ActivationKind::Silu,
        )
        .unwrap()
    }
}

fn run_bf16(
    fixture: &MlpFixture,
    weight_type: DataType,
    concat: bool,
    rows: usize,
    input: &[bf16],
) -> Vec<f32> {
    let mut ctx = fixture.ctx(1, 0);
    ctx.prepare::<bf16>(1, rows, 0);
    let engine = MatmulEngine::new(weight_type).unwrap();
    let mut block: MlpBlock<bf16, bf16, bf16> = MlpBlock::new(&ctx, concat).unwrap();
    block.set_weights(&ctx, &engine, &fixture.weights()).unwrap();
    let mut out = vec![bf16::from_f32(0.0); rows * fixture.hidden];
    block
        .forward(&mut ctx, input, &mut out, fixture.hidden, fixture.hidden, true)
        .unwrap();
    out.iter().map(|v| v.to_f32()).collect()
}

// Scenario D: concatenated and separate gate/up agree on a bf16 layer with
// int8-quantized weights. Both paths see identical quantized columns; the
// only divergence is bf16 intermediate rounding.
#[test]
fn test_concat_matches_separate_int8_bf16() {
    let fixture = MlpFixture::new(256, 704, 3);
    let rows = 4;
    let input_f = pseudo(9, rows * fixture.hidden);
    let input: Vec<bf16> = input_f.iter().map(|&v| bf16::from_f32(v)).collect();

    let separate = run_bf16(&fixture, DataType::Int8, false, rows, &input);
    let concat = run_bf16(&fixture, DataType::Int8, true, rows, &input);

    assert!(
        cosine_distance(&separate, &concat) < 1e-4,
        "cosine {}",
        cosine_distance(&separate, &concat)
    );
    assert!(max_abs_diff(&separate, &concat) < 1e-2);
}

// 4-bit weights: the nibble-packed concat path must respect the halved
// stride; outputs of both paths agree.
#[test]
fn test_concat_matches_separate_uint4() {
    let fixture = MlpFixture::new(64, 96, 5);
    let rows = 3;
    let input_f = pseudo(21, rows * fixture.hidden);
    let input: Vec<bf16> = input_f.iter().map(|&v| bf16::from_f32(v)).collect();

    let separate = run_bf16(&fixture, DataType::Uint4x2, false, rows, &input);
    let concat = run_bf16(&fixture, DataType::Uint4x2, true, rows, &input);

    assert!(
        max_abs_diff(&separate, &concat) < 1e-2,
        "diff {}",
        max_abs_diff(&separate, &concat)
    );
}

// Tensor-parallel MLP with the concatenated layout: per-split partials
// (residual only on split 0) sum to the single-replica output.
#[test]
fn test_concat_split_outputs_sum() {
    let fixture = MlpFixture::new(64, 96, 7);
    let rows = 2;
    let input = pseudo(31, rows * fixture.hidden);
    let engine = MatmulEngine::new(DataType::F32).unwrap();

    let run = |num_split: usize, idx: usize| -> Vec<f32> {
        let mut ctx = fixture.ctx(num_split, idx);
        ctx.prepare::<f32>(1, rows, 0);
        let mut block: MlpBlock<f32, f32, f32> = MlpBlock::new(&ctx, true).unwrap();
        block.set_weights(&ctx, &engine, &fixture.weights()).unwrap();
        let mut out = vec![0.0f32; rows * fixture.hidden];
        block
            .forward(&mut ctx, &input, &mut out, fixture.hidden, fixture.hidden, true)
            .unwrap();
        out
    };

    let single = run(1, 0);
    let mut total = vec![0.0f32; rows * fixture.hidden];
    for idx in 0..3 {
        for (t, o) in total.iter_mut().zip(run(3, idx).iter()) {
            *t += o;
        }
    }
    assert!(
        max_abs_diff(&total, &single) < 1e-4,
        "diff {}",
        max_abs_diff(&total, &single)
    );
}

// Quantized MLP tracks the float MLP within the quantization error bound.
#[test]
fn test_int8_mlp_tracks_float() {
    let fixture = MlpFixture::new(128, 192, 13);
    let rows = 3;
    let input = pseudo(43, rows * fixture.hidden);

    let run = |weight_type: DataType| -> Vec<f32> {
        let mut ctx = fixture.ctx(1, 0);
        ctx.prepare::<f32>(1, rows, 0);
        let engine = MatmulEngine::new(weight_type).unwrap();
        let mut block: MlpBlock<f32, f32, f32> = MlpBlock::new(&ctx, false).unwrap();
        block.set_weights(&ctx, &engine, &fixture.weights()).unwrap();
        let mut out = vec![0.0f32; rows * fixture.hidden];
        block
            .forward(&mut ctx, &input, &mut out, fixture.hidden, fixture.hidden, true)
            .unwrap();
        out
    };

    let float_out = run(DataType::F32);
    let int8_out = run(DataType::Int8);
    assert!(
        cosine_distance(&float_out, &int8_out) < 5e-3,
        "cosine {}",
        cosine_distance(&float_out, &int8_out)
    );
}
