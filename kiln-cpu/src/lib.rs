//! Host backend for Kiln.
//!
//! Implements the full operation vocabulary on plain host memory. All
//! compute is done in f32; f16 and bf16 operands widen inside the
//! kernels, and int8/int4 linear weights run through the integer path.
//! Wide loops are parallelized with Rayon.
//!
//! This backend is the correctness baseline every accelerator falls
//! back to; it favors straightforward kernels over peak throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod ops;

use kiln::{DeviceBackend, DeviceBuffer, Error, Op, OpKind, Result};

/// The host execution target.
///
/// Covers every [`OpKind`], which is what lets the executor use it as
/// the universal fallback.
pub struct HostBackend;

impl DeviceBackend for HostBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn supported_ops(&self) -> &[OpKind] {
        &OpKind::ALL
    }

    fn upload(&self, _src: &[u8]) -> Result<Box<dyn DeviceBuffer>> {
        Err(Error::Backend(
            "cpu backend keeps tensors in host memory".into(),
        ))
    }

    fn execute(&self, op: Op<'_>) -> Result<()> {
        match op {
            Op::Embedding {
                input,
                weight,
                output,
            } => ops::embed::embedding(input, weight, output),
            Op::RMSNorm {
                input,
                weight,
                output,
                eps,
            } => ops::norm::rms_norm(input, weight, eps, output),
            Op::LayerNorm {
                input,
                gamma,
                beta,
                output,
                axis,
            } => ops::norm::layer_norm(input, gamma, beta, axis, output),
            Op::Linear {
                input,
                weight,
                bias,
                output,
            } => ops::linear::linear(input, weight, bias, output),
            Op::Split {
                input,
                output,
                axis,
                start,
                end,
            } => ops::shape::split(input, axis, start, end, output),
            Op::Cat {
                input0,
                input1,
                output,
                axis,
            } => ops::shape::cat(input0, input1, output, axis),
            Op::CatDirect {
                input0,
                input1,
                axis,
            } => ops::shape::cat_direct(input0, input1, axis),
            Op::MatMul {
                input0,
                input1,
                output,
                alpha,
            } => ops::matmul::matmul(input0, input1, output, alpha),
            Op::MatMulTransB {
                input0,
                input1,
                output,
                alpha,
            } => ops::matmul::matmul_trans_b(input0, input1, output, alpha),
            Op::SoftMax {
                input,
                output,
                axis,
            } => ops::activation::softmax(input, output, axis),
            Op::Silu { input, output } => ops::activation::silu(input, output),
            Op::GeluNew { input, output } => ops::activation::gelu_new(input, output),
            Op::Mul { input, output, v } => ops::arith::mul(input, output, v),
            Op::MulTo { input0, input1 } => ops::arith::mul_to(input0, input1),
            Op::AddTo {
                input0,
                input1,
                alpha,
            } => ops::arith::add_to(input0, input1, alpha),
            Op::AttentionMask {
                input,
                mask,
                mask_value,
            } => ops::mask::attention_mask(input, mask, mask_value),
            Op::Permute {
                input,
                axis,
                output,
            } => ops::shape::permute(input, axis, output),
            Op::PermuteSelf { input, axis } => ops::shape::permute_self(input, axis),
            Op::TopK {
                input,
                output,
                topk,
            } => ops::topk::top_k(input, output, topk),
            Op::RotatePosition2D {
                input,
                position_ids,
                sin,
                cos,
                rotary_dim,
            } => ops::rope::rotate_position_2d(input, position_ids, sin, cos, rotary_dim),
            Op::RepeatPenalty { input, penalty } => ops::penalty::repeat_penalty(input, penalty),
        }
    }
}
