//! The dispatch operation vocabulary.
//!
//! Every compute operation is one variant of [`Op`], carrying its operands
//! as exclusive tensor borrows and its parameters as typed fields. Backends
//! advertise support per [`OpKind`]; the names returned by
//! [`OpKind::name`] are the wire-level vocabulary and never change.

use crate::tensor::Tensor;

/// Identity of an operation, independent of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Embedding,
    RMSNorm,
    LayerNorm,
    Linear,
    Split,
    Cat,
    CatDirect,
    MatMul,
    MatMulTransB,
    SoftMax,
    Silu,
    GeluNew,
    Mul,
    MulTo,
    AddTo,
    AttentionMask,
    Permute,
    PermuteSelf,
    TopK,
    RotatePosition2D,
    RepeatPenalty,
}

impl OpKind {
    /// Every operation in the vocabulary.
    pub const ALL: [OpKind; 21] = [
        OpKind::Embedding,
        OpKind::RMSNorm,
        OpKind::LayerNorm,
        OpKind::Linear,
        OpKind::Split,
        OpKind::Cat,
        OpKind::CatDirect,
        OpKind::MatMul,
        OpKind::MatMulTransB,
        OpKind::SoftMax,
        OpKind::Silu,
        OpKind::GeluNew,
        OpKind::Mul,
        OpKind::MulTo,
        OpKind::AddTo,
        OpKind::AttentionMask,
        OpKind::Permute,
        OpKind::PermuteSelf,
        OpKind::TopK,
        OpKind::RotatePosition2D,
        OpKind::RepeatPenalty,
    ];

    /// Stable operation name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            OpKind::Embedding => "Embedding",
            OpKind::RMSNorm => "RMSNorm",
            OpKind::LayerNorm => "LayerNorm",
            OpKind::Linear => "Linear",
            OpKind::Split => "Split",
            OpKind::Cat => "Cat",
            OpKind::CatDirect => "CatDirect",
            OpKind::MatMul => "MatMul",
            OpKind::MatMulTransB => "MatMulTransB",
            OpKind::SoftMax => "SoftMax",
            OpKind::Silu => "Silu",
            OpKind::GeluNew => "GeluNew",
            OpKind::Mul => "Mul",
            OpKind::MulTo => "MulTo",
            OpKind::AddTo => "AddTo",
            OpKind::AttentionMask => "AttentionMask",
            OpKind::Permute => "Permute",
            OpKind::PermuteSelf => "PermuteSelf",
            OpKind::TopK => "TopK",
            OpKind::RotatePosition2D => "RotatePosition2D",
            OpKind::RepeatPenalty => "RepeatPenalty",
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One staged operation: operands plus typed parameters.
///
/// Operands are exclusive borrows, so an operation can never alias its
/// output with an input. Ops that update a tensor in place carry that
/// tensor as their sole mutable operand instead of a separate output.
pub enum Op<'a> {
    /// Row lookup: `output[i] = weight[input[i]]`.
    Embedding {
        input: &'a mut Tensor,
        weight: &'a mut Tensor,
        output: &'a mut Tensor,
    },
    /// Root-mean-square normalization over the last axis.
    RMSNorm {
        input: &'a mut Tensor,
        weight: &'a mut Tensor,
        output: &'a mut Tensor,
        eps: f32,
    },
    /// Mean/variance normalization along `axis` with affine gamma/beta.
    LayerNorm {
        input: &'a mut Tensor,
        gamma: &'a mut Tensor,
        beta: &'a mut Tensor,
        output: &'a mut Tensor,
        axis: i32,
    },
    /// `output = input * weight^T + bias`.
    Linear {
        input: &'a mut Tensor,
        weight: &'a mut Tensor,
        bias: &'a mut Tensor,
        output: &'a mut Tensor,
    },
    /// Copy the `[start, end)` range of `axis` into `output`.
    Split {
        input: &'a mut Tensor,
        output: &'a mut Tensor,
        axis: i32,
        start: i32,
        end: i32,
    },
    /// Concatenate two tensors along `axis` into `output`.
    Cat {
        input0: &'a mut Tensor,
        input1: &'a mut Tensor,
        output: &'a mut Tensor,
        axis: i32,
    },
    /// Append `input1` to `input0` in place, inside `input0`'s reservation.
    CatDirect {
        input0: &'a mut Tensor,
        input1: &'a mut Tensor,
        axis: i32,
    },
    /// Batched `output = alpha * (input0 @ input1)`.
    MatMul {
        input0: &'a mut Tensor,
        input1: &'a mut Tensor,
        output: &'a mut Tensor,
        alpha: f32,
    },
    /// Batched `output = alpha * (input0 @ input1^T)`.
    MatMulTransB {
        input0: &'a mut Tensor,
        input1: &'a mut Tensor,
        output: &'a mut Tensor,
        alpha: f32,
    },
    /// Softmax along `axis`.
    SoftMax {
        input: &'a mut Tensor,
        output: &'a mut Tensor,
        axis: i32,
    },
    /// `x * sigmoid(x)` elementwise.
    Silu {
        input: &'a mut Tensor,
        output: &'a mut Tensor,
    },
    /// Tanh-approximated GELU elementwise.
    GeluNew {
        input: &'a mut Tensor,
        output: &'a mut Tensor,
    },
    /// `output = input * v`.
    Mul {
        input: &'a mut Tensor,
        output: &'a mut Tensor,
        v: f32,
    },
    /// `input0 *= input1` elementwise, in place.
    MulTo {
        input0: &'a mut Tensor,
        input1: &'a mut Tensor,
    },
    /// `input0 += alpha * input1`, in place.
    AddTo {
        input0: &'a mut Tensor,
        input1: &'a mut Tensor,
        alpha: f32,
    },
    /// Write `mask_value` into `input` wherever `mask` is set, in place.
    AttentionMask {
        input: &'a mut Tensor,
        mask: &'a mut Tensor,
        mask_value: f32,
    },
    /// Reorder axes into `output`; `axis` is an int32-parameter tensor.
    Permute {
        input: &'a mut Tensor,
        axis: &'a mut Tensor,
        output: &'a mut Tensor,
    },
    /// Reorder axes in place; `axis` is an int32-parameter tensor.
    PermuteSelf {
        input: &'a mut Tensor,
        axis: &'a mut Tensor,
    },
    /// Top-k selection over the last axis, emitting (index, value) pairs.
    TopK {
        input: &'a mut Tensor,
        output: &'a mut Tensor,
        topk: i32,
    },
    /// Rotary position encoding applied in place over `rotary_dim` lanes.
    RotatePosition2D {
        input: &'a mut Tensor,
        position_ids: &'a mut Tensor,
        sin: &'a mut Tensor,
        cos: &'a mut Tensor,
        rotary_dim: i32,
    },
    /// Divide positive logits by `penalty`, multiply negative ones, in place.
    RepeatPenalty {
        input: &'a mut Tensor,
        penalty: &'a mut Tensor,
    },
}

impl Op<'_> {
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Embedding { .. } => OpKind::Embedding,
            Op::RMSNorm { .. } => OpKind::RMSNorm,
            Op::LayerNorm { .. } => OpKind::LayerNorm,
            Op::Linear { .. } => OpKind::Linear,
            Op::Split { .. } => OpKind::Split,
            Op::Cat { .. } => OpKind::Cat,
            Op::CatDirect { .. } => OpKind::CatDirect,
            Op::MatMul { .. } => OpKind::MatMul,
            Op::MatMulTransB { .. } => OpKind::MatMulTransB,
            Op::SoftMax { .. } => OpKind::SoftMax,
            Op::Silu { .. } => OpKind::Silu,
            Op::GeluNew { .. } => OpKind::GeluNew,
            Op::Mul { .. } => OpKind::Mul,
            Op::MulTo { .. } => OpKind::MulTo,
            Op::AddTo { .. } => OpKind::AddTo,
            Op::AttentionMask { .. } => OpKind::AttentionMask,
            Op::Permute { .. } => OpKind::Permute,
            Op::PermuteSelf { .. } => OpKind::PermuteSelf,
            Op::TopK { .. } => OpKind::TopK,
            Op::RotatePosition2D { .. } => OpKind::RotatePosition2D,
            Op::RepeatPenalty { .. } => OpKind::RepeatPenalty,
        }
    }

    /// Shared view of every tensor operand, placement-relevant or not.
    #[must_use]
    pub fn operands(&self) -> Vec<&Tensor> {
        match self {
            Op::Embedding {
                input,
                weight,
                output,
            } => vec![input, weight, output],
            Op::RMSNorm {
                input,
                weight,
                output,
                ..
            } => vec![input, weight, output],
            Op::LayerNorm {
                input,
                gamma,
                beta,
                output,
                ..
            } => vec![input, gamma, beta, output],
            Op::Linear {
                input,
                weight,
                bias,
                output,
            } => vec![input, weight, bias, output],
            Op::Split { input, output, .. }
            | Op::SoftMax { input, output, .. }
            | Op::Silu { input, output }
            | Op::GeluNew { input, output }
            | Op::Mul { input, output, .. }
            | Op::TopK { input, output, .. } => vec![input, output],
            Op::Cat {
                input0,
                input1,
                output,
                ..
            }
            | Op::MatMul {
                input0,
                input1,
                output,
                ..
            }
            | Op::MatMulTransB {
                input0,
                input1,
                output,
                ..
            } => vec![input0, input1, output],
            Op::CatDirect { input0, input1, .. }
            | Op::MulTo { input0, input1 }
            | Op::AddTo { input0, input1, .. } => vec![input0, input1],
            Op::AttentionMask { input, mask, .. } => vec![input, mask],
            Op::Permute {
                input,
                axis,
                output,
            } => vec![input, axis, output],
            Op::PermuteSelf { input, axis } => vec![input, axis],
            Op::RotatePosition2D {
                input,
                position_ids,
                sin,
                cos,
                ..
            } => vec![input, position_ids, sin, cos],
            Op::RepeatPenalty { input, penalty } => vec![input, penalty],
        }
    }

    /// Exclusive view of every tensor operand, used for staging.
    pub fn operands_mut(&mut self) -> Vec<&mut Tensor> {
        match self {
            Op::Embedding {
                input,
                weight,
                output,
            } => vec![input, weight, output],
            Op::RMSNorm {
                input,
                weight,
                output,
                ..
            } => vec![input, weight, output],
            Op::LayerNorm {
                input,
                gamma,
                beta,
                output,
                ..
            } => vec![input, gamma, beta, output],
            Op::Linear {
                input,
                weight,
                bias,
                output,
            } => vec![input, weight, bias, output],
            Op::Split { input, output, .. }
            | Op::SoftMax { input, output, .. }
            | Op::Silu { input, output }
            | Op::GeluNew { input, output }
            | Op::Mul { input, output, .. }
            | Op::TopK { input, output, .. } => vec![input, output],
            Op::Cat {
                input0,
                input1,
                output,
                ..
            }
            | Op::MatMul {
                input0,
                input1,
                output,
                ..
            }
            | Op::MatMulTransB {
                input0,
                input1,
                output,
                ..
            } => vec![input0, input1, output],
            Op::CatDirect { input0, input1, .. }
            | Op::MulTo { input0, input1 }
            | Op::AddTo { input0, input1, .. } => vec![input0, input1],
            Op::AttentionMask { input, mask, .. } => vec![input, mask],
            Op::Permute {
                input,
                axis,
                output,
            } => vec![input, axis, output],
            Op::PermuteSelf { input, axis } => vec![input, axis],
            Op::RotatePosition2D {
                input,
                position_ids,
                sin,
                cos,
                ..
            } => vec![input, position_ids, sin, cos],
            Op::RepeatPenalty { input, penalty } => vec![input, penalty],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn test_vocabulary_is_closed() {
        assert_eq!(OpKind::ALL.len(), 21);
        for kind in OpKind::ALL {
            assert!(!kind.name().is_empty());
        }
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<&str> = OpKind::ALL.iter().map(|k| k.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 21);
    }

    #[test]
    fn test_kind_and_operand_listing() {
        let mut input = Tensor::with_shape(DType::F32, &[2, 2]);
        let mut output = Tensor::with_shape(DType::F32, &[2, 2]);
        let mut op = Op::Silu {
            input: &mut input,
            output: &mut output,
        };
        assert_eq!(op.kind(), OpKind::Silu);
        assert_eq!(op.operands().len(), 2);
        assert_eq!(op.operands_mut().len(), 2);
    }
}
