//! Backend negotiation and operation dispatch.
//!
//! The executor owns one host backend plus any number of registered
//! accelerator backends. Model code never names a backend: it submits an
//! [`Op`], the executor picks a target from operand placement, stages
//! operands there, and runs the kernel. The host backend must cover the
//! whole vocabulary; accelerators are a throughput optimization, never a
//! correctness requirement.

use std::cmp::Ordering;

use crate::config::EngineConfig;
use crate::device::{DeviceBackend, DeviceKind};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::ops::{Op, OpKind};
use crate::tensor::Tensor;

pub struct Executor {
    config: EngineConfig,
    host: Box<dyn DeviceBackend>,
    accels: Vec<Box<dyn DeviceBackend>>,
}

impl Executor {
    /// Build an executor around a host backend.
    ///
    /// # Errors
    /// Fails when `host` does not support the full operation vocabulary.
    pub fn new(config: EngineConfig, host: Box<dyn DeviceBackend>) -> Result<Self> {
        for kind in OpKind::ALL {
            if !host.supports(kind) {
                return Err(Error::NoBackend(format!(
                    "{kind} on host backend {}",
                    host.name()
                )));
            }
        }
        Ok(Self {
            config,
            host,
            accels: Vec::new(),
        })
    }

    /// Register an accelerator backend. Earlier registrations win when
    /// several support the same operation.
    pub fn register(&mut self, backend: Box<dyn DeviceBackend>) {
        self.accels.push(backend);
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Dispatch one operation: choose a backend, stage operands onto its
    /// device, and execute.
    ///
    /// Placement follows the operand majority, ties going to the
    /// configured default. Sequentially extended caches stay on host when
    /// the config says so. An operation the chosen accelerator cannot run
    /// falls back to the host backend.
    ///
    /// # Errors
    /// Fails when no backend supports the operation, when staging fails,
    /// or when the kernel itself fails.
    pub fn submit(&self, mut op: Op<'_>) -> Result<()> {
        let kind = op.kind();
        let mut target = self.preferred_device(&op);
        if self.config.cache_on_host && kind == OpKind::CatDirect {
            target = DeviceKind::Host;
        }
        let (device, backend): (DeviceKind, &dyn DeviceBackend) = match target {
            DeviceKind::Accel => match self.accels.iter().find(|b| b.supports(kind)) {
                Some(b) => (DeviceKind::Accel, b.as_ref()),
                None if self.host.supports(kind) => (DeviceKind::Host, self.host.as_ref()),
                None => return Err(Error::NoBackend(kind.name().to_string())),
            },
            DeviceKind::Host => {
                if self.host.supports(kind) {
                    (DeviceKind::Host, self.host.as_ref())
                } else {
                    return Err(Error::NoBackend(kind.name().to_string()));
                }
            }
        };
        for tensor in op.operands_mut() {
            tensor.to_device(device, backend)?;
        }
        backend.execute(op)
    }

    fn preferred_device(&self, op: &Op<'_>) -> DeviceKind {
        let mut host = 0usize;
        let mut accel = 0usize;
        for tensor in op.operands() {
            if tensor.dtype() == DType::I32Param {
                continue;
            }
            match tensor.device() {
                DeviceKind::Host => host += 1,
                DeviceKind::Accel => accel += 1,
            }
        }
        match accel.cmp(&host) {
            Ordering::Greater => DeviceKind::Accel,
            Ordering::Less => DeviceKind::Host,
            Ordering::Equal => self.config.device,
        }
    }

    /// Embedding lookup of `input` token ids into `weight` rows.
    ///
    /// # Errors
    /// Fails when dispatch or the kernel fails; same for every wrapper
    /// below.
    pub fn embedding(
        &self,
        input: &mut Tensor,
        weight: &mut Tensor,
        output: &mut Tensor,
    ) -> Result<()> {
        self.submit(Op::Embedding {
            input,
            weight,
            output,
        })
    }

    pub fn rms_norm(
        &self,
        input: &mut Tensor,
        weight: &mut Tensor,
        eps: f32,
        output: &mut Tensor,
    ) -> Result<()> {
        self.submit(Op::RMSNorm {
            input,
            weight,
            output,
            eps,
        })
    }

    pub fn layer_norm(
        &self,
        input: &mut Tensor,
        gamma: &mut Tensor,
        beta: &mut Tensor,
        axis: i32,
        output: &mut Tensor,
    ) -> Result<()> {
        self.submit(Op::LayerNorm {
            input,
            gamma,
            beta,
            output,
            axis,
        })
    }

    pub fn linear(
        &self,
        input: &mut Tensor,
        weight: &mut Tensor,
        bias: &mut Tensor,
        output: &mut Tensor,
    ) -> Result<()> {
        self.submit(Op::Linear {
            input,
            weight,
            bias,
            output,
        })
    }

    pub fn split(
        &self,
        input: &mut Tensor,
        axis: i32,
        start: i32,
        end: i32,
        output: &mut Tensor,
    ) -> Result<()> {
        self.submit(Op::Split {
            input,
            output,
            axis,
            start,
            end,
        })
    }

    pub fn cat(
        &self,
        input0: &mut Tensor,
        input1: &mut Tensor,
        axis: i32,
        output: &mut Tensor,
    ) -> Result<()> {
        self.submit(Op::Cat {
            input0,
            input1,
            output,
            axis,
        })
    }

    pub fn cat_direct(&self, input0: &mut Tensor, input1: &mut Tensor, axis: i32) -> Result<()> {
        self.submit(Op::CatDirect {
            input0,
            input1,
            axis,
        })
    }

    pub fn matmul(
        &self,
        input0: &mut Tensor,
        input1: &mut Tensor,
        output: &mut Tensor,
        alpha: f32,
    ) -> Result<()> {
        self.submit(Op::MatMul {
            input0,
            input1,
            output,
            alpha,
        })
    }

    pub fn matmul_trans_b(
        &self,
        input0: &mut Tensor,
        input1: &mut Tensor,
        output: &mut Tensor,
        alpha: f32,
    ) -> Result<()> {
        self.submit(Op::MatMulTransB {
            input0,
            input1,
            output,
            alpha,
        })
    }

    pub fn softmax(&self, input: &mut Tensor, output: &mut Tensor, axis: i32) -> Result<()> {
        self.submit(Op::SoftMax {
            input,
            output,
            axis,
        })
    }

    pub fn silu(&self, input: &mut Tensor, output: &mut Tensor) -> Result<()> {
        self.submit(Op::Silu { input, output })
    }

    pub fn gelu_new(&self, input: &mut Tensor, output: &mut Tensor) -> Result<()> {
        self.submit(Op::GeluNew { input, output })
    }

    pub fn mul(&self, input: &mut Tensor, v: f32, output: &mut Tensor) -> Result<()> {
        self.submit(Op::Mul { input, output, v })
    }

    pub fn mul_to(&self, input0: &mut Tensor, input1: &mut Tensor) -> Result<()> {
        self.submit(Op::MulTo { input0, input1 })
    }

    pub fn add_to(&self, input0: &mut Tensor, input1: &mut Tensor, alpha: f32) -> Result<()> {
        self.submit(Op::AddTo {
            input0,
            input1,
            alpha,
        })
    }

    pub fn attention_mask(
        &self,
        input: &mut Tensor,
        mask: &mut Tensor,
        mask_value: f32,
    ) -> Result<()> {
        self.submit(Op::AttentionMask {
            input,
            mask,
            mask_value,
        })
    }

    /// Axis reorder through an int32-parameter tensor, like every axis
    /// list that reaches a kernel.
    pub fn permute(&self, input: &mut Tensor, axis: &[i32], output: &mut Tensor) -> Result<()> {
        let mut axis_data = Tensor::int32_params(axis);
        self.submit(Op::Permute {
            input,
            axis: &mut axis_data,
            output,
        })
    }

    pub fn permute_self(&self, input: &mut Tensor, axis: &[i32]) -> Result<()> {
        let mut axis_data = Tensor::int32_params(axis);
        self.submit(Op::PermuteSelf {
            input,
            axis: &mut axis_data,
        })
    }

    pub fn top_k(&self, input: &mut Tensor, output: &mut Tensor, topk: i32) -> Result<()> {
        self.submit(Op::TopK {
            input,
            output,
            topk,
        })
    }

    pub fn rotate_position_2d(
        &self,
        input: &mut Tensor,
        position_ids: &mut Tensor,
        sin: &mut Tensor,
        cos: &mut Tensor,
        rotary_dim: i32,
    ) -> Result<()> {
        self.submit(Op::RotatePosition2D {
            input,
            position_ids,
            sin,
            cos,
            rotary_dim,
        })
    }

    pub fn repeat_penalty(&self, input: &mut Tensor, penalty: &mut Tensor) -> Result<()> {
        self.submit(Op::RepeatPenalty { input, penalty })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBuffer, StubAccelerator};

    struct TestHost;

    impl DeviceBackend for TestHost {
        fn name(&self) -> &str {
            "test-host"
        }

        fn supported_ops(&self) -> &[OpKind] {
            &OpKind::ALL
        }

        fn upload(&self, _src: &[u8]) -> Result<Box<dyn DeviceBuffer>> {
            Err(Error::Backend("test host has no device memory".into()))
        }

        fn execute(&self, op: Op<'_>) -> Result<()> {
            match op {
                Op::Mul { input, output, v } => {
                    output.resize(&input.shape().to_vec())?;
                    output.allocate()?;
                    let src = input.as_f32()?.to_vec();
                    for (dst, x) in output.as_f32_mut()?.iter_mut().zip(src) {
                        *dst = x * v;
                    }
                    Ok(())
                }
                Op::CatDirect { .. } | Op::MulTo { .. } | Op::PermuteSelf { .. } => Ok(()),
                other => Err(Error::Backend(format!(
                    "test host has no {} kernel",
                    other.kind()
                ))),
            }
        }
    }

    struct TestAccel {
        caps: Vec<OpKind>,
        inner: StubAccelerator,
    }

    impl TestAccel {
        fn new(caps: Vec<OpKind>) -> Self {
            Self {
                caps,
                inner: StubAccelerator::new(),
            }
        }
    }

    impl DeviceBackend for TestAccel {
        fn name(&self) -> &str {
            "test-accel"
        }

        fn supported_ops(&self) -> &[OpKind] {
            &self.caps
        }

        fn upload(&self, src: &[u8]) -> Result<Box<dyn DeviceBuffer>> {
            self.inner.upload(src)
        }

        fn execute(&self, _op: Op<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn executor() -> Executor {
        Executor::new(EngineConfig::default(), Box::new(TestHost)).unwrap()
    }

    #[test]
    fn test_host_backend_must_cover_vocabulary() {
        let err = Executor::new(EngineConfig::default(), Box::new(StubAccelerator::new()));
        assert!(matches!(err, Err(Error::NoBackend(_))));
    }

    #[test]
    fn test_submit_runs_on_host() {
        let exec = executor();
        let mut input = Tensor::from_f32(&[3], &[1.0, 2.0, 3.0]);
        let mut output = Tensor::new(DType::F32);
        exec.mul(&mut input, 2.0, &mut output).unwrap();
        assert_eq!(output.as_f32().unwrap(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_accel_majority_falls_back_to_host() {
        let mut exec = executor();
        exec.register(Box::new(TestAccel::new(Vec::new())));
        let backend = TestAccel::new(Vec::new());

        let mut input = Tensor::from_f32(&[2], &[1.5, -1.0]);
        input.to_accel(&backend).unwrap();
        let mut output = Tensor::from_f32(&[2], &[0.0, 0.0]);
        output.to_accel(&backend).unwrap();
        exec.mul(&mut input, 4.0, &mut output).unwrap();

        // No accelerator kernel exists, so the operands came back home.
        assert_eq!(input.device(), DeviceKind::Host);
        assert_eq!(output.device(), DeviceKind::Host);
        assert_eq!(output.as_f32().unwrap(), &[6.0, -4.0]);
    }

    #[test]
    fn test_cache_on_host_pins_cat_direct() {
        let config = EngineConfig {
            cache_on_host: true,
            ..EngineConfig::default()
        };
        let mut exec = Executor::new(config, Box::new(TestHost)).unwrap();
        exec.register(Box::new(TestAccel::new(vec![OpKind::CatDirect])));
        let backend = TestAccel::new(Vec::new());

        let mut cache = Tensor::from_f32(&[1, 2], &[1.0, 2.0]);
        cache.to_accel(&backend).unwrap();
        let mut item = Tensor::from_f32(&[1, 2], &[3.0, 4.0]);
        item.to_accel(&backend).unwrap();

        exec.cat_direct(&mut cache, &mut item, 1).unwrap();
        assert_eq!(cache.device(), DeviceKind::Host);
        assert_eq!(item.device(), DeviceKind::Host);
    }

    #[test]
    fn test_accel_keeps_supported_op() {
        let mut exec = executor();
        exec.register(Box::new(TestAccel::new(vec![OpKind::CatDirect])));
        let backend = TestAccel::new(Vec::new());

        let mut cache = Tensor::from_f32(&[1, 2], &[1.0, 2.0]);
        cache.to_accel(&backend).unwrap();
        let mut item = Tensor::from_f32(&[1, 2], &[3.0, 4.0]);
        item.to_accel(&backend).unwrap();

        exec.cat_direct(&mut cache, &mut item, 1).unwrap();
        assert_eq!(cache.device(), DeviceKind::Accel);
        assert_eq!(item.device(), DeviceKind::Accel);
    }

    #[test]
    fn test_params_do_not_vote_on_placement() {
        let mut exec = executor();
        exec.register(Box::new(TestAccel::new(vec![OpKind::PermuteSelf])));
        let backend = TestAccel::new(Vec::new());

        let mut input = Tensor::from_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        input.to_accel(&backend).unwrap();

        // One accel operand against one host-pinned parameter tensor: the
        // parameter does not vote, so dispatch stays on the accelerator.
        exec.permute_self(&mut input, &[1, 0]).unwrap();
        assert_eq!(input.device(), DeviceKind::Accel);
    }

    #[test]
    fn test_tie_takes_configured_default() {
        let exec = executor();
        let backend = TestAccel::new(Vec::new());

        let mut input0 = Tensor::from_f32(&[2], &[1.0, 2.0]);
        let mut input1 = Tensor::from_f32(&[2], &[3.0, 4.0]);
        input1.to_accel(&backend).unwrap();

        // One host, one accel; default device is host and no accelerator
        // is registered, so both land on host.
        exec.mul_to(&mut input0, &mut input1).unwrap();
        assert_eq!(input1.device(), DeviceKind::Host);
    }
}
