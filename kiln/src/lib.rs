//! Kiln: tensor storage and operation dispatch for on-device LLM inference
//!
//! This crate provides the core types: strided tensors with sub-byte
//! quantization and reserved-capacity growth, host/accelerator placement,
//! the closed operation vocabulary with its dispatch executor, and the
//! versioned binary weight format. Backend kernel implementations live in
//! separate crates.

pub mod config;
pub mod device;
pub mod dtype;
pub mod error;
pub mod executor;
pub mod ops;
pub mod quant;
pub mod sampling;
pub mod tensor;
pub mod weights;

pub use config::EngineConfig;
#[cfg(feature = "cuda")]
pub use device::CudaAccelerator;
pub use device::{DeviceBackend, DeviceBuffer, DeviceKind, StubAccelerator};
pub use dtype::DType;
pub use error::{Error, Result};
pub use executor::Executor;
pub use ops::{Op, OpKind};
pub use quant::QuantConfig;
pub use sampling::TokenPenaltyManager;
pub use tensor::{DeferredSource, Tensor, WeightKind};
pub use weights::WeightStore;
