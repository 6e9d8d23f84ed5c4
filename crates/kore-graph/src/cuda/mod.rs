//! CUDA driver-API backend for command buffers.
//!
//! Uses `libloading` for runtime-loaded CUDA driver function pointers
//! (no build-time CUDA dependency).
//!
//! Provides:
//! - Runtime CUDA detection
//! - `CudaGraphDriver`: graph construction, instantiation, in-place patching
//!   and stream capture on the calling thread's current context
//! - `CudaModule`: loading precompiled kernel images, including the
//!   set-condition kernel used by conditional commands

pub mod ffi;
pub mod driver;
pub mod module;

pub use driver::{is_cuda_available, CudaGraphDriver, CudaStream};
pub use module::CudaModule;
