//! # kore-graph
//!
//! GPU command buffers for Kore.
//!
//! Record a sequence of device operations once, instantiate it into an
//! executable graph, then patch individual operations in place on later
//! runs instead of re-recording.
//!
//! Provides:
//! - `CommandBuffer` with a create / finalize / update state machine
//! - Kernel launch, device-to-device copy and nested command buffer nodes
//! - Predicate-driven conditional branches (`if_then`)
//! - Stream capture into a command buffer (`trace`)
//! - Allocated/alive executable counters (`ExecMetrics`)
//! - `GraphDriver` trait with a host reference driver and a CUDA driver-API
//!   backend (behind the `cuda` feature flag)
//!
//! ```
//! use kore_graph::host::HostGraphDriver;
//! use kore_graph::{grid_1d, CommandBuffer, DevicePtr, PackedArgs};
//!
//! let driver = HostGraphDriver::new();
//! let scale = driver.kernel("scale", 2);
//!
//! let mut cb = CommandBuffer::primary(driver.clone())?;
//! let args = PackedArgs::new().push_ptr(DevicePtr(0x1000)).push_f32(2.0);
//! cb.launch(&grid_1d(1024, 256), &scale, &args.into())?;
//! cb.finalize()?;
//!
//! // Same shape, new scalar.
//! cb.update()?;
//! let args = PackedArgs::new().push_ptr(DevicePtr(0x1000)).push_f32(4.0);
//! cb.launch(&grid_1d(1024, 256), &scale, &args.into())?;
//! cb.finalize()?;
//! assert_eq!(cb.num_updates(), 1);
//! # Ok::<(), kore_graph::GraphError>(())
//! ```

pub mod error;
pub mod config;
pub mod driver;
pub mod kernel;
pub mod metrics;
pub mod resource;
pub mod command_buffer;
mod conditional;
mod trace;
pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use command_buffer::{CommandBuffer, Mode, NodeKind, State};
pub use config::{CaptureMode, GraphConfig, InstantiateFlags};
pub use driver::{
    ConditionalHandle, DevicePtr, ExecHandle, GraphDriver, GraphHandle, NodeHandle, Platform,
    StreamHandle,
};
pub use error::{DriverError, ErrorKind, GraphError};
pub use kernel::{grid_1d, grid_2d, FunctionHandle, Kernel, KernelArgs, KernelLoader, LaunchConfig, PackedArgs};
pub use metrics::ExecMetrics;
pub use resource::{Executable, GraphRef, OwnedGraph};

pub type Result<T> = std::result::Result<T, GraphError>;
