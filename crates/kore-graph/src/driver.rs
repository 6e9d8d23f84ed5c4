//! Graph driver interface.
//!
//! The command buffer never talks to a GPU API directly. Everything it needs
//! (node creation, instantiation, in-place patching, stream capture, teardown)
//! goes through [`GraphDriver`]. Handles are opaque 64-bit values owned by the
//! driver; the core only copies them around.

use std::fmt;

use crate::config::{CaptureMode, InstantiateFlags};
use crate::error::DriverError;
use crate::kernel::{FunctionHandle, LaunchConfig, PackedArgs};

/// Result of a driver call.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw driver value.
            pub fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

opaque_handle!(
    /// Mutable graph under construction.
    GraphHandle
);
opaque_handle!(
    /// Node inside a graph.
    NodeHandle
);
opaque_handle!(
    /// Instantiated executable graph.
    ExecHandle
);
opaque_handle!(
    /// Device stream.
    StreamHandle
);
opaque_handle!(
    /// Device memory address.
    DevicePtr
);
opaque_handle!(
    /// Device-resident value gating a conditional node.
    ConditionalHandle
);

/// Which backend a driver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// In-process reference driver.
    Host,
    /// CUDA driver API.
    Cuda,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Host => write!(f, "host"),
            Platform::Cuda => write!(f, "cuda"),
        }
    }
}

/// Parameters of a kernel node.
#[derive(Debug, Clone, Copy)]
pub struct KernelNodeParams<'a> {
    pub kernel_name: &'a str,
    pub function: FunctionHandle,
    pub config: &'a LaunchConfig,
    pub args: &'a PackedArgs,
}

/// Kind of a conditional node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionalType {
    /// Body runs once if the handle is non-zero.
    If,
}

/// A conditional node and the body graph the driver created for it.
///
/// The body graph belongs to the conditional node and is released together
/// with the enclosing graph.
#[derive(Debug, Clone, Copy)]
pub struct ConditionalNode {
    pub node: NodeHandle,
    pub body: GraphHandle,
}

/// Primitive graph operations consumed by [`CommandBuffer`](crate::CommandBuffer).
///
/// `deps` is the predecessor set of a new node.
pub trait GraphDriver: Send + Sync {
    /// Backend this driver belongs to.
    fn platform(&self) -> Platform;

    fn create_graph(&self) -> DriverResult<GraphHandle>;

    fn add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        params: &KernelNodeParams<'_>,
    ) -> DriverResult<NodeHandle>;

    /// Add a device-to-device copy of `size` bytes.
    fn add_memcpy_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        dst: DevicePtr,
        src: DevicePtr,
        size: u64,
    ) -> DriverResult<NodeHandle>;

    fn add_child_graph_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        child: GraphHandle,
    ) -> DriverResult<NodeHandle>;

    fn create_conditional_handle(
        &self,
        graph: GraphHandle,
        default_launch_value: u32,
        flags: u32,
    ) -> DriverResult<ConditionalHandle>;

    fn add_conditional_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        kind: ConditionalType,
        handle: ConditionalHandle,
    ) -> DriverResult<ConditionalNode>;

    fn instantiate(&self, graph: GraphHandle, flags: InstantiateFlags) -> DriverResult<ExecHandle>;

    /// Patch a kernel node of an executable in place.
    fn exec_kernel_node_set_params(
        &self,
        exec: ExecHandle,
        node: NodeHandle,
        params: &KernelNodeParams<'_>,
    ) -> DriverResult<()>;

    /// Point a child-graph node of an executable at a different graph.
    fn exec_child_node_set_params(
        &self,
        exec: ExecHandle,
        node: NodeHandle,
        child: GraphHandle,
    ) -> DriverResult<()>;

    fn destroy_graph(&self, graph: GraphHandle) -> DriverResult<()>;

    fn destroy_exec(&self, exec: ExecHandle) -> DriverResult<()>;

    fn stream_begin_capture(&self, stream: StreamHandle, mode: CaptureMode) -> DriverResult<()>;

    /// Stop capturing and hand back the graph holding the captured work.
    fn stream_end_capture(&self, stream: StreamHandle) -> DriverResult<GraphHandle>;
}
