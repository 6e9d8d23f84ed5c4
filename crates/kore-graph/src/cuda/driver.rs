//! [`GraphDriver`] over the CUDA driver API.
//!
//! All calls go through runtime-loaded function pointers from `ffi.rs`.
//! Handles are the driver's pointers carried as `u64`.

use std::ffi::c_void;
use std::sync::Arc;

use super::ffi::{self, check_cu, CudaApi, CuContext, CuGraph, CuGraphNode, CUDA_SUCCESS};
use crate::config::{CaptureMode, InstantiateFlags};
use crate::driver::{
    ConditionalHandle, ConditionalNode, ConditionalType, DevicePtr, DriverResult, ExecHandle,
    GraphDriver, GraphHandle, KernelNodeParams, NodeHandle, Platform, StreamHandle,
};
use crate::error::DriverError;

/// Check if CUDA is available (libcuda.so loadable and `cuInit` succeeds).
pub fn is_cuda_available() -> bool {
    match ffi::cuda_api() {
        Some(api) => (unsafe { (api.cu_init)(0) }) == CUDA_SUCCESS,
        None => false,
    }
}

fn not_available(op: &str) -> DriverError {
    DriverError::new(op, "libcuda.so could not be loaded")
}

fn ptr(raw: u64) -> *mut c_void {
    raw as usize as *mut c_void
}

fn raw(p: *mut c_void) -> u64 {
    p as usize as u64
}

fn node_ptrs(deps: &[NodeHandle]) -> Vec<CuGraphNode> {
    deps.iter().map(|d| ptr(d.0)).collect()
}

/// Graph driver bound to one CUDA context.
pub struct CudaGraphDriver {
    api: &'static CudaApi,
    /// `CUcontext` captured at construction.
    context: u64,
    /// Device whose primary context this driver retained, if any.
    retained_device: Option<ffi::CuDevice>,
}

impl CudaGraphDriver {
    /// Driver for the primary context of device `device_idx`, made current on
    /// the calling thread.
    pub fn for_device(device_idx: usize) -> DriverResult<Arc<Self>> {
        let api = ffi::cuda_api().ok_or_else(|| not_available("cuInit"))?;
        check_cu(api, unsafe { (api.cu_init)(0) }, "cuInit")?;

        let mut device: ffi::CuDevice = 0;
        check_cu(api, unsafe { (api.cu_device_get)(&mut device, device_idx as i32) }, "cuDeviceGet")?;
        let mut ctx: CuContext = std::ptr::null_mut();
        check_cu(
            api,
            unsafe { (api.cu_device_primary_ctx_retain)(&mut ctx, device) },
            "cuDevicePrimaryCtxRetain",
        )?;
        let driver = Self { api, context: raw(ctx), retained_device: Some(device) };
        check_cu(api, unsafe { (api.cu_ctx_set_current)(ctx) }, "cuCtxSetCurrent")?;

        tracing::debug!("CUDA graph driver bound to primary context {:#x} of device {}", raw(ctx), device_idx);
        Ok(Arc::new(driver))
    }

    /// Driver for the context current on the calling thread.
    ///
    /// Context creation belongs to the executor; this fails if none is current.
    pub fn current() -> DriverResult<Arc<Self>> {
        let api = ffi::cuda_api().ok_or_else(|| not_available("cuInit"))?;
        check_cu(api, unsafe { (api.cu_init)(0) }, "cuInit")?;

        let mut ctx: CuContext = std::ptr::null_mut();
        check_cu(api, unsafe { (api.cu_ctx_get_current)(&mut ctx) }, "cuCtxGetCurrent")?;
        if ctx.is_null() {
            return Err(DriverError::new("cuCtxGetCurrent", "no CUDA context is current on this thread"));
        }
        tracing::debug!("CUDA graph driver bound to context {:#x}", raw(ctx));
        Ok(Arc::new(Self { api, context: raw(ctx), retained_device: None }))
    }

    fn context(&self) -> CuContext {
        ptr(self.context)
    }

    /// Create a non-blocking stream in this driver's context.
    pub fn create_stream(&self) -> DriverResult<CudaStream> {
        check_cu(self.api, unsafe { (self.api.cu_ctx_set_current)(self.context()) }, "cuCtxSetCurrent")?;
        let mut stream: ffi::CuStream = std::ptr::null_mut();
        // CU_STREAM_NON_BLOCKING
        check_cu(self.api, unsafe { (self.api.cu_stream_create)(&mut stream, 1) }, "cuStreamCreate")?;
        Ok(CudaStream { api: self.api, stream: raw(stream) })
    }

    /// Fill `CUDA_KERNEL_NODE_PARAMS` and run `f` while the argument address
    /// array is alive. The driver copies argument values before returning.
    fn with_kernel_params<R>(
        params: &KernelNodeParams<'_>,
        f: impl FnOnce(&ffi::CudaKernelNodeParams) -> R,
    ) -> R {
        let mut arg_ptrs: Vec<*mut c_void> = params
            .args
            .args()
            .iter()
            .map(|a| a.as_ptr() as *mut c_void)
            .collect();
        let (gx, gy, gz) = params.config.grid_dim;
        let (bx, by, bz) = params.config.block_dim;
        let node_params = ffi::CudaKernelNodeParams {
            func: ptr(params.function.0),
            grid_dim_x: gx,
            grid_dim_y: gy,
            grid_dim_z: gz,
            block_dim_x: bx,
            block_dim_y: by,
            block_dim_z: bz,
            shared_mem_bytes: params.config.shared_mem_bytes,
            kernel_params: if arg_ptrs.is_empty() { std::ptr::null_mut() } else { arg_ptrs.as_mut_ptr() },
            extra: std::ptr::null_mut(),
        };
        f(&node_params)
    }
}

impl Drop for CudaGraphDriver {
    fn drop(&mut self) {
        if let Some(device) = self.retained_device {
            let code = unsafe { (self.api.cu_device_primary_ctx_release)(device) };
            if let Err(e) = check_cu(self.api, code, "cuDevicePrimaryCtxRelease") {
                tracing::warn!("Failed to release primary context of device {}: {}", device, e);
            }
        }
    }
}

/// A CUDA stream, destroyed when dropped.
pub struct CudaStream {
    api: &'static CudaApi,
    stream: u64,
}

impl CudaStream {
    pub fn handle(&self) -> StreamHandle {
        StreamHandle(self.stream)
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        let code = unsafe { (self.api.cu_stream_destroy)(ptr(self.stream)) };
        if let Err(e) = check_cu(self.api, code, "cuStreamDestroy") {
            tracing::warn!("Failed to destroy CUDA stream {:#x}: {}", self.stream, e);
        }
    }
}

impl GraphDriver for CudaGraphDriver {
    fn platform(&self) -> Platform {
        Platform::Cuda
    }

    fn create_graph(&self) -> DriverResult<GraphHandle> {
        let mut graph: CuGraph = std::ptr::null_mut();
        check_cu(self.api, unsafe { (self.api.cu_graph_create)(&mut graph, 0) }, "cuGraphCreate")?;
        Ok(GraphHandle(raw(graph)))
    }

    fn add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        params: &KernelNodeParams<'_>,
    ) -> DriverResult<NodeHandle> {
        let deps = node_ptrs(deps);
        let mut node: CuGraphNode = std::ptr::null_mut();
        let code = Self::with_kernel_params(params, |p| unsafe {
            (self.api.cu_graph_add_kernel_node)(&mut node, ptr(graph.0), deps.as_ptr(), deps.len(), p)
        });
        check_cu(self.api, code, "cuGraphAddKernelNode")?;
        Ok(NodeHandle(raw(node)))
    }

    fn add_memcpy_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        dst: DevicePtr,
        src: DevicePtr,
        size: u64,
    ) -> DriverResult<NodeHandle> {
        let deps = node_ptrs(deps);
        let copy = ffi::CudaMemcpy3D {
            src_x_in_bytes: 0,
            src_y: 0,
            src_z: 0,
            src_lod: 0,
            src_memory_type: ffi::CU_MEMORYTYPE_DEVICE,
            src_host: std::ptr::null(),
            src_device: src.0,
            src_array: std::ptr::null_mut(),
            reserved0: std::ptr::null_mut(),
            src_pitch: 0,
            src_height: 0,
            dst_x_in_bytes: 0,
            dst_y: 0,
            dst_z: 0,
            dst_lod: 0,
            dst_memory_type: ffi::CU_MEMORYTYPE_DEVICE,
            dst_host: std::ptr::null_mut(),
            dst_device: dst.0,
            dst_array: std::ptr::null_mut(),
            reserved1: std::ptr::null_mut(),
            dst_pitch: 0,
            dst_height: 0,
            width_in_bytes: size as usize,
            height: 1,
            depth: 1,
        };
        let mut node: CuGraphNode = std::ptr::null_mut();
        check_cu(
            self.api,
            unsafe {
                (self.api.cu_graph_add_memcpy_node)(
                    &mut node,
                    ptr(graph.0),
                    deps.as_ptr(),
                    deps.len(),
                    &copy,
                    self.context(),
                )
            },
            "cuGraphAddMemcpyNode",
        )?;
        Ok(NodeHandle(raw(node)))
    }

    fn add_child_graph_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        child: GraphHandle,
    ) -> DriverResult<NodeHandle> {
        let deps = node_ptrs(deps);
        let mut node: CuGraphNode = std::ptr::null_mut();
        check_cu(
            self.api,
            unsafe {
                (self.api.cu_graph_add_child_graph_node)(
                    &mut node,
                    ptr(graph.0),
                    deps.as_ptr(),
                    deps.len(),
                    ptr(child.0),
                )
            },
            "cuGraphAddChildGraphNode",
        )?;
        Ok(NodeHandle(raw(node)))
    }

    fn create_conditional_handle(
        &self,
        graph: GraphHandle,
        default_launch_value: u32,
        flags: u32,
    ) -> DriverResult<ConditionalHandle> {
        const OP: &str = "cuGraphConditionalHandleCreate";
        let create = self
            .api
            .cu_graph_conditional_handle_create
            .ok_or_else(|| DriverError::new(OP, "conditional nodes require CUDA 12.3 or newer"))?;
        let mut handle: ffi::CuGraphConditionalHandle = 0;
        check_cu(
            self.api,
            unsafe { create(&mut handle, ptr(graph.0), self.context(), default_launch_value, flags) },
            OP,
        )?;
        Ok(ConditionalHandle(handle))
    }

    fn add_conditional_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        kind: ConditionalType,
        handle: ConditionalHandle,
    ) -> DriverResult<ConditionalNode> {
        const OP: &str = "cuGraphAddNode";
        let add_node = self
            .api
            .cu_graph_add_node
            .ok_or_else(|| DriverError::new(OP, "conditional nodes require CUDA 12.3 or newer"))?;
        let cond_type = match kind {
            ConditionalType::If => ffi::CU_GRAPH_COND_TYPE_IF,
        };

        let mut bodies: [CuGraph; 1] = [std::ptr::null_mut()];
        let mut params = ffi::CuGraphNodeParams {
            node_type: ffi::CU_GRAPH_NODE_TYPE_CONDITIONAL,
            reserved0: [0; 3],
            body: ffi::CuGraphNodeParamsBody {
                conditional: ffi::CudaConditionalNodeParams {
                    handle: handle.0,
                    cond_type,
                    size: 1,
                    ph_graph_out: bodies.as_mut_ptr(),
                    ctx: self.context(),
                },
            },
            reserved2: 0,
        };

        let deps = node_ptrs(deps);
        let mut node: CuGraphNode = std::ptr::null_mut();
        check_cu(
            self.api,
            unsafe { add_node(&mut node, ptr(graph.0), deps.as_ptr(), deps.len(), &mut params) },
            OP,
        )?;
        Ok(ConditionalNode { node: NodeHandle(raw(node)), body: GraphHandle(raw(bodies[0])) })
    }

    fn instantiate(&self, graph: GraphHandle, flags: InstantiateFlags) -> DriverResult<ExecHandle> {
        let mut exec: ffi::CuGraphExec = std::ptr::null_mut();
        check_cu(
            self.api,
            unsafe { (self.api.cu_graph_instantiate_with_flags)(&mut exec, ptr(graph.0), flags.bits()) },
            "cuGraphInstantiateWithFlags",
        )?;
        Ok(ExecHandle(raw(exec)))
    }

    fn exec_kernel_node_set_params(
        &self,
        exec: ExecHandle,
        node: NodeHandle,
        params: &KernelNodeParams<'_>,
    ) -> DriverResult<()> {
        let code = Self::with_kernel_params(params, |p| unsafe {
            (self.api.cu_graph_exec_kernel_node_set_params)(ptr(exec.0), ptr(node.0), p)
        });
        check_cu(self.api, code, "cuGraphExecKernelNodeSetParams")
    }

    fn exec_child_node_set_params(
        &self,
        exec: ExecHandle,
        node: NodeHandle,
        child: GraphHandle,
    ) -> DriverResult<()> {
        check_cu(
            self.api,
            unsafe {
                (self.api.cu_graph_exec_child_graph_node_set_params)(ptr(exec.0), ptr(node.0), ptr(child.0))
            },
            "cuGraphExecChildGraphNodeSetParams",
        )
    }

    fn destroy_graph(&self, graph: GraphHandle) -> DriverResult<()> {
        check_cu(self.api, unsafe { (self.api.cu_graph_destroy)(ptr(graph.0)) }, "cuGraphDestroy")
    }

    fn destroy_exec(&self, exec: ExecHandle) -> DriverResult<()> {
        check_cu(self.api, unsafe { (self.api.cu_graph_exec_destroy)(ptr(exec.0)) }, "cuGraphExecDestroy")
    }

    fn stream_begin_capture(&self, stream: StreamHandle, mode: CaptureMode) -> DriverResult<()> {
        let mode = match mode {
            CaptureMode::Global => ffi::CU_STREAM_CAPTURE_MODE_GLOBAL,
            CaptureMode::ThreadLocal => ffi::CU_STREAM_CAPTURE_MODE_THREAD_LOCAL,
            CaptureMode::Relaxed => ffi::CU_STREAM_CAPTURE_MODE_RELAXED,
        };
        check_cu(
            self.api,
            unsafe { (self.api.cu_stream_begin_capture)(ptr(stream.0), mode) },
            "cuStreamBeginCapture",
        )
    }

    fn stream_end_capture(&self, stream: StreamHandle) -> DriverResult<GraphHandle> {
        let mut graph: CuGraph = std::ptr::null_mut();
        check_cu(
            self.api,
            unsafe { (self.api.cu_stream_end_capture)(ptr(stream.0), &mut graph) },
            "cuStreamEndCapture",
        )?;
        Ok(GraphHandle(raw(graph)))
    }
}
