//! Runtime-loaded CUDA driver API function pointers via dlopen.
//!
//! No build-time CUDA dependency: works with any driver that ships
//! `libcuda.so`. Conditional-node entry points (CUDA 12.3+) are optional so
//! older drivers still load.

use std::ffi::{c_char, c_int, c_uint, c_ulonglong, c_void, CStr};
use std::sync::OnceLock;

use libloading::Library;

use crate::error::DriverError;

// ---------------------------------------------------------------------------
// Status codes, handles and enums
// ---------------------------------------------------------------------------

pub type CuResult = c_int;
pub const CUDA_SUCCESS: CuResult = 0;

pub type CuDevice = c_int;
pub type CuContext = *mut c_void;
pub type CuModule = *mut c_void;
pub type CuFunction = *mut c_void;
pub type CuStream = *mut c_void;
pub type CuGraph = *mut c_void;
pub type CuGraphNode = *mut c_void;
pub type CuGraphExec = *mut c_void;
pub type CuDevicePtr = c_ulonglong;
pub type CuGraphConditionalHandle = c_ulonglong;

pub const CU_MEMORYTYPE_DEVICE: c_uint = 2;

pub const CU_GRAPH_NODE_TYPE_CONDITIONAL: c_int = 13;
pub const CU_GRAPH_COND_TYPE_IF: c_int = 0;

pub const CU_STREAM_CAPTURE_MODE_GLOBAL: c_int = 0;
pub const CU_STREAM_CAPTURE_MODE_THREAD_LOCAL: c_int = 1;
pub const CU_STREAM_CAPTURE_MODE_RELAXED: c_int = 2;

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

/// `CUDA_KERNEL_NODE_PARAMS_v1`.
#[repr(C)]
pub struct CudaKernelNodeParams {
    pub func: CuFunction,
    pub grid_dim_x: c_uint,
    pub grid_dim_y: c_uint,
    pub grid_dim_z: c_uint,
    pub block_dim_x: c_uint,
    pub block_dim_y: c_uint,
    pub block_dim_z: c_uint,
    pub shared_mem_bytes: c_uint,
    pub kernel_params: *mut *mut c_void,
    pub extra: *mut *mut c_void,
}

/// `CUDA_MEMCPY3D`.
#[repr(C)]
pub struct CudaMemcpy3D {
    pub src_x_in_bytes: usize,
    pub src_y: usize,
    pub src_z: usize,
    pub src_lod: usize,
    pub src_memory_type: c_uint,
    pub src_host: *const c_void,
    pub src_device: CuDevicePtr,
    pub src_array: *mut c_void,
    pub reserved0: *mut c_void,
    pub src_pitch: usize,
    pub src_height: usize,

    pub dst_x_in_bytes: usize,
    pub dst_y: usize,
    pub dst_z: usize,
    pub dst_lod: usize,
    pub dst_memory_type: c_uint,
    pub dst_host: *mut c_void,
    pub dst_device: CuDevicePtr,
    pub dst_array: *mut c_void,
    pub reserved1: *mut c_void,
    pub dst_pitch: usize,
    pub dst_height: usize,

    pub width_in_bytes: usize,
    pub height: usize,
    pub depth: usize,
}

/// `CUDA_CONDITIONAL_NODE_PARAMS`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CudaConditionalNodeParams {
    pub handle: CuGraphConditionalHandle,
    pub cond_type: c_int,
    pub size: c_uint,
    /// Filled by the driver with `size` body graphs.
    pub ph_graph_out: *mut CuGraph,
    pub ctx: CuContext,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union CuGraphNodeParamsBody {
    pub reserved1: [i64; 29],
    pub conditional: CudaConditionalNodeParams,
}

/// `CUgraphNodeParams` (256 bytes).
#[repr(C)]
pub struct CuGraphNodeParams {
    pub node_type: c_int,
    pub reserved0: [c_int; 3],
    pub body: CuGraphNodeParamsBody,
    pub reserved2: i64,
}

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuGetErrorString = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;
type FnCuDeviceGet = unsafe extern "C" fn(*mut CuDevice, c_int) -> CuResult;
type FnCuDevicePrimaryCtxRetain = unsafe extern "C" fn(*mut CuContext, CuDevice) -> CuResult;
type FnCuDevicePrimaryCtxRelease = unsafe extern "C" fn(CuDevice) -> CuResult;
type FnCuCtxGetCurrent = unsafe extern "C" fn(*mut CuContext) -> CuResult;
type FnCuCtxSetCurrent = unsafe extern "C" fn(CuContext) -> CuResult;
type FnCuStreamCreate = unsafe extern "C" fn(*mut CuStream, c_uint) -> CuResult;
type FnCuStreamDestroy = unsafe extern "C" fn(CuStream) -> CuResult;
type FnCuModuleLoadData = unsafe extern "C" fn(*mut CuModule, *const c_void) -> CuResult;
type FnCuModuleGetFunction = unsafe extern "C" fn(*mut CuFunction, CuModule, *const c_char) -> CuResult;
type FnCuModuleUnload = unsafe extern "C" fn(CuModule) -> CuResult;
type FnCuGraphCreate = unsafe extern "C" fn(*mut CuGraph, c_uint) -> CuResult;
type FnCuGraphDestroy = unsafe extern "C" fn(CuGraph) -> CuResult;
type FnCuGraphAddKernelNode = unsafe extern "C" fn(
    *mut CuGraphNode, CuGraph, *const CuGraphNode, usize, *const CudaKernelNodeParams,
) -> CuResult;
type FnCuGraphAddMemcpyNode = unsafe extern "C" fn(
    *mut CuGraphNode, CuGraph, *const CuGraphNode, usize, *const CudaMemcpy3D, CuContext,
) -> CuResult;
type FnCuGraphAddChildGraphNode = unsafe extern "C" fn(
    *mut CuGraphNode, CuGraph, *const CuGraphNode, usize, CuGraph,
) -> CuResult;
type FnCuGraphConditionalHandleCreate = unsafe extern "C" fn(
    *mut CuGraphConditionalHandle, CuGraph, CuContext, c_uint, c_uint,
) -> CuResult;
type FnCuGraphAddNode = unsafe extern "C" fn(
    *mut CuGraphNode, CuGraph, *const CuGraphNode, usize, *mut CuGraphNodeParams,
) -> CuResult;
type FnCuGraphInstantiateWithFlags = unsafe extern "C" fn(*mut CuGraphExec, CuGraph, c_ulonglong) -> CuResult;
type FnCuGraphExecKernelNodeSetParams = unsafe extern "C" fn(
    CuGraphExec, CuGraphNode, *const CudaKernelNodeParams,
) -> CuResult;
type FnCuGraphExecChildGraphNodeSetParams = unsafe extern "C" fn(CuGraphExec, CuGraphNode, CuGraph) -> CuResult;
type FnCuGraphExecDestroy = unsafe extern "C" fn(CuGraphExec) -> CuResult;
type FnCuStreamBeginCapture = unsafe extern "C" fn(CuStream, c_int) -> CuResult;
type FnCuStreamEndCapture = unsafe extern "C" fn(CuStream, *mut CuGraph) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct CudaApi {
    _lib: Library,
    pub cu_init: FnCuInit,
    pub cu_get_error_string: FnCuGetErrorString,
    pub cu_device_get: FnCuDeviceGet,
    pub cu_device_primary_ctx_retain: FnCuDevicePrimaryCtxRetain,
    pub cu_device_primary_ctx_release: FnCuDevicePrimaryCtxRelease,
    pub cu_ctx_get_current: FnCuCtxGetCurrent,
    pub cu_ctx_set_current: FnCuCtxSetCurrent,
    pub cu_stream_create: FnCuStreamCreate,
    pub cu_stream_destroy: FnCuStreamDestroy,
    pub cu_module_load_data: FnCuModuleLoadData,
    pub cu_module_get_function: FnCuModuleGetFunction,
    pub cu_module_unload: FnCuModuleUnload,
    pub cu_graph_create: FnCuGraphCreate,
    pub cu_graph_destroy: FnCuGraphDestroy,
    pub cu_graph_add_kernel_node: FnCuGraphAddKernelNode,
    pub cu_graph_add_memcpy_node: FnCuGraphAddMemcpyNode,
    pub cu_graph_add_child_graph_node: FnCuGraphAddChildGraphNode,
    pub cu_graph_instantiate_with_flags: FnCuGraphInstantiateWithFlags,
    pub cu_graph_exec_kernel_node_set_params: FnCuGraphExecKernelNodeSetParams,
    pub cu_graph_exec_child_graph_node_set_params: FnCuGraphExecChildGraphNodeSetParams,
    pub cu_graph_exec_destroy: FnCuGraphExecDestroy,
    pub cu_stream_begin_capture: FnCuStreamBeginCapture,
    pub cu_stream_end_capture: FnCuStreamEndCapture,
    // CUDA 12.3+
    pub cu_graph_conditional_handle_create: Option<FnCuGraphConditionalHandleCreate>,
    pub cu_graph_add_node: Option<FnCuGraphAddNode>,
}

// Safety: the loaded function pointers are process-global and the CUDA
// driver API is thread-safe.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

static CUDA_API: OnceLock<Option<CudaApi>> = OnceLock::new();

impl CudaApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libcuda.so.1") }
            .or_else(|_| unsafe { Library::new("libcuda.so") })
            .ok()?;
        unsafe {
            let api = CudaApi {
                cu_init: *lib.get::<FnCuInit>(b"cuInit\0").ok()?,
                cu_get_error_string: *lib.get::<FnCuGetErrorString>(b"cuGetErrorString\0").ok()?,
                cu_device_get: *lib.get::<FnCuDeviceGet>(b"cuDeviceGet\0").ok()?,
                cu_device_primary_ctx_retain: *lib
                    .get::<FnCuDevicePrimaryCtxRetain>(b"cuDevicePrimaryCtxRetain\0")
                    .ok()?,
                cu_device_primary_ctx_release: *lib
                    .get::<FnCuDevicePrimaryCtxRelease>(b"cuDevicePrimaryCtxRelease_v2\0")
                    .ok()?,
                cu_ctx_get_current: *lib.get::<FnCuCtxGetCurrent>(b"cuCtxGetCurrent\0").ok()?,
                cu_ctx_set_current: *lib.get::<FnCuCtxSetCurrent>(b"cuCtxSetCurrent\0").ok()?,
                cu_stream_create: *lib.get::<FnCuStreamCreate>(b"cuStreamCreate\0").ok()?,
                cu_stream_destroy: *lib.get::<FnCuStreamDestroy>(b"cuStreamDestroy_v2\0").ok()?,
                cu_module_load_data: *lib.get::<FnCuModuleLoadData>(b"cuModuleLoadData\0").ok()?,
                cu_module_get_function: *lib.get::<FnCuModuleGetFunction>(b"cuModuleGetFunction\0").ok()?,
                cu_module_unload: *lib.get::<FnCuModuleUnload>(b"cuModuleUnload\0").ok()?,
                cu_graph_create: *lib.get::<FnCuGraphCreate>(b"cuGraphCreate\0").ok()?,
                cu_graph_destroy: *lib.get::<FnCuGraphDestroy>(b"cuGraphDestroy\0").ok()?,
                cu_graph_add_kernel_node: *lib.get::<FnCuGraphAddKernelNode>(b"cuGraphAddKernelNode\0").ok()?,
                cu_graph_add_memcpy_node: *lib.get::<FnCuGraphAddMemcpyNode>(b"cuGraphAddMemcpyNode\0").ok()?,
                cu_graph_add_child_graph_node: *lib
                    .get::<FnCuGraphAddChildGraphNode>(b"cuGraphAddChildGraphNode\0")
                    .ok()?,
                cu_graph_instantiate_with_flags: *lib
                    .get::<FnCuGraphInstantiateWithFlags>(b"cuGraphInstantiateWithFlags\0")
                    .ok()?,
                cu_graph_exec_kernel_node_set_params: *lib
                    .get::<FnCuGraphExecKernelNodeSetParams>(b"cuGraphExecKernelNodeSetParams\0")
                    .ok()?,
                cu_graph_exec_child_graph_node_set_params: *lib
                    .get::<FnCuGraphExecChildGraphNodeSetParams>(b"cuGraphExecChildGraphNodeSetParams\0")
                    .ok()?,
                cu_graph_exec_destroy: *lib.get::<FnCuGraphExecDestroy>(b"cuGraphExecDestroy\0").ok()?,
                cu_stream_begin_capture: *lib.get::<FnCuStreamBeginCapture>(b"cuStreamBeginCapture_v2\0").ok()?,
                cu_stream_end_capture: *lib.get::<FnCuStreamEndCapture>(b"cuStreamEndCapture\0").ok()?,
                cu_graph_conditional_handle_create: lib
                    .get::<FnCuGraphConditionalHandleCreate>(b"cuGraphConditionalHandleCreate\0")
                    .ok()
                    .map(|f| *f),
                cu_graph_add_node: lib.get::<FnCuGraphAddNode>(b"cuGraphAddNode\0").ok().map(|f| *f),
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// Get the runtime-loaded CUDA driver API. Returns None if libcuda.so not found.
pub fn cuda_api() -> Option<&'static CudaApi> {
    CUDA_API.get_or_init(CudaApi::try_load).as_ref()
}

// ---------------------------------------------------------------------------
// Error checking
// ---------------------------------------------------------------------------

/// Check a CUDA driver API return code, attaching the driver's error string.
pub fn check_cu(api: &CudaApi, code: CuResult, op: &str) -> Result<(), DriverError> {
    if code == CUDA_SUCCESS {
        return Ok(());
    }
    let mut msg: *const c_char = std::ptr::null();
    let described = unsafe { (api.cu_get_error_string)(code, &mut msg) } == CUDA_SUCCESS && !msg.is_null();
    let msg = if described {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    } else {
        format!("CUDA error {code}")
    };
    Err(DriverError::new(op, msg))
}
