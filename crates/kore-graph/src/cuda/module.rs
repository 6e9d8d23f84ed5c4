//! Precompiled kernel modules.

use std::ffi::{c_void, CString};
use std::path::Path;

use super::ffi::{self, check_cu, CudaApi, CuFunction, CuModule};
use crate::error::{DriverError, GraphError};
use crate::kernel::{FunctionHandle, Kernel, KernelLoader, SET_CONDITION_KERNEL};
use crate::Result;

/// A loaded CUDA module (PTX, cubin or fatbin image).
///
/// Unloaded on drop. Kernels resolved from it must not outlive it.
pub struct CudaModule {
    api: &'static CudaApi,
    module: u64,
}

impl CudaModule {
    /// Load a module image into the current context.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        let api = ffi::cuda_api().ok_or_else(|| DriverError::new("cuModuleLoadData", "libcuda.so could not be loaded"))?;
        // PTX images are read as C strings.
        let mut data = image.to_vec();
        data.push(0);

        let mut module: CuModule = std::ptr::null_mut();
        check_cu(
            api,
            unsafe { (api.cu_module_load_data)(&mut module, data.as_ptr() as *const c_void) },
            "cuModuleLoadData",
        )?;
        tracing::debug!("Loaded CUDA module {:#x} ({} bytes)", module as usize, image.len());
        Ok(Self { api, module: module as usize as u64 })
    }

    /// Load a module image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = std::fs::read(path)
            .map_err(|e| GraphError::Config(format!("cannot read kernel module {}: {e}", path.display())))?;
        Self::from_image(&image)
    }

    /// Resolve a kernel by its (unmangled) name.
    pub fn kernel(&self, name: &str, arity: usize) -> Result<Kernel> {
        let c_name = CString::new(name)
            .map_err(|_| GraphError::BadArgument(format!("kernel name {name:?} contains a NUL byte")))?;
        let mut function: CuFunction = std::ptr::null_mut();
        check_cu(
            self.api,
            unsafe {
                (self.api.cu_module_get_function)(&mut function, self.module as usize as CuModule, c_name.as_ptr())
            },
            "cuModuleGetFunction",
        )?;
        Ok(Kernel::new(name, FunctionHandle(function as usize as u64), arity))
    }
}

impl KernelLoader for CudaModule {
    fn set_condition_kernel(&self) -> Result<Kernel> {
        self.kernel(SET_CONDITION_KERNEL, 2)
    }
}

impl Drop for CudaModule {
    fn drop(&mut self) {
        let code = unsafe { (self.api.cu_module_unload)(self.module as usize as CuModule) };
        if let Err(e) = check_cu(self.api, code, "cuModuleUnload") {
            tracing::warn!("Failed to unload CUDA module {:#x}: {e}", self.module);
        }
    }
}
