//! Kernel references, launch dimensions and packed kernel arguments.

use std::fmt;

use crate::driver::DevicePtr;
use crate::Result;

/// Resolved device entry point of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub u64);

impl fmt::Display for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A loaded kernel: name plus resolved entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    name: String,
    function: FunctionHandle,
    arity: usize,
}

impl Kernel {
    pub fn new(name: impl Into<String>, function: FunctionHandle, arity: usize) -> Self {
        Self { name: name.into(), function, arity }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function(&self) -> FunctionHandle {
        self.function
    }

    /// Number of arguments the kernel takes.
    pub fn arity(&self) -> usize {
        self.arity
    }
}

/// Grid/block dimensions and dynamic shared memory of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchConfig {
    pub grid_dim: (u32, u32, u32),
    pub block_dim: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchConfig {
    /// A single thread in a single block.
    pub fn single() -> Self {
        Self { grid_dim: (1, 1, 1), block_dim: (1, 1, 1), shared_mem_bytes: 0 }
    }
}

/// Grid dimensions for a 1D kernel covering `n` elements.
///
/// `block_size` must be non-zero and the grid must fit in `u32`.
pub fn grid_1d(n: usize, block_size: usize) -> LaunchConfig {
    let grid = n.div_ceil(block_size);
    LaunchConfig {
        grid_dim: (grid as u32, 1, 1),
        block_dim: (block_size as u32, 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Grid dimensions for a 2D kernel covering a `rows x cols` matrix.
///
/// Block dimensions must be non-zero and every dimension must fit in `u32`.
pub fn grid_2d(rows: usize, cols: usize, block_x: usize, block_y: usize) -> LaunchConfig {
    LaunchConfig {
        grid_dim: (cols.div_ceil(block_x) as u32, rows.div_ceil(block_y) as u32, 1),
        block_dim: (block_x as u32, block_y as u32, 1),
        shared_mem_bytes: 0,
    }
}

/// Kernel arguments packed into per-argument byte storage.
///
/// Drivers that need an array of argument addresses (as `cuLaunchKernel`
/// does) point at each entry of [`PackedArgs::args`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackedArgs {
    args: Vec<Vec<u8>>,
}

impl PackedArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ptr(mut self, ptr: DevicePtr) -> Self {
        self.args.push(ptr.0.to_ne_bytes().to_vec());
        self
    }

    pub fn push_u64(mut self, v: u64) -> Self {
        self.args.push(v.to_ne_bytes().to_vec());
        self
    }

    pub fn push_u32(mut self, v: u32) -> Self {
        self.args.push(v.to_ne_bytes().to_vec());
        self
    }

    pub fn push_i32(mut self, v: i32) -> Self {
        self.args.push(v.to_ne_bytes().to_vec());
        self
    }

    pub fn push_f32(mut self, v: f32) -> Self {
        self.args.push(v.to_ne_bytes().to_vec());
        self
    }

    /// Push an argument given as raw bytes (e.g. a by-value struct).
    pub fn push_bytes(mut self, bytes: &[u8]) -> Self {
        self.args.push(bytes.to_vec());
        self
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

/// Kernel arguments as handed to [`CommandBuffer::launch`](crate::CommandBuffer::launch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArgs {
    /// Arguments already packed for the driver.
    Packed(PackedArgs),
    /// Bare device buffers that still need packing against a kernel signature.
    DeviceMemory(Vec<DevicePtr>),
}

impl KernelArgs {
    /// The packed form, if these arguments are packed.
    pub fn as_packed(&self) -> Option<&PackedArgs> {
        match self {
            KernelArgs::Packed(packed) => Some(packed),
            KernelArgs::DeviceMemory(_) => None,
        }
    }
}

impl From<PackedArgs> for KernelArgs {
    fn from(packed: PackedArgs) -> Self {
        KernelArgs::Packed(packed)
    }
}

/// Name under which the set-condition kernel is bound.
pub const SET_CONDITION_KERNEL: &str = "set_condition";

/// Executor-side kernel binding needed by conditional commands.
pub trait KernelLoader {
    /// Bind the in-process kernel that reads a `bool` predicate buffer and
    /// writes the result into a conditional handle.
    ///
    /// The kernel takes `(ConditionalHandle, *const bool)`.
    fn set_condition_kernel(&self) -> Result<Kernel>;
}
