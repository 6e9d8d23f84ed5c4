//! Command buffer state machine and node recording.
//!
//! A command buffer records operations into a driver graph as a strict
//! sequential chain: every new node depends on the previously recorded one.
//! After [`CommandBuffer::finalize`] a primary buffer owns an executable graph.
//! [`CommandBuffer::update`] then starts a patch pass in which the same
//! recording calls, issued in the same order, rewrite the parameters of the
//! already recorded nodes instead of appending new ones.
//!
//! ```text
//!   Create ──finalize──▶ Finalized ──update──▶ Update
//!                           ▲                     │
//!                           └──────finalize───────┘
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::config::GraphConfig;
use crate::driver::{DevicePtr, ExecHandle, GraphDriver, GraphHandle, KernelNodeParams, NodeHandle};
use crate::error::GraphError;
use crate::kernel::{Kernel, KernelArgs, LaunchConfig};
use crate::metrics::ExecMetrics;
use crate::resource::{Executable, GraphRef, OwnedGraph};
use crate::Result;

/// Whether a command buffer is independently executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Instantiates an executable graph on finalize.
    Primary,
    /// Sub-graph embedded in a primary buffer; never instantiated.
    Nested,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Primary => write!(f, "primary"),
            Mode::Nested => write!(f, "nested"),
        }
    }
}

/// Which operations a command buffer currently accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Recording calls append nodes.
    Create,
    /// Recording calls patch recorded nodes in order.
    Update,
    /// Sealed; only `update` is accepted.
    Finalized,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Create => write!(f, "create"),
            State::Update => write!(f, "update"),
            State::Finalized => write!(f, "finalized"),
        }
    }
}

/// Operation a recorded node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Kernel,
    Memcpy,
    ChildGraph,
    Conditional,
}

impl NodeKind {
    /// Whether an update pass can rewrite a node of this kind.
    pub fn is_patchable(self) -> bool {
        matches!(self, NodeKind::Kernel | NodeKind::ChildGraph)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Kernel => write!(f, "kernel"),
            NodeKind::Memcpy => write!(f, "memcpy"),
            NodeKind::ChildGraph => write!(f, "child graph"),
            NodeKind::Conditional => write!(f, "conditional"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RecordedNode {
    handle: NodeHandle,
    kind: NodeKind,
}

/// Recorded sequence of GPU operations backed by a driver graph.
pub struct CommandBuffer {
    mode: Mode,
    state: State,
    driver: Arc<dyn GraphDriver>,
    metrics: Arc<ExecMetrics>,
    config: GraphConfig,
    // Dropped before the graph it was instantiated from.
    exec: Option<Executable>,
    graph: GraphRef,
    nodes: Vec<RecordedNode>,
    update_cursor: usize,
    num_updates: u64,
}

impl CommandBuffer {
    /// Wrap `graph` into a command buffer in the `Create` state.
    pub fn new(driver: Arc<dyn GraphDriver>, mode: Mode, graph: GraphRef) -> Self {
        Self {
            mode,
            state: State::Create,
            driver,
            metrics: ExecMetrics::global(),
            config: GraphConfig::default(),
            exec: None,
            graph,
            nodes: Vec::new(),
            update_cursor: 0,
            num_updates: 0,
        }
    }

    /// Create a command buffer recording into a fresh graph it owns.
    pub fn create(driver: Arc<dyn GraphDriver>, mode: Mode) -> Result<Self> {
        let graph = OwnedGraph::create(Arc::clone(&driver))?;
        Ok(Self::new(driver, mode, GraphRef::Owned(graph)))
    }

    /// Primary command buffer over a fresh owned graph.
    pub fn primary(driver: Arc<dyn GraphDriver>) -> Result<Self> {
        Self::create(driver, Mode::Primary)
    }

    /// Nested command buffer over a fresh owned graph.
    pub fn nested(driver: Arc<dyn GraphDriver>) -> Result<Self> {
        Self::create(driver, Mode::Nested)
    }

    /// Replace the default configuration.
    pub fn with_config(mut self, config: GraphConfig) -> Self {
        self.config = config;
        self
    }

    /// Count executables in `metrics` instead of the process-wide registry.
    pub fn with_metrics(mut self, metrics: Arc<ExecMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Primary or nested.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current state of the create / finalize / update cycle.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ExecMetrics> {
        &self.metrics
    }

    pub fn driver(&self) -> &Arc<dyn GraphDriver> {
        &self.driver
    }

    /// Graph this buffer records into.
    pub fn graph(&self) -> GraphHandle {
        self.graph.handle()
    }

    /// Whether dropping this buffer destroys its graph.
    pub fn owns_graph(&self) -> bool {
        self.graph.is_owned()
    }

    /// Executable graph, present on primary buffers after the first finalize.
    pub fn executable(&self) -> Option<ExecHandle> {
        self.exec.as_ref().map(Executable::handle)
    }

    /// Number of recorded nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Recorded node handles in recording order.
    pub fn nodes(&self) -> Vec<NodeHandle> {
        self.nodes.iter().map(|n| n.handle).collect()
    }

    /// Position the next patch call of an update pass will rewrite.
    pub fn update_cursor(&self) -> usize {
        self.update_cursor
    }

    /// Completed update passes.
    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    /// Record a kernel launch, or patch the kernel node at the cursor during
    /// an update pass.
    ///
    /// Only [`KernelArgs::Packed`] arguments are accepted.
    pub fn launch(&mut self, config: &LaunchConfig, kernel: &Kernel, args: &KernelArgs) -> Result<()> {
        self.check_not_finalized("launch a kernel")?;

        let packed = args
            .as_packed()
            .ok_or_else(|| GraphError::BadArgument("unsupported kernel arguments type".into()))?;
        let params = KernelNodeParams {
            kernel_name: kernel.name(),
            function: kernel.function(),
            config,
            args: packed,
        };

        match self.state {
            State::Create => {
                let deps = self.dependencies();
                let node = self.driver.add_kernel_node(self.graph(), &deps, &params)?;
                tracing::trace!("Add kernel node {} ({}) to graph {}", node, kernel.name(), self.graph());
                self.push_node(node, NodeKind::Kernel);
                Ok(())
            }
            State::Update => {
                let (exec, node) = self.next_patch(NodeKind::Kernel)?;
                self.driver.exec_kernel_node_set_params(exec, node, &params)?;
                tracing::trace!("Update kernel node {} ({}) in executable graph {}", node, kernel.name(), exec);
                self.update_cursor += 1;
                Ok(())
            }
            State::Finalized => Err(self.state_error("launch a kernel")),
        }
    }

    /// Record a device-to-device copy of `size` bytes.
    ///
    /// Copies can only be recorded while constructing; an update pass can't
    /// patch them.
    pub fn memcpy_device_to_device(&mut self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<()> {
        self.check_not_finalized("record a memcpy")?;

        match self.state {
            State::Create => {
                let deps = self.dependencies();
                let node = self.driver.add_memcpy_node(self.graph(), &deps, dst, src, size)?;
                tracing::trace!("Add memcpy node {} ({} bytes) to graph {}", node, size, self.graph());
                self.push_node(node, NodeKind::Memcpy);
                Ok(())
            }
            State::Update | State::Finalized => Err(self.state_error("record a memcpy")),
        }
    }

    /// Embed a finalized nested command buffer as a child-graph node, or point
    /// the child-graph node at the cursor to it during an update pass.
    pub fn add_nested_command_buffer(&mut self, nested: &CommandBuffer) -> Result<()> {
        const OP: &str = "add a nested command buffer";
        self.check_not_finalized(OP)?;
        self.check_primary(OP)?;
        self.check_nested_arg(nested)?;

        let child = nested.graph();
        match self.state {
            State::Create => {
                let deps = self.dependencies();
                let node = self.driver.add_child_graph_node(self.graph(), &deps, child)?;
                tracing::trace!("Add child graph node {} ({}) to graph {}", node, child, self.graph());
                self.push_node(node, NodeKind::ChildGraph);
                Ok(())
            }
            State::Update => {
                let (exec, node) = self.next_patch(NodeKind::ChildGraph)?;
                self.driver.exec_child_node_set_params(exec, node, child)?;
                tracing::trace!("Update child graph node {} to {} in executable graph {}", node, child, exec);
                self.update_cursor += 1;
                Ok(())
            }
            State::Finalized => Err(self.state_error(OP)),
        }
    }

    /// Seal the current pass.
    ///
    /// After construction a primary buffer is instantiated into an executable
    /// graph. After an update pass nothing is instantiated, the patches were
    /// already applied to the executable. Nested buffers only change state.
    pub fn finalize(&mut self) -> Result<()> {
        self.check_not_finalized("finalize")?;

        match (self.mode, self.state) {
            (Mode::Primary, State::Create) => {
                let start = Instant::now();
                let exec = Executable::instantiate(
                    Arc::clone(&self.driver),
                    Arc::clone(&self.metrics),
                    self.graph(),
                    self.config.instantiate,
                )?;
                tracing::debug!(
                    "Instantiated executable graph {} in {} μs (#{}, alive executable graphs: {})",
                    exec.handle(),
                    start.elapsed().as_micros(),
                    self.metrics.allocated_execs(),
                    self.metrics.alive_execs()
                );
                self.exec = Some(exec);
            }
            (Mode::Primary, _) => {
                if self.update_cursor != self.nodes.len() {
                    return Err(GraphError::UpdateMismatch {
                        consumed: self.update_cursor,
                        expected: self.nodes.len(),
                    });
                }
                tracing::debug!(
                    "Finalize executable graph {:?} update #{} (alive executable graphs: {})",
                    self.executable(),
                    self.num_updates,
                    self.metrics.alive_execs()
                );
                self.num_updates += 1;
            }
            (Mode::Nested, _) => {
                tracing::debug!("Finalize nested command buffer without instantiating executable graph");
            }
        }

        self.state = State::Finalized;
        Ok(())
    }

    /// Begin an update pass over a finalized primary buffer.
    ///
    /// Refused with [`GraphError::Unsupported`] if any recorded node can't be
    /// patched (see [`NodeKind::is_patchable`]); the buffer stays finalized.
    pub fn update(&mut self) -> Result<()> {
        if self.state != State::Finalized {
            return Err(self.state_error("begin an update"));
        }

        let Some(exec) = self.executable() else {
            return Err(match self.mode {
                Mode::Primary => GraphError::MissingExecutable,
                Mode::Nested => GraphError::Unsupported(
                    "nested command buffer update is deliberately not implemented; create a new \
                     nested command buffer and update the primary one instead"
                        .into(),
                ),
            });
        };

        // Copies and conditionals can't be patched, so a pass over them could never finish.
        if let Some(index) = self.nodes.iter().position(|n| !n.kind.is_patchable()) {
            return Err(GraphError::Unsupported(format!(
                "{} command at position {} can't be updated; record a new command buffer instead",
                self.nodes[index].kind, index
            )));
        }

        tracing::debug!("Begin primary command buffer update for executable graph {}", exec);
        self.state = State::Update;
        self.update_cursor = 0;
        Ok(())
    }

    pub(crate) fn dependencies(&self) -> Vec<NodeHandle> {
        self.nodes.last().map(|n| n.handle).into_iter().collect()
    }

    pub(crate) fn push_node(&mut self, handle: NodeHandle, kind: NodeKind) {
        self.nodes.push(RecordedNode { handle, kind });
    }

    pub(crate) fn check_not_finalized(&self, op: &'static str) -> Result<()> {
        if self.state == State::Finalized {
            return Err(self.state_error(op));
        }
        Ok(())
    }

    pub(crate) fn state_error(&self, op: &'static str) -> GraphError {
        GraphError::InvalidState { op, state: self.state }
    }

    fn check_primary(&self, op: &'static str) -> Result<()> {
        if self.mode != Mode::Primary {
            return Err(GraphError::InvalidMode { op, mode: self.mode });
        }
        Ok(())
    }

    fn check_nested_arg(&self, nested: &CommandBuffer) -> Result<()> {
        let (expected, found) = (self.driver.platform(), nested.driver.platform());
        if expected != found {
            return Err(GraphError::BackendMismatch { expected, found });
        }
        if nested.mode != Mode::Nested {
            return Err(GraphError::InvalidMode { op: "embed as a child graph", mode: nested.mode });
        }
        if nested.state != State::Finalized {
            return Err(GraphError::InvalidState { op: "embed as a child graph", state: nested.state });
        }
        Ok(())
    }

    /// Executable and node handle to patch at the cursor.
    fn next_patch(&self, requested: NodeKind) -> Result<(ExecHandle, NodeHandle)> {
        let exec = self.executable().ok_or(GraphError::MissingExecutable)?;
        let index = self.update_cursor;
        let recorded = self
            .nodes
            .get(index)
            .ok_or(GraphError::PatchOutOfRange { index, len: self.nodes.len() })?;
        if recorded.kind != requested {
            return Err(GraphError::PatchMismatch { index, recorded: recorded.kind, requested });
        }
        Ok((exec, recorded.handle))
    }

    pub(crate) fn replace_graph(&mut self, graph: GraphRef) {
        self.graph = graph;
    }
}

impl fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("platform", &self.driver.platform())
            .field("graph", &self.graph)
            .field("exec", &self.exec)
            .field("nodes", &self.nodes.len())
            .field("update_cursor", &self.update_cursor)
            .field("num_updates", &self.num_updates)
            .finish()
    }
}
