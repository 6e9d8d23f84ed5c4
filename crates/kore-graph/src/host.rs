//! In-process reference implementation of [`GraphDriver`].
//!
//! Graphs, executables and captures live in host memory. Nothing runs on a
//! device; the driver only keeps the structure a real driver would build, so
//! it can be inspected after recording, instantiation and patching.
//!
//! Instantiation snapshots the graph like a real driver does: patching an
//! executable never changes the graph it came from, and editing a graph
//! after instantiation never changes the executable. Child-graph nodes embed
//! a copy of the child graph taken when the node is added or patched.
//!
//! Any driver entry point can be made to fail once with [`HostGraphDriver::fail_next`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{CaptureMode, InstantiateFlags};
use crate::driver::{
    ConditionalHandle, ConditionalNode, ConditionalType, DevicePtr, DriverResult, ExecHandle,
    GraphDriver, GraphHandle, KernelNodeParams, NodeHandle, Platform, StreamHandle,
};
use crate::error::DriverError;
use crate::kernel::{FunctionHandle, Kernel, KernelLoader, LaunchConfig, PackedArgs, SET_CONDITION_KERNEL};
use crate::Result;

/// Operation carried by a host graph node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOp {
    Kernel {
        name: String,
        function: FunctionHandle,
        config: LaunchConfig,
        args: PackedArgs,
    },
    Memcpy {
        dst: DevicePtr,
        src: DevicePtr,
        size: u64,
    },
    ChildGraph {
        source: GraphHandle,
        nodes: Vec<HostNode>,
    },
    Conditional {
        kind: ConditionalType,
        handle: ConditionalHandle,
        body: GraphHandle,
    },
}

/// A node of a host graph or executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNode {
    pub handle: NodeHandle,
    pub deps: Vec<NodeHandle>,
    pub op: HostOp,
}

impl HostNode {
    /// Kernel name, if this is a kernel node.
    pub fn kernel_name(&self) -> Option<&str> {
        match &self.op {
            HostOp::Kernel { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Work executed eagerly on a stream that was not capturing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EagerLaunch {
    pub stream: StreamHandle,
    pub kernel: String,
}

#[derive(Debug, Default)]
struct HostGraph {
    nodes: Vec<HostNode>,
    // Set for conditional bodies, which are released with their parent.
    owner: Option<GraphHandle>,
}

#[derive(Debug)]
struct HostExec {
    nodes: Vec<HostNode>,
    flags: InstantiateFlags,
}

#[derive(Debug, Default)]
struct HostState {
    graphs: HashMap<GraphHandle, HostGraph>,
    execs: HashMap<ExecHandle, HostExec>,
    captures: HashMap<StreamHandle, (GraphHandle, CaptureMode)>,
    conditional_handles: HashMap<ConditionalHandle, GraphHandle>,
    destroyed_graphs: Vec<GraphHandle>,
    destroyed_execs: Vec<ExecHandle>,
    eager: Vec<EagerLaunch>,
    faults: HashSet<&'static str>,
}

/// Host-memory graph driver.
#[derive(Debug)]
pub struct HostGraphDriver {
    state: Mutex<HostState>,
    next_id: AtomicU64,
    set_condition: FunctionHandle,
}

impl HostGraphDriver {
    pub fn new() -> Arc<Self> {
        let next_id = AtomicU64::new(1);
        let set_condition = FunctionHandle(next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(Self { state: Mutex::new(HostState::default()), next_id, set_condition })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Make the next call to driver entry point `op` fail.
    ///
    /// `op` is the [`GraphDriver`] method name, e.g. `"instantiate"`, or
    /// `"set_condition_kernel"` for the kernel loader.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().faults.insert(op);
    }

    /// A kernel resolved by this driver.
    pub fn kernel(&self, name: &str, arity: usize) -> Kernel {
        Kernel::new(name, FunctionHandle(self.next_id()), arity)
    }

    /// Nodes of a live graph.
    pub fn graph_nodes(&self, graph: GraphHandle) -> Option<Vec<HostNode>> {
        self.state.lock().graphs.get(&graph).map(|g| g.nodes.clone())
    }

    /// Nodes of a live executable, with any patches applied.
    pub fn exec_nodes(&self, exec: ExecHandle) -> Option<Vec<HostNode>> {
        self.state.lock().execs.get(&exec).map(|e| e.nodes.clone())
    }

    /// Flags a live executable was instantiated with.
    pub fn exec_flags(&self, exec: ExecHandle) -> Option<InstantiateFlags> {
        self.state.lock().execs.get(&exec).map(|e| e.flags)
    }

    pub fn is_live_graph(&self, graph: GraphHandle) -> bool {
        self.state.lock().graphs.contains_key(&graph)
    }

    pub fn live_graphs(&self) -> usize {
        self.state.lock().graphs.len()
    }

    pub fn live_execs(&self) -> usize {
        self.state.lock().execs.len()
    }

    /// Graphs released through [`GraphDriver::destroy_graph`], in order.
    pub fn destroyed_graphs(&self) -> Vec<GraphHandle> {
        self.state.lock().destroyed_graphs.clone()
    }

    /// Executables released through [`GraphDriver::destroy_exec`], in order.
    pub fn destroyed_execs(&self) -> Vec<ExecHandle> {
        self.state.lock().destroyed_execs.clone()
    }

    /// Capture mode of a stream, if it is capturing.
    pub fn capture_mode(&self, stream: StreamHandle) -> Option<CaptureMode> {
        self.state.lock().captures.get(&stream).map(|(_, mode)| *mode)
    }

    /// Kernels that ran eagerly on non-capturing streams.
    pub fn eager_launches(&self) -> Vec<EagerLaunch> {
        self.state.lock().eager.clone()
    }

    /// Issue a kernel launch on `stream`.
    ///
    /// A capturing stream appends the launch to its capture graph; any other
    /// stream just logs it as eager work.
    pub fn launch_on_stream(
        &self,
        stream: StreamHandle,
        kernel: &Kernel,
        config: &LaunchConfig,
        args: &PackedArgs,
    ) -> DriverResult<()> {
        let mut state = self.state.lock();
        take_fault(&mut state, "launch_on_stream")?;
        let Some(&(graph, _)) = state.captures.get(&stream) else {
            state.eager.push(EagerLaunch { stream, kernel: kernel.name().to_string() });
            return Ok(());
        };
        let handle = NodeHandle(self.next_id());
        let graph = graph_mut(&mut state, graph, "launch_on_stream")?;
        let deps = graph.nodes.last().map(|n| n.handle).into_iter().collect();
        graph.nodes.push(HostNode {
            handle,
            deps,
            op: HostOp::Kernel {
                name: kernel.name().to_string(),
                function: kernel.function(),
                config: *config,
                args: args.clone(),
            },
        });
        Ok(())
    }

    fn add_node(
        &self,
        op_name: &'static str,
        graph: GraphHandle,
        deps: &[NodeHandle],
        op: HostOp,
    ) -> DriverResult<NodeHandle> {
        let mut state = self.state.lock();
        take_fault(&mut state, op_name)?;
        let graph = graph_mut(&mut state, graph, op_name)?;
        check_deps(graph, deps, op_name)?;
        let handle = NodeHandle(self.next_id());
        graph.nodes.push(HostNode { handle, deps: deps.to_vec(), op });
        Ok(handle)
    }

    fn snapshot(&self, graph: GraphHandle, op_name: &'static str) -> DriverResult<Vec<HostNode>> {
        let state = self.state.lock();
        state
            .graphs
            .get(&graph)
            .map(|g| g.nodes.clone())
            .ok_or_else(|| DriverError::new(op_name, format!("unknown graph {graph}")))
    }
}

fn take_fault(state: &mut HostState, op: &'static str) -> DriverResult<()> {
    if state.faults.remove(op) {
        return Err(DriverError::new(op, "injected failure"));
    }
    Ok(())
}

fn graph_mut<'a>(
    state: &'a mut HostState,
    graph: GraphHandle,
    op: &'static str,
) -> DriverResult<&'a mut HostGraph> {
    state
        .graphs
        .get_mut(&graph)
        .ok_or_else(|| DriverError::new(op, format!("unknown graph {graph}")))
}

fn check_deps(graph: &HostGraph, deps: &[NodeHandle], op: &'static str) -> DriverResult<()> {
    for dep in deps {
        if !graph.nodes.iter().any(|n| n.handle == *dep) {
            return Err(DriverError::new(op, format!("dependency {dep} is not in the graph")));
        }
    }
    Ok(())
}

fn exec_node_mut<'a>(
    state: &'a mut HostState,
    exec: ExecHandle,
    node: NodeHandle,
    op: &'static str,
) -> DriverResult<&'a mut HostNode> {
    state
        .execs
        .get_mut(&exec)
        .ok_or_else(|| DriverError::new(op, format!("unknown executable {exec}")))?
        .nodes
        .iter_mut()
        .find(|n| n.handle == node)
        .ok_or_else(|| DriverError::new(op, format!("node {node} is not in executable {exec}")))
}

impl GraphDriver for HostGraphDriver {
    fn platform(&self) -> Platform {
        Platform::Host
    }

    fn create_graph(&self) -> DriverResult<GraphHandle> {
        let mut state = self.state.lock();
        take_fault(&mut state, "create_graph")?;
        let handle = GraphHandle(self.next_id());
        state.graphs.insert(handle, HostGraph::default());
        Ok(handle)
    }

    fn add_kernel_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        params: &KernelNodeParams<'_>,
    ) -> DriverResult<NodeHandle> {
        let op = HostOp::Kernel {
            name: params.kernel_name.to_string(),
            function: params.function,
            config: *params.config,
            args: params.args.clone(),
        };
        self.add_node("add_kernel_node", graph, deps, op)
    }

    fn add_memcpy_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        dst: DevicePtr,
        src: DevicePtr,
        size: u64,
    ) -> DriverResult<NodeHandle> {
        self.add_node("add_memcpy_node", graph, deps, HostOp::Memcpy { dst, src, size })
    }

    fn add_child_graph_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        child: GraphHandle,
    ) -> DriverResult<NodeHandle> {
        let nodes = self.snapshot(child, "add_child_graph_node")?;
        self.add_node("add_child_graph_node", graph, deps, HostOp::ChildGraph { source: child, nodes })
    }

    fn create_conditional_handle(
        &self,
        graph: GraphHandle,
        _default_launch_value: u32,
        _flags: u32,
    ) -> DriverResult<ConditionalHandle> {
        let mut state = self.state.lock();
        take_fault(&mut state, "create_conditional_handle")?;
        graph_mut(&mut state, graph, "create_conditional_handle")?;
        let handle = ConditionalHandle(self.next_id());
        state.conditional_handles.insert(handle, graph);
        Ok(handle)
    }

    fn add_conditional_node(
        &self,
        graph: GraphHandle,
        deps: &[NodeHandle],
        kind: ConditionalType,
        handle: ConditionalHandle,
    ) -> DriverResult<ConditionalNode> {
        const OP: &str = "add_conditional_node";
        let mut state = self.state.lock();
        take_fault(&mut state, OP)?;
        if state.conditional_handles.get(&handle) != Some(&graph) {
            return Err(DriverError::new(OP, format!("handle {handle} was not created for graph {graph}")));
        }

        let body = GraphHandle(self.next_id());
        let node = NodeHandle(self.next_id());
        let parent = graph_mut(&mut state, graph, OP)?;
        check_deps(parent, deps, OP)?;
        parent.nodes.push(HostNode { handle: node, deps: deps.to_vec(), op: HostOp::Conditional { kind, handle, body } });
        state.graphs.insert(body, HostGraph { nodes: Vec::new(), owner: Some(graph) });
        Ok(ConditionalNode { node, body })
    }

    fn instantiate(&self, graph: GraphHandle, flags: InstantiateFlags) -> DriverResult<ExecHandle> {
        let mut state = self.state.lock();
        take_fault(&mut state, "instantiate")?;
        let nodes = graph_mut(&mut state, graph, "instantiate")?.nodes.clone();
        let handle = ExecHandle(self.next_id());
        state.execs.insert(handle, HostExec { nodes, flags });
        Ok(handle)
    }

    fn exec_kernel_node_set_params(
        &self,
        exec: ExecHandle,
        node: NodeHandle,
        params: &KernelNodeParams<'_>,
    ) -> DriverResult<()> {
        const OP: &str = "exec_kernel_node_set_params";
        let mut state = self.state.lock();
        take_fault(&mut state, OP)?;
        let target = exec_node_mut(&mut state, exec, node, OP)?;
        match &mut target.op {
            HostOp::Kernel { name, function, config, args } => {
                *name = params.kernel_name.to_string();
                *function = params.function;
                *config = *params.config;
                *args = params.args.clone();
                Ok(())
            }
            _ => Err(DriverError::new(OP, format!("node {node} is not a kernel node"))),
        }
    }

    fn exec_child_node_set_params(
        &self,
        exec: ExecHandle,
        node: NodeHandle,
        child: GraphHandle,
    ) -> DriverResult<()> {
        const OP: &str = "exec_child_node_set_params";
        let snapshot = self.snapshot(child, OP)?;
        let mut state = self.state.lock();
        take_fault(&mut state, OP)?;
        let target = exec_node_mut(&mut state, exec, node, OP)?;
        match &mut target.op {
            HostOp::ChildGraph { source, nodes } => {
                *source = child;
                *nodes = snapshot;
                Ok(())
            }
            _ => Err(DriverError::new(OP, format!("node {node} is not a child graph node"))),
        }
    }

    fn destroy_graph(&self, graph: GraphHandle) -> DriverResult<()> {
        const OP: &str = "destroy_graph";
        let mut state = self.state.lock();
        take_fault(&mut state, OP)?;
        match state.graphs.get(&graph) {
            None => return Err(DriverError::new(OP, format!("unknown graph {graph}"))),
            Some(g) if g.owner.is_some() => {
                return Err(DriverError::new(OP, format!("graph {graph} is owned by a conditional node")));
            }
            Some(_) => {}
        }
        // Conditional bodies can hold conditionals of their own.
        let mut pending = vec![graph];
        while let Some(released) = pending.pop() {
            state.graphs.remove(&released);
            state.conditional_handles.retain(|_, g| *g != released);
            pending.extend(state.graphs.iter().filter(|(_, g)| g.owner == Some(released)).map(|(h, _)| *h));
        }
        state.destroyed_graphs.push(graph);
        Ok(())
    }

    fn destroy_exec(&self, exec: ExecHandle) -> DriverResult<()> {
        let mut state = self.state.lock();
        take_fault(&mut state, "destroy_exec")?;
        state
            .execs
            .remove(&exec)
            .ok_or_else(|| DriverError::new("destroy_exec", format!("unknown executable {exec}")))?;
        state.destroyed_execs.push(exec);
        Ok(())
    }

    fn stream_begin_capture(&self, stream: StreamHandle, mode: CaptureMode) -> DriverResult<()> {
        const OP: &str = "stream_begin_capture";
        let mut state = self.state.lock();
        take_fault(&mut state, OP)?;
        if state.captures.contains_key(&stream) {
            return Err(DriverError::new(OP, format!("stream {stream} is already capturing")));
        }
        let graph = GraphHandle(self.next_id());
        state.graphs.insert(graph, HostGraph::default());
        state.captures.insert(stream, (graph, mode));
        Ok(())
    }

    fn stream_end_capture(&self, stream: StreamHandle) -> DriverResult<GraphHandle> {
        const OP: &str = "stream_end_capture";
        let mut state = self.state.lock();
        let (graph, _) = state
            .captures
            .remove(&stream)
            .ok_or_else(|| DriverError::new(OP, format!("stream {stream} is not capturing")))?;
        if let Err(e) = take_fault(&mut state, OP) {
            // A failed capture invalidates the partially captured graph.
            state.graphs.remove(&graph);
            return Err(e);
        }
        Ok(graph)
    }
}

impl KernelLoader for HostGraphDriver {
    fn set_condition_kernel(&self) -> Result<Kernel> {
        take_fault(&mut self.state.lock(), "set_condition_kernel")?;
        Ok(Kernel::new(SET_CONDITION_KERNEL, self.set_condition, 2))
    }
}
