//! Command buffer state machine tests against the host reference driver.
//! Run with: cargo test -p kore-graph

use std::sync::Arc;

use kore_graph::host::{HostGraphDriver, HostOp};
use kore_graph::{
    grid_1d, CommandBuffer, DevicePtr, ErrorKind, ExecMetrics, GraphConfig, GraphDriver, GraphError,
    GraphRef, InstantiateFlags, Kernel, KernelArgs, LaunchConfig, Mode, NodeKind, PackedArgs, State,
};

fn args(x: u64) -> KernelArgs {
    PackedArgs::new().push_ptr(DevicePtr(0x1000)).push_u64(x).into()
}

fn arg_value(op: &HostOp) -> u64 {
    match op {
        HostOp::Kernel { args, .. } => {
            let bytes: [u8; 8] = args.args()[1].as_slice().try_into().unwrap();
            u64::from_ne_bytes(bytes)
        }
        other => panic!("not a kernel node: {other:?}"),
    }
}

fn primary(driver: &Arc<HostGraphDriver>) -> CommandBuffer {
    CommandBuffer::primary(driver.clone()).unwrap().with_metrics(ExecMetrics::new())
}

fn record(cb: &mut CommandBuffer, kernels: &[Kernel], x: u64) {
    for k in kernels {
        cb.launch(&LaunchConfig::single(), k, &args(x)).unwrap();
    }
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_new_buffer_starts_in_create() {
    let driver = HostGraphDriver::new();
    let cb = primary(&driver);
    assert_eq!(cb.state(), State::Create);
    assert_eq!(cb.mode(), Mode::Primary);
    assert!(cb.owns_graph());
    assert!(cb.executable().is_none());
    assert_eq!(cb.node_count(), 0);
    assert!(driver.is_live_graph(cb.graph()));
}

#[test]
fn test_create_graph_failure_is_reported() {
    let driver = HostGraphDriver::new();
    driver.fail_next("create_graph");
    let err = CommandBuffer::primary(driver.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Driver);
    assert!(err.to_string().contains("create_graph"));
}

// ============================================================================
// Recording
// ============================================================================

#[test]
fn test_nodes_form_a_chain() {
    let driver = HostGraphDriver::new();
    let kernels: Vec<_> = (0..5).map(|i| driver.kernel(&format!("k{i}"), 2)).collect();
    let mut cb = primary(&driver);
    record(&mut cb, &kernels, 1);
    cb.memcpy_device_to_device(DevicePtr(0x10), DevicePtr(0x20), 64).unwrap();

    let nodes = driver.graph_nodes(cb.graph()).unwrap();
    assert_eq!(nodes.len(), 6);
    assert_eq!(cb.nodes(), nodes.iter().map(|n| n.handle).collect::<Vec<_>>());
    assert!(nodes[0].deps.is_empty());
    for i in 1..nodes.len() {
        assert_eq!(nodes[i].deps, vec![nodes[i - 1].handle]);
    }
    assert_eq!(nodes[5].op, HostOp::Memcpy { dst: DevicePtr(0x10), src: DevicePtr(0x20), size: 64 });
}

#[test]
fn test_launch_records_dimensions() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("scale", 2);
    let mut cb = primary(&driver);
    cb.launch(&grid_1d(1000, 128), &k, &args(3)).unwrap();

    let nodes = driver.graph_nodes(cb.graph()).unwrap();
    match &nodes[0].op {
        HostOp::Kernel { name, function, config, .. } => {
            assert_eq!(name, "scale");
            assert_eq!(*function, k.function());
            assert_eq!(config.grid_dim, (8, 1, 1));
            assert_eq!(config.block_dim, (128, 1, 1));
        }
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_device_memory_args_rejected() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("scale", 2);
    let mut cb = primary(&driver);
    let err = cb
        .launch(&LaunchConfig::single(), &k, &KernelArgs::DeviceMemory(vec![DevicePtr(1)]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadArgument);
    assert_eq!(cb.node_count(), 0);
}

#[test]
fn test_failed_append_records_nothing() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("scale", 2);
    let mut cb = primary(&driver);
    cb.launch(&LaunchConfig::single(), &k, &args(1)).unwrap();
    driver.fail_next("add_kernel_node");
    assert!(cb.launch(&LaunchConfig::single(), &k, &args(2)).is_err());
    assert_eq!(cb.node_count(), 1);

    // The chain continues from the last node that made it in.
    cb.launch(&LaunchConfig::single(), &k, &args(3)).unwrap();
    let nodes = driver.graph_nodes(cb.graph()).unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1].deps, vec![nodes[0].handle]);
}

// ============================================================================
// Finalize
// ============================================================================

#[test]
fn test_finalize_primary_instantiates() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("scale", 2);
    let mut cb = primary(&driver);
    record(&mut cb, &[k], 1);
    cb.finalize().unwrap();

    assert_eq!(cb.state(), State::Finalized);
    let exec = cb.executable().unwrap();
    assert_eq!(driver.exec_nodes(exec).unwrap().len(), 1);
    assert_eq!(cb.metrics().alive_execs(), 1);
    assert_eq!(cb.metrics().allocated_execs(), 1);
}

#[test]
fn test_finalize_uses_configured_flags() {
    let driver = HostGraphDriver::new();
    let config = GraphConfig {
        instantiate: InstantiateFlags { upload: true, ..InstantiateFlags::default() },
        ..GraphConfig::default()
    };
    let mut cb = primary(&driver).with_config(config);
    cb.finalize().unwrap();
    let flags = driver.exec_flags(cb.executable().unwrap()).unwrap();
    assert!(flags.upload);
    assert!(!flags.auto_free_on_launch);
}

#[test]
fn test_finalize_nested_creates_no_executable() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("scale", 2);
    let mut nested = CommandBuffer::nested(driver.clone()).unwrap();
    record(&mut nested, &[k], 1);
    nested.finalize().unwrap();
    assert_eq!(nested.state(), State::Finalized);
    assert!(nested.executable().is_none());
    assert_eq!(driver.live_execs(), 0);
}

#[test]
fn test_failed_instantiate_stays_in_create() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("scale", 2);
    let mut cb = primary(&driver);
    record(&mut cb, &[k], 1);
    driver.fail_next("instantiate");
    let err = cb.finalize().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Driver);
    assert_eq!(cb.state(), State::Create);
    assert_eq!(cb.metrics().allocated_execs(), 0);

    cb.finalize().unwrap();
    assert!(cb.executable().is_some());
}

#[test]
fn test_finalize_twice_rejected() {
    let driver = HostGraphDriver::new();
    let mut cb = primary(&driver);
    cb.finalize().unwrap();
    let err = cb.finalize().unwrap_err();
    assert!(matches!(err, GraphError::InvalidState { state: State::Finalized, .. }));
    assert_eq!(cb.metrics().allocated_execs(), 1);
}

#[test]
fn test_recording_after_finalize_rejected() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("scale", 2);
    let mut cb = primary(&driver);
    record(&mut cb, &[k.clone()], 1);
    cb.finalize().unwrap();

    let err = cb.launch(&LaunchConfig::single(), &k, &args(2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    let err = cb.memcpy_device_to_device(DevicePtr(1), DevicePtr(2), 4).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(cb.node_count(), 1);
    assert_eq!(driver.graph_nodes(cb.graph()).unwrap().len(), 1);
}

// ============================================================================
// Update
// ============================================================================

#[test]
fn test_update_patches_in_place() {
    let driver = HostGraphDriver::new();
    let a = driver.kernel("a", 2);
    let b = driver.kernel("b", 2);
    let mut cb = primary(&driver);
    cb.launch(&LaunchConfig::single(), &a, &args(1)).unwrap();
    cb.launch(&LaunchConfig::single(), &b, &args(2)).unwrap();
    cb.finalize().unwrap();
    let exec = cb.executable().unwrap();
    let recorded = cb.nodes();

    cb.update().unwrap();
    assert_eq!(cb.state(), State::Update);
    cb.launch(&LaunchConfig::single(), &a, &args(10)).unwrap();
    cb.launch(&LaunchConfig::single(), &b, &args(20)).unwrap();
    cb.finalize().unwrap();

    assert_eq!(cb.state(), State::Finalized);
    assert_eq!(cb.executable(), Some(exec));
    assert_eq!(cb.nodes(), recorded);
    assert_eq!(cb.num_updates(), 1);
    assert_eq!(cb.metrics().allocated_execs(), 1);

    let patched = driver.exec_nodes(exec).unwrap();
    assert_eq!(arg_value(&patched[0].op), 10);
    assert_eq!(arg_value(&patched[1].op), 20);
    // The graph the executable came from is untouched.
    let graph = driver.graph_nodes(cb.graph()).unwrap();
    assert_eq!(arg_value(&graph[0].op), 1);
    assert_eq!(arg_value(&graph[1].op), 2);
}

#[test]
fn test_update_cycles_repeat() {
    let driver = HostGraphDriver::new();
    let kernels: Vec<_> = (0..4).map(|i| driver.kernel(&format!("k{i}"), 2)).collect();
    let mut cb = primary(&driver);
    record(&mut cb, &kernels, 0);
    cb.finalize().unwrap();
    let exec = cb.executable().unwrap();

    for round in 1..=3u64 {
        cb.update().unwrap();
        assert_eq!(cb.update_cursor(), 0);
        record(&mut cb, &kernels, round);
        assert_eq!(cb.update_cursor(), kernels.len());
        cb.finalize().unwrap();
        assert_eq!(cb.num_updates(), round);
        for node in driver.exec_nodes(exec).unwrap() {
            assert_eq!(arg_value(&node.op), round);
        }
    }
    assert_eq!(cb.node_count(), kernels.len());
    assert_eq!(driver.live_execs(), 1);
}

#[test]
fn test_update_requires_finalized() {
    let driver = HostGraphDriver::new();
    let mut cb = primary(&driver);
    let err = cb.update().unwrap_err();
    assert!(matches!(err, GraphError::InvalidState { state: State::Create, .. }));

    cb.finalize().unwrap();
    cb.update().unwrap();
    let err = cb.update().unwrap_err();
    assert!(matches!(err, GraphError::InvalidState { state: State::Update, .. }));
}

#[test]
fn test_nested_update_unsupported() {
    let driver = HostGraphDriver::new();
    let mut nested = CommandBuffer::nested(driver.clone()).unwrap();
    nested.finalize().unwrap();
    let err = nested.update().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert_eq!(nested.state(), State::Finalized);
}

#[test]
fn test_short_update_pass_rejected() {
    let driver = HostGraphDriver::new();
    let kernels: Vec<_> = (0..3).map(|i| driver.kernel(&format!("k{i}"), 2)).collect();
    let mut cb = primary(&driver);
    record(&mut cb, &kernels, 0);
    cb.finalize().unwrap();

    cb.update().unwrap();
    record(&mut cb, &kernels[..2], 1);
    let err = cb.finalize().unwrap_err();
    assert!(matches!(err, GraphError::UpdateMismatch { consumed: 2, expected: 3 }));
    assert_eq!(cb.state(), State::Update);

    record(&mut cb, &kernels[2..], 1);
    cb.finalize().unwrap();
    assert_eq!(cb.num_updates(), 1);
}

#[test]
fn test_patch_past_recorded_nodes_rejected() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("k", 2);
    let mut cb = primary(&driver);
    record(&mut cb, &[k.clone()], 0);
    cb.finalize().unwrap();

    cb.update().unwrap();
    record(&mut cb, &[k.clone()], 1);
    let err = cb.launch(&LaunchConfig::single(), &k, &args(2)).unwrap_err();
    assert!(matches!(err, GraphError::PatchOutOfRange { index: 1, len: 1 }));
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(cb.update_cursor(), 1);
}

#[test]
fn test_patch_of_different_kind_rejected() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("k", 2);
    let mut nested = CommandBuffer::nested(driver.clone()).unwrap();
    nested.finalize().unwrap();

    let mut cb = primary(&driver);
    cb.add_nested_command_buffer(&nested).unwrap();
    cb.finalize().unwrap();

    cb.update().unwrap();
    let err = cb.launch(&LaunchConfig::single(), &k, &args(1)).unwrap_err();
    assert!(matches!(
        err,
        GraphError::PatchMismatch { index: 0, recorded: NodeKind::ChildGraph, requested: NodeKind::Kernel }
    ));
    assert_eq!(cb.update_cursor(), 0);
}

#[test]
fn test_failed_patch_keeps_cursor() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("k", 2);
    let mut cb = primary(&driver);
    record(&mut cb, &[k.clone()], 0);
    cb.finalize().unwrap();

    cb.update().unwrap();
    driver.fail_next("exec_kernel_node_set_params");
    assert!(cb.launch(&LaunchConfig::single(), &k, &args(1)).is_err());
    assert_eq!(cb.update_cursor(), 0);
    cb.launch(&LaunchConfig::single(), &k, &args(1)).unwrap();
    cb.finalize().unwrap();
}

#[test]
fn test_memcpy_in_update_rejected() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("k", 2);
    let mut cb = primary(&driver);
    record(&mut cb, &[k.clone()], 0);
    cb.finalize().unwrap();

    cb.update().unwrap();
    let err = cb.memcpy_device_to_device(DevicePtr(1), DevicePtr(2), 16).unwrap_err();
    assert!(matches!(err, GraphError::InvalidState { state: State::Update, .. }));
    assert_eq!(cb.update_cursor(), 0);

    // The pass can still be completed.
    record(&mut cb, &[k], 1);
    cb.finalize().unwrap();
}

#[test]
fn test_update_refused_for_recorded_memcpy() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("k", 2);
    let mut cb = primary(&driver);
    record(&mut cb, &[k.clone()], 0);
    cb.memcpy_device_to_device(DevicePtr(1), DevicePtr(2), 16).unwrap();
    cb.finalize().unwrap();

    let err = cb.update().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(err.to_string().contains("memcpy command at position 1"));
    assert_eq!(cb.state(), State::Finalized);
    assert_eq!(cb.update_cursor(), 0);

    // Still finalized, so the same answer on retry and no stuck pass.
    assert_eq!(cb.update().unwrap_err().kind(), ErrorKind::Unsupported);
    assert_eq!(cb.num_updates(), 0);
    assert!(cb.executable().is_some());
}

// ============================================================================
// Nested command buffers
// ============================================================================

fn finalized_nested(driver: &Arc<HostGraphDriver>, kernel: &Kernel, x: u64) -> CommandBuffer {
    let mut nested = CommandBuffer::nested(driver.clone()).unwrap();
    nested.launch(&LaunchConfig::single(), kernel, &args(x)).unwrap();
    nested.finalize().unwrap();
    nested
}

#[test]
fn test_add_nested_embeds_child_graph() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("inner", 2);
    let nested = finalized_nested(&driver, &k, 7);

    let mut cb = primary(&driver);
    cb.add_nested_command_buffer(&nested).unwrap();
    let nodes = driver.graph_nodes(cb.graph()).unwrap();
    match &nodes[0].op {
        HostOp::ChildGraph { source, nodes } => {
            assert_eq!(*source, nested.graph());
            assert_eq!(nodes.len(), 1);
            assert_eq!(arg_value(&nodes[0].op), 7);
        }
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_nested_update_swaps_child_graph() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("inner", 2);
    let first = finalized_nested(&driver, &k, 1);

    let mut cb = primary(&driver);
    cb.add_nested_command_buffer(&first).unwrap();
    cb.finalize().unwrap();
    let exec = cb.executable().unwrap();

    let second = finalized_nested(&driver, &k, 2);
    cb.update().unwrap();
    cb.add_nested_command_buffer(&second).unwrap();
    cb.finalize().unwrap();

    match &driver.exec_nodes(exec).unwrap()[0].op {
        HostOp::ChildGraph { source, nodes } => {
            assert_eq!(*source, second.graph());
            assert_eq!(arg_value(&nodes[0].op), 2);
        }
        other => panic!("unexpected node {other:?}"),
    }
}

#[test]
fn test_add_nested_requires_primary_target() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("inner", 2);
    let nested = finalized_nested(&driver, &k, 1);
    let mut outer = CommandBuffer::nested(driver.clone()).unwrap();
    let err = outer.add_nested_command_buffer(&nested).unwrap_err();
    assert!(matches!(err, GraphError::InvalidMode { mode: Mode::Nested, .. }));
    assert_eq!(outer.node_count(), 0);
}

#[test]
fn test_add_nested_argument_checked() {
    let driver = HostGraphDriver::new();
    let mut cb = primary(&driver);

    let mut not_nested = CommandBuffer::primary(driver.clone()).unwrap();
    not_nested.finalize().unwrap();
    let err = cb.add_nested_command_buffer(&not_nested).unwrap_err();
    assert!(matches!(err, GraphError::InvalidMode { mode: Mode::Primary, .. }));

    let unfinalized = CommandBuffer::nested(driver.clone()).unwrap();
    let err = cb.add_nested_command_buffer(&unfinalized).unwrap_err();
    assert!(matches!(err, GraphError::InvalidState { state: State::Create, .. }));
    assert_eq!(cb.node_count(), 0);
}

#[test]
fn test_add_nested_from_other_backend_rejected() {
    struct CudaLookalike(Arc<HostGraphDriver>);

    // Forwards everything but claims another platform.
    impl GraphDriver for CudaLookalike {
        fn platform(&self) -> kore_graph::Platform {
            kore_graph::Platform::Cuda
        }
        fn create_graph(&self) -> kore_graph::driver::DriverResult<kore_graph::GraphHandle> {
            self.0.create_graph()
        }
        fn add_kernel_node(
            &self,
            graph: kore_graph::GraphHandle,
            deps: &[kore_graph::NodeHandle],
            params: &kore_graph::driver::KernelNodeParams<'_>,
        ) -> kore_graph::driver::DriverResult<kore_graph::NodeHandle> {
            self.0.add_kernel_node(graph, deps, params)
        }
        fn add_memcpy_node(
            &self,
            graph: kore_graph::GraphHandle,
            deps: &[kore_graph::NodeHandle],
            dst: DevicePtr,
            src: DevicePtr,
            size: u64,
        ) -> kore_graph::driver::DriverResult<kore_graph::NodeHandle> {
            self.0.add_memcpy_node(graph, deps, dst, src, size)
        }
        fn add_child_graph_node(
            &self,
            graph: kore_graph::GraphHandle,
            deps: &[kore_graph::NodeHandle],
            child: kore_graph::GraphHandle,
        ) -> kore_graph::driver::DriverResult<kore_graph::NodeHandle> {
            self.0.add_child_graph_node(graph, deps, child)
        }
        fn create_conditional_handle(
            &self,
            graph: kore_graph::GraphHandle,
            default_launch_value: u32,
            flags: u32,
        ) -> kore_graph::driver::DriverResult<kore_graph::ConditionalHandle> {
            self.0.create_conditional_handle(graph, default_launch_value, flags)
        }
        fn add_conditional_node(
            &self,
            graph: kore_graph::GraphHandle,
            deps: &[kore_graph::NodeHandle],
            kind: kore_graph::driver::ConditionalType,
            handle: kore_graph::ConditionalHandle,
        ) -> kore_graph::driver::DriverResult<kore_graph::driver::ConditionalNode> {
            self.0.add_conditional_node(graph, deps, kind, handle)
        }
        fn instantiate(
            &self,
            graph: kore_graph::GraphHandle,
            flags: InstantiateFlags,
        ) -> kore_graph::driver::DriverResult<kore_graph::ExecHandle> {
            self.0.instantiate(graph, flags)
        }
        fn exec_kernel_node_set_params(
            &self,
            exec: kore_graph::ExecHandle,
            node: kore_graph::NodeHandle,
            params: &kore_graph::driver::KernelNodeParams<'_>,
        ) -> kore_graph::driver::DriverResult<()> {
            self.0.exec_kernel_node_set_params(exec, node, params)
        }
        fn exec_child_node_set_params(
            &self,
            exec: kore_graph::ExecHandle,
            node: kore_graph::NodeHandle,
            child: kore_graph::GraphHandle,
        ) -> kore_graph::driver::DriverResult<()> {
            self.0.exec_child_node_set_params(exec, node, child)
        }
        fn destroy_graph(&self, graph: kore_graph::GraphHandle) -> kore_graph::driver::DriverResult<()> {
            self.0.destroy_graph(graph)
        }
        fn destroy_exec(&self, exec: kore_graph::ExecHandle) -> kore_graph::driver::DriverResult<()> {
            self.0.destroy_exec(exec)
        }
        fn stream_begin_capture(
            &self,
            stream: kore_graph::StreamHandle,
            mode: kore_graph::CaptureMode,
        ) -> kore_graph::driver::DriverResult<()> {
            self.0.stream_begin_capture(stream, mode)
        }
        fn stream_end_capture(
            &self,
            stream: kore_graph::StreamHandle,
        ) -> kore_graph::driver::DriverResult<kore_graph::GraphHandle> {
            self.0.stream_end_capture(stream)
        }
    }

    let host = HostGraphDriver::new();
    let mut other = CommandBuffer::nested(Arc::new(CudaLookalike(host.clone()))).unwrap();
    other.finalize().unwrap();

    let mut cb = primary(&host);
    let err = cb.add_nested_command_buffer(&other).unwrap_err();
    assert!(matches!(
        err,
        GraphError::BackendMismatch { expected: kore_graph::Platform::Host, found: kore_graph::Platform::Cuda }
    ));
}

// ============================================================================
// Resource release
// ============================================================================

#[test]
fn test_drop_releases_graph_and_executable() {
    let driver = HostGraphDriver::new();
    let k = driver.kernel("k", 2);
    let metrics = ExecMetrics::new();
    let (graph, exec) = {
        let mut cb = CommandBuffer::primary(driver.clone()).unwrap().with_metrics(metrics.clone());
        record(&mut cb, &[k], 0);
        cb.finalize().unwrap();
        (cb.graph(), cb.executable().unwrap())
    };

    assert_eq!(driver.destroyed_execs(), vec![exec]);
    assert_eq!(driver.destroyed_graphs(), vec![graph]);
    assert_eq!(driver.live_graphs(), 0);
    assert_eq!(driver.live_execs(), 0);
    assert_eq!(metrics.alive_execs(), 0);
    assert_eq!(metrics.allocated_execs(), 1);
}

#[test]
fn test_borrowed_graph_not_released() {
    let driver = HostGraphDriver::new();
    let graph = driver.create_graph().unwrap();
    {
        let mut cb = CommandBuffer::new(driver.clone(), Mode::Nested, GraphRef::Borrowed(graph));
        assert!(!cb.owns_graph());
        cb.memcpy_device_to_device(DevicePtr(1), DevicePtr(2), 8).unwrap();
        cb.finalize().unwrap();
    }
    assert!(driver.is_live_graph(graph));
    assert_eq!(driver.graph_nodes(graph).unwrap().len(), 1);
    assert!(driver.destroyed_graphs().is_empty());
}
