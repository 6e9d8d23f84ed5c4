//! Predicate-driven conditional commands.

use std::sync::Arc;

use crate::command_buffer::{CommandBuffer, Mode, NodeKind, State};
use crate::driver::{ConditionalType, DevicePtr};
use crate::error::GraphError;
use crate::kernel::{KernelArgs, KernelLoader, LaunchConfig, PackedArgs};
use crate::resource::GraphRef;
use crate::Result;

impl CommandBuffer {
    /// Record a branch that runs the commands built by `then_builder` only
    /// when the device-side `bool` at `predicate` is true.
    ///
    /// The branch is decided when the executable runs, not here. This
    /// appends two nodes: a launch of the set-condition kernel that copies the
    /// predicate into a fresh conditional handle, and the conditional node
    /// itself. `then_builder` records into a nested buffer wrapping the body
    /// graph the driver created for the conditional node.
    ///
    /// Conditional commands can't be patched by an update pass: the handle
    /// and the body's node mapping are not kept after construction.
    pub fn if_then<F>(&mut self, loader: &dyn KernelLoader, predicate: DevicePtr, then_builder: F) -> Result<()>
    where
        F: FnOnce(&mut CommandBuffer) -> Result<()>,
    {
        self.check_not_finalized("record a conditional")?;
        if self.state() == State::Update {
            return Err(GraphError::Unsupported(
                "conditional commands can't be updated; record a new command buffer instead".into(),
            ));
        }

        let set_condition = loader.set_condition_kernel()?;

        let handle = self.driver().create_conditional_handle(
            self.graph(),
            self.config().conditional_default_value,
            self.config().conditional_flags,
        )?;

        let args = PackedArgs::new().push_u64(handle.raw()).push_ptr(predicate);
        self.launch(&LaunchConfig::single(), &set_condition, &KernelArgs::Packed(args))?;

        let deps = self.dependencies();
        let conditional = self
            .driver()
            .add_conditional_node(self.graph(), &deps, ConditionalType::If, handle)?;
        tracing::trace!(
            "Add conditional node {} (handle {}, body graph {}) to graph {}",
            conditional.node,
            handle,
            conditional.body,
            self.graph()
        );
        self.push_node(conditional.node, NodeKind::Conditional);

        let mut then_buffer = CommandBuffer::new(
            Arc::clone(self.driver()),
            Mode::Nested,
            GraphRef::Borrowed(conditional.body),
        )
        .with_config(self.config().clone())
        .with_metrics(Arc::clone(self.metrics()));

        then_builder(&mut then_buffer)?;
        then_buffer.finalize()
    }
}
