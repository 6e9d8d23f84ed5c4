//! Building a command buffer by capturing work issued on a stream.

use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use crate::command_buffer::{CommandBuffer, State};
use crate::config::GraphConfig;
use crate::driver::{GraphDriver, StreamHandle};
use crate::error::GraphError;
use crate::resource::{GraphRef, OwnedGraph};
use crate::Result;

impl CommandBuffer {
    /// Record everything `function` issues on `stream` into this buffer's
    /// graph using the driver's stream capture.
    ///
    /// `function` runs inline. Capture is always ended before its result is
    /// looked at: a failed capture end is reported as is, otherwise a failed
    /// `function` is reported as [`GraphError::TraceFailed`]. On success the
    /// captured graph replaces the buffer's graph.
    pub fn trace<F, E>(&mut self, stream: StreamHandle, function: F) -> Result<()>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        const OP: &str = "trace into its graph";
        self.check_not_finalized(OP)?;
        if self.state() != State::Create {
            return Err(self.state_error(OP));
        }
        if self.node_count() != 0 {
            return Err(GraphError::InvalidState {
                op: "trace into a graph with explicitly recorded commands",
                state: self.state(),
            });
        }
        if !self.owns_graph() {
            return Err(GraphError::Unsupported(
                "tracing into a borrowed graph would detach it from its owner".into(),
            ));
        }

        tracing::debug!("Trace into GPU command buffer graph {} on stream {}", self.graph(), stream);

        let start = Instant::now();
        self.driver().stream_begin_capture(stream, self.config().capture_mode)?;

        let traced = function();

        let captured = self.driver().stream_end_capture(stream)?;
        let captured = OwnedGraph::from_raw(Arc::clone(self.driver()), captured);

        if let Err(e) = traced {
            return Err(GraphError::TraceFailed(e.into()));
        }

        tracing::debug!(
            "Traced into the GPU command buffer graph {} (took {} μs)",
            captured.handle(),
            start.elapsed().as_micros()
        );
        self.replace_graph(GraphRef::Owned(captured));
        Ok(())
    }

    /// Trace `function` into a new primary command buffer and finalize it.
    pub fn trace_primary<F, E>(
        driver: Arc<dyn GraphDriver>,
        config: GraphConfig,
        stream: StreamHandle,
        function: F,
    ) -> Result<CommandBuffer>
    where
        F: FnOnce() -> std::result::Result<(), E>,
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let mut command_buffer = CommandBuffer::primary(driver)?.with_config(config);
        command_buffer.trace(stream, function)?;
        command_buffer.finalize()?;
        Ok(command_buffer)
    }
}
