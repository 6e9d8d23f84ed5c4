//! Scoped ownership of driver graphs and executables.
//!
//! An [`OwnedGraph`] or [`Executable`] releases its driver handle exactly once,
//! on drop. A graph borrowed from somewhere else (the body of a conditional
//! node) is a [`GraphRef::Borrowed`] and is never released by the holder.

use std::sync::Arc;

use crate::config::InstantiateFlags;
use crate::driver::{ExecHandle, GraphDriver, GraphHandle};
use crate::metrics::ExecMetrics;
use crate::Result;

/// A graph destroyed when dropped.
pub struct OwnedGraph {
    driver: Arc<dyn GraphDriver>,
    handle: GraphHandle,
}

impl OwnedGraph {
    /// Create an empty graph.
    pub fn create(driver: Arc<dyn GraphDriver>) -> Result<Self> {
        let handle = driver.create_graph()?;
        Ok(Self { driver, handle })
    }

    /// Take ownership of an existing graph handle.
    pub fn from_raw(driver: Arc<dyn GraphDriver>, handle: GraphHandle) -> Self {
        Self { driver, handle }
    }

    pub fn handle(&self) -> GraphHandle {
        self.handle
    }
}

impl Drop for OwnedGraph {
    fn drop(&mut self) {
        if let Err(e) = self.driver.destroy_graph(self.handle) {
            fatal(&format!("failed to destroy gpu graph {}: {}", self.handle, e));
        }
    }
}

impl std::fmt::Debug for OwnedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedGraph").field("handle", &self.handle).finish()
    }
}

/// Graph a command buffer records into.
#[derive(Debug)]
pub enum GraphRef {
    /// Destroyed together with the command buffer.
    Owned(OwnedGraph),
    /// Owned by someone else; the command buffer only records into it.
    Borrowed(GraphHandle),
}

impl GraphRef {
    pub fn handle(&self) -> GraphHandle {
        match self {
            GraphRef::Owned(g) => g.handle(),
            GraphRef::Borrowed(h) => *h,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, GraphRef::Owned(_))
    }
}

/// An instantiated graph, destroyed when dropped.
pub struct Executable {
    driver: Arc<dyn GraphDriver>,
    metrics: Arc<ExecMetrics>,
    handle: ExecHandle,
}

impl Executable {
    /// Instantiate `graph` and register the result in `metrics`.
    pub fn instantiate(
        driver: Arc<dyn GraphDriver>,
        metrics: Arc<ExecMetrics>,
        graph: GraphHandle,
        flags: InstantiateFlags,
    ) -> Result<Self> {
        let handle = driver.instantiate(graph, flags)?;
        metrics.notify_created();
        Ok(Self { driver, metrics, handle })
    }

    pub fn handle(&self) -> ExecHandle {
        self.handle
    }
}

impl Drop for Executable {
    fn drop(&mut self) {
        let remaining = self.metrics.notify_destroyed();
        tracing::debug!(
            "Destroy executable graph {} (remaining alive executable graphs: {})",
            self.handle,
            remaining
        );
        if let Err(e) = self.driver.destroy_exec(self.handle) {
            fatal(&format!("failed to destroy gpu graph exec {}: {}", self.handle, e));
        }
    }
}

impl std::fmt::Debug for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executable").field("handle", &self.handle).finish()
    }
}

// Release failures have no error channel and leave the device in an unknown state.
fn fatal(msg: &str) -> ! {
    tracing::error!("{}", msg);
    eprintln!("kore-graph: {msg}");
    std::process::abort()
}
