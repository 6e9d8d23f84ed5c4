//! Configuration for graph capture and instantiation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::Result;

/// Environment variable overriding [`GraphConfig::capture_mode`].
pub const CAPTURE_MODE_ENV: &str = "KORE_GRAPH_CAPTURE_MODE";

/// How a stream in capture mode reacts to unsafe API calls from other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Unsafe calls from any thread are prohibited while capturing.
    Global,
    /// Only the capturing thread is restricted.
    #[default]
    ThreadLocal,
    /// No restrictions.
    Relaxed,
}

impl CaptureMode {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Some(CaptureMode::Global),
            "thread_local" | "threadlocal" | "thread-local" => Some(CaptureMode::ThreadLocal),
            "relaxed" => Some(CaptureMode::Relaxed),
            _ => None,
        }
    }
}

/// Flags passed to graph instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstantiateFlags {
    pub auto_free_on_launch: bool,
    pub upload: bool,
    pub device_launch: bool,
    pub use_node_priority: bool,
}

impl InstantiateFlags {
    pub const AUTO_FREE_ON_LAUNCH: u64 = 1;
    pub const UPLOAD: u64 = 2;
    pub const DEVICE_LAUNCH: u64 = 4;
    pub const USE_NODE_PRIORITY: u64 = 8;

    /// Driver bit representation.
    pub fn bits(&self) -> u64 {
        let mut bits = 0;
        if self.auto_free_on_launch {
            bits |= Self::AUTO_FREE_ON_LAUNCH;
        }
        if self.upload {
            bits |= Self::UPLOAD;
        }
        if self.device_launch {
            bits |= Self::DEVICE_LAUNCH;
        }
        if self.use_node_priority {
            bits |= Self::USE_NODE_PRIORITY;
        }
        bits
    }
}

/// Command buffer configuration.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```json
/// { "capture_mode": "global", "instantiate": { "upload": true } }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Stream capture mode used by `trace`.
    pub capture_mode: CaptureMode,
    /// Flags for instantiating primary command buffers.
    pub instantiate: InstantiateFlags,
    /// Launch value of a conditional handle when the set-condition kernel
    /// did not run.
    pub conditional_default_value: u32,
    /// Flags for conditional handle creation.
    pub conditional_flags: u32,
}

impl GraphConfig {
    /// Parse a JSON config document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| GraphError::Config(e.to_string()))
    }

    /// Read and parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GraphError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Apply `KORE_GRAPH_CAPTURE_MODE` if set.
    pub fn with_env_overrides(self) -> Result<Self> {
        match std::env::var(CAPTURE_MODE_ENV) {
            Ok(value) => self.with_capture_mode_override(&value),
            Err(_) => Ok(self),
        }
    }

    fn with_capture_mode_override(mut self, value: &str) -> Result<Self> {
        self.capture_mode = CaptureMode::parse(value).ok_or_else(|| {
            GraphError::Config(format!("{CAPTURE_MODE_ENV}: unknown capture mode '{value}'"))
        })?;
        Ok(self)
    }
}
