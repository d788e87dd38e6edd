//! Execution providers.
//!
//! A provider decides where a node's kernel comes from. [`Provider::Cpu`]
//! uses the kernels registered in this crate. [`Provider::Delegated`] hands
//! the node to an [`ExternalEngine`] while the node still takes part in the
//! executor's value table and ordering.

mod delegated;
mod reference;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use mlinfer_core::{ModelGraph, Value};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use delegated::DelegatedKernel;
pub use reference::ReferenceEngine;

/// Where kernels for a node are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Built-in CPU kernels.
    #[default]
    Cpu,
    /// Proxy to an external engine.
    Delegated,
}

impl Provider {
    /// Lowercase provider name.
    pub fn name(self) -> &'static str {
        match self {
            Provider::Cpu => "cpu",
            Provider::Delegated => "delegated",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Provider::Cpu),
            "delegated" => Ok(Provider::Delegated),
            _ => Err(Error::UnsupportedProvider(s.to_string())),
        }
    }
}

/// Opaque id of a graph loaded into an [`ExternalEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineHandle(pub u64);

/// An inference engine that delegated kernels forward to.
///
/// Implementations must be usable from several threads at once because
/// executors are shared across concurrent runs.
pub trait ExternalEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Whether the engine can execute `op_type` from `domain`.
    fn supports(&self, op_type: &str, domain: &str) -> bool;

    /// Prepare `graph` for execution.
    fn load(&self, graph: &ModelGraph) -> anyhow::Result<EngineHandle>;

    /// Evaluate a loaded graph, returning every declared output.
    fn execute(
        &self,
        handle: EngineHandle,
        inputs: HashMap<String, Value>,
    ) -> anyhow::Result<HashMap<String, Value>>;

    /// Drop resources held for `handle`.
    fn release(&self, _handle: EngineHandle) {}
}
