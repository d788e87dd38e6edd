use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use dashmap::DashMap;
use mlinfer_core::{DataType, ModelGraph, Value};
use tracing::debug;

use super::{EngineHandle, ExternalEngine};
use crate::executor::{Executor, LoadedGraph, RuntimeEnv};
use crate::registry::KernelRegistry;
use crate::session::SessionOptions;

/// Engine that evaluates delegated graphs with a private CPU executor.
///
/// Used by the delegated provider when no other engine is configured.
pub struct ReferenceEngine {
    registry: Arc<KernelRegistry>,
    dtype: DataType,
    executors: DashMap<u64, Arc<Executor>>,
    next_handle: AtomicU64,
}

impl ReferenceEngine {
    /// Engine resolving kernels from `registry`, computing in `dtype`.
    pub fn new(registry: Arc<KernelRegistry>, dtype: DataType) -> Self {
        Self {
            registry,
            dtype,
            executors: DashMap::new(),
            next_handle: AtomicU64::new(0),
        }
    }

    /// Number of graphs currently loaded.
    pub fn loaded_count(&self) -> usize {
        self.executors.len()
    }
}

impl ExternalEngine for ReferenceEngine {
    fn name(&self) -> &str {
        "reference"
    }

    fn supports(&self, op_type: &str, domain: &str) -> bool {
        self.registry.is_supported(op_type, domain)
    }

    fn load(&self, graph: &ModelGraph) -> anyhow::Result<EngineHandle> {
        let env = RuntimeEnv::new(
            Arc::clone(&self.registry),
            SessionOptions::new().with_dtype(self.dtype),
        );
        let executor = LoadedGraph::new(graph.clone())
            .plan(&env)
            .context("reference engine could not plan the delegated graph")?;

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.executors.insert(id, Arc::new(executor));
        debug!("Reference engine loaded graph as handle {}", id);
        Ok(EngineHandle(id))
    }

    fn execute(
        &self,
        handle: EngineHandle,
        inputs: HashMap<String, Value>,
    ) -> anyhow::Result<HashMap<String, Value>> {
        let executor = self
            .executors
            .get(&handle.0)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| anyhow!("unknown engine handle {}", handle.0))?;
        Ok(executor.run(inputs, None)?)
    }

    fn release(&self, handle: EngineHandle) {
        if self.executors.remove(&handle.0).is_some() {
            debug!("Reference engine released handle {}", handle.0);
        }
    }
}
