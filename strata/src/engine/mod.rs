//! The collective engine: hierarchy cache, decision tables and the
//! execution paths for broadcast and allreduce.

mod allreduce;
mod broadcast;
mod single_copy;
mod tree;

use crate::comm::Communicator;
use crate::config::EngineConfig;
use crate::decision::{DecisionTables, Plan};
use crate::device::{CpuAdapter, DeviceAdapter};
use crate::error::{Result, StrataError};
use crate::hierarchy::{CacheStats, HierarchyCache};
use crate::shm::MemoryDomain;
use crate::types::DataType;
use std::sync::{Arc, Mutex};

/// Topology-aware broadcast and allreduce over communicators of type `C`.
///
/// One engine serves one process. It keeps a bounded side table of
/// per-communicator hierarchies; collectives on the same communicator are
/// serialized through that table, collectives on different communicators
/// may run concurrently.
///
/// ```ignore
/// let engine = Engine::new(EngineConfig::from_env(), memory)?;
/// engine.allreduce_in_place(&comm, &mut grads, DataType::F32, &ReduceOp::Sum).await?;
/// ```
pub struct Engine<C: Communicator> {
    config: Arc<EngineConfig>,
    tables: DecisionTables,
    memory: Arc<dyn MemoryDomain>,
    adapter: Arc<dyn DeviceAdapter>,
    cache: HierarchyCache<C>,
    last_plan: Mutex<Option<Plan>>,
}

impl<C: Communicator> Engine<C> {
    /// Validate `config` and create an engine for host buffers.
    pub fn new(config: EngineConfig, memory: Arc<dyn MemoryDomain>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: HierarchyCache::new(config.max_comms),
            config: Arc::new(config),
            tables: DecisionTables::default(),
            memory,
            adapter: Arc::new(CpuAdapter::new()),
            last_plan: Mutex::new(None),
        })
    }

    /// Use `adapter` to reach caller buffers.
    pub fn with_adapter(mut self, adapter: Arc<dyn DeviceAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Replace the decision breakpoints.
    pub fn with_tables(mut self, tables: DecisionTables) -> Self {
        self.tables = tables;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn tables(&self) -> &DecisionTables {
        &self.tables
    }

    /// Plan of the most recent collective this engine ran.
    pub fn last_plan(&self) -> Option<Plan> {
        self.last_plan.lock().ok().and_then(|p| *p)
    }

    /// Cache state of `comm`, if it has an entry.
    pub async fn cache_stats(&self, comm: &C) -> Option<CacheStats> {
        self.cache.stats(comm.id()).await
    }

    /// Communicators holding a cache entry.
    pub async fn cached_comms(&self) -> usize {
        self.cache.len().await
    }

    fn record(&self, plan: Plan) {
        if let Ok(mut last) = self.last_plan.lock() {
            *last = Some(plan);
        }
    }
}

/// Payload size of `count` elements of `dtype`.
fn payload_bytes(count: usize, dtype: DataType) -> Result<usize> {
    count.checked_mul(dtype.size_in_bytes()).ok_or_else(|| {
        StrataError::OutOfResources(format!("{count} x {dtype} overflows the address space"))
    })
}

/// Check that a slice holds exactly `count` elements of `dtype`.
fn check_slice(len: usize, count: usize, dtype: DataType) -> Result<()> {
    let expected = payload_bytes(count, dtype)?;
    if len != expected {
        return Err(StrataError::BufferSizeMismatch {
            expected,
            actual: len,
        });
    }
    Ok(())
}
