//! Topology-aware broadcast and allreduce.
//!
//! An [`Engine`] splits each communicator into node, socket, NUMA and
//! subgroup tiers once, caches the result, and picks a strategy per call
//! from message size, group size and node count: flat trees, layered
//! hierarchical trees, a shared-memory staging path, or single-copy
//! reductions through mapped peer buffers.

pub mod comm;
pub mod config;
pub mod decision;
pub mod device;
pub mod engine;
pub mod error;
pub(crate) mod fallback;
mod hash;
pub mod hierarchy;
pub mod reduce;
pub mod shm;
pub(crate) mod sync;
pub mod transport;
pub mod types;

pub use comm::{Communicator, Locality, Request, wait_all};
pub use config::EngineConfig;
pub use decision::{
    AlgorithmChoice, AllreduceAlgorithm, BcastAlgorithm, DecisionTables, FanOut, Plan,
};
pub use device::{CpuAdapter, DeviceAdapter};
pub use engine::Engine;
pub use error::{Result, StrataError};
pub use hierarchy::CacheStats;
pub use reduce::Operator;
pub use shm::{LocalMemoryDomain, MemoryDomain};
pub use transport::{LocalCluster, LocalComm};
pub use types::{CommId, DataType, Rank, ReduceOp, SendBuf};
