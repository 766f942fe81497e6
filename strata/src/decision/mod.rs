//! Algorithm selection.
//!
//! Decisions are pure functions of the call shape, the engine configuration
//! and the tables below, so every rank reaches the same plan without
//! talking to its peers. The tables are plain data and can be replaced
//! wholesale through [`DecisionTables`].

mod allreduce;
mod bcast;

pub use allreduce::{AllreduceAlgorithm, AllreduceShape, AllreduceTable};
pub use bcast::{
    AlgorithmChoice, BcastAlgorithm, BcastBand, BcastRule, BcastShape, BcastTable, FanOut,
    SubgroupSpan,
};

/// Every breakpoint the engine consults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionTables {
    pub bcast: BcastTable,
    pub allreduce: AllreduceTable,
}

/// A decided plan, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Broadcast(BcastAlgorithm),
    Allreduce(AllreduceAlgorithm),
}
