use crate::config::EngineConfig;
use crate::shm::PER_RANK_SHM_SIZE;

/// Allreduce execution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllreduceAlgorithm {
    /// Single rank: copy send to receive.
    Copy,
    /// Order-preserving recursive doubling.
    RecursiveDoubling,
    /// Reduce-scatter followed by allgather.
    ReduceScatterAllgather,
    /// Two-level reduction through the node's shared region.
    ShmStaged,
    /// Every rank reduces one chunk straight from its peers' mapped buffers.
    SingleCopyScatter,
    /// Single-copy reduction per NUMA group, then across NUMA leaders into
    /// the node leader, then a broadcast.
    SingleCopyHierarchical,
}

/// Byte breakpoints of the single-node allreduce tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllreduceTable {
    /// Below: recursive doubling.
    pub rd_below: usize,
    /// Below: shared-memory staged reduction.
    pub shm_below: usize,
    /// Up to: recursive doubling.
    pub rd_upto: usize,
    /// Below: reduce-scatter/allgather.
    pub rsag_below: usize,
    /// Below: single-copy scatter.
    pub scatter_below: usize,
    /// Up to: single-copy hierarchical; larger payloads scatter again.
    pub hierarchical_upto: usize,
}

impl Default for AllreduceTable {
    fn default() -> Self {
        Self {
            rd_below: 32,
            shm_below: 512,
            rd_upto: 2048,
            rsag_below: 65536,
            scatter_below: 4_194_304,
            hierarchical_upto: 16_777_216,
        }
    }
}

/// Shape of an allreduce call, identical on every rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllreduceShape {
    pub size: usize,
    pub bytes: usize,
    pub commutative: bool,
    /// Predefined datatype and host buffers on every side.
    pub fast_path: bool,
    /// `None` when the communicator has no hierarchy.
    pub num_nodes: Option<usize>,
    /// The memory domain supports single-copy mapping.
    pub can_map: bool,
}

impl AllreduceTable {
    pub fn decide(&self, config: &EngineConfig, shape: &AllreduceShape) -> AllreduceAlgorithm {
        use AllreduceAlgorithm::*;

        let bytes = shape.bytes;
        if shape.size == 1 && shape.fast_path {
            return Copy;
        }
        if !shape.commutative {
            return RecursiveDoubling;
        }
        let Some(num_nodes) = shape.num_nodes else {
            return ReduceScatterAllgather;
        };
        if num_nodes > 1 {
            return ReduceScatterAllgather;
        }

        let single_copy = shape.can_map
            && !config.without_smsc
            && shape.fast_path
            && (config.smsc_use_sr_buf || config.smsc_buf_size > 2 * bytes);
        let or_rsag = |algo| if single_copy { algo } else { ReduceScatterAllgather };

        if bytes < self.rd_below {
            RecursiveDoubling
        } else if bytes < self.shm_below && bytes <= PER_RANK_SHM_SIZE && shape.fast_path {
            ShmStaged
        } else if bytes <= self.rd_upto {
            RecursiveDoubling
        } else if bytes < self.rsag_below {
            ReduceScatterAllgather
        } else if bytes < self.scatter_below {
            or_rsag(SingleCopyScatter)
        } else if bytes <= self.hierarchical_upto {
            or_rsag(SingleCopyHierarchical)
        } else {
            or_rsag(SingleCopyScatter)
        }
    }
}
