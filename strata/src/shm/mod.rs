//! Node-scoped shared memory: segments, the memory-domain seam and the
//! typed region view used by the intra-node fast paths.

mod domain;
mod region;
mod segment;

pub use domain::{LocalMemoryDomain, MappedRegion, MemoryDomain, RegionToken};
pub use region::{CACHE_LINE_SIZE, FlagArea, LEADER_SHM_SIZE, PER_RANK_SHM_SIZE, SharedRegion};
pub use segment::{Segment, SegmentKey};
