use crate::comm::Communicator;
use crate::error::{Result, StrataError};
use crate::hierarchy::SubgroupHierarchy;
use crate::shm::{MemoryDomain, SharedRegion};
use crate::types::{CommId, Rank};
use indexmap::IndexSet;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Snapshot of one communicator's cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Hierarchy builds so far.
    pub builds: usize,
    /// Distinct broadcast roots, in order of first use.
    pub roots_seen: Vec<Rank>,
    /// Root of the current hierarchy.
    pub cached_root: Option<Rank>,
    /// Whether broadcast has given up on hierarchies for this communicator.
    pub root_fallback: bool,
}

/// Per-communicator state: the current hierarchy plus the resources that
/// outlive rebuilds (shared region, scratch buffer).
pub(crate) struct CacheEntry<C> {
    hierarchy: Option<SubgroupHierarchy<C>>,
    roots_seen: IndexSet<Rank>,
    root_fallback: bool,
    builds: usize,
    region: Option<SharedRegion>,
    scratch: Option<Box<[u8]>>,
}

impl<C: Communicator> CacheEntry<C> {
    fn new() -> Self {
        Self {
            hierarchy: None,
            roots_seen: IndexSet::new(),
            root_fallback: false,
            builds: 0,
            region: None,
            scratch: None,
        }
    }

    /// Record a broadcast root. Returns `true` once more than `threshold`
    /// distinct roots have been seen; from then on it stays `true`.
    pub(crate) fn note_root(&mut self, root: Rank, threshold: usize) -> bool {
        self.roots_seen.insert(root);
        if !self.root_fallback && self.roots_seen.len() > threshold {
            warn!(
                roots = self.roots_seen.len(),
                threshold, "too many broadcast roots, falling back to k-nomial"
            );
            self.root_fallback = true;
        }
        self.root_fallback
    }

    pub(crate) fn hierarchy(&self) -> Option<&SubgroupHierarchy<C>> {
        self.hierarchy.as_ref()
    }

    /// Hierarchy for `root`, rebuilding when the cached one has another root.
    pub(crate) async fn hierarchy_for(
        &mut self,
        comm: &C,
        root: Rank,
        sg_size: usize,
    ) -> Result<&SubgroupHierarchy<C>> {
        let stale = self.hierarchy.as_ref().is_none_or(|h| h.root() != root);
        if stale {
            self.rebuild(comm, root, sg_size).await?;
        }
        self.current()
    }

    /// Current hierarchy, building one rooted at 0 if there is none.
    pub(crate) async fn any_hierarchy(
        &mut self,
        comm: &C,
        sg_size: usize,
    ) -> Result<&SubgroupHierarchy<C>> {
        if self.hierarchy.is_none() {
            self.rebuild(comm, 0, sg_size).await?;
        }
        self.current()
    }

    async fn rebuild(&mut self, comm: &C, root: Rank, sg_size: usize) -> Result<()> {
        // Drop the old sub-communicators before the new split traffic starts.
        self.hierarchy = None;
        let hierarchy = SubgroupHierarchy::build(comm, root, sg_size).await?;
        self.builds += 1;
        debug!(comm = comm.id(), root, builds = self.builds, "hierarchy cached");
        self.hierarchy = Some(hierarchy);
        Ok(())
    }

    fn current(&self) -> Result<&SubgroupHierarchy<C>> {
        self.hierarchy
            .as_ref()
            .ok_or_else(|| StrataError::Split("no hierarchy cached".into()))
    }

    /// The current hierarchy together with the node's shared region,
    /// attaching the region on first use.
    pub(crate) fn with_region(
        &mut self,
        memory: &Arc<dyn MemoryDomain>,
        comm: CommId,
    ) -> Result<(&SubgroupHierarchy<C>, &SharedRegion)> {
        let hierarchy = self
            .hierarchy
            .as_ref()
            .ok_or_else(|| StrataError::Split("no hierarchy cached".into()))?;
        if self.region.is_none() {
            let shm = hierarchy.shm();
            let region = SharedRegion::attach(
                Arc::clone(memory),
                comm,
                hierarchy.node_key(),
                shm.node_size(),
                shm.slot,
            )?;
            debug!(comm, slot = shm.slot, node_size = shm.node_size(), "attached shared region");
            self.region = Some(region);
        }
        let region = self
            .region
            .as_ref()
            .ok_or_else(|| StrataError::SharedMemory("region not attached".into()))?;
        Ok((hierarchy, region))
    }

    /// Address of a zeroed scratch buffer of at least `len` bytes, owned by
    /// this entry.
    pub(crate) fn scratch_addr(&mut self, len: usize) -> u64 {
        let fits = self.scratch.as_ref().is_some_and(|s| s.len() >= len);
        if !fits {
            self.scratch = Some(vec![0u8; len].into_boxed_slice());
        }
        self.scratch
            .as_mut()
            .map_or(0, |s| s.as_mut_ptr() as u64)
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            builds: self.builds,
            roots_seen: self.roots_seen.iter().copied().collect(),
            cached_root: self.hierarchy.as_ref().map(SubgroupHierarchy::root),
            root_fallback: self.root_fallback,
        }
    }
}

struct Entries<C> {
    by_comm: HashMap<CommId, Arc<Mutex<CacheEntry<C>>>>,
    /// Communicators already turned away, so the warning fires once each.
    rejected: HashSet<CommId>,
}

/// Side table of per-communicator entries, bounded by `max_comms`.
pub(crate) struct HierarchyCache<C> {
    entries: Mutex<Entries<C>>,
    max_comms: usize,
}

impl<C: Communicator> HierarchyCache<C> {
    pub(crate) fn new(max_comms: usize) -> Self {
        Self {
            entries: Mutex::new(Entries {
                by_comm: HashMap::new(),
                rejected: HashSet::new(),
            }),
            max_comms,
        }
    }

    /// Entry for `comm`, created on first use. `None` once the table is
    /// full; the caller then uses a flat algorithm.
    pub(crate) async fn entry(&self, comm: CommId) -> Option<Arc<Mutex<CacheEntry<C>>>> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.by_comm.get(&comm) {
            return Some(Arc::clone(entry));
        }
        if entries.by_comm.len() >= self.max_comms {
            if entries.rejected.insert(comm) {
                warn!(comm, max_comms = self.max_comms, "hierarchy cache full");
            }
            return None;
        }
        let entry = Arc::new(Mutex::new(CacheEntry::new()));
        entries.by_comm.insert(comm, Arc::clone(&entry));
        Some(entry)
    }

    pub(crate) async fn stats(&self, comm: CommId) -> Option<CacheStats> {
        let entry = {
            let entries = self.entries.lock().await;
            entries.by_comm.get(&comm).map(Arc::clone)
        }?;
        let stats = entry.lock().await.stats();
        Some(stats)
    }

    /// Communicators with an entry.
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.by_comm.len()
    }
}
