use crate::comm::{Communicator, tags};
use crate::decision::{AlgorithmChoice, BcastAlgorithm, BcastShape, Plan};
use crate::device::DeviceBuf;
use crate::engine::tree::broadcast_layer;
use crate::engine::{Engine, check_slice, payload_bytes};
use crate::error::{Result, StrataError};
use crate::fallback::{knomial_broadcast, linear_broadcast};
use crate::hierarchy::{BaseParent, BaseTier, CacheEntry, SubgroupHierarchy};
use crate::shm::{FlagArea, SharedRegion};
use crate::sync::{publish, spin_until};
use crate::types::{DataType, Rank};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

impl<C: Communicator> Engine<C> {
    /// Broadcast `count` elements of `dtype` at `ptr` from `root` to every
    /// rank of `comm`. Collective.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `count` elements of
    /// `dtype` for the duration of the call, in memory the engine's device
    /// adapter can reach.
    pub async unsafe fn broadcast(
        &self,
        comm: &C,
        ptr: u64,
        count: usize,
        dtype: DataType,
        root: Rank,
    ) -> Result<()> {
        check_root(comm, root)?;
        let bytes = payload_bytes(count, dtype)?;
        let buf = unsafe { DeviceBuf::new(&*self.adapter, ptr, bytes) };

        if (comm.size() as usize) < self.tables.bcast.linear_below {
            self.record(Plan::Broadcast(BcastAlgorithm::Linear));
            return linear_broadcast(comm, &buf, root, tags::BCAST).await;
        }
        match self.bcast_entry(comm, root).await {
            Some(mut entry) => {
                let algo = self.plan_locked(comm, &mut entry, &buf, dtype, root).await?;
                self.record(Plan::Broadcast(algo));
                self.run_locked(comm, &mut entry, &buf, root, algo).await
            }
            None => {
                let algo = self.flat_bcast();
                self.record(Plan::Broadcast(algo));
                self.run_flat_bcast(comm, &buf, root, algo).await
            }
        }
    }

    /// Broadcast a host slice. Collective; every rank passes a slice of the
    /// same length.
    pub async fn broadcast_slice<T: Copy + Send + Sync>(
        &self,
        comm: &C,
        data: &mut [T],
        dtype: DataType,
        root: Rank,
    ) -> Result<()> {
        let bytes = std::mem::size_of_val(data);
        let count = bytes / dtype.size_in_bytes().max(1);
        check_slice(bytes, count, dtype)?;
        unsafe {
            self.broadcast(comm, data.as_mut_ptr() as u64, count, dtype, root)
                .await
        }
    }

    /// The strategy `broadcast` would use for this call, building the
    /// hierarchy if needed. Collective; counts as a use of `root`.
    pub async fn plan_broadcast(
        &self,
        comm: &C,
        count: usize,
        dtype: DataType,
        root: Rank,
    ) -> Result<BcastAlgorithm> {
        check_root(comm, root)?;
        let bytes = payload_bytes(count, dtype)?;
        if (comm.size() as usize) < self.tables.bcast.linear_below {
            return Ok(BcastAlgorithm::Linear);
        }
        match self.bcast_entry(comm, root).await {
            Some(mut entry) => {
                let hierarchy = entry
                    .hierarchy_for(comm, root, self.config.sg_count())
                    .await?;
                Ok(self.decide_bcast(comm, hierarchy, bytes, dtype.is_predefined()))
            }
            None => Ok(self.flat_bcast()),
        }
    }

    /// Locked cache entry for a broadcast, or `None` when the call must use
    /// the k-nomial fallback.
    async fn bcast_entry(&self, comm: &C, root: Rank) -> Option<OwnedMutexGuard<CacheEntry<C>>> {
        let entry = self.cache.entry(comm.id()).await?;
        let mut entry = entry.lock_owned().await;
        if entry.note_root(root, self.config.root_change_thresh) {
            return None;
        }
        Some(entry)
    }

    fn flat_bcast(&self) -> BcastAlgorithm {
        BcastAlgorithm::Knomial {
            radix: self.tables.bcast.knomial_radix,
        }
    }

    fn decide_bcast(
        &self,
        comm: &C,
        hierarchy: &SubgroupHierarchy<C>,
        bytes: usize,
        shm_capable: bool,
    ) -> BcastAlgorithm {
        let shape = BcastShape {
            size: comm.size() as usize,
            bytes,
            num_nodes: hierarchy.num_nodes(),
            node_size: hierarchy.node_size(),
            shm_capable,
        };
        let algo = self.tables.bcast.decide(&self.config, &shape);
        debug!(comm = comm.id(), root = hierarchy.root(), bytes, ?algo, "broadcast plan");
        algo
    }

    async fn run_flat_bcast(
        &self,
        comm: &C,
        buf: &DeviceBuf<'_>,
        root: Rank,
        algo: BcastAlgorithm,
    ) -> Result<()> {
        match algo {
            BcastAlgorithm::Knomial { radix } => {
                knomial_broadcast(comm, buf, root, radix, tags::BCAST).await
            }
            _ => linear_broadcast(comm, buf, root, tags::BCAST).await,
        }
    }

    /// Plan for a broadcast with the entry already locked, rebuilding the
    /// hierarchy for `root` if needed.
    pub(crate) async fn plan_locked(
        &self,
        comm: &C,
        entry: &mut CacheEntry<C>,
        buf: &DeviceBuf<'_>,
        dtype: DataType,
        root: Rank,
    ) -> Result<BcastAlgorithm> {
        let hierarchy = entry
            .hierarchy_for(comm, root, self.config.sg_count())
            .await?;
        let shm_capable = dtype.is_predefined() && !buf.is_device();
        Ok(self.decide_bcast(comm, hierarchy, buf.len(), shm_capable))
    }

    /// Run `algo` with the entry already locked. Does not touch the
    /// recorded plan, so the hierarchical single-copy allreduce can end
    /// with a broadcast and still report itself.
    pub(crate) async fn run_locked(
        &self,
        comm: &C,
        entry: &mut CacheEntry<C>,
        buf: &DeviceBuf<'_>,
        root: Rank,
        algo: BcastAlgorithm,
    ) -> Result<()> {
        match algo {
            BcastAlgorithm::Hierarchical(choice) => {
                self.hierarchical_bcast(comm, entry, buf, choice).await
            }
            flat => self.run_flat_bcast(comm, buf, root, flat).await,
        }
    }

    /// Top layer among leaders, then base and leaf layers (or the
    /// shared-memory path) inside each node or socket. Every sub-communicator
    /// has its leader at rank 0, so each layer is rooted at 0.
    async fn hierarchical_bcast(
        &self,
        comm: &C,
        entry: &mut CacheEntry<C>,
        buf: &DeviceBuf<'_>,
        choice: AlgorithmChoice,
    ) -> Result<()> {
        {
            let h = entry
                .hierarchy()
                .ok_or_else(|| StrataError::Split("no hierarchy cached".into()))?;
            if choice.use_leaders || choice.use_socket {
                let leaders = if choice.use_socket {
                    h.socket_leaders()
                } else {
                    h.node_leaders()
                };
                if let Some(leaders) = leaders {
                    broadcast_layer(leaders, buf, 0, choice.top).await?;
                }
            }
        }

        if choice.use_shm {
            let (h, region) = entry.with_region(&self.memory, comm.id())?;
            return shm_broadcast(h, region, buf).await;
        }

        let h = entry
            .hierarchy()
            .ok_or_else(|| StrataError::Split("no hierarchy cached".into()))?;
        let (intra, parent) = if choice.use_socket {
            (h.socket(), BaseParent::Socket)
        } else {
            (h.node(), BaseParent::Node)
        };
        let tier = if choice.use_numa {
            BaseTier::Numa
        } else {
            BaseTier::L3
        };

        let base = if choice.single_stage {
            Some(intra)
        } else {
            h.base(tier, parent)
        };
        if let Some(base) = base {
            broadcast_layer(base, buf, 0, choice.base).await?;
        }
        if choice.single_stage {
            return Ok(());
        }

        let leaf = if choice.use_numa { h.numa() } else { h.subgroup() };
        broadcast_layer(leaf, buf, 0, choice.leaf).await
    }
}

fn check_root<C: Communicator>(comm: &C, root: Rank) -> Result<()> {
    if root >= comm.size() {
        return Err(StrataError::InvalidRank {
            rank: root,
            size: comm.size(),
        });
    }
    Ok(())
}

/// Node-local broadcast through the shared region.
///
/// The node leader stages the payload and raises its flag; NUMA leaders
/// copy it, restage it in their own rows and raise theirs; members copy
/// from their NUMA leader. Every completion is reported in the flag of the
/// row it was read from, and no writer returns before all of its readers
/// have reported, so a row is never restaged while still being read.
async fn shm_broadcast<C>(
    h: &SubgroupHierarchy<C>,
    region: &SharedRegion,
    buf: &DeviceBuf<'_>,
) -> Result<()> {
    const AREA: FlagArea = FlagArea::Bcast;
    let shm = h.shm();
    let generation = region.advance(AREA);
    let me = shm.slot;
    let (Some(&root), Some(&leader)) = (shm.l2.first(), shm.l1.first()) else {
        return Ok(());
    };
    let len = buf.len();

    if me == root {
        unsafe { region.write_staging(root, &buf.load()?)? };
        publish(region.flag(root, root, AREA)?, generation);
        for &peer in shm.l2[1..].iter().chain(&shm.l1[1..]) {
            spin_until(region.flag(root, peer, AREA)?, generation).await;
        }
    } else if me == leader {
        spin_until(region.flag(root, root, AREA)?, generation).await;
        let data = unsafe { region.read_staging(root, len)? };
        buf.store(&data)?;
        unsafe { region.write_staging(me, &data)? };
        publish(region.flag(root, me, AREA)?, generation);
        publish(region.flag(me, me, AREA)?, generation);
        for &member in &shm.l1[1..] {
            spin_until(region.flag(me, member, AREA)?, generation).await;
        }
    } else {
        spin_until(region.flag(leader, leader, AREA)?, generation).await;
        let data = unsafe { region.read_staging(leader, len)? };
        buf.store(&data)?;
        publish(region.flag(leader, me, AREA)?, generation);
    }
    Ok(())
}
