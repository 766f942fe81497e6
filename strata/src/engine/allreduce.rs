use crate::comm::{Communicator, tags};
use crate::decision::{AllreduceAlgorithm, AllreduceShape, Plan};
use crate::device::DeviceBuf;
use crate::engine::single_copy::Exposure;
use crate::engine::{Engine, check_slice, payload_bytes};
use crate::error::{Result, StrataError};
use crate::fallback::helpers::ChunkLayout;
use crate::fallback::{barrier, linear_broadcast, recursive_doubling_allreduce, rsag_allreduce};
use crate::hierarchy::{CacheEntry, MIN_HIERARCHY_SIZE, ShmGroups, Tier};
use crate::reduce::Operator;
use crate::shm::FlagArea;
use crate::sync::rendezvous;
use crate::types::{DataType, SendBuf};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Operands of one allreduce call.
struct Operands<'a> {
    /// `None` for in-place calls.
    send: Option<DeviceBuf<'a>>,
    recv: DeviceBuf<'a>,
    count: usize,
    dtype: DataType,
    op: &'a dyn Operator,
}

impl Operands<'_> {
    /// This rank's contribution.
    fn contribution(&self) -> Result<Vec<u8>> {
        match &self.send {
            Some(send) => send.load(),
            None => self.recv.load(),
        }
    }

    fn bytes(&self) -> usize {
        self.recv.len()
    }

    /// Fold `rhs` into `acc`, or start the accumulator with it.
    fn fold(&self, acc: &mut Option<Vec<u8>>, rhs: &[u8], count: usize) -> Result<()> {
        match acc {
            Some(acc) => self.op.apply(acc, rhs, count, self.dtype),
            None => {
                *acc = Some(rhs.to_vec());
                Ok(())
            }
        }
    }
}

impl<C: Communicator> Engine<C> {
    /// Combine `count` elements of `dtype` from every rank with `op` and
    /// leave the result in every rank's receive buffer. Collective.
    ///
    /// Non-commutative operators are applied in rank order.
    ///
    /// # Safety
    /// `recv_ptr`, and the send pointer unless `send` is
    /// [`SendBuf::InPlace`], must be valid for `count` elements of `dtype`
    /// for the duration of the call and must not overlap each other.
    pub async unsafe fn allreduce(
        &self,
        comm: &C,
        send: SendBuf,
        recv_ptr: u64,
        count: usize,
        dtype: DataType,
        op: &dyn Operator,
    ) -> Result<()> {
        if !op.supports(dtype) {
            return Err(StrataError::UnsupportedDType {
                dtype,
                op: "allreduce",
            });
        }
        let bytes = payload_bytes(count, dtype)?;
        let adapter = &*self.adapter;
        let operands = Operands {
            send: match send {
                SendBuf::InPlace => None,
                SendBuf::Ptr(ptr) => Some(unsafe { DeviceBuf::new(adapter, ptr, bytes) }),
            },
            recv: unsafe { DeviceBuf::new(adapter, recv_ptr, bytes) },
            count,
            dtype,
            op,
        };
        let fast_path = dtype.is_predefined()
            && !operands.recv.is_device()
            && !operands.send.as_ref().is_some_and(DeviceBuf::is_device);

        let (algo, entry) = self
            .route_allreduce(comm, bytes, op.is_commutative(), fast_path)
            .await?;
        self.record(Plan::Allreduce(algo));
        debug!(comm = comm.id(), bytes, op = op.name(), ?algo, "allreduce plan");

        match (algo, entry) {
            (AllreduceAlgorithm::Copy, _) => {
                if let Some(send) = &operands.send {
                    operands.recv.store(&send.load()?)?;
                }
                Ok(())
            }
            (AllreduceAlgorithm::ShmStaged, Some(mut entry)) => {
                self.shm_staged(comm, &mut entry, &operands).await
            }
            (AllreduceAlgorithm::SingleCopyScatter, Some(mut entry)) => {
                self.single_copy_scatter(comm, &mut entry, &operands).await
            }
            (AllreduceAlgorithm::SingleCopyHierarchical, Some(mut entry)) => {
                self.single_copy_hierarchical(comm, &mut entry, &operands)
                    .await
            }
            (algo, _) => p2p_allreduce(comm, &operands, algo).await,
        }
    }

    /// Allreduce between two host slices of equal length.
    pub async fn allreduce_slice<T: Copy + Send + Sync>(
        &self,
        comm: &C,
        send: &[T],
        recv: &mut [T],
        dtype: DataType,
        op: &dyn Operator,
    ) -> Result<()> {
        let bytes = std::mem::size_of_val(recv);
        if std::mem::size_of_val(send) != bytes {
            return Err(StrataError::BufferSizeMismatch {
                expected: bytes,
                actual: std::mem::size_of_val(send),
            });
        }
        let count = bytes / dtype.size_in_bytes().max(1);
        check_slice(bytes, count, dtype)?;
        unsafe {
            self.allreduce(
                comm,
                SendBuf::Ptr(send.as_ptr() as u64),
                recv.as_mut_ptr() as u64,
                count,
                dtype,
                op,
            )
            .await
        }
    }

    /// Allreduce a host slice in place.
    pub async fn allreduce_in_place<T: Copy + Send + Sync>(
        &self,
        comm: &C,
        data: &mut [T],
        dtype: DataType,
        op: &dyn Operator,
    ) -> Result<()> {
        let bytes = std::mem::size_of_val(data);
        let count = bytes / dtype.size_in_bytes().max(1);
        check_slice(bytes, count, dtype)?;
        unsafe {
            self.allreduce(
                comm,
                SendBuf::InPlace,
                data.as_mut_ptr() as u64,
                count,
                dtype,
                op,
            )
            .await
        }
    }

    /// The strategy `allreduce` would use for host buffers, building the
    /// hierarchy if needed. Collective.
    pub async fn plan_allreduce(
        &self,
        comm: &C,
        count: usize,
        dtype: DataType,
        op: &dyn Operator,
    ) -> Result<AllreduceAlgorithm> {
        let bytes = payload_bytes(count, dtype)?;
        let (algo, _) = self
            .route_allreduce(comm, bytes, op.is_commutative(), dtype.is_predefined())
            .await?;
        Ok(algo)
    }

    /// Decide the algorithm. Hierarchy-dependent plans come back with the
    /// communicator's entry locked.
    async fn route_allreduce(
        &self,
        comm: &C,
        bytes: usize,
        commutative: bool,
        fast_path: bool,
    ) -> Result<(AllreduceAlgorithm, Option<OwnedMutexGuard<CacheEntry<C>>>)> {
        let mut shape = AllreduceShape {
            size: comm.size() as usize,
            bytes,
            commutative,
            fast_path,
            num_nodes: None,
            can_map: self.memory.can_map(),
        };
        let table = &self.tables.allreduce;
        let flat = table.decide(&self.config, &shape);
        if flat != AllreduceAlgorithm::ReduceScatterAllgather || comm.size() < MIN_HIERARCHY_SIZE {
            return Ok((flat, None));
        }
        let Some(entry) = self.cache.entry(comm.id()).await else {
            return Ok((flat, None));
        };
        let mut entry = entry.lock_owned().await;
        let hierarchy = entry.any_hierarchy(comm, self.config.sg_count()).await?;
        shape.num_nodes = Some(hierarchy.num_nodes());
        let algo = table.decide(&self.config, &shape);
        Ok((algo, Some(entry)))
    }

    /// Two-level reduction through the shared region, then a flat
    /// broadcast inside each NUMA group.
    ///
    /// Members stage contributions in their NUMA leader's row; the leader
    /// folds them in slot order and stages the partial; NUMA leaders fold
    /// every partial in slot order, so all of them hold the same bytes.
    async fn shm_staged(
        &self,
        comm: &C,
        entry: &mut CacheEntry<C>,
        operands: &Operands<'_>,
    ) -> Result<()> {
        let (h, region) = entry.with_region(&self.memory, comm.id())?;
        let shm = h.shm();
        let (count, bytes) = (operands.count, operands.bytes());

        // Every node rank advances every area, taking part or not.
        let up = region.advance(FlagArea::Up);
        let partials_ready = region.advance(FlagArea::Down);
        let partials_read = region.advance(FlagArea::Down);

        let me = shm.slot;
        let leader = shm.l1.first().copied().unwrap_or(me);
        unsafe { region.write_contribution(leader, me, &operands.contribution()?)? };
        rendezvous(region, &shm.l1, FlagArea::Up, up).await?;

        if shm.is_l1_leader() {
            let mut acc = None;
            for member in ShmGroups::ascending(&shm.l1) {
                let c = unsafe { region.read_contribution(leader, member, bytes)? };
                operands.fold(&mut acc, &c, count)?;
            }
            let mut result = acc.unwrap_or_default();

            if shm.l2.len() > 1 {
                unsafe { region.write_staging(me, &result)? };
                rendezvous(region, &shm.l2, FlagArea::Down, partials_ready).await?;
                let mut total = None;
                for peer in ShmGroups::ascending(&shm.l2) {
                    let partial = unsafe { region.read_staging(peer, bytes)? };
                    operands.fold(&mut total, &partial, count)?;
                }
                rendezvous(region, &shm.l2, FlagArea::Down, partials_read).await?;
                result = total.unwrap_or_default();
            }
            operands.recv.store(&result)?;
        }

        linear_broadcast(h.numa(), &operands.recv, 0, tags::ALLREDUCE).await
    }

    /// Buffers to expose for single-copy access: the user buffers, or both
    /// halves of the entry's scratch buffer with the contribution staged in
    /// the upper half.
    fn single_copy_buffers(
        &self,
        entry: &mut CacheEntry<C>,
        operands: &Operands<'_>,
    ) -> Result<(u64, u64)> {
        if self.config.smsc_use_sr_buf {
            let recv = operands.recv.addr();
            let send = operands.send.as_ref().map_or(recv, DeviceBuf::addr);
            return Ok((send, recv));
        }
        let scratch = entry.scratch_addr(self.config.smsc_buf_size);
        let half = (self.config.smsc_buf_size / 2) as u64;
        let data = operands.contribution()?;
        // Scratch is owned by the locked entry and sized above 2 * bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), (scratch + half) as *mut u8, data.len());
        }
        Ok((scratch + half, scratch))
    }

    /// Each rank reduces one chunk straight out of every peer's send
    /// buffer, then every rank gathers all chunks from the peers' receive
    /// buffers.
    async fn single_copy_scatter(
        &self,
        comm: &C,
        entry: &mut CacheEntry<C>,
        operands: &Operands<'_>,
    ) -> Result<()> {
        let (send, recv) = self.single_copy_buffers(entry, operands)?;
        let memory = &*self.memory;
        let exposure = Exposure::exchange(comm, memory, send, recv, operands.bytes()).await?;
        let result = self.scatter_with(comm, &exposure, operands).await;
        exposure.release(memory);
        result
    }

    async fn scatter_with(
        &self,
        comm: &C,
        exposure: &Exposure,
        operands: &Operands<'_>,
    ) -> Result<()> {
        let size = comm.size() as usize;
        let rank = comm.rank() as usize;
        let elem = operands.dtype.size_in_bytes();
        let chunks = ChunkLayout::new(operands.count, size);

        let (off, n) = (chunks.offset(rank) * elem, chunks.chunk_count(rank));
        if n > 0 {
            let mut acc = None;
            for peer in 0..size {
                let src = unsafe { exposure.peer(peer)?.send.bytes(off, n * elem)? };
                operands.fold(&mut acc, src, n)?;
            }
            if let Some(acc) = acc {
                unsafe { exposure.peer(rank)?.recv.write(off, &acc)? };
            }
        }
        barrier(comm, tags::BARRIER).await?;

        for peer in 0..size {
            // Own chunk already sits in the user receive buffer.
            if self.config.smsc_use_sr_buf && peer == rank {
                continue;
            }
            let (off, n) = (chunks.offset(peer) * elem, chunks.chunk_count(peer));
            if n == 0 {
                continue;
            }
            let chunk = unsafe { exposure.peer(peer)?.recv.bytes(off, n * elem)? };
            operands.recv.store_at(off, chunk)?;
        }
        barrier(comm, tags::BARRIER).await
    }

    /// Reduce inside each NUMA group into the group leader's receive
    /// buffer, then across NUMA leaders into the node leader's, then
    /// broadcast from the node leader.
    async fn single_copy_hierarchical(
        &self,
        comm: &C,
        entry: &mut CacheEntry<C>,
        operands: &Operands<'_>,
    ) -> Result<()> {
        let (owner, group_leader, numa_members, numa_leaders) = {
            let h = entry
                .hierarchy()
                .ok_or_else(|| StrataError::Split("no hierarchy cached".into()))?;
            let layout = h.layout();
            let me = comm.rank();
            let numa_members = layout.members(Tier::Numa, layout.group_of(Tier::Numa, me));
            let mut numa_leaders: Vec<_> = layout.leaders(Tier::Numa).to_vec();
            numa_leaders.sort_unstable();
            let group_leader = layout.leader_of(Tier::Numa, me);
            (h.root(), group_leader, numa_members, numa_leaders)
        };

        let (send, recv) = self.single_copy_buffers(entry, operands)?;
        let memory = &*self.memory;
        let exposure = Exposure::exchange(comm, memory, send, recv, operands.bytes()).await?;
        let staged = async {
            let me = comm.rank();
            let elem = operands.dtype.size_in_bytes();

            // Stage 1: one chunk per NUMA member, into the group leader.
            if let Some(i) = numa_members.iter().position(|&r| r == me) {
                let chunks = ChunkLayout::new(operands.count, numa_members.len());
                let (off, n) = (chunks.offset(i) * elem, chunks.chunk_count(i));
                if n > 0 {
                    let mut acc = None;
                    for &m in &numa_members {
                        let src = unsafe { exposure.peer(m as usize)?.send.bytes(off, n * elem)? };
                        operands.fold(&mut acc, src, n)?;
                    }
                    if let Some(acc) = acc {
                        let dst = &exposure.peer(group_leader as usize)?.recv;
                        unsafe { dst.write(off, &acc)? };
                    }
                }
            }
            barrier(comm, tags::BARRIER).await?;

            // Stage 2: one chunk per NUMA leader, into the owner.
            if let Some(j) = numa_leaders.iter().position(|&r| r == me) {
                let chunks = ChunkLayout::new(operands.count, numa_leaders.len());
                let (off, n) = (chunks.offset(j) * elem, chunks.chunk_count(j));
                if n > 0 {
                    let mut acc = None;
                    for &l in &numa_leaders {
                        let src = unsafe { exposure.peer(l as usize)?.recv.bytes(off, n * elem)? };
                        operands.fold(&mut acc, src, n)?;
                    }
                    if let Some(acc) = acc {
                        let dst = &exposure.peer(owner as usize)?.recv;
                        unsafe { dst.write(off, &acc)? };
                    }
                }
            }
            barrier(comm, tags::BARRIER).await?;

            if !self.config.smsc_use_sr_buf && me == owner {
                let reduced = unsafe { exposure.peer(owner as usize)?.recv.bytes(0, operands.bytes())? };
                operands.recv.store(reduced)?;
            }
            Ok::<(), StrataError>(())
        }
        .await;
        exposure.release(memory);
        staged?;

        let recv = &operands.recv;
        let algo = self
            .plan_locked(comm, entry, recv, operands.dtype, owner)
            .await?;
        self.run_locked(comm, entry, recv, owner, algo).await
    }
}

/// Point-to-point fallbacks on a host copy of the contribution.
async fn p2p_allreduce<C: Communicator>(
    comm: &C,
    operands: &Operands<'_>,
    algo: AllreduceAlgorithm,
) -> Result<()> {
    let mut data = operands.contribution()?;
    let (count, dtype, op) = (operands.count, operands.dtype, operands.op);
    match algo {
        AllreduceAlgorithm::RecursiveDoubling => {
            recursive_doubling_allreduce(comm, &mut data, count, dtype, op, tags::ALLREDUCE).await?
        }
        _ => rsag_allreduce(comm, &mut data, count, dtype, op, tags::ALLREDUCE).await?,
    }
    operands.recv.store(&data)
}
