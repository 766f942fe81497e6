use crate::error::{Result, StrataError};
use crate::shm::{MemoryDomain, Segment, SegmentKey};
use crate::types::CommId;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Staging area at the start of every segment.
pub const LEADER_SHM_SIZE: usize = 16 * 1024;

/// Stride of one flag slot, so no two ranks' flags share a line.
pub const CACHE_LINE_SIZE: usize = 64;

/// Contribution slot per node-local rank.
pub const PER_RANK_SHM_SIZE: usize = 8 * 1024;

/// Flag areas of a segment. Each has one slot per node-local rank and its
/// own generation counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagArea {
    /// Members reporting to their group leader.
    Up,
    /// Leaders of leaders.
    Down,
    /// Shared-memory broadcast completion.
    Bcast,
}

impl FlagArea {
    const fn index(self) -> usize {
        match self {
            FlagArea::Up => 0,
            FlagArea::Down => 1,
            FlagArea::Bcast => 2,
        }
    }
}

/// Typed view of a node's shared segments: one row per node-local rank.
///
/// Row layout for a node of `n` ranks (all offsets are multiples of 64):
///
/// | offset                         | size     | content             |
/// |--------------------------------|----------|---------------------|
/// | 0                              | 16 KiB   | staging             |
/// | 16 KiB                         | 64·n     | `Up` flags          |
/// | 16 KiB + 64·n                  | 64·n     | `Down` flags        |
/// | 16 KiB + 128·n                 | 8 KiB·n  | contribution slots  |
/// | 16 KiB + 128·n + 8 KiB·n       | 64·n     | `Bcast` flags       |
///
/// The flag of rank `m` in a row's area lives at `area_base + 64 * m`.
pub struct SharedRegion {
    memory: Arc<dyn MemoryDomain>,
    keys: Vec<SegmentKey>,
    segments: Vec<Arc<Segment>>,
    slot: usize,
    /// This rank's last generation per flag area.
    generations: [AtomicU32; 3],
}

impl SharedRegion {
    /// Bytes needed per row for a node of `n` ranks.
    pub const fn segment_len(n: usize) -> usize {
        LEADER_SHM_SIZE + 3 * CACHE_LINE_SIZE * n + PER_RANK_SHM_SIZE * n
    }

    /// Attach every row of the node's region. `slot` is this rank's
    /// node-local index and `node_size` the number of ranks on the node.
    pub fn attach(
        memory: Arc<dyn MemoryDomain>,
        comm: CommId,
        node: u64,
        node_size: usize,
        slot: usize,
    ) -> Result<Self> {
        if slot >= node_size {
            return Err(StrataError::SharedMemory(format!(
                "slot {slot} outside node of {node_size} ranks"
            )));
        }
        let len = Self::segment_len(node_size);
        let mut keys = Vec::with_capacity(node_size);
        let mut segments = Vec::with_capacity(node_size);
        for owner in 0..node_size {
            let key = SegmentKey {
                comm,
                node,
                owner: owner as u32,
            };
            match memory.attach_segment(key, len) {
                Ok(seg) => {
                    keys.push(key);
                    segments.push(seg);
                }
                Err(e) => {
                    for k in keys {
                        memory.detach_segment(k);
                    }
                    return Err(e);
                }
            }
        }
        Ok(Self {
            memory,
            keys,
            segments,
            slot,
            generations: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        })
    }

    /// Ranks on the node.
    pub fn node_size(&self) -> usize {
        self.segments.len()
    }

    /// This rank's row.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Next generation for `area`. Every node-local rank must advance an
    /// area the same number of times, whether or not it takes part in the
    /// round, so the values stay in agreement.
    pub fn advance(&self, area: FlagArea) -> u32 {
        let counter = &self.generations[area.index()];
        let mut next = counter.load(Ordering::Relaxed).wrapping_add(1);
        // Zero is the initial flag value and never names a round.
        if next == 0 {
            next = 1;
        }
        counter.store(next, Ordering::Relaxed);
        next
    }

    fn segment(&self, owner: usize) -> Result<&Segment> {
        self.segments.get(owner).map(Arc::as_ref).ok_or_else(|| {
            StrataError::SharedMemory(format!(
                "row {owner} outside node of {} ranks",
                self.node_size()
            ))
        })
    }

    fn flag_offset(&self, area: FlagArea, member: usize) -> usize {
        let n = self.node_size();
        let base = match area {
            FlagArea::Up => LEADER_SHM_SIZE,
            FlagArea::Down => LEADER_SHM_SIZE + CACHE_LINE_SIZE * n,
            FlagArea::Bcast => LEADER_SHM_SIZE + 2 * CACHE_LINE_SIZE * n + PER_RANK_SHM_SIZE * n,
        };
        base + CACHE_LINE_SIZE * member
    }

    fn contribution_offset(&self, member: usize) -> usize {
        LEADER_SHM_SIZE + 2 * CACHE_LINE_SIZE * self.node_size() + PER_RANK_SHM_SIZE * member
    }

    /// Flag of `member` in `owner`'s row.
    pub fn flag(&self, owner: usize, member: usize, area: FlagArea) -> Result<&AtomicU32> {
        if member >= self.node_size() {
            return Err(StrataError::SharedMemory(format!(
                "flag slot {member} outside node of {} ranks",
                self.node_size()
            )));
        }
        self.segment(owner)?
            .atomic_u32(self.flag_offset(area, member))
    }

    /// # Safety
    /// See [`Segment::write`].
    pub unsafe fn write_staging(&self, owner: usize, data: &[u8]) -> Result<()> {
        check_fits(data.len(), LEADER_SHM_SIZE, "staging")?;
        unsafe { self.segment(owner)?.write(0, data) }
    }

    /// # Safety
    /// See [`Segment::read`].
    pub unsafe fn read_staging(&self, owner: usize, len: usize) -> Result<Vec<u8>> {
        check_fits(len, LEADER_SHM_SIZE, "staging")?;
        unsafe { self.segment(owner)?.read(0, len) }
    }

    /// # Safety
    /// See [`Segment::write`].
    pub unsafe fn write_contribution(&self, owner: usize, member: usize, data: &[u8]) -> Result<()> {
        check_fits(data.len(), PER_RANK_SHM_SIZE, "contribution")?;
        let off = self.contribution_offset(member);
        unsafe { self.segment(owner)?.write(off, data) }
    }

    /// # Safety
    /// See [`Segment::read`].
    pub unsafe fn read_contribution(&self, owner: usize, member: usize, len: usize) -> Result<Vec<u8>> {
        check_fits(len, PER_RANK_SHM_SIZE, "contribution")?;
        let off = self.contribution_offset(member);
        unsafe { self.segment(owner)?.read(off, len) }
    }
}

fn check_fits(len: usize, cap: usize, what: &str) -> Result<()> {
    if len > cap {
        return Err(StrataError::SharedMemory(format!(
            "{len} bytes exceed the {cap}-byte {what} area"
        )));
    }
    Ok(())
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        for key in self.keys.drain(..) {
            self.memory.detach_segment(key);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("node_size", &self.node_size())
            .field("slot", &self.slot)
            .finish()
    }
}
