//! Pure group arithmetic: who belongs to which tier group and who leads it.
//!
//! Every rank runs the same computation on the same gathered placement
//! table, so every rank derives the same groups and leaders without further
//! messaging.

use crate::comm::{Communicator, Locality, tags};
use crate::error::{Result, StrataError};
use crate::fallback;
use crate::hash::fnv1a;
use crate::types::Rank;
use indexmap::IndexSet;

/// Wire size of one placement record: [node digest u64][socket u32][numa u32].
pub(crate) const PLACEMENT_RECORD_SIZE: usize = 16;

/// A rank's placement as exchanged on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RawPlacement {
    pub node: u64,
    pub socket: u32,
    pub numa: u32,
}

impl RawPlacement {
    pub(crate) fn of(locality: &Locality) -> Self {
        Self {
            node: fnv1a([locality.node.as_bytes()]),
            socket: locality.socket,
            numa: locality.numa,
        }
    }

    fn encode(&self) -> [u8; PLACEMENT_RECORD_SIZE] {
        let mut out = [0u8; PLACEMENT_RECORD_SIZE];
        out[..8].copy_from_slice(&self.node.to_le_bytes());
        out[8..12].copy_from_slice(&self.socket.to_le_bytes());
        out[12..].copy_from_slice(&self.numa.to_le_bytes());
        out
    }

    fn decode(b: &[u8]) -> Result<Self> {
        if b.len() != PLACEMENT_RECORD_SIZE {
            return Err(StrataError::DecodeFailed(format!(
                "placement record needs {PLACEMENT_RECORD_SIZE} bytes, got {}",
                b.len()
            )));
        }
        let mut node = [0u8; 8];
        node.copy_from_slice(&b[..8]);
        Ok(Self {
            node: u64::from_le_bytes(node),
            socket: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            numa: u32::from_le_bytes([b[12], b[13], b[14], b[15]]),
        })
    }
}

/// Collective: gather every rank's placement, indexed by rank.
pub(crate) async fn exchange_placements<C: Communicator>(comm: &C) -> Result<Vec<RawPlacement>> {
    let mine = RawPlacement::of(comm.locality()).encode();
    let all = fallback::allgather(comm, &mine, tags::ALLGATHER).await?;
    all.chunks_exact(PLACEMENT_RECORD_SIZE)
        .map(RawPlacement::decode)
        .collect()
}

/// Tiers of the hierarchy, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Node,
    Socket,
    Numa,
    Subgroup,
}

/// Group membership and leaders of every rank in every tier.
///
/// Group ids are dense and numbered in order of first appearance by rank.
/// A group's leader is the root when the group contains it, otherwise its
/// lowest rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    root: Rank,
    sg_size: usize,
    /// Digest of each node id's name, for shared-segment keys.
    node_keys: Vec<u64>,
    node_of: Vec<usize>,
    socket_of: Vec<usize>,
    numa_of: Vec<usize>,
    subgroup_of: Vec<usize>,
    node_leaders: Vec<Rank>,
    socket_leaders: Vec<Rank>,
    numa_leaders: Vec<Rank>,
    subgroup_leaders: Vec<Rank>,
}

impl GroupLayout {
    /// Derive the layout of a group of `placements.len()` ranks for `root`,
    /// with subgroups of `sg_size` consecutive ranks inside each socket.
    pub(crate) fn compute(placements: &[RawPlacement], root: Rank, sg_size: usize) -> Self {
        let sg_size = sg_size.max(1);

        let mut nodes: IndexSet<u64> = IndexSet::new();
        let mut sockets: IndexSet<(usize, u32)> = IndexSet::new();
        let mut numas: IndexSet<(usize, u32, u32)> = IndexSet::new();
        let mut node_of = Vec::with_capacity(placements.len());
        let mut socket_of = Vec::with_capacity(placements.len());
        let mut numa_of = Vec::with_capacity(placements.len());

        for p in placements {
            let (node, _) = nodes.insert_full(p.node);
            let (socket, _) = sockets.insert_full((node, p.socket));
            let (numa, _) = numas.insert_full((node, p.socket, p.numa));
            node_of.push(node);
            socket_of.push(socket);
            numa_of.push(numa);
        }

        // Ranks are visited in ascending order, so the running position
        // inside each socket is the rank's index among its socket peers.
        let mut seen_in_socket = vec![0usize; sockets.len()];
        let mut subgroups: IndexSet<(usize, usize)> = IndexSet::new();
        let mut subgroup_of = Vec::with_capacity(placements.len());
        for &socket in &socket_of {
            let block = seen_in_socket[socket] / sg_size;
            seen_in_socket[socket] += 1;
            let (sg, _) = subgroups.insert_full((socket, block));
            subgroup_of.push(sg);
        }

        Self {
            root,
            sg_size,
            node_keys: nodes.into_iter().collect(),
            node_leaders: leaders(&node_of, root),
            socket_leaders: leaders(&socket_of, root),
            numa_leaders: leaders(&numa_of, root),
            subgroup_leaders: leaders(&subgroup_of, root),
            node_of,
            socket_of,
            numa_of,
            subgroup_of,
        }
    }

    pub fn root(&self) -> Rank {
        self.root
    }

    pub fn sg_size(&self) -> usize {
        self.sg_size
    }

    pub fn size(&self) -> usize {
        self.node_of.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_keys.len()
    }

    pub fn num_groups(&self, tier: Tier) -> usize {
        self.tier_leaders(tier).len()
    }

    /// Ranks on the most populated node. Equal on every rank, unlike the
    /// size of a rank's own node.
    pub fn max_node_size(&self) -> usize {
        let mut counts = vec![0usize; self.num_nodes()];
        for &n in &self.node_of {
            counts[n] += 1;
        }
        counts.into_iter().max().unwrap_or(0)
    }

    pub(crate) fn node_key(&self, node: usize) -> u64 {
        self.node_keys[node]
    }

    fn tier_of(&self, tier: Tier) -> &[usize] {
        match tier {
            Tier::Node => &self.node_of,
            Tier::Socket => &self.socket_of,
            Tier::Numa => &self.numa_of,
            Tier::Subgroup => &self.subgroup_of,
        }
    }

    fn tier_leaders(&self, tier: Tier) -> &[Rank] {
        match tier {
            Tier::Node => &self.node_leaders,
            Tier::Socket => &self.socket_leaders,
            Tier::Numa => &self.numa_leaders,
            Tier::Subgroup => &self.subgroup_leaders,
        }
    }

    /// Group id of `rank` in `tier`.
    pub fn group_of(&self, tier: Tier, rank: Rank) -> usize {
        self.tier_of(tier)[rank as usize]
    }

    /// Leader of every group of `tier`, indexed by group id.
    pub fn leaders(&self, tier: Tier) -> &[Rank] {
        self.tier_leaders(tier)
    }

    pub fn leader_of(&self, tier: Tier, rank: Rank) -> Rank {
        self.tier_leaders(tier)[self.group_of(tier, rank)]
    }

    pub fn is_leader(&self, tier: Tier, rank: Rank) -> bool {
        self.leader_of(tier, rank) == rank
    }

    /// Members of group `group` of `tier`, ascending.
    pub fn members(&self, tier: Tier, group: usize) -> Vec<Rank> {
        self.tier_of(tier)
            .iter()
            .enumerate()
            .filter(|&(_, &g)| g == group)
            .map(|(r, _)| r as Rank)
            .collect()
    }

    /// Shared-memory grouping of `rank`'s node.
    pub(crate) fn shm_groups(&self, rank: Rank) -> ShmGroups {
        let node = self.group_of(Tier::Node, rank);
        let node_members = self.members(Tier::Node, node);
        let slot_of = |r: Rank| node_members.iter().position(|&m| m == r).unwrap_or(0);

        let numa = self.group_of(Tier::Numa, rank);
        let l1 = leader_first(
            self.numa_leaders[numa],
            self.members(Tier::Numa, numa).into_iter(),
        )
        .into_iter()
        .map(slot_of)
        .collect();

        let numa_leaders_here = node_members
            .iter()
            .copied()
            .filter(|&r| self.is_leader(Tier::Numa, r));
        let l2 = leader_first(self.node_leaders[node], numa_leaders_here)
            .into_iter()
            .map(slot_of)
            .collect();

        ShmGroups {
            slot: slot_of(rank),
            node,
            l1,
            l2,
            node_members,
        }
    }
}

/// Split key placing `root` first, then everyone else in rank order.
pub(crate) fn split_key(rank: Rank, root: Rank) -> u32 {
    if rank == root { 0 } else { rank + 1 }
}

fn leaders(group_of: &[usize], root: Rank) -> Vec<Rank> {
    let groups = group_of.iter().copied().max().map_or(0, |m| m + 1);
    let mut leaders: Vec<Option<Rank>> = vec![None; groups];
    for (r, &g) in group_of.iter().enumerate() {
        if leaders[g].is_none() {
            leaders[g] = Some(r as Rank);
        }
    }
    if let Some(&g) = group_of.get(root as usize) {
        leaders[g] = Some(root);
    }
    leaders.into_iter().map(|l| l.unwrap_or(0)).collect()
}

fn leader_first(leader: Rank, members: impl Iterator<Item = Rank>) -> Vec<Rank> {
    std::iter::once(leader)
        .chain(members.filter(|&m| m != leader))
        .collect()
}

/// Node-local view used by the shared-memory paths. Slots index the node's
/// members in ascending rank order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShmGroups {
    /// This rank's slot.
    pub slot: usize,
    /// Node id.
    pub node: usize,
    /// This rank's NUMA group, leader first, then ascending.
    pub l1: Vec<usize>,
    /// NUMA leaders of the node, node leader first, then ascending.
    pub l2: Vec<usize>,
    /// Ranks of the node, ascending; index is the slot.
    pub node_members: Vec<Rank>,
}

impl ShmGroups {
    pub(crate) fn node_size(&self) -> usize {
        self.node_members.len()
    }

    pub(crate) fn is_l1_leader(&self) -> bool {
        self.l1.first() == Some(&self.slot)
    }

    /// `group` in ascending slot order.
    pub(crate) fn ascending(group: &[usize]) -> Vec<usize> {
        let mut sorted = group.to_vec();
        sorted.sort_unstable();
        sorted
    }
}
