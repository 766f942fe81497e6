//! Subgroup hierarchy: nested node, socket, NUMA and subgroup
//! communicators derived from the static placement of every rank.
//!
//! The layout is computed locally from one placement allgather; every
//! sub-communicator is then carved out with `split`, keyed so that each
//! group's leader lands at position 0.

mod cache;
mod layout;

pub(crate) use cache::{CacheEntry, HierarchyCache};
pub use cache::CacheStats;
pub use layout::{GroupLayout, Tier};
pub(crate) use layout::ShmGroups;

use crate::comm::Communicator;
use crate::error::{Result, StrataError};
use crate::types::Rank;
use layout::{exchange_placements, split_key};
use tracing::debug;

/// Communicators smaller than this never get a hierarchy.
pub const MIN_HIERARCHY_SIZE: u32 = 3;

/// Which leaders make up a base communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseTier {
    /// Subgroup leaders.
    L3,
    /// NUMA leaders.
    Numa,
}

/// The group a base communicator spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseParent {
    Node,
    Socket,
}

/// Sub-communicators of one communicator for one root.
pub struct SubgroupHierarchy<C> {
    layout: GroupLayout,
    node: C,
    socket: C,
    numa: C,
    subgroup: C,
    node_leaders: Option<C>,
    socket_leaders: Option<C>,
    /// Indexed `[BaseTier][BaseParent]`.
    base: [[Option<C>; 2]; 2],
    shm: ShmGroups,
}

impl<C: Communicator> SubgroupHierarchy<C> {
    /// Collective over `comm`: exchange placements and split out every tier.
    pub(crate) async fn build(comm: &C, root: Rank, sg_size: usize) -> Result<Self> {
        let placements = exchange_placements(comm).await?;
        let me = comm.rank();
        let layout = GroupLayout::compute(&placements, root, sg_size);
        let key = split_key(me, root);

        let group = |tier: Tier| Some(layout.group_of(tier, me) as u32);
        let leads = |tier: Tier| layout.is_leader(tier, me);

        let node = required(comm.split(group(Tier::Node), key).await?, "node")?;
        let socket = required(comm.split(group(Tier::Socket), key).await?, "socket")?;
        let numa = required(comm.split(group(Tier::Numa), key).await?, "numa")?;
        let subgroup = required(comm.split(group(Tier::Subgroup), key).await?, "subgroup")?;

        let node_leaders = comm.split(leads(Tier::Node).then_some(0), key).await?;
        let socket_leaders = comm.split(leads(Tier::Socket).then_some(0), key).await?;

        let l3_node = comm
            .split(leads(Tier::Subgroup).then(|| group(Tier::Node)).flatten(), key)
            .await?;
        let l3_socket = comm
            .split(leads(Tier::Subgroup).then(|| group(Tier::Socket)).flatten(), key)
            .await?;
        let numa_node = comm
            .split(leads(Tier::Numa).then(|| group(Tier::Node)).flatten(), key)
            .await?;
        let numa_socket = comm
            .split(leads(Tier::Numa).then(|| group(Tier::Socket)).flatten(), key)
            .await?;

        let shm = layout.shm_groups(me);
        debug!(
            comm = comm.id(),
            root,
            nodes = layout.num_nodes(),
            sockets = layout.num_groups(Tier::Socket),
            numas = layout.num_groups(Tier::Numa),
            subgroups = layout.num_groups(Tier::Subgroup),
            "built subgroup hierarchy"
        );

        Ok(Self {
            layout,
            node,
            socket,
            numa,
            subgroup,
            node_leaders,
            socket_leaders,
            base: [[l3_node, l3_socket], [numa_node, numa_socket]],
            shm,
        })
    }
}

impl<C> SubgroupHierarchy<C> {
    /// Root the hierarchy was built for.
    pub fn root(&self) -> Rank {
        self.layout.root()
    }

    pub fn layout(&self) -> &GroupLayout {
        &self.layout
    }

    pub fn num_nodes(&self) -> usize {
        self.layout.num_nodes()
    }

    /// Ranks on the most populated node.
    pub fn node_size(&self) -> usize {
        self.layout.max_node_size()
    }

    pub fn node(&self) -> &C {
        &self.node
    }

    pub fn socket(&self) -> &C {
        &self.socket
    }

    pub fn numa(&self) -> &C {
        &self.numa
    }

    pub fn subgroup(&self) -> &C {
        &self.subgroup
    }

    /// One rank per node; `None` on non-leaders.
    pub fn node_leaders(&self) -> Option<&C> {
        self.node_leaders.as_ref()
    }

    /// One rank per socket across all nodes; `None` on non-leaders.
    pub fn socket_leaders(&self) -> Option<&C> {
        self.socket_leaders.as_ref()
    }

    /// Leaders of `tier` within each `parent`; `None` on ranks that do not
    /// lead their `tier` group.
    pub fn base(&self, tier: BaseTier, parent: BaseParent) -> Option<&C> {
        let t = match tier {
            BaseTier::L3 => 0,
            BaseTier::Numa => 1,
        };
        let p = match parent {
            BaseParent::Node => 0,
            BaseParent::Socket => 1,
        };
        self.base[t][p].as_ref()
    }

    pub(crate) fn shm(&self) -> &ShmGroups {
        &self.shm
    }

    /// Digest of this rank's node name.
    pub(crate) fn node_key(&self) -> u64 {
        self.layout.node_key(self.shm.node)
    }
}

fn required<C>(comm: Option<C>, tier: &str) -> Result<C> {
    comm.ok_or_else(|| StrataError::Split(format!("{tier} split returned no communicator")))
}

impl<C> std::fmt::Debug for SubgroupHierarchy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubgroupHierarchy")
            .field("root", &self.root())
            .field("nodes", &self.num_nodes())
            .field("node_size", &self.node_size())
            .finish()
    }
}
