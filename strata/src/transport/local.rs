//! In-process transport: every rank is a tokio task sharing one fabric.
//!
//! Nodes, sockets and NUMA domains are declared labels rather than
//! discovered hardware, so multi-node layouts can be exercised inside a
//! single test process.

use crate::comm::{Communicator, Locality, Request, tags};
use crate::error::{Result, StrataError};
use crate::fallback;
use crate::hash::fnv1a;
use crate::types::{CommId, Rank, Tag};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Color value reserved on the wire for "no color".
const NO_COLOR: u32 = u32::MAX;

/// Comm id of the communicator returned by [`LocalCluster::bootstrap`].
const WORLD_COMM_ID: CommId = 0;

/// Placement table for an in-process cluster.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    localities: Vec<Locality>,
}

impl LocalCluster {
    /// One rank per entry, in rank order.
    pub fn new(localities: Vec<Locality>) -> Self {
        Self { localities }
    }

    /// `nodes` identical nodes of `sockets` sockets, each with `numas` NUMA
    /// domains of `ranks_per_numa` ranks. Ranks are numbered node-major.
    pub fn uniform(nodes: u32, sockets: u32, numas: u32, ranks_per_numa: u32) -> Self {
        let mut localities = Vec::new();
        for node in 0..nodes {
            for socket in 0..sockets {
                for numa in 0..numas {
                    for _ in 0..ranks_per_numa {
                        localities.push(Locality::new(format!("node{node}"), socket, numa));
                    }
                }
            }
        }
        Self { localities }
    }

    /// `size` ranks on one node with a single socket and NUMA domain.
    pub fn single_node(size: u32) -> Self {
        Self::uniform(1, 1, 1, size)
    }

    pub fn size(&self) -> u32 {
        self.localities.len() as u32
    }

    pub fn localities(&self) -> &[Locality] {
        &self.localities
    }

    /// Create one connected communicator per rank.
    pub fn bootstrap(&self) -> Vec<LocalComm> {
        let size = self.localities.len();
        let fabric = Arc::new(Fabric {
            mailboxes: (0..size).map(|_| Mailbox::default()).collect(),
            closed: AtomicBool::new(false),
        });
        let members: Arc<[Rank]> = (0..size as Rank).collect();
        self.localities
            .iter()
            .enumerate()
            .map(|(rank, locality)| LocalComm {
                fabric: Arc::clone(&fabric),
                id: WORLD_COMM_ID,
                rank: rank as Rank,
                members: Arc::clone(&members),
                locality: locality.clone(),
                split_generation: AtomicU64::new(0),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MailKey {
    comm: CommId,
    src: Rank,
    tag: Tag,
}

#[derive(Default)]
struct Mailbox {
    queues: Mutex<HashMap<MailKey, VecDeque<Vec<u8>>>>,
    arrived: Notify,
}

struct Fabric {
    /// Indexed by world rank.
    mailboxes: Vec<Mailbox>,
    closed: AtomicBool,
}

/// A member of an in-process communicator.
pub struct LocalComm {
    fabric: Arc<Fabric>,
    id: CommId,
    rank: Rank,
    /// Communicator rank -> world rank.
    members: Arc<[Rank]>,
    locality: Locality,
    split_generation: AtomicU64,
}

impl LocalComm {
    /// Tear the fabric down. Every pending and future receive on any
    /// communicator of this cluster fails with `PeerDisconnected`.
    pub fn disconnect(&self) {
        self.fabric.closed.store(true, Ordering::Release);
        for mailbox in &self.fabric.mailboxes {
            mailbox.arrived.notify_waiters();
        }
    }

    fn world_rank(&self, rank: Rank) -> Result<Rank> {
        self.members
            .get(rank as usize)
            .copied()
            .ok_or(StrataError::InvalidRank {
                rank,
                size: self.size(),
            })
    }

    fn mailbox(&self) -> Result<&Mailbox> {
        let me = self.world_rank(self.rank)?;
        Ok(&self.fabric.mailboxes[me as usize])
    }

    fn take(&self, key: &MailKey) -> Result<Option<Vec<u8>>> {
        let mut queues = self
            .mailbox()?
            .queues
            .lock()
            .map_err(|_| StrataError::LockPoisoned("mailbox"))?;
        let Some(queue) = queues.get_mut(key) else {
            return Ok(None);
        };
        let data = queue.pop_front();
        if queue.is_empty() {
            queues.remove(key);
        }
        Ok(data)
    }

    /// Keys with undelivered messages in this rank's mailbox.
    #[cfg(test)]
    fn pending_keys(&self) -> usize {
        self.mailbox()
            .ok()
            .and_then(|m| m.queues.lock().ok().map(|q| q.len()))
            .unwrap_or(0)
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.members.len() as u32
    }

    fn id(&self) -> CommId {
        self.id
    }

    fn locality(&self) -> &Locality {
        &self.locality
    }

    fn isend(&self, dest: Rank, tag: Tag, data: Vec<u8>) -> Result<Request> {
        let dest_world = self.world_rank(dest)?;
        if self.fabric.closed.load(Ordering::Acquire) {
            return Err(StrataError::PeerDisconnected { rank: dest });
        }
        let key = MailKey {
            comm: self.id,
            src: self.world_rank(self.rank)?,
            tag,
        };
        let mailbox = &self.fabric.mailboxes[dest_world as usize];
        mailbox
            .queues
            .lock()
            .map_err(|_| StrataError::LockPoisoned("mailbox"))?
            .entry(key)
            .or_default()
            .push_back(data);
        mailbox.arrived.notify_waiters();
        Ok(Request::completed())
    }

    async fn recv(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        let key = MailKey {
            comm: self.id,
            src: self.world_rank(src)?,
            tag,
        };
        let mailbox = self.mailbox()?;
        loop {
            // Register interest before checking, so a push between the check
            // and the await still wakes us.
            let notified = mailbox.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(data) = self.take(&key)? {
                return Ok(data);
            }
            if self.fabric.closed.load(Ordering::Acquire) {
                return Err(StrataError::PeerDisconnected { rank: src });
            }
            notified.await;
        }
    }

    async fn split(&self, color: Option<u32>, key: u32) -> Result<Option<Self>> {
        if color == Some(NO_COLOR) {
            return Err(StrataError::Split(format!("color {NO_COLOR} is reserved")));
        }

        // Exchange (color, key) tuples with all peers.
        // Wire record: color then key, both u32 LE.
        let mut my_info = [0u8; 8];
        my_info[..4].copy_from_slice(&color.unwrap_or(NO_COLOR).to_le_bytes());
        my_info[4..].copy_from_slice(&key.to_le_bytes());
        let all_info = fallback::allgather(self, &my_info, tags::SPLIT).await?;

        // Every member advances the generation, colored or not, so ids stay
        // in lockstep.
        let split_gen = self.split_generation.fetch_add(1, Ordering::Relaxed);

        let Some(my_color) = color else {
            return Ok(None);
        };

        let mut group: Vec<(Rank, u32)> = Vec::new();
        for (r, entry) in all_info.chunks_exact(8).enumerate() {
            let c = u32::from_le_bytes([entry[0], entry[1], entry[2], entry[3]]);
            let k = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
            if c == my_color {
                group.push((r as Rank, k));
            }
        }
        group.sort_by_key(|&(orig_rank, k)| (k, orig_rank));

        let new_rank = group
            .iter()
            .position(|&(r, _)| r == self.rank)
            .ok_or_else(|| StrataError::Split("rank missing from its own color group".into()))?
            as Rank;

        let members = group
            .iter()
            .map(|&(r, _)| self.world_rank(r))
            .collect::<Result<Vec<Rank>>>()?;

        let id = fnv1a([
            &self.id.to_le_bytes()[..],
            &split_gen.to_le_bytes(),
            &my_color.to_le_bytes(),
        ]);

        Ok(Some(LocalComm {
            fabric: Arc::clone(&self.fabric),
            id,
            rank: new_rank,
            members: members.into(),
            locality: self.locality.clone(),
            split_generation: AtomicU64::new(0),
        }))
    }
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("id", &self.id)
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .field("locality", &self.locality)
            .finish()
    }
}
