//! The communicator seam: what the engine needs from the transport.

mod request;

pub use request::{Request, wait_all};

use crate::error::Result;
use crate::types::{CommId, Rank, Tag};
use std::future::Future;

/// Tags reserved for the engine's own traffic.
pub mod tags {
    use crate::types::Tag;

    pub const BCAST: Tag = 0x5100;
    pub const ALLREDUCE: Tag = 0x5101;
    pub const ALLGATHER: Tag = 0x5102;
    pub const BARRIER: Tag = 0x5103;
    pub const SPLIT: Tag = 0x5104;
}

/// Static placement of a rank: which node, socket and NUMA domain it runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locality {
    /// Node name. Ranks with equal names share memory.
    pub node: String,
    /// Socket index within the node.
    pub socket: u32,
    /// NUMA domain index within the socket.
    pub numa: u32,
}

impl Locality {
    pub fn new(node: impl Into<String>, socket: u32, numa: u32) -> Self {
        Self {
            node: node.into(),
            socket,
            numa,
        }
    }
}

/// A process group with reliable, ordered point-to-point messaging.
///
/// Messages on the same (communicator, peer, tag) arrive in send order.
/// All methods named as collective must be called by every member in the
/// same order.
pub trait Communicator: Send + Sync + Sized + 'static {
    /// This process's rank within the group.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> u32;

    /// Identity of the group, equal on every member.
    fn id(&self) -> CommId;

    /// Placement of this process.
    fn locality(&self) -> &Locality;

    /// Start sending `data` to `dest`. The returned request completes once
    /// the payload has been handed to the transport.
    fn isend(&self, dest: Rank, tag: Tag, data: Vec<u8>) -> Result<Request>;

    /// Receive the next message from `src` on `tag`.
    fn recv(&self, src: Rank, tag: Tag) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Collective: partition the group by `color`. Within each color, ranks
    /// are ordered by `key` (ties broken by current rank). Ranks passing
    /// `None` take part in the exchange but get no communicator back.
    fn split(
        &self,
        color: Option<u32>,
        key: u32,
    ) -> impl Future<Output = Result<Option<Self>>> + Send;
}
