//! Buffer exposure for the single-copy allreduce paths.

use crate::comm::{Communicator, tags};
use crate::error::{Result, StrataError};
use crate::fallback::allgather;
use crate::shm::{MappedRegion, MemoryDomain, RegionToken};
use tracing::warn;

/// A rank's send and receive buffers as seen by one peer.
pub(crate) struct PeerBuffers {
    pub send: MappedRegion,
    pub recv: MappedRegion,
}

/// Every rank's buffers mapped into this process, indexed by rank.
///
/// Must be released with [`Exposure::release`] once the last barrier that
/// covers reads from the mappings has passed.
pub(crate) struct Exposure {
    local: [RegionToken; 2],
    pub peers: Vec<PeerBuffers>,
}

impl Exposure {
    /// Collective: register this rank's `send`/`recv` buffers of `len` bytes,
    /// exchange tokens and map every rank's pair.
    pub(crate) async fn exchange<C: Communicator>(
        comm: &C,
        memory: &dyn MemoryDomain,
        send: u64,
        recv: u64,
        len: usize,
    ) -> Result<Self> {
        let send_token = memory.register(send, len)?;
        let recv_token = match memory.register(recv, len) {
            Ok(t) => t,
            Err(e) => {
                let _ = memory.deregister(send_token);
                return Err(e);
            }
        };
        let mut exposure = Self {
            local: [send_token, recv_token],
            peers: Vec::with_capacity(comm.size() as usize),
        };

        let mut mine = [0u8; 2 * RegionToken::WIRE_SIZE];
        mine[..RegionToken::WIRE_SIZE].copy_from_slice(&send_token.to_bytes());
        mine[RegionToken::WIRE_SIZE..].copy_from_slice(&recv_token.to_bytes());

        let mapped = async {
            let all = allgather(comm, &mine, tags::ALLGATHER).await?;
            for pair in all.chunks_exact(2 * RegionToken::WIRE_SIZE) {
                let (s, r) = pair.split_at(RegionToken::WIRE_SIZE);
                let send = memory.map(RegionToken::from_bytes(s)?)?;
                let recv = match memory.map(RegionToken::from_bytes(r)?) {
                    Ok(m) => m,
                    Err(e) => {
                        let _ = memory.unmap(send);
                        return Err(e);
                    }
                };
                exposure.peers.push(PeerBuffers { send, recv });
            }
            Ok::<(), StrataError>(())
        }
        .await;

        match mapped {
            Ok(()) => Ok(exposure),
            Err(e) => {
                exposure.release(memory);
                Err(e)
            }
        }
    }

    pub(crate) fn peer(&self, rank: usize) -> Result<&PeerBuffers> {
        self.peers
            .get(rank)
            .ok_or_else(|| StrataError::Mapping(format!("no mapping for rank {rank}")))
    }

    /// Unmap every peer and withdraw this rank's registrations.
    pub(crate) fn release(self, memory: &dyn MemoryDomain) {
        for peer in self.peers {
            for region in [peer.send, peer.recv] {
                if let Err(e) = memory.unmap(region) {
                    warn!(error = %e, "unmap failed");
                }
            }
        }
        for token in self.local {
            if let Err(e) = memory.deregister(token) {
                warn!(error = %e, "deregister failed");
            }
        }
    }
}
