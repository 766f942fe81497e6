//! Broadcast fan-out over one layer of the hierarchy.
//!
//! Each function receives from its parent (if any) and issues the sends to
//! its children, returning the pending requests. The caller waits for them
//! before the next layer starts.

use crate::comm::{Communicator, Request, tags, wait_all};
use crate::decision::FanOut;
use crate::device::DeviceBuf;
use crate::error::Result;
use crate::fallback::helpers::{ceil_log2, collective_recv, collective_send};
use crate::types::Rank;

/// Run one layer to completion.
pub(crate) async fn broadcast_layer<C: Communicator>(
    comm: &C,
    buf: &DeviceBuf<'_>,
    root: Rank,
    fan_out: FanOut,
) -> Result<()> {
    if comm.size() <= 1 {
        return Ok(());
    }
    let reqs = match fan_out {
        FanOut::Binomial => binomial(comm, buf, root).await?,
        FanOut::Linear => flat(comm, buf, root).await?,
    };
    wait_all(reqs).await
}

/// Balanced binomial tree: sub-rank `s` receives from `s` with its highest
/// set bit cleared and sends to `s | 1 << i` for every `i` above that bit.
async fn binomial<C: Communicator>(
    comm: &C,
    buf: &DeviceBuf<'_>,
    root: Rank,
) -> Result<Vec<Request>> {
    let size = comm.size();
    let sub_rank = (comm.rank() + size - root) % size;
    let dim = ceil_log2(size);

    let (data, first_child_bit) = if sub_rank == 0 {
        (buf.load()?, 0)
    } else {
        let msb = u32::BITS - 1 - sub_rank.leading_zeros();
        let parent = ((sub_rank & !(1 << msb)) + root) % size;
        let data = collective_recv(comm, parent, tags::BCAST, buf.len(), "broadcast").await?;
        buf.store(&data)?;
        (data, msb + 1)
    };

    let mut reqs = Vec::new();
    for bit in first_child_bit..dim {
        let child = sub_rank | (1 << bit);
        if child < size {
            let peer = (child + root) % size;
            reqs.push(collective_send(comm, peer, tags::BCAST, data.clone(), "broadcast")?);
        }
    }
    Ok(reqs)
}

async fn flat<C: Communicator>(comm: &C, buf: &DeviceBuf<'_>, root: Rank) -> Result<Vec<Request>> {
    let size = comm.size();
    if comm.rank() != root {
        let data = collective_recv(comm, root, tags::BCAST, buf.len(), "broadcast").await?;
        buf.store(&data)?;
        return Ok(Vec::new());
    }
    let data = buf.load()?;
    (0..size)
        .filter(|&peer| peer != root)
        .map(|peer| collective_send(comm, peer, tags::BCAST, data.clone(), "broadcast"))
        .collect()
}
