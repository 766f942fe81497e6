use crate::comm::{Communicator, wait_all};
use crate::device::DeviceBuf;
use crate::error::Result;
use crate::fallback::helpers::{collective_recv, collective_send};
use crate::types::{Rank, Tag};

/// Flat broadcast: the root sends the whole buffer to every other rank.
pub(crate) async fn linear_broadcast<C: Communicator>(
    comm: &C,
    buf: &DeviceBuf<'_>,
    root: Rank,
    tag: Tag,
) -> Result<()> {
    let size = comm.size();
    if size <= 1 {
        return Ok(());
    }
    let rank = comm.rank();

    if rank == root {
        let data = buf.load()?;
        let mut reqs = Vec::with_capacity(size as usize - 1);
        for peer in (0..size).filter(|&r| r != root) {
            reqs.push(collective_send(comm, peer, tag, data.clone(), "broadcast")?);
        }
        wait_all(reqs).await
    } else {
        let data = collective_recv(comm, root, tag, buf.len(), "broadcast").await?;
        buf.store(&data)
    }
}

/// K-nomial tree broadcast.
///
/// Ranks are renumbered so the root is virtual rank 0. A rank receives from
/// the virtual rank obtained by clearing its lowest non-zero radix-`k`
/// digit, then forwards to every virtual rank that differs from it only in
/// a lower digit.
pub(crate) async fn knomial_broadcast<C: Communicator>(
    comm: &C,
    buf: &DeviceBuf<'_>,
    root: Rank,
    radix: u32,
    tag: Tag,
) -> Result<()> {
    let size = comm.size();
    if size <= 1 {
        return Ok(());
    }
    let radix = radix.max(2);
    let rank = comm.rank();
    let vrank = (rank + size - root) % size;
    let physical = |v: u32| (v + root) % size;

    let mut mask = 1u32;
    let mut data = None;
    while mask < size {
        let span = mask.saturating_mul(radix);
        if vrank % span != 0 {
            let parent = vrank / span * span;
            let received =
                collective_recv(comm, physical(parent), tag, buf.len(), "broadcast").await?;
            buf.store(&received)?;
            data = Some(received);
            break;
        }
        mask = span;
    }
    let data = match data {
        Some(d) => d,
        None => buf.load()?,
    };

    let mut reqs = Vec::new();
    mask /= radix;
    while mask > 0 {
        for j in 1..radix {
            let child = vrank as u64 + (mask as u64) * (j as u64);
            if child < size as u64 {
                reqs.push(collective_send(
                    comm,
                    physical(child as u32),
                    tag,
                    data.clone(),
                    "broadcast",
                )?);
            }
        }
        mask /= radix;
    }
    wait_all(reqs).await
}
