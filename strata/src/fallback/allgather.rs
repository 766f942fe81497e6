use crate::comm::{Communicator, wait_all};
use crate::error::Result;
use crate::fallback::helpers::{collective_recv, collective_send};
use crate::types::Tag;

/// Ring allgather of equal-sized byte blocks.
///
/// Returns every rank's `mine` concatenated in rank order. Uses N-1 ring
/// rounds where each rank forwards the latest received block to its
/// successor.
pub(crate) async fn allgather<C: Communicator>(comm: &C, mine: &[u8], tag: Tag) -> Result<Vec<u8>> {
    let world = comm.size() as usize;
    let rank = comm.rank() as usize;
    let block = mine.len();

    let mut buf = vec![0u8; block * world];
    buf[rank * block..(rank + 1) * block].copy_from_slice(mine);
    if world <= 1 {
        return Ok(buf);
    }

    let next = ((rank + 1) % world) as u32;
    let prev = ((rank + world - 1) % world) as u32;

    for step in 0..(world - 1) {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;

        let send_data = buf[send_idx * block..(send_idx + 1) * block].to_vec();
        let req = collective_send(comm, next, tag, send_data, "allgather")?;
        let received = collective_recv(comm, prev, tag, block, "allgather").await?;
        wait_all([req]).await?;

        buf[recv_idx * block..(recv_idx + 1) * block].copy_from_slice(&received);
    }

    Ok(buf)
}
