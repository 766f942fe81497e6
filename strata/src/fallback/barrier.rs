use crate::comm::{Communicator, wait_all};
use crate::error::Result;
use crate::fallback::helpers::{ceil_log2, collective_recv, collective_send};
use crate::types::Tag;

/// Returns once every rank of `comm` has entered.
///
/// Each round posts an empty `isend` to the rank `2^round` ahead and
/// `recv`s the empty message from the rank `2^round` behind, both modulo
/// the size. After `ceil_log2(size)` rounds the arrivals of all ranks have
/// reached everyone.
pub(crate) async fn barrier<C: Communicator>(comm: &C, tag: Tag) -> Result<()> {
    let world = comm.size();
    if world <= 1 {
        return Ok(());
    }
    let rank = comm.rank();

    for round in 0..ceil_log2(world) {
        let distance = 1u32 << round;
        let send_to = (rank + distance) % world;
        let recv_from = (rank + world - distance) % world;

        let req = collective_send(comm, send_to, tag, Vec::new(), "barrier")?;
        collective_recv(comm, recv_from, tag, 0, "barrier").await?;
        wait_all([req]).await?;
    }

    Ok(())
}
