use crate::comm::{Communicator, wait_all};
use crate::error::Result;
use crate::fallback::helpers::{collective_recv, collective_send, floor_pow2};
use crate::reduce::{Operator, apply_left};
use crate::types::{DataType, Tag};

/// Recursive-doubling allreduce on a host buffer, in place.
///
/// Order-preserving, so it is correct for non-commutative operators: in
/// every combine step the partial covering lower ranks is the left operand.
/// For non-power-of-2 sizes the first `2 * rem` ranks pair up (even into
/// odd) before the doubling rounds and the result is handed back after.
pub(crate) async fn recursive_doubling_allreduce<C: Communicator>(
    comm: &C,
    buf: &mut Vec<u8>,
    count: usize,
    dtype: DataType,
    op: &dyn Operator,
    tag: Tag,
) -> Result<()> {
    let world = comm.size() as usize;
    let rank = comm.rank() as usize;
    if world <= 1 || count == 0 {
        return Ok(());
    }
    let bytes = buf.len();

    let pof2 = floor_pow2(world);
    let rem = world - pof2;

    // Step 1: fold the first 2*rem ranks pairwise so pof2 ranks remain.
    let new_rank = if rank < 2 * rem {
        if rank % 2 == 0 {
            let req = collective_send(comm, (rank + 1) as u32, tag, buf.clone(), "allreduce")?;
            wait_all([req]).await?;
            None
        } else {
            let lower =
                collective_recv(comm, (rank - 1) as u32, tag, bytes, "allreduce").await?;
            apply_left(op, &lower, buf, count, dtype)?;
            Some(rank / 2)
        }
    } else {
        Some(rank - rem)
    };

    // Step 2: doubling rounds among the remaining pof2 ranks.
    if let Some(new_rank) = new_rank {
        let mut mask = 1usize;
        while mask < pof2 {
            let new_dst = new_rank ^ mask;
            let dst = if new_dst < rem {
                new_dst * 2 + 1
            } else {
                new_dst + rem
            };

            let req = collective_send(comm, dst as u32, tag, buf.clone(), "allreduce")?;
            let received = collective_recv(comm, dst as u32, tag, bytes, "allreduce").await?;
            wait_all([req]).await?;

            if dst < rank {
                apply_left(op, &received, buf, count, dtype)?;
            } else {
                op.apply(buf, &received, count, dtype)?;
            }
            mask <<= 1;
        }
    }

    // Step 3: hand the result back to the folded-out even ranks.
    if rank < 2 * rem {
        if rank % 2 == 1 {
            let req = collective_send(comm, (rank - 1) as u32, tag, buf.clone(), "allreduce")?;
            wait_all([req]).await?;
        } else {
            *buf = collective_recv(comm, (rank + 1) as u32, tag, bytes, "allreduce").await?;
        }
    }

    Ok(())
}

/// Reduce-scatter then allgather over a host copy of the contribution.
/// Commutative operators only; the result is left in `buf` on every rank.
///
/// Ranks past the largest power of two hand their whole buffer to a low
/// partner and sit out. The rest pair up by flipping one rank bit per
/// round: each posts an `isend` of the half it gives away, `recv`s the half
/// it keeps, folds it in with the operator and waits on its send before
/// narrowing to that half. The gather replays the pairings in reverse,
/// swapping the owned ranges until every rank holds the whole result, and
/// the parked ranks get a full copy back.
pub(crate) async fn rsag_allreduce<C: Communicator>(
    comm: &C,
    buf: &mut [u8],
    count: usize,
    dtype: DataType,
    op: &dyn Operator,
    tag: Tag,
) -> Result<()> {
    let world = comm.size() as usize;
    let rank = comm.rank() as usize;
    if world <= 1 || count == 0 {
        return Ok(());
    }
    let elem_size = dtype.size_in_bytes();
    let total_bytes = buf.len();

    let p2 = floor_pow2(world);
    let excess = world - p2;

    // Parked ranks hand off their buffer.
    let mut participates = true;
    if rank < excess {
        let partner = (rank + p2) as u32;
        let received = collective_recv(comm, partner, tag, total_bytes, "allreduce").await?;
        op.apply(buf, &received, count, dtype)?;
    } else if rank >= p2 {
        let partner = (rank - p2) as u32;
        let req = collective_send(comm, partner, tag, buf.to_vec(), "allreduce")?;
        wait_all([req]).await?;
        participates = false;
    }

    if participates {
        let log2 = p2.trailing_zeros() as usize;

        // Reduce-scatter.
        let mut slice_start = 0usize;
        let mut slice_len = count;
        let mut history = Vec::with_capacity(log2);

        for round in 0..log2 {
            let partner = rank ^ (1 << round);
            let half = slice_len / 2;
            let half_rem = slice_len - half;

            // The lower rank of a pair owns the front half.
            let (send_start, send_len, keep_start, keep_len) = if rank < partner {
                (slice_start + half, half_rem, slice_start, half)
            } else {
                (slice_start, half, slice_start + half, half_rem)
            };

            let send_off = send_start * elem_size;
            let send_data = buf[send_off..send_off + send_len * elem_size].to_vec();
            let keep_off = keep_start * elem_size;
            let keep_bytes = keep_len * elem_size;

            let req = collective_send(comm, partner as u32, tag, send_data, "allreduce")?;
            let received =
                collective_recv(comm, partner as u32, tag, keep_bytes, "allreduce").await?;
            wait_all([req]).await?;

            op.apply(
                &mut buf[keep_off..keep_off + keep_bytes],
                &received,
                keep_len,
                dtype,
            )?;

            history.push((slice_start, slice_len));
            slice_start = keep_start;
            slice_len = keep_len;
        }

        // Allgather over the same pairs, last round first.
        for round in (0..log2).rev() {
            let partner = rank ^ (1 << round);
            let (outer_start, outer_len) = history[round];

            let send_off = slice_start * elem_size;
            let send_data = buf[send_off..send_off + slice_len * elem_size].to_vec();

            let (recv_start, recv_len) = if slice_start == outer_start {
                (outer_start + slice_len, outer_len - slice_len)
            } else {
                (outer_start, outer_len - slice_len)
            };
            let recv_off = recv_start * elem_size;
            let recv_bytes = recv_len * elem_size;

            let req = collective_send(comm, partner as u32, tag, send_data, "allreduce")?;
            let received =
                collective_recv(comm, partner as u32, tag, recv_bytes, "allreduce").await?;
            wait_all([req]).await?;

            buf[recv_off..recv_off + recv_bytes].copy_from_slice(&received);
            slice_start = outer_start;
            slice_len = outer_len;
        }
    }

    // Parked ranks get the result.
    if rank < excess {
        let partner = (rank + p2) as u32;
        let req = collective_send(comm, partner, tag, buf.to_vec(), "allreduce")?;
        wait_all([req]).await?;
    } else if rank >= p2 {
        let partner = (rank - p2) as u32;
        let received = collective_recv(comm, partner, tag, total_bytes, "allreduce").await?;
        buf.copy_from_slice(&received);
    }

    Ok(())
}
