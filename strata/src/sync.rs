//! Lock-free rendezvous over shared flag slots.
//!
//! Waiting is a pure spin on acquire loads. Ranks may share executor
//! threads, so the spin yields to the runtime every few hundred iterations;
//! it never parks on an OS primitive.

use crate::error::Result;
use crate::shm::{FlagArea, SharedRegion};
use std::sync::atomic::{AtomicU32, Ordering};

/// Spins between cooperative yields.
const SPINS_PER_YIELD: u32 = 256;

/// Wait until `flag` holds `target`.
pub(crate) async fn spin_until(flag: &AtomicU32, target: u32) {
    let mut spins = 0u32;
    while flag.load(Ordering::Acquire) != target {
        spins += 1;
        if spins % SPINS_PER_YIELD == 0 {
            tokio::task::yield_now().await;
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Publish `generation` in `flag`.
pub(crate) fn publish(flag: &AtomicU32, generation: u32) {
    flag.store(generation, Ordering::Release);
}

/// Two-sided rendezvous of `group` (node-local slots, leader first) in the
/// leader's row of `area`.
///
/// The leader waits until every member's slot holds `generation`, then
/// publishes its own; each member publishes its slot, then waits for the
/// leader's. When this returns, every write a party made before entering is
/// visible to every other party.
///
/// `generation` must come from [`SharedRegion::advance`] on the same area.
pub(crate) async fn rendezvous(
    region: &SharedRegion,
    group: &[usize],
    area: FlagArea,
    generation: u32,
) -> Result<()> {
    let Some(&leader) = group.first() else {
        return Ok(());
    };
    if group.len() == 1 {
        return Ok(());
    }
    let me = region.slot();

    if me == leader {
        for &member in &group[1..] {
            spin_until(region.flag(leader, member, area)?, generation).await;
        }
        publish(region.flag(leader, leader, area)?, generation);
    } else {
        publish(region.flag(leader, me, area)?, generation);
        spin_until(region.flag(leader, leader, area)?, generation).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{LocalMemoryDomain, MemoryDomain};
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_spin_until_sees_store_from_other_task() {
        let flag = Arc::new(AtomicU32::new(0));
        let setter = Arc::clone(&flag);
        let h = tokio::spawn(async move { publish(&setter, 3) });
        spin_until(&flag, 3).await;
        h.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rendezvous_is_a_barrier() {
        const N: usize = 6;
        const ROUNDS: usize = 20;
        let domain = Arc::new(LocalMemoryDomain::new());
        let entered = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for slot in 0..N {
            let memory: Arc<dyn MemoryDomain> = domain.clone();
            let entered = Arc::clone(&entered);
            handles.push(tokio::spawn(async move {
                let region = SharedRegion::attach(memory, 1, 1, N, slot).unwrap();
                // Leader rotates each round; everyone still advances the area.
                for round in 0..ROUNDS {
                    let generation = region.advance(FlagArea::Up);
                    let leader = round % N;
                    let mut group = vec![leader];
                    group.extend((0..N).filter(|&s| s != leader));

                    entered.fetch_add(1, Ordering::SeqCst);
                    rendezvous(&region, &group, FlagArea::Up, generation)
                        .await
                        .unwrap();
                    assert!(entered.load(Ordering::SeqCst) >= (round + 1) * N);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), N * ROUNDS);
    }

    #[tokio::test]
    async fn test_subgroup_rendezvous_ignores_outsiders() {
        let domain = Arc::new(LocalMemoryDomain::new());
        let mut handles = Vec::new();
        for slot in 0..4 {
            let memory: Arc<dyn MemoryDomain> = domain.clone();
            handles.push(tokio::spawn(async move {
                let region = SharedRegion::attach(memory, 2, 2, 4, slot).unwrap();
                let generation = region.advance(FlagArea::Down);
                // Only slots 1 and 3 meet; 0 and 2 skip the round.
                if slot % 2 == 1 {
                    rendezvous(&region, &[3, 1], FlagArea::Down, generation)
                        .await
                        .unwrap();
                }
                region
            }));
        }
        let mut regions = Vec::new();
        for h in handles {
            regions.push(h.await.unwrap());
        }
        let leader_flag = regions[0].flag(3, 3, FlagArea::Down).unwrap();
        assert_eq!(leader_flag.load(Ordering::Acquire), 1);
        assert_eq!(regions[0].flag(3, 0, FlagArea::Down).unwrap().load(Ordering::Acquire), 0);
    }
}
