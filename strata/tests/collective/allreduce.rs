use std::sync::Arc;
use strata::decision::AllreduceTable;
use strata::{
    AllreduceAlgorithm, Communicator, DataType, DecisionTables, DeviceAdapter, EngineConfig,
    LocalCluster, LocalMemoryDomain, Operator, Plan, ReduceOp, Result, SendBuf,
};

use super::helpers::{SimulatedDevice, run_collective, run_with};

fn last_allreduce(plan: Option<Plan>) -> Option<AllreduceAlgorithm> {
    match plan {
        Some(Plan::Allreduce(algo)) => Some(algo),
        _ => None,
    }
}

/// Product of 2x2 integer matrices, four `u32`s per element, row-major.
/// Associative but not commutative.
struct MatMul;

impl Operator for MatMul {
    fn is_commutative(&self) -> bool {
        false
    }

    fn apply(&self, acc: &mut [u8], rhs: &[u8], _count: usize, _dtype: DataType) -> Result<()> {
        for (a, b) in acc.chunks_exact_mut(16).zip(rhs.chunks_exact(16)) {
            let product = matmul(words(a), words(b));
            for (dst, w) in a.chunks_exact_mut(4).zip(product) {
                dst.copy_from_slice(&w.to_le_bytes());
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "matmul"
    }
}

fn words(bytes: &[u8]) -> [u32; 4] {
    let mut out = [0u32; 4];
    for (w, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    out
}

fn matmul(a: [u32; 4], b: [u32; 4]) -> [u32; 4] {
    [
        a[0].wrapping_mul(b[0]).wrapping_add(a[1].wrapping_mul(b[2])),
        a[0].wrapping_mul(b[1]).wrapping_add(a[1].wrapping_mul(b[3])),
        a[2].wrapping_mul(b[0]).wrapping_add(a[3].wrapping_mul(b[2])),
        a[2].wrapping_mul(b[1]).wrapping_add(a[3].wrapping_mul(b[3])),
    ]
}

fn rank_matrix(rank: u32) -> [u32; 4] {
    [rank + 1, 1, 1, 0]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allreduce_4_ranks_sum() {
    run_collective(LocalCluster::single_node(4), EngineConfig::default(), |m| async move {
        let send = [1.0f32];
        let mut recv = [0.0f32];
        m.engine
            .allreduce_slice(&m.comm, &send, &mut recv, DataType::F32, &ReduceOp::Sum)
            .await
            .unwrap();
        assert_eq!(recv, [4.0]);
        assert_eq!(
            last_allreduce(m.engine.last_plan()),
            Some(AllreduceAlgorithm::RecursiveDoubling)
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_ranks_skip_hierarchy() {
    run_collective(LocalCluster::single_node(2), EngineConfig::default(), |m| async move {
        let mut data = vec![m.comm.rank() as i64 + 5; 100];
        m.engine
            .allreduce_in_place(&m.comm, &mut data, DataType::I64, &ReduceOp::Max)
            .await
            .unwrap();
        assert_eq!(data, vec![6i64; 100]);
        assert_eq!(
            last_allreduce(m.engine.last_plan()),
            Some(AllreduceAlgorithm::ReduceScatterAllgather)
        );
        assert_eq!(m.engine.cached_comms().await, 0);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_rank_copies() {
    run_collective(LocalCluster::single_node(1), EngineConfig::default(), |m| async move {
        let send = [3u64, 4, 5];
        let mut recv = [0u64; 3];
        m.engine
            .allreduce_slice(&m.comm, &send, &mut recv, DataType::U64, &ReduceOp::Prod)
            .await
            .unwrap();
        assert_eq!(recv, send);
        assert_eq!(
            last_allreduce(m.engine.last_plan()),
            Some(AllreduceAlgorithm::Copy)
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_node_uses_reduce_scatter_allgather() {
    run_collective(LocalCluster::uniform(2, 1, 1, 4), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        let send: Vec<f64> = (0..1000).map(|i| (rank + 1) as f64 * i as f64).collect();
        let mut recv = vec![0.0f64; 1000];
        m.engine
            .allreduce_slice(&m.comm, &send, &mut recv, DataType::F64, &ReduceOp::Sum)
            .await
            .unwrap();
        let expected: Vec<f64> = (0..1000).map(|i| 36.0 * i as f64).collect();
        assert_eq!(recv, expected, "rank {rank}");
        assert_eq!(
            last_allreduce(m.engine.last_plan()),
            Some(AllreduceAlgorithm::ReduceScatterAllgather)
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shm_staged_interleaved_with_shm_broadcast() {
    // 16 ranks over two sockets of two NUMA domains.
    run_collective(LocalCluster::uniform(1, 2, 2, 4), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        for round in 0..4u32 {
            let mut data: Vec<u32> = (0..16).map(|i| rank * 100 + i + round).collect();
            m.engine
                .allreduce_in_place(&m.comm, &mut data, DataType::U32, &ReduceOp::Sum)
                .await
                .unwrap();
            let expected: Vec<u32> = (0..16).map(|i| 100 * 120 + 16 * (i + round)).collect();
            assert_eq!(data, expected, "rank {rank} round {round}");
            assert_eq!(
                last_allreduce(m.engine.last_plan()),
                Some(AllreduceAlgorithm::ShmStaged)
            );

            let root = (round * 5) % 16;
            let mut bcast = if rank == root { vec![round as u8; 32] } else { vec![0u8; 32] };
            m.engine
                .broadcast_slice(&m.comm, &mut bcast, DataType::U8, root)
                .await
                .unwrap();
            assert_eq!(bcast, vec![round as u8; 32]);
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shm_staged_separate_buffers() {
    run_collective(LocalCluster::uniform(1, 1, 2, 3), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        let send = vec![rank as f32 + 1.0; 32];
        let mut recv = vec![0.0f32; 32];
        m.engine
            .allreduce_slice(&m.comm, &send, &mut recv, DataType::F32, &ReduceOp::Sum)
            .await
            .unwrap();
        assert_eq!(recv, vec![21.0f32; 32]);
        assert_eq!(send, vec![rank as f32 + 1.0; 32]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_copy_scatter_releases_mappings() {
    let memory = run_collective(LocalCluster::single_node(4), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        let send: Vec<f32> = (0..16384).map(|i| (i % 7) as f32 + rank as f32).collect();
        let mut recv = vec![0.0f32; 16384];
        m.engine
            .allreduce_slice(&m.comm, &send, &mut recv, DataType::F32, &ReduceOp::Sum)
            .await
            .unwrap();
        let expected: Vec<f32> = (0..16384).map(|i| 4.0 * (i % 7) as f32 + 6.0).collect();
        assert_eq!(recv, expected, "rank {rank}");
        assert_eq!(
            last_allreduce(m.engine.last_plan()),
            Some(AllreduceAlgorithm::SingleCopyScatter)
        );
    })
    .await;
    assert_eq!(memory.live_mappings(), 0);
    assert_eq!(memory.live_registrations(), 0);
}

fn single_copy_tables() -> DecisionTables {
    DecisionTables {
        allreduce: AllreduceTable {
            rd_below: 0,
            shm_below: 0,
            rd_upto: 0,
            rsag_below: 0,
            scatter_below: 1024,
            hierarchical_upto: 1 << 20,
        },
        ..DecisionTables::default()
    }
}

async fn check_single_copy(config: EngineConfig, count: usize, expected_algo: AllreduceAlgorithm) {
    let cluster = LocalCluster::uniform(1, 2, 2, 2);
    let memory = run_collective(cluster, config, move |m| async move {
        let rank = m.comm.rank();
        let engine = m.engine.with_tables(single_copy_tables());
        for in_place in [false, true] {
            let send: Vec<u32> = (0..count as u32).map(|i| i * (rank + 1)).collect();
            let mut recv = if in_place { send.clone() } else { vec![0u32; count] };
            let send_buf = if in_place {
                SendBuf::InPlace
            } else {
                SendBuf::Ptr(send.as_ptr() as u64)
            };
            unsafe {
                engine
                    .allreduce(
                        &m.comm,
                        send_buf,
                        recv.as_mut_ptr() as u64,
                        count,
                        DataType::U32,
                        &ReduceOp::Sum,
                    )
                    .await
                    .unwrap();
            }
            let expected: Vec<u32> = (0..count as u32).map(|i| i * 36).collect();
            assert_eq!(recv, expected, "rank {rank} in_place {in_place}");
            assert_eq!(last_allreduce(engine.last_plan()), Some(expected_algo));
        }
    })
    .await;
    assert_eq!(memory.live_mappings(), 0);
    assert_eq!(memory.live_registrations(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_copy_hierarchical() {
    check_single_copy(
        EngineConfig::default(),
        301,
        AllreduceAlgorithm::SingleCopyHierarchical,
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_copy_scatter_uneven_chunks() {
    check_single_copy(EngineConfig::default(), 131, AllreduceAlgorithm::SingleCopyScatter).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_copy_through_scratch_buffer() {
    let config = EngineConfig {
        smsc_use_sr_buf: false,
        ..EngineConfig::default()
    };
    check_single_copy(config.clone(), 301, AllreduceAlgorithm::SingleCopyHierarchical).await;
    check_single_copy(config, 131, AllreduceAlgorithm::SingleCopyScatter).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_scratch_falls_back_to_rsag() {
    let config = EngineConfig {
        smsc_use_sr_buf: false,
        smsc_buf_size: 1024,
        ..EngineConfig::default()
    };
    check_single_copy(config, 301, AllreduceAlgorithm::ReduceScatterAllgather).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_without_mapping_falls_back_to_rsag() {
    run_with(
        LocalCluster::single_node(4),
        EngineConfig::default(),
        LocalMemoryDomain::without_mapping(),
        None,
        |m| async move {
            let mut data = vec![2.0f64; 10_000];
            m.engine
                .allreduce_in_place(&m.comm, &mut data, DataType::F64, &ReduceOp::Sum)
                .await
                .unwrap();
            assert_eq!(data, vec![8.0f64; 10_000]);
            assert_eq!(
                last_allreduce(m.engine.last_plan()),
                Some(AllreduceAlgorithm::ReduceScatterAllgather)
            );
        },
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_commutative_keeps_rank_order() {
    run_collective(LocalCluster::uniform(1, 2, 1, 3), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        let mine = rank_matrix(rank);
        let mut data = vec![0u32; 8];
        data[..4].copy_from_slice(&mine);
        data[4..].copy_from_slice(&mine);
        m.engine
            .allreduce_in_place(&m.comm, &mut data, DataType::U32, &MatMul)
            .await
            .unwrap();

        let expected = (1..6).fold(rank_matrix(0), |acc, r| matmul(acc, rank_matrix(r)));
        assert_eq!(&data[..4], &expected, "rank {rank}");
        assert_eq!(&data[4..], &expected, "rank {rank}");
        assert_eq!(
            last_allreduce(m.engine.last_plan()),
            Some(AllreduceAlgorithm::RecursiveDoubling)
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_buffers_match_host_result() {
    for device in [false, true] {
        let adapter: Option<Arc<dyn DeviceAdapter>> =
            device.then(|| Arc::new(SimulatedDevice::default()) as Arc<dyn DeviceAdapter>);
        run_with(
            LocalCluster::uniform(1, 2, 2, 2),
            EngineConfig::default(),
            LocalMemoryDomain::new(),
            adapter,
            move |m| async move {
                let rank = m.comm.rank();
                let mut data: Vec<i32> = (0..24).map(|i| i - rank as i32).collect();
                m.engine
                    .allreduce_in_place(&m.comm, &mut data, DataType::I32, &ReduceOp::Min)
                    .await
                    .unwrap();
                let expected: Vec<i32> = (0..24).map(|i| i - 7).collect();
                assert_eq!(data, expected, "device {device}");
                let algo = last_allreduce(m.engine.last_plan());
                if device {
                    assert_eq!(algo, Some(AllreduceAlgorithm::RecursiveDoubling));
                } else {
                    assert_eq!(algo, Some(AllreduceAlgorithm::ShmStaged));
                }
            },
        )
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plan_allreduce_agrees_with_execution() {
    run_collective(LocalCluster::single_node(6), EngineConfig::default(), |m| async move {
        for count in [4usize, 64, 256, 4096, 20_000] {
            let planned = m
                .engine
                .plan_allreduce(&m.comm, count, DataType::F32, &ReduceOp::Sum)
                .await
                .unwrap();
            let mut data = vec![1.0f32; count];
            m.engine
                .allreduce_in_place(&m.comm, &mut data, DataType::F32, &ReduceOp::Sum)
                .await
                .unwrap();
            assert_eq!(data, vec![6.0f32; count]);
            assert_eq!(m.engine.last_plan(), Some(Plan::Allreduce(planned)), "count {count}");
        }
    })
    .await;
}
