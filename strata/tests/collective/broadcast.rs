use std::sync::Arc;
use strata::{
    BcastAlgorithm, Communicator, DataType, DeviceAdapter, EngineConfig, LocalCluster,
    LocalMemoryDomain, Locality, Plan,
};

use super::helpers::{SimulatedDevice, pattern, run_collective, run_with};

fn is_shm(plan: Option<Plan>) -> bool {
    matches!(plan, Some(Plan::Broadcast(BcastAlgorithm::Hierarchical(c))) if c.use_shm)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_single_node_broadcast_uses_shared_memory() {
    run_collective(LocalCluster::single_node(16), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        let mut data = if rank == 3 {
            vec![0xde, 0xad, 0xbe, 0xef]
        } else {
            vec![0u8; 4]
        };
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::U8, 3)
            .await
            .unwrap();

        assert_eq!(data, vec![0xde, 0xad, 0xbe, 0xef], "rank {rank}");
        assert!(is_shm(m.engine.last_plan()), "rank {rank}: {:?}", m.engine.last_plan());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_memory_broadcast_across_numa_groups() {
    // 20 ranks: two sockets of two NUMA domains of five ranks.
    run_collective(LocalCluster::uniform(1, 2, 2, 5), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        for (round, root) in [13u32, 0, 13, 7].into_iter().enumerate() {
            let len = 4096 + round;
            let expected = pattern(root + round as u32, len);
            let mut data = if rank == root {
                expected.clone()
            } else {
                vec![0u8; len]
            };
            m.engine
                .broadcast_slice(&m.comm, &mut data, DataType::U8, root)
                .await
                .unwrap();
            assert_eq!(data, expected, "rank {rank} round {round}");
            assert!(is_shm(m.engine.last_plan()));
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hierarchical_broadcast_layouts() {
    let interleaved = LocalCluster::new(
        (0..12)
            .map(|r| Locality::new(format!("node{}", r % 3), (r / 3) % 2, 0))
            .collect(),
    );
    let cases = [
        (LocalCluster::uniform(2, 2, 1, 4), 5u32, 64usize),
        (LocalCluster::uniform(1, 2, 2, 4), 9, 10_000),
        (LocalCluster::uniform(4, 1, 2, 3), 23, 100),
        (LocalCluster::uniform(8, 1, 1, 2), 7, 512),
        (LocalCluster::uniform(1, 1, 1, 40), 33, 20_000),
        (interleaved, 4, 300),
    ];
    for (cluster, root, len) in cases {
        let size = cluster.size();
        run_collective(cluster, EngineConfig::default(), move |m| async move {
            let rank = m.comm.rank();
            let expected = pattern(root, len);
            let mut data = if rank == root {
                expected.clone()
            } else {
                vec![0u8; len]
            };
            m.engine
                .broadcast_slice(&m.comm, &mut data, DataType::U8, root)
                .await
                .unwrap();
            assert_eq!(data, expected, "size {size} root {root} rank {rank}");
        })
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_node_plan_uses_leaders() {
    run_collective(LocalCluster::uniform(2, 1, 1, 8), EngineConfig::default(), |m| async move {
        // Small payloads cross nodes among leaders, then go through each
        // node's shared region.
        let mut data = if m.comm.rank() == 10 { vec![7u32; 16] } else { vec![0u32; 16] };
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::U32, 10)
            .await
            .unwrap();
        assert_eq!(data, vec![7u32; 16]);
        match m.engine.last_plan() {
            Some(Plan::Broadcast(BcastAlgorithm::Hierarchical(choice))) => {
                assert!(choice.use_leaders);
                assert!(choice.use_shm);
            }
            other => panic!("unexpected plan {other:?}"),
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_nodes_use_knomial() {
    run_collective(LocalCluster::uniform(8, 1, 1, 2), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        let mut data = if rank == 11 { vec![1.5f64; 8] } else { vec![0.0; 8] };
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::F64, 11)
            .await
            .unwrap();
        assert_eq!(data, vec![1.5f64; 8]);
        assert!(matches!(
            m.engine.last_plan(),
            Some(Plan::Broadcast(BcastAlgorithm::Knomial { radix: 4 }))
        ));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_small_group_is_linear() {
    run_collective(LocalCluster::single_node(5), EngineConfig::default(), |m| async move {
        let mut data = if m.comm.rank() == 4 { vec![9i32; 3] } else { vec![0; 3] };
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::I32, 4)
            .await
            .unwrap();
        assert_eq!(data, vec![9i32; 3]);
        assert_eq!(
            m.engine.last_plan(),
            Some(Plan::Broadcast(BcastAlgorithm::Linear))
        );
        assert_eq!(m.engine.cached_comms().await, 0);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overrides_force_numa_and_socket_tiers() {
    let configs = [
        EngineConfig {
            force_numa: Some(true),
            ..EngineConfig::default()
        },
        EngineConfig {
            bcast_socket: Some(true),
            ..EngineConfig::default()
        },
        EngineConfig {
            use_dynamic_rules: true,
            bcast_lin0: true,
            bcast_lin2: true,
            ..EngineConfig::default()
        },
        EngineConfig {
            disable_shmbcast: true,
            ..EngineConfig::default()
        },
    ];
    for config in configs {
        for cluster in [LocalCluster::uniform(2, 2, 2, 2), LocalCluster::uniform(1, 2, 2, 4)] {
            run_collective(cluster, config.clone(), |m| async move {
                let rank = m.comm.rank();
                let expected = pattern(6, 1000);
                let mut data = if rank == 6 {
                    expected.clone()
                } else {
                    vec![0u8; 1000]
                };
                m.engine
                    .broadcast_slice(&m.comm, &mut data, DataType::U8, 6)
                    .await
                    .unwrap();
                assert_eq!(data, expected, "rank {rank}");
            })
            .await;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disable_shmbcast_keeps_payload_off_shared_memory() {
    let config = EngineConfig {
        disable_shmbcast: true,
        ..EngineConfig::default()
    };
    let memory = run_collective(LocalCluster::single_node(16), config, |m| async move {
        let mut data = if m.comm.rank() == 0 { vec![3u8; 8] } else { vec![0; 8] };
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::U8, 0)
            .await
            .unwrap();
        assert_eq!(data, vec![3u8; 8]);
        assert!(!is_shm(m.engine.last_plan()));
    })
    .await;
    assert_eq!(memory.attached_segments(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_derived_type_skips_shared_memory() {
    run_collective(LocalCluster::single_node(16), EngineConfig::default(), |m| async move {
        let rank = m.comm.rank();
        let expected = pattern(2, 15);
        let mut data = if rank == 2 {
            expected.clone()
        } else {
            vec![0u8; 15]
        };
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::Derived(3), 2)
            .await
            .unwrap();
        assert_eq!(data, expected);
        assert!(!is_shm(m.engine.last_plan()));
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_device_buffers_match_host_result() {
    let expected = pattern(12, 256);
    for device in [false, true] {
        let adapter: Option<Arc<dyn DeviceAdapter>> =
            device.then(|| Arc::new(SimulatedDevice::default()) as Arc<dyn DeviceAdapter>);
        let expected = expected.clone();
        run_with(
            LocalCluster::uniform(1, 2, 1, 8),
            EngineConfig::default(),
            LocalMemoryDomain::new(),
            adapter,
            move |m| {
                let expected = expected.clone();
                async move {
                    let mut data = if m.comm.rank() == 12 {
                        expected.clone()
                    } else {
                        vec![0u8; 256]
                    };
                    m.engine
                        .broadcast_slice(&m.comm, &mut data, DataType::U8, 12)
                        .await
                        .unwrap();
                    assert_eq!(data, expected, "device {device}");
                    assert_eq!(is_shm(m.engine.last_plan()), !device);
                }
            },
        )
        .await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plan_broadcast_agrees_with_execution() {
    run_collective(LocalCluster::uniform(1, 2, 2, 4), EngineConfig::default(), |m| async move {
        let planned = m
            .engine
            .plan_broadcast(&m.comm, 2048, DataType::F32, 1)
            .await
            .unwrap();
        let mut data = vec![m.comm.rank() as f32; 2048];
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::F32, 1)
            .await
            .unwrap();
        assert_eq!(data, vec![1.0f32; 2048]);
        assert_eq!(m.engine.last_plan(), Some(Plan::Broadcast(planned)));
    })
    .await;
}
