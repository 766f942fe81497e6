use strata::{BcastAlgorithm, Communicator, DataType, EngineConfig, LocalCluster, Plan, ReduceOp};

use super::helpers::run_collective;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hierarchy_built_once_per_root() {
    run_collective(LocalCluster::uniform(1, 2, 1, 4), EngineConfig::default(), |m| async move {
        let mut data = vec![0u8; 64];
        for _ in 0..3 {
            m.engine
                .broadcast_slice(&m.comm, &mut data, DataType::U8, 2)
                .await
                .unwrap();
        }
        let stats = m.engine.cache_stats(&m.comm).await.unwrap();
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.cached_root, Some(2));

        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::U8, 5)
            .await
            .unwrap();
        let mut sum = vec![1u32; 64];
        m.engine
            .allreduce_in_place(&m.comm, &mut sum, DataType::U32, &ReduceOp::Sum)
            .await
            .unwrap();
        assert_eq!(sum, vec![8u32; 64]);

        let stats = m.engine.cache_stats(&m.comm).await.unwrap();
        assert_eq!(stats.builds, 2);
        assert_eq!(stats.cached_root, Some(5));
        assert_eq!(stats.roots_seen, vec![2, 5]);
        assert!(!stats.root_fallback);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allreduce_builds_hierarchy_when_missing() {
    run_collective(LocalCluster::single_node(8), EngineConfig::default(), |m| async move {
        let mut data = vec![2.0f32; 16];
        m.engine
            .allreduce_in_place(&m.comm, &mut data, DataType::F32, &ReduceOp::Prod)
            .await
            .unwrap();
        assert_eq!(data, vec![256.0f32; 16]);

        let stats = m.engine.cache_stats(&m.comm).await.unwrap();
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.cached_root, Some(0));
        assert!(stats.roots_seen.is_empty());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_root_change_threshold_is_sticky() {
    let config = EngineConfig {
        root_change_thresh: 2,
        ..EngineConfig::default()
    };
    run_collective(LocalCluster::single_node(8), config, |m| async move {
        let rank = m.comm.rank();
        for root in [0u32, 1, 2, 0] {
            let mut data = if rank == root { vec![root as u8 + 1; 16] } else { vec![0u8; 16] };
            m.engine
                .broadcast_slice(&m.comm, &mut data, DataType::U8, root)
                .await
                .unwrap();
            assert_eq!(data, vec![root as u8 + 1; 16]);

            let knomial = matches!(
                m.engine.last_plan(),
                Some(Plan::Broadcast(BcastAlgorithm::Knomial { .. }))
            );
            let fallback = m.engine.cache_stats(&m.comm).await.unwrap().root_fallback;
            let past_threshold = root == 2 || (fallback && root == 0);
            assert_eq!(knomial, past_threshold, "root {root}");
        }
        let stats = m.engine.cache_stats(&m.comm).await.unwrap();
        assert!(stats.root_fallback);
        assert_eq!(stats.builds, 2);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cache_bounded_by_max_comms() {
    let config = EngineConfig {
        max_comms: 1,
        ..EngineConfig::default()
    };
    run_collective(LocalCluster::single_node(8), config, |m| async move {
        let mut data = if m.comm.rank() == 0 { vec![5u8; 24] } else { vec![0u8; 24] };
        m.engine
            .broadcast_slice(&m.comm, &mut data, DataType::U8, 0)
            .await
            .unwrap();
        assert_eq!(m.engine.cached_comms().await, 1);

        let dup = m.comm.split(Some(0), m.comm.rank()).await.unwrap().unwrap();
        assert_ne!(dup.id(), m.comm.id());
        for _ in 0..2 {
            let mut data = if dup.rank() == 3 { vec![6u8; 24] } else { vec![0u8; 24] };
            m.engine
                .broadcast_slice(&dup, &mut data, DataType::U8, 3)
                .await
                .unwrap();
            assert_eq!(data, vec![6u8; 24]);
            assert!(matches!(
                m.engine.last_plan(),
                Some(Plan::Broadcast(BcastAlgorithm::Knomial { .. }))
            ));
        }
        assert_eq!(m.engine.cached_comms().await, 1);
        assert!(m.engine.cache_stats(&dup).await.is_none());
    })
    .await;
}
