use strata::{Communicator, DataType, EngineConfig, LocalCluster, ReduceOp, StrataError};

use super::helpers::run_collective;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_fails_every_rank() {
    run_collective(LocalCluster::single_node(4), EngineConfig::default(), |m| async move {
        if m.comm.rank() == 0 {
            m.comm.disconnect();
        }
        let mut data = vec![0u8; 32];
        let err = m
            .engine
            .broadcast_slice(&m.comm, &mut data, DataType::U8, 0)
            .await
            .unwrap_err();
        assert!(
            matches!(
                err,
                StrataError::CollectiveFailed { .. } | StrataError::PeerDisconnected { .. }
            ),
            "unexpected error {err}"
        );
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_during_hierarchy_build() {
    run_collective(LocalCluster::uniform(2, 1, 1, 4), EngineConfig::default(), |m| async move {
        if m.comm.rank() == 5 {
            m.comm.disconnect();
        }
        let mut data = vec![1.0f32; 256];
        let result = m
            .engine
            .allreduce_in_place(&m.comm, &mut data, DataType::F32, &ReduceOp::Sum)
            .await;
        assert!(result.is_err(), "rank {} finished", m.comm.rank());
    })
    .await;
}

#[tokio::test]
async fn test_invalid_root_rejected_locally() {
    run_collective(LocalCluster::single_node(3), EngineConfig::default(), |m| async move {
        let mut data = vec![0u8; 4];
        let err = m
            .engine
            .broadcast_slice(&m.comm, &mut data, DataType::U8, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::InvalidRank { rank: 3, size: 3 }));
    })
    .await;
}

#[tokio::test]
async fn test_mismatched_slices_rejected() {
    run_collective(LocalCluster::single_node(2), EngineConfig::default(), |m| async move {
        let send = [1u32; 4];
        let mut recv = [0u32; 3];
        let err = m
            .engine
            .allreduce_slice(&m.comm, &send, &mut recv, DataType::U32, &ReduceOp::Sum)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StrataError::BufferSizeMismatch {
                expected: 12,
                actual: 16
            }
        ));

        let mut odd = [0u8; 7];
        let err = m
            .engine
            .broadcast_slice(&m.comm, &mut odd, DataType::U32, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::BufferSizeMismatch { .. }));
    })
    .await;
}

#[tokio::test]
async fn test_reduce_rejects_derived_type() {
    run_collective(LocalCluster::single_node(2), EngineConfig::default(), |m| async move {
        let mut data = [0u8; 12];
        let err = m
            .engine
            .allreduce_in_place(&m.comm, &mut data, DataType::Derived(6), &ReduceOp::Sum)
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::UnsupportedDType { .. }));
    })
    .await;
}
