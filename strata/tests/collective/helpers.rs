use std::sync::Arc;
use strata::{
    CpuAdapter, DeviceAdapter, Engine, EngineConfig, LocalCluster, LocalComm, LocalMemoryDomain,
    MemoryDomain, Result,
};
use tracing_subscriber::EnvFilter;

/// One rank of a test cluster: its communicator and its engine.
pub struct Member {
    pub comm: LocalComm,
    pub engine: Engine<LocalComm>,
}

/// Run a collective across every rank of `cluster` concurrently. All ranks
/// share one memory domain, as processes on a node share `/dev/shm`.
/// Returns the domain so callers can check for leaked mappings.
pub async fn run_collective<F, Fut>(
    cluster: LocalCluster,
    config: EngineConfig,
    f: F,
) -> Arc<LocalMemoryDomain>
where
    F: Fn(Member) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    run_with(cluster, config, LocalMemoryDomain::new(), None, f).await
}

/// Like [`run_collective`] with an explicit memory domain and, optionally,
/// a device adapter installed on every engine.
pub async fn run_with<F, Fut>(
    cluster: LocalCluster,
    config: EngineConfig,
    memory: LocalMemoryDomain,
    adapter: Option<Arc<dyn DeviceAdapter>>,
    f: F,
) -> Arc<LocalMemoryDomain>
where
    F: Fn(Member) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    init_tracing();
    let memory = Arc::new(memory);
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for comm in cluster.bootstrap() {
        let shared: Arc<dyn MemoryDomain> = memory.clone();
        let mut engine = Engine::new(config.clone(), shared).unwrap();
        if let Some(adapter) = &adapter {
            engine = engine.with_adapter(Arc::clone(adapter));
        }
        let member = Member { comm, engine };
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(member).await }));
    }
    for h in handles {
        h.await.unwrap();
    }
    memory
}

/// Route engine logs to the test output. Set `RUST_LOG=strata=debug` to see
/// plan selection.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Host memory that claims to be device memory, forcing the staged
/// point-to-point paths.
#[derive(Debug, Default)]
pub struct SimulatedDevice {
    inner: CpuAdapter,
}

impl DeviceAdapter for SimulatedDevice {
    unsafe fn stage_for_send(&self, ptr: u64, size_bytes: usize) -> Result<Vec<u8>> {
        unsafe { self.inner.stage_for_send(ptr, size_bytes) }
    }

    unsafe fn receive_to_device(&self, data: &[u8], dst_ptr: u64) -> Result<()> {
        unsafe { self.inner.receive_to_device(data, dst_ptr) }
    }

    fn is_device_ptr(&self, _ptr: u64) -> bool {
        true
    }
}

/// Bytes that identify `rank` at every position.
pub fn pattern(rank: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (rank as usize * 31 + i) as u8).collect()
}
