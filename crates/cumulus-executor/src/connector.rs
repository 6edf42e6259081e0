use crate::error::{ExecutorError, Result};
use crate::process::ProcessCluster;
use crate::rpc::ClusterRpc;
use cumulus_core::constants::schemes;
use cumulus_core::model::{ClusterConfig, StorageConfig};
use cumulus_storage::ObjectStore;
use std::sync::Arc;

/// Turns configuration into live storage and cluster clients.
///
/// Network transports live outside this workspace and plug in by
/// implementing this trait.
pub trait ClusterConnector: Send + Sync {
    fn open_store(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStore>>;

    fn connect(
        &self,
        cluster: &ClusterConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<dyn ClusterRpc>>;
}

/// Understands `local://` clusters and the built-in object store schemes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConnector;

impl ClusterConnector for DefaultConnector {
    fn open_store(&self, config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
        Ok(cumulus_storage::open_store(config)?)
    }

    fn connect(
        &self,
        cluster: &ClusterConfig,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Arc<dyn ClusterRpc>> {
        if cluster.endpoint.starts_with(schemes::LOCAL) {
            tracing::debug!(
                "Cluster '{}' runs invocations as local processes",
                cluster.name
            );
            return Ok(Arc::new(ProcessCluster::from_endpoint(
                &cluster.endpoint,
                store,
            )?));
        }
        Err(ExecutorError::UnsupportedEndpoint(cluster.endpoint.clone()))
    }
}
