use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AgentArgs;
use crate::metrics::Metrics;
use crate::reconcile::ConnectionAgent;
use crate::store::KubeStore;
use crate::{Error, Result};

pub async fn start(args: AgentArgs, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    let fabric = vnet_fabric::registry::by_name(&args.fabric)
        .ok_or_else(|| Error::UnknownFabric(args.fabric.clone()))?;

    let client = kube::Client::try_default().await?;
    let store = Arc::new(KubeStore::new(
        client,
        args.node_name.clone(),
        args.host_ip,
    ));

    info!(
        node = %args.node_name,
        host_ip = %args.host_ip,
        fabric = fabric.name(),
        workers = args.workers,
        "starting connection agent"
    );

    let agent = Arc::new(ConnectionAgent::new(
        args.node_name,
        args.host_ip,
        args.workers,
        store,
        fabric,
        metrics.agent.clone(),
        cancel,
    ));
    agent.run().await
}
