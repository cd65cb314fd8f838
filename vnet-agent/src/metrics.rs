use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct Metrics {
    pub agent: AgentMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("vnet_agent");
        let agent = AgentMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            agent,
        }
    }
}

#[derive(Clone, Default)]
pub struct AgentMetrics {
    pub reconciles: Family<OutcomeLabels, Counter>,
    pub virtual_networks: Gauge,
    pub local_ifcs: Gauge,
    pub remote_ifcs: Gauge,
}

impl AgentMetrics {
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "reconciles",
            "Number of attachment reconciliations by outcome",
            self.reconciles.clone(),
        );
        registry.register(
            "virtual_networks",
            "Number of virtual networks with a local attachment",
            self.virtual_networks.clone(),
        );
        registry.register(
            "local_interfaces",
            "Number of realized local interfaces",
            self.local_ifcs.clone(),
        );
        registry.register(
            "remote_interfaces",
            "Number of realized remote interfaces",
            self.remote_ifcs.clone(),
        );
        self
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: String,
}

impl OutcomeLabels {
    pub fn ok() -> Self {
        Self { outcome: "ok".into() }
    }

    pub fn error() -> Self {
        Self {
            outcome: "error".into(),
        }
    }
}
