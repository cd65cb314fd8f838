use std::sync::Arc;

use crate::Fabric;
use crate::logical::LogicalFabric;

type Constructor = fn() -> Arc<dyn Fabric>;

// Hard-state drivers (OVS and friends) register here when built in.
const DRIVERS: &[(&str, Constructor)] = &[(crate::logical::NAME, || {
    Arc::new(LogicalFabric::new())
})];

/// Resolves a fabric driver by name. Drivers are selected once at startup.
pub fn by_name(name: &str) -> Option<Arc<dyn Fabric>> {
    DRIVERS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, construct)| construct())
}

pub fn names() -> Vec<&'static str> {
    DRIVERS.iter().map(|(n, _)| *n).collect()
}
