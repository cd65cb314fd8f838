pub mod agent;
pub mod cache;
pub mod config;
pub mod http;
pub mod ifc;
pub mod mac;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod sync;
pub mod vn;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("fabric error: {0}")]
    FabricError(#[from] vnet_fabric::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),

    #[error("unknown fabric driver {0:?}")]
    UnknownFabric(String),

    #[error("attachment {0} has no status")]
    MissingStatus(String),

    #[error("attachment {nsn} has a malformed {field}: {value:?}")]
    BadAddress {
        nsn: String,
        field: &'static str,
        value: String,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
