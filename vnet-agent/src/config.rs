use std::net::{Ipv4Addr, SocketAddr};

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the per-node connection agent
    Agent(AgentArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// IPv4 address of this node on the underlay network
    #[arg(long, env = "HOST_IP")]
    pub host_ip: Ipv4Addr,

    /// Number of reconcile workers
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Network fabric driver to realize interfaces with
    #[arg(long, env = "NET_FABRIC", default_value = "logical")]
    pub fabric: String,

    /// Metrics listener for the agent
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}
