pub mod ifc;
pub mod logical;
pub mod registry;

use thiserror::Error;

pub use ifc::{LocalNetIfc, MacAddr, RemoteNetIfc};

#[derive(Error, Debug)]
pub enum Error {
    #[error("an interface with VNI {vni} and guest IP {guest_ip} already exists")]
    Occupied { vni: u32, guest_ip: std::net::Ipv4Addr },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("driver error: {0}")]
    Driver(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fabric is the contract of a VXLAN network fabric driver.
///
/// A local interface is the host-side networking state of a guest bound to
/// the caller's node: a Linux network device wired so that it can exchange
/// VXLAN-tunneled traffic with the other guests of its virtual network. A
/// remote interface is the state needed on the caller's node so that traffic
/// directed at a guest on another node is tunneled to that node.
///
/// (VNI, guest IP) pairs identify interfaces: two interfaces with the same
/// pair are the same interface, regardless of whether they are local or
/// remote. Implementers must guarantee that:
///
/// 1. after an interface X is created, creating an interface with the same
///    (VNI, guest IP) pair fails until X is deleted through this contract,
///    regardless of the other fields and of whether X is local or remote;
/// 2. two concurrent creations with the same (VNI, guest IP) pair cannot
///    both succeed: exactly one fails;
/// 3. a successfully created interface is reported by the list operations
///    until it is deleted through this contract or its hard state is removed
///    by another process, even across restarts of the creating process.
///
/// Creating an interface may entail non-atomic host operations, so a crashed
/// creator can leave half-implemented state behind. The list operations are
/// the place for best-effort cleanup of such state and should be called
/// before anything else is done through the fabric.
pub trait Fabric: Send + Sync {
    fn name(&self) -> &str;

    fn create_local_ifc(&self, ifc: &LocalNetIfc) -> Result<()>;

    /// Deletes the local interface described by `ifc` if it exists. Deleting
    /// an absent interface is a success.
    fn delete_local_ifc(&self, ifc: &LocalNetIfc) -> Result<()>;

    fn create_remote_ifc(&self, ifc: &RemoteNetIfc) -> Result<()>;

    /// Deletes the remote interface described by `ifc` if it exists. Deleting
    /// an absent interface is a success.
    fn delete_remote_ifc(&self, ifc: &RemoteNetIfc) -> Result<()>;

    fn list_local_ifcs(&self) -> Result<Vec<LocalNetIfc>>;

    fn list_remote_ifcs(&self) -> Result<Vec<RemoteNetIfc>>;
}
