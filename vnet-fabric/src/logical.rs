use std::net::Ipv4Addr;
use std::sync::Mutex;

use ahash::{HashMap, HashMapExt};

use crate::{Error, Fabric, LocalNetIfc, RemoteNetIfc, Result};

pub const NAME: &str = "logical";

enum Slot {
    Local(LocalNetIfc),
    Remote(RemoteNetIfc),
}

/// LogicalFabric keeps interfaces in process memory instead of programming
/// the host. It exists for development and tests, and is the reference for
/// the uniqueness guarantees of the contract: one map keyed by
/// (VNI, guest IP) covers local and remote interfaces alike, so a creation
/// colliding with an interface of either kind fails.
#[derive(Default)]
pub struct LogicalFabric {
    ifcs: Mutex<HashMap<(u32, Ipv4Addr), Slot>>,
}

impl LogicalFabric {
    pub fn new() -> Self {
        Self {
            ifcs: Mutex::new(HashMap::new()),
        }
    }
}

impl Fabric for LogicalFabric {
    fn name(&self) -> &str {
        NAME
    }

    fn create_local_ifc(&self, ifc: &LocalNetIfc) -> Result<()> {
        let mut ifcs = self.ifcs.lock().unwrap();
        let key = (ifc.vni, ifc.guest_ip);
        if ifcs.contains_key(&key) {
            return Err(Error::Occupied {
                vni: ifc.vni,
                guest_ip: ifc.guest_ip,
            });
        }
        ifcs.insert(key, Slot::Local(ifc.clone()));
        Ok(())
    }

    fn delete_local_ifc(&self, ifc: &LocalNetIfc) -> Result<()> {
        let mut ifcs = self.ifcs.lock().unwrap();
        let key = (ifc.vni, ifc.guest_ip);
        if matches!(ifcs.get(&key), Some(Slot::Local(_))) {
            ifcs.remove(&key);
        }
        Ok(())
    }

    fn create_remote_ifc(&self, ifc: &RemoteNetIfc) -> Result<()> {
        let mut ifcs = self.ifcs.lock().unwrap();
        let key = (ifc.vni, ifc.guest_ip);
        if ifcs.contains_key(&key) {
            return Err(Error::Occupied {
                vni: ifc.vni,
                guest_ip: ifc.guest_ip,
            });
        }
        ifcs.insert(key, Slot::Remote(ifc.clone()));
        Ok(())
    }

    fn delete_remote_ifc(&self, ifc: &RemoteNetIfc) -> Result<()> {
        let mut ifcs = self.ifcs.lock().unwrap();
        let key = (ifc.vni, ifc.guest_ip);
        if matches!(ifcs.get(&key), Some(Slot::Remote(_))) {
            ifcs.remove(&key);
        }
        Ok(())
    }

    fn list_local_ifcs(&self) -> Result<Vec<LocalNetIfc>> {
        let ifcs = self.ifcs.lock().unwrap();
        Ok(ifcs
            .values()
            .filter_map(|slot| match slot {
                Slot::Local(ifc) => Some(ifc.clone()),
                Slot::Remote(_) => None,
            })
            .collect())
    }

    fn list_remote_ifcs(&self) -> Result<Vec<RemoteNetIfc>> {
        let ifcs = self.ifcs.lock().unwrap();
        Ok(ifcs
            .values()
            .filter_map(|slot| match slot {
                Slot::Remote(ifc) => Some(ifc.clone()),
                Slot::Local(_) => None,
            })
            .collect())
    }
}
