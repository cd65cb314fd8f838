use std::sync::RwLock;

use ahash::{HashMap, HashMapExt};
use vnet_fabric::{LocalNetIfc, RemoteNetIfc};

use crate::cache::NsName;

/// The host interfaces currently realized for each attachment. Mutated only
/// by the reconcile workers and the startup sync; an attachment has at most
/// one of a local or a remote interface at a time.
#[derive(Default)]
pub struct IfcRegistry {
    local: RwLock<HashMap<NsName, LocalNetIfc>>,
    remote: RwLock<HashMap<NsName, RemoteNetIfc>>,
}

impl IfcRegistry {
    pub fn new() -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            remote: RwLock::new(HashMap::new()),
        }
    }

    pub fn local(&self, nsn: &NsName) -> Option<LocalNetIfc> {
        self.local.read().unwrap().get(nsn).cloned()
    }

    pub fn set_local(&self, nsn: &NsName, ifc: LocalNetIfc) {
        self.local.write().unwrap().insert(nsn.clone(), ifc);
    }

    pub fn unset_local(&self, nsn: &NsName) {
        self.local.write().unwrap().remove(nsn);
    }

    pub fn remote(&self, nsn: &NsName) -> Option<RemoteNetIfc> {
        self.remote.read().unwrap().get(nsn).cloned()
    }

    pub fn set_remote(&self, nsn: &NsName, ifc: RemoteNetIfc) {
        self.remote.write().unwrap().insert(nsn.clone(), ifc);
    }

    pub fn unset_remote(&self, nsn: &NsName) {
        self.remote.write().unwrap().remove(nsn);
    }

    pub fn local_count(&self) -> usize {
        self.local.read().unwrap().len()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_count() == 0 && self.remote_count() == 0
    }
}
