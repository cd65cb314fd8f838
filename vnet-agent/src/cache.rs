use std::fmt;
use std::sync::{Arc, RwLock};

use ahash::{HashMap, HashMapExt, HashSet};
use kube::ResourceExt;
use tokio::sync::watch;
use vnet_crds::v1alpha1::attachment::NetworkAttachment;
use vnet_fabric::MacAddr;

use crate::mac::derive_mac;

/// Namespaced name of an attachment; the identity everything in the agent is
/// keyed by.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct NsName {
    pub namespace: String,
    pub name: String,
}

impl NsName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NsName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

pub fn nsn_of(att: &NetworkAttachment) -> NsName {
    NsName {
        namespace: att.namespace().unwrap_or_default(),
        name: att.name_any(),
    }
}

/// Receives cache events after the cache has applied them. Implementations
/// must not block and must not fail; they are called from the watch pump,
/// in order per key.
pub trait CacheSubscriber: Send + Sync + 'static {
    fn on_add(&self, att: &Arc<NetworkAttachment>);
    fn on_update(&self, old: &Arc<NetworkAttachment>, new: &Arc<NetworkAttachment>);
    fn on_delete(&self, att: &Arc<NetworkAttachment>);
}

struct CacheState {
    by_name: HashMap<NsName, Arc<NetworkAttachment>>,
    by_mac: HashMap<MacAddr, HashSet<NsName>>,
}

struct CacheInner {
    state: RwLock<CacheState>,
    subscriber: Arc<dyn CacheSubscriber>,
    ready: watch::Sender<bool>,
}

/// One watch stream's view of the attachments it selects, kept in memory
/// and secondarily indexed by derived MAC. The MAC index pairs pre-existing
/// host interfaces with their owning attachments at startup.
#[derive(Clone)]
pub struct AttachmentCache {
    inner: Arc<CacheInner>,
}

impl AttachmentCache {
    pub fn new(subscriber: Arc<dyn CacheSubscriber>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(CacheInner {
                state: RwLock::new(CacheState {
                    by_name: HashMap::new(),
                    by_mac: HashMap::new(),
                }),
                subscriber,
                ready,
            }),
        }
    }

    pub fn get(&self, nsn: &NsName) -> Option<Arc<NetworkAttachment>> {
        self.inner.state.read().unwrap().by_name.get(nsn).cloned()
    }

    pub fn by_mac(&self, mac: &MacAddr) -> Vec<Arc<NetworkAttachment>> {
        let state = self.inner.state.read().unwrap();
        let Some(names) = state.by_mac.get(mac) else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|nsn| state.by_name.get(nsn).cloned())
            .collect()
    }

    pub fn list(&self) -> Vec<Arc<NetworkAttachment>> {
        self.inner
            .state
            .read()
            .unwrap()
            .by_name
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().unwrap().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds or replaces the entry for `att` and notifies the subscriber.
    pub fn apply(&self, att: Arc<NetworkAttachment>) {
        let nsn = nsn_of(&att);
        let old = {
            let mut state = self.inner.state.write().unwrap();
            let old = state.by_name.insert(nsn.clone(), att.clone());
            if let Some(old) = &old {
                unindex_mac(&mut state, old, &nsn);
            }
            if let Some(mac) = mac_of(&att) {
                state.by_mac.entry(mac).or_default().insert(nsn);
            }
            old
        };
        match old {
            Some(old) => self.inner.subscriber.on_update(&old, &att),
            None => self.inner.subscriber.on_add(&att),
        }
    }

    /// Drops the entry for `nsn`, if any, and notifies the subscriber with
    /// the last version the cache held.
    pub fn remove(&self, nsn: &NsName) {
        let old = {
            let mut state = self.inner.state.write().unwrap();
            let old = state.by_name.remove(nsn);
            if let Some(old) = &old {
                unindex_mac(&mut state, old, nsn);
            }
            old
        };
        if let Some(old) = old {
            self.inner.subscriber.on_delete(&old);
        }
    }

    /// Drops every entry whose key is not in `keys`, firing a delete event
    /// for each. Used after a re-list to surface deletions that happened
    /// while the watch was down.
    pub fn retain_keys(&self, keys: &HashSet<NsName>) {
        let stale: Vec<NsName> = {
            let state = self.inner.state.read().unwrap();
            state
                .by_name
                .keys()
                .filter(|nsn| !keys.contains(*nsn))
                .cloned()
                .collect()
        };
        for nsn in stale {
            self.remove(&nsn);
        }
    }

    /// Flips the readiness latch; called once the initial list is complete.
    pub fn mark_ready(&self) {
        self.inner.ready.send_replace(true);
    }

    /// Resolves once the initial list has been fully delivered.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

fn mac_of(att: &NetworkAttachment) -> Option<MacAddr> {
    let status = att.status.as_ref()?;
    let guest_ip = status.ipv4.parse().ok()?;
    Some(derive_mac(status.address_vni, guest_ip))
}

fn unindex_mac(state: &mut CacheState, att: &NetworkAttachment, nsn: &NsName) {
    if let Some(mac) = mac_of(att)
        && let Some(names) = state.by_mac.get_mut(&mac)
    {
        names.remove(nsn);
        if names.is_empty() {
            state.by_mac.remove(&mac);
        }
    }
}
