use std::sync::{Arc, RwLock};

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vnet_crds::v1alpha1::attachment::NetworkAttachment;

use crate::cache::{AttachmentCache, CacheSubscriber, NsName, nsn_of};
use crate::queue::WorkQueue;
use crate::store::AttachmentStore;

/// Tracks the set of VNIs under which the remote streams have observed each
/// attachment. An attachment seen under more than one VNI, or seen both
/// locally and remotely, is in transit between watch streams; the reconciler
/// leaves it alone until the resolving delete arrives.
#[derive(Default)]
pub struct SeenVnis {
    state: RwLock<HashMap<NsName, HashSet<u32>>>,
}

impl SeenVnis {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, nsn: &NsName, vni: u32) {
        let mut state = self.state.write().unwrap();
        state.entry(nsn.clone()).or_default().insert(vni);
    }

    pub fn remove(&self, nsn: &NsName, vni: u32) {
        let mut state = self.state.write().unwrap();
        if let Some(vnis) = state.get_mut(nsn) {
            vnis.remove(&vni);
            if vnis.is_empty() {
                state.remove(nsn);
            }
        }
    }

    /// Returns how many VNIs the attachment has been seen under and, when
    /// exactly one, which.
    pub fn seen(&self, nsn: &NsName) -> (usize, Option<u32>) {
        let state = self.state.read().unwrap();
        match state.get(nsn) {
            Some(vnis) if vnis.len() == 1 => (1, vnis.iter().next().copied()),
            Some(vnis) => (vnis.len(), None),
            None => (0, None),
        }
    }
}

/// Control block of one virtual network while at least one of its
/// attachments is local to this node.
pub struct VnState {
    /// A virtual network is confined to one namespace.
    pub namespace: String,
    pub remote_cache: AttachmentCache,
    /// Stops the remote watch; a child of the agent's root token, so either
    /// cancels it.
    pub stop: CancellationToken,
    pub local_atts: HashSet<String>,
    pub remote_atts: HashSet<String>,
}

/// Outcome of recording an attachment in its VN-state.
pub enum VnUpdate {
    /// The attachment is tracked by the state for its VNI.
    Tracked,
    /// The attachment was the last local one of its VN and has turned
    /// remote; the detached state is handed back for teardown.
    TornDown(VnState),
    /// The attachment is remote and its VN has no state (the last local
    /// attachment left between lookup and this call); the caller must treat
    /// the attachment as deleted.
    NoStateForRemote,
}

/// Registry of the VN-states of all currently relevant virtual networks,
/// with an auxiliary identity-to-VNI map kept in lock-step so workers can
/// find an attachment's owning state without the main lock.
///
/// The main lock is held around set mutations together with the decision to
/// start or stop a remote watcher, so two workers cannot double-start or
/// double-stop one. The auxiliary lock is only ever taken after the main
/// lock has been released.
pub struct VnRegistry {
    states: RwLock<HashMap<u32, VnState>>,
    nsn_to_vni: RwLock<HashMap<NsName, u32>>,
    store: Arc<dyn AttachmentStore>,
    queue: Arc<WorkQueue<NsName>>,
    seen: Arc<SeenVnis>,
    root: CancellationToken,
}

impl VnRegistry {
    pub fn new(
        store: Arc<dyn AttachmentStore>,
        queue: Arc<WorkQueue<NsName>>,
        seen: Arc<SeenVnis>,
        root: CancellationToken,
    ) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            nsn_to_vni: RwLock::new(HashMap::new()),
            store,
            queue,
            seen,
            root,
        }
    }

    /// Records that `nsn` currently belongs to the virtual network `vni` as
    /// a local or remote attachment, creating the VN-state (and its remote
    /// watcher) on the first local attachment of a VN and detaching it when
    /// the last local one turns remote. If the attachment was tracked under
    /// a different VNI, it first departs from the old VN-state.
    pub fn note_attachment(&self, nsn: &NsName, is_local: bool, vni: u32) -> VnUpdate {
        if let Some(old_vni) = self.vni_of(nsn)
            && old_vni != vni
        {
            if let Some(state) = self.remove_departed(&nsn.name, old_vni) {
                self.teardown(state, old_vni);
            }
            self.unset_vni(nsn);
        }

        let mut first_local_in_vn = false;
        let update = {
            let mut states = self.states.write().unwrap();
            if is_local {
                let state = states.entry(vni).or_insert_with(|| {
                    first_local_in_vn = true;
                    self.new_state(vni, &nsn.namespace)
                });
                state.remote_atts.remove(&nsn.name);
                state.local_atts.insert(nsn.name.clone());
                VnUpdate::Tracked
            } else if let Some(state) = states.get_mut(&vni) {
                state.remote_atts.insert(nsn.name.clone());
                state.local_atts.remove(&nsn.name);
                if state.local_atts.is_empty() {
                    let state = states.remove(&vni).unwrap();
                    VnUpdate::TornDown(state)
                } else {
                    VnUpdate::Tracked
                }
            } else {
                VnUpdate::NoStateForRemote
            }
        };

        match &update {
            VnUpdate::Tracked => self.set_vni(nsn, vni),
            VnUpdate::TornDown(_) | VnUpdate::NoStateForRemote => self.unset_vni(nsn),
        }
        if first_local_in_vn {
            info!(vni, "virtual network became relevant, remote watch started");
        }
        update
    }

    /// Removes `name` from the VN-state of `vni` after the attachment left
    /// the agent's worldview. If it was the last local attachment of the VN,
    /// the detached state is returned for teardown.
    pub fn remove_departed(&self, name: &str, vni: u32) -> Option<VnState> {
        let mut states = self.states.write().unwrap();
        let state = states.get_mut(&vni)?;
        state.local_atts.remove(name);
        if state.local_atts.is_empty() {
            return states.remove(&vni);
        }
        state.remote_atts.remove(name);
        None
    }

    /// Stops the VN's remote watch and enqueues its remote attachments so
    /// that workers observe their remote state vanish and delete their
    /// interfaces.
    pub fn teardown(&self, state: VnState, vni: u32) {
        state.stop.cancel();
        info!(
            vni,
            namespace = %state.namespace,
            "last local attachment left the virtual network, remote watch stopped"
        );
        for name in state.remote_atts {
            let nsn = NsName::new(state.namespace.clone(), name);
            self.seen.remove(&nsn, vni);
            self.queue.add(nsn);
        }
    }

    pub fn remote_cache(&self, vni: u32) -> Option<AttachmentCache> {
        self.states
            .read()
            .unwrap()
            .get(&vni)
            .map(|state| state.remote_cache.clone())
    }

    /// Snapshot of the live remote caches, for the startup sync to wait on.
    pub fn remote_caches(&self) -> Vec<(u32, AttachmentCache)> {
        self.states
            .read()
            .unwrap()
            .iter()
            .map(|(vni, state)| (*vni, state.remote_cache.clone()))
            .collect()
    }

    pub fn vni_of(&self, nsn: &NsName) -> Option<u32> {
        self.nsn_to_vni.read().unwrap().get(nsn).copied()
    }

    pub fn unset_vni(&self, nsn: &NsName) {
        self.nsn_to_vni.write().unwrap().remove(nsn);
    }

    fn set_vni(&self, nsn: &NsName, vni: u32) {
        self.nsn_to_vni.write().unwrap().insert(nsn.clone(), vni);
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_state(&self, vni: u32, namespace: &str) -> VnState {
        let stop = self.root.child_token();
        let subscriber = Arc::new(RemoteSubscriber {
            vni,
            queue: Arc::clone(&self.queue),
            seen: Arc::clone(&self.seen),
        });
        let remote_cache = self.store.watch_remote(vni, namespace, subscriber, stop.clone());
        VnState {
            namespace: namespace.to_owned(),
            remote_cache,
            stop,
            local_atts: HashSet::new(),
            remote_atts: HashSet::new(),
        }
    }
}

/// Handler of one VN's remote stream: maintains the seen-VNIs tracker and
/// enqueues the attachment on every event.
struct RemoteSubscriber {
    vni: u32,
    queue: Arc<WorkQueue<NsName>>,
    seen: Arc<SeenVnis>,
}

impl CacheSubscriber for RemoteSubscriber {
    fn on_add(&self, att: &Arc<NetworkAttachment>) {
        let nsn = nsn_of(att);
        debug!(vni = self.vni, %nsn, "remote attachment appeared");
        self.seen.add(&nsn, self.vni);
        self.queue.add(nsn);
    }

    fn on_update(&self, _old: &Arc<NetworkAttachment>, new: &Arc<NetworkAttachment>) {
        self.queue.add(nsn_of(new));
    }

    fn on_delete(&self, att: &Arc<NetworkAttachment>) {
        let nsn = nsn_of(att);
        debug!(vni = self.vni, %nsn, "remote attachment left");
        self.seen.remove(&nsn, self.vni);
        self.queue.add(nsn);
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    use futures::future::BoxFuture;

    use super::*;
    use crate::store::WriteOutcome;

    /// Store stub that hands out unwired caches and records the VNIs it was
    /// asked to watch.
    #[derive(Default)]
    struct StubStore {
        watched: Mutex<Vec<u32>>,
    }

    impl AttachmentStore for StubStore {
        fn watch_local(
            &self,
            subscriber: Arc<dyn CacheSubscriber>,
            _stop: CancellationToken,
        ) -> AttachmentCache {
            AttachmentCache::new(subscriber)
        }

        fn watch_remote(
            &self,
            vni: u32,
            _namespace: &str,
            subscriber: Arc<dyn CacheSubscriber>,
            _stop: CancellationToken,
        ) -> AttachmentCache {
            self.watched.lock().unwrap().push(vni);
            AttachmentCache::new(subscriber)
        }

        fn write_status(
            &self,
            _att: Arc<NetworkAttachment>,
            _host_ip: Ipv4Addr,
            _ifc_name: String,
        ) -> BoxFuture<'static, crate::Result<WriteOutcome>> {
            Box::pin(async { Ok(WriteOutcome::Applied) })
        }
    }

    fn registry() -> (Arc<StubStore>, Arc<WorkQueue<NsName>>, Arc<SeenVnis>, VnRegistry) {
        let store = Arc::new(StubStore::default());
        let queue = Arc::new(WorkQueue::new());
        let seen = Arc::new(SeenVnis::new());
        let registry = VnRegistry::new(
            store.clone(),
            queue.clone(),
            seen.clone(),
            CancellationToken::new(),
        );
        (store, queue, seen, registry)
    }

    #[tokio::test]
    async fn test_seen_vnis() {
        let seen = SeenVnis::new();
        let nsn = NsName::new("ns1", "a1");
        assert_eq!(seen.seen(&nsn), (0, None));
        seen.add(&nsn, 42);
        assert_eq!(seen.seen(&nsn), (1, Some(42)));
        seen.add(&nsn, 43);
        assert_eq!(seen.seen(&nsn), (2, None));
        seen.remove(&nsn, 42);
        assert_eq!(seen.seen(&nsn), (1, Some(43)));
        seen.remove(&nsn, 43);
        assert_eq!(seen.seen(&nsn), (0, None));
    }

    #[tokio::test]
    async fn test_first_local_creates_state_last_departure_tears_down() {
        let (store, _queue, _seen, registry) = registry();
        let a1 = NsName::new("ns1", "a1");
        let a2 = NsName::new("ns1", "a2");

        assert!(matches!(registry.note_attachment(&a1, true, 42), VnUpdate::Tracked));
        assert!(matches!(registry.note_attachment(&a2, true, 42), VnUpdate::Tracked));
        // one watch for the vni, created on the first local attachment only
        assert_eq!(*store.watched.lock().unwrap(), vec![42]);
        assert_eq!(registry.vni_of(&a1), Some(42));

        assert!(registry.remove_departed("a1", 42).is_none());
        let state = registry.remove_departed("a2", 42).expect("last local departure");
        assert!(registry.is_empty());
        assert!(state.local_atts.is_empty());
    }

    #[tokio::test]
    async fn test_remote_without_state_is_rejected() {
        let (_store, _queue, _seen, registry) = registry();
        let b1 = NsName::new("ns1", "b1");
        assert!(matches!(
            registry.note_attachment(&b1, false, 42),
            VnUpdate::NoStateForRemote
        ));
        assert_eq!(registry.vni_of(&b1), None);
    }

    #[tokio::test]
    async fn test_local_turning_remote_detaches_state() {
        let (_store, queue, seen, registry) = registry();
        let a1 = NsName::new("ns1", "a1");
        let b1 = NsName::new("ns1", "b1");

        registry.note_attachment(&a1, true, 42);
        registry.note_attachment(&b1, false, 42);
        seen.add(&b1, 42);

        // a1 re-binds to another node: last local turns remote
        let update = registry.note_attachment(&a1, false, 42);
        let VnUpdate::TornDown(state) = update else {
            panic!("expected teardown");
        };
        assert!(registry.is_empty());

        registry.teardown(state, 42);
        // the remote attachment is re-enqueued with its seen entry cleared
        assert_eq!(seen.seen(&b1), (0, None));
        assert_eq!(queue.get().await, Some(b1));
    }

    #[tokio::test]
    async fn test_vni_move_departs_old_state() {
        let (store, _queue, _seen, registry) = registry();
        let a1 = NsName::new("ns1", "a1");
        let a2 = NsName::new("ns1", "a2");

        registry.note_attachment(&a1, true, 42);
        registry.note_attachment(&a2, true, 42);

        // a1 moves to vni 43: state 42 survives on a2, state 43 appears
        registry.note_attachment(&a1, true, 43);
        assert_eq!(registry.vni_of(&a1), Some(43));
        assert_eq!(registry.len(), 2);
        assert_eq!(*store.watched.lock().unwrap(), vec![42, 43]);

        // a2 follows: the last local leaves 42, which is torn down
        registry.note_attachment(&a2, true, 43);
        assert_eq!(registry.len(), 1);
        assert!(registry.remote_cache(42).is_none());
        assert!(registry.remote_cache(43).is_some());
    }
}
