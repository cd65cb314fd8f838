//! End-to-end exercises of the connection agent against an in-memory store
//! and the logical fabric: watch events go into the caches exactly as the
//! watch pumps would deliver them, and the assertions are on realized
//! fabric state, status write-backs, and the agent's registries.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::HashMap;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use vnet_agent::cache::{AttachmentCache, CacheSubscriber, NsName, nsn_of};
use vnet_agent::mac::{derive_mac, ifc_name};
use vnet_agent::metrics::AgentMetrics;
use vnet_agent::reconcile::ConnectionAgent;
use vnet_agent::store::{AttachmentStore, WriteOutcome};
use vnet_crds::v1alpha1::attachment::{
    NetworkAttachment, NetworkAttachmentSpec, NetworkAttachmentStatus,
};
use vnet_fabric::logical::LogicalFabric;
use vnet_fabric::{Fabric, LocalNetIfc, RemoteNetIfc};

const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const OTHER_HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

#[derive(Default)]
struct TestStoreInner {
    local: Mutex<Option<AttachmentCache>>,
    initial_local: Mutex<Vec<Arc<NetworkAttachment>>>,
    remotes: Mutex<HashMap<u32, AttachmentCache>>,
    initial_remote: Mutex<HashMap<u32, Vec<Arc<NetworkAttachment>>>>,
    status_writes: Mutex<Vec<(NsName, String, String)>>,
    conflicts: Mutex<u32>,
}

/// In-memory store: watches come up synced with the seeded objects, status
/// writes are recorded and looped back into the local cache the way the
/// resulting watch event would be.
#[derive(Clone, Default)]
struct TestStore {
    inner: Arc<TestStoreInner>,
}

impl TestStore {
    fn seed_local(&self, att: Arc<NetworkAttachment>) {
        self.inner.initial_local.lock().unwrap().push(att);
    }

    fn seed_remote(&self, vni: u32, att: Arc<NetworkAttachment>) {
        self.inner
            .initial_remote
            .lock()
            .unwrap()
            .entry(vni)
            .or_default()
            .push(att);
    }

    fn fail_next_write_with_conflict(&self) {
        *self.inner.conflicts.lock().unwrap() += 1;
    }

    fn local(&self) -> AttachmentCache {
        self.inner.local.lock().unwrap().clone().expect("local watch started")
    }

    fn remote(&self, vni: u32) -> Option<AttachmentCache> {
        self.inner.remotes.lock().unwrap().get(&vni).cloned()
    }

    fn status_writes(&self) -> Vec<(NsName, String, String)> {
        self.inner.status_writes.lock().unwrap().clone()
    }
}

impl AttachmentStore for TestStore {
    fn watch_local(
        &self,
        subscriber: Arc<dyn CacheSubscriber>,
        _stop: CancellationToken,
    ) -> AttachmentCache {
        let cache = AttachmentCache::new(subscriber);
        for att in self.inner.initial_local.lock().unwrap().drain(..) {
            cache.apply(att);
        }
        cache.mark_ready();
        *self.inner.local.lock().unwrap() = Some(cache.clone());
        cache
    }

    fn watch_remote(
        &self,
        vni: u32,
        _namespace: &str,
        subscriber: Arc<dyn CacheSubscriber>,
        _stop: CancellationToken,
    ) -> AttachmentCache {
        let cache = AttachmentCache::new(subscriber);
        let initial = self
            .inner
            .initial_remote
            .lock()
            .unwrap()
            .remove(&vni)
            .unwrap_or_default();
        for att in initial {
            cache.apply(att);
        }
        cache.mark_ready();
        self.inner.remotes.lock().unwrap().insert(vni, cache.clone());
        cache
    }

    fn write_status(
        &self,
        att: Arc<NetworkAttachment>,
        host_ip: Ipv4Addr,
        ifc_name: String,
    ) -> BoxFuture<'static, vnet_agent::Result<WriteOutcome>> {
        let store = self.clone();
        Box::pin(async move {
            {
                let mut conflicts = store.inner.conflicts.lock().unwrap();
                if *conflicts > 0 {
                    *conflicts -= 1;
                    return Ok(WriteOutcome::Conflict);
                }
            }
            let mut updated = (*att).clone();
            let status = updated.status.get_or_insert_with(Default::default);
            status.host_ip = host_ip.to_string();
            status.ifc_name = ifc_name.clone();
            store.inner.status_writes.lock().unwrap().push((
                nsn_of(&att),
                host_ip.to_string(),
                ifc_name,
            ));
            // the accepted write comes back as a watch event
            let local = store.inner.local.lock().unwrap().clone();
            if let Some(cache) = local {
                cache.apply(Arc::new(updated));
            }
            Ok(WriteOutcome::Applied)
        })
    }
}

/// Fabric decorator whose next local creations fail with a driver error.
struct FlakyFabric {
    inner: LogicalFabric,
    create_failures: Mutex<u32>,
    create_attempts: Mutex<u32>,
}

impl FlakyFabric {
    fn failing_once() -> Self {
        Self {
            inner: LogicalFabric::new(),
            create_failures: Mutex::new(1),
            create_attempts: Mutex::new(0),
        }
    }
}

impl Fabric for FlakyFabric {
    fn name(&self) -> &str {
        "flaky"
    }

    fn create_local_ifc(&self, ifc: &LocalNetIfc) -> vnet_fabric::Result<()> {
        *self.create_attempts.lock().unwrap() += 1;
        let mut failures = self.create_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(vnet_fabric::Error::Driver("transient".into()));
        }
        self.inner.create_local_ifc(ifc)
    }

    fn delete_local_ifc(&self, ifc: &LocalNetIfc) -> vnet_fabric::Result<()> {
        self.inner.delete_local_ifc(ifc)
    }

    fn create_remote_ifc(&self, ifc: &RemoteNetIfc) -> vnet_fabric::Result<()> {
        self.inner.create_remote_ifc(ifc)
    }

    fn delete_remote_ifc(&self, ifc: &RemoteNetIfc) -> vnet_fabric::Result<()> {
        self.inner.delete_remote_ifc(ifc)
    }

    fn list_local_ifcs(&self) -> vnet_fabric::Result<Vec<LocalNetIfc>> {
        self.inner.list_local_ifcs()
    }

    fn list_remote_ifcs(&self) -> vnet_fabric::Result<Vec<RemoteNetIfc>> {
        self.inner.list_remote_ifcs()
    }
}

fn att(name: &str, node: &str, vni: u32, ipv4: &str, host_ip: &str) -> Arc<NetworkAttachment> {
    let mut att = NetworkAttachment::new(
        name,
        NetworkAttachmentSpec {
            node: node.into(),
            subnet: "s1".into(),
            ..Default::default()
        },
    );
    att.metadata.namespace = Some("ns1".into());
    att.status = Some(NetworkAttachmentStatus {
        address_vni: vni,
        ipv4: ipv4.into(),
        host_ip: host_ip.into(),
        ..Default::default()
    });
    Arc::new(att)
}

struct Harness {
    agent: Arc<ConnectionAgent>,
    store: TestStore,
    cancel: CancellationToken,
    run: tokio::task::JoinHandle<vnet_agent::Result<()>>,
}

impl Harness {
    fn start(store: TestStore, fabric: Arc<dyn Fabric>) -> Self {
        let cancel = CancellationToken::new();
        let agent = Arc::new(ConnectionAgent::new(
            "n1".into(),
            HOST_IP,
            2,
            Arc::new(store.clone()),
            fabric,
            AgentMetrics::default(),
            cancel.clone(),
        ));
        let run = tokio::spawn(Arc::clone(&agent).run());
        Self {
            agent,
            store,
            cancel,
            run,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.run.await.expect("agent task").expect("agent run");
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting until {what}");
}

/// Lets in-flight work drain so that "nothing changed" assertions mean
/// something.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

#[tokio::test]
async fn test_lone_local_create() {
    let fabric = Arc::new(LogicalFabric::new());
    let h = Harness::start(TestStore::default(), fabric.clone());

    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));

    wait_until("local interface realized", || {
        fabric.list_local_ifcs().unwrap().len() == 1
    })
    .await;

    let mac = derive_mac(42, "192.168.1.7".parse().unwrap());
    let expected = LocalNetIfc {
        name: ifc_name(mac),
        vni: 42,
        guest_mac: mac,
        guest_ip: "192.168.1.7".parse().unwrap(),
        host_ip: HOST_IP,
    };
    assert_eq!(fabric.list_local_ifcs().unwrap(), vec![expected.clone()]);

    wait_until("status write-back", || !h.store.status_writes().is_empty()).await;
    assert_eq!(
        h.store.status_writes(),
        vec![(NsName::new("ns1", "a1"), "10.0.0.1".into(), expected.name.clone())]
    );
    assert!(h.agent.vns().remote_cache(42).is_some());
    assert_eq!(h.agent.interfaces().local(&NsName::new("ns1", "a1")), Some(expected));

    // the accepted write came back as an event; a converged attachment must
    // not be written again
    settle().await;
    assert_eq!(h.store.status_writes().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_remote_follows_local() {
    let fabric = Arc::new(LogicalFabric::new());
    let h = Harness::start(TestStore::default(), fabric.clone());

    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    wait_until("remote watch for the VN", || h.store.remote(42).is_some()).await;

    h.store
        .remote(42)
        .unwrap()
        .apply(att("b1", "n2", 42, "192.168.1.8", "10.0.0.2"));

    wait_until("remote interface realized", || {
        fabric.list_remote_ifcs().unwrap().len() == 1
    })
    .await;

    let mac = derive_mac(42, "192.168.1.8".parse().unwrap());
    assert_eq!(
        fabric.list_remote_ifcs().unwrap(),
        vec![RemoteNetIfc {
            vni: 42,
            guest_mac: mac,
            guest_ip: "192.168.1.8".parse().unwrap(),
            host_ip: OTHER_HOST_IP,
        }]
    );
    // the local interface is untouched and b1 triggered no write-back
    assert_eq!(fabric.list_local_ifcs().unwrap().len(), 1);
    settle().await;
    assert_eq!(h.store.status_writes().len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_local_deletion_tears_down_vn() {
    let fabric = Arc::new(LogicalFabric::new());
    let h = Harness::start(TestStore::default(), fabric.clone());

    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    wait_until("remote watch for the VN", || h.store.remote(42).is_some()).await;
    h.store
        .remote(42)
        .unwrap()
        .apply(att("b1", "n2", 42, "192.168.1.8", "10.0.0.2"));
    wait_until("both interfaces realized", || {
        fabric.list_local_ifcs().unwrap().len() == 1 && fabric.list_remote_ifcs().unwrap().len() == 1
    })
    .await;

    h.store.local().remove(&NsName::new("ns1", "a1"));

    wait_until("all interfaces removed", || {
        fabric.list_local_ifcs().unwrap().is_empty() && fabric.list_remote_ifcs().unwrap().is_empty()
    })
    .await;
    assert!(h.agent.interfaces().is_empty());
    assert!(h.agent.vns().is_empty());
    assert!(h.agent.vns().remote_cache(42).is_none());

    h.stop().await;
}

#[tokio::test]
async fn test_ambiguity_on_node_move() {
    let fabric = Arc::new(LogicalFabric::new());
    let h = Harness::start(TestStore::default(), fabric.clone());

    // a2 keeps the VN relevant after a1 moves away
    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    h.store.local().apply(att("a2", "n1", 42, "192.168.1.9", ""));
    wait_until("local interfaces realized", || {
        fabric.list_local_ifcs().unwrap().len() == 2
    })
    .await;

    // a1 re-binds to n2: the remote stream sees it while the local cache
    // still holds the stale version
    wait_until("remote watch for the VN", || h.store.remote(42).is_some()).await;
    h.store
        .remote(42)
        .unwrap()
        .apply(att("a1", "n2", 42, "192.168.1.7", "10.0.0.2"));

    // while ambiguous nothing may happen to a1
    settle().await;
    assert_eq!(fabric.list_local_ifcs().unwrap().len(), 2);
    assert!(fabric.list_remote_ifcs().unwrap().is_empty());

    // the resolving delete arrives on the local stream
    h.store.local().remove(&NsName::new("ns1", "a1"));

    wait_until("a1 reconciled to a remote interface", || {
        fabric.list_remote_ifcs().unwrap().len() == 1
    })
    .await;
    let a1 = NsName::new("ns1", "a1");
    assert_eq!(fabric.list_local_ifcs().unwrap().len(), 1);
    assert!(h.agent.interfaces().local(&a1).is_none());
    assert!(h.agent.interfaces().remote(&a1).is_some());

    h.stop().await;
}

#[tokio::test]
async fn test_transient_fabric_failure_is_retried() {
    let fabric = Arc::new(FlakyFabric::failing_once());
    let h = Harness::start(TestStore::default(), fabric.clone());

    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));

    wait_until("local interface realized after retry", || {
        fabric.list_local_ifcs().unwrap().len() == 1
    })
    .await;
    assert!(*fabric.create_attempts.lock().unwrap() >= 2);

    wait_until("status write-back", || !h.store.status_writes().is_empty()).await;
    let mac = derive_mac(42, "192.168.1.7".parse().unwrap());
    assert_eq!(fabric.list_local_ifcs().unwrap()[0].name, ifc_name(mac));

    h.stop().await;
}

#[tokio::test]
async fn test_startup_deletes_orphan() {
    let fabric = Arc::new(LogicalFabric::new());
    let orphan_mac = derive_mac(99, "172.16.0.9".parse().unwrap());
    fabric
        .create_local_ifc(&LocalNetIfc {
            name: ifc_name(orphan_mac),
            vni: 99,
            guest_mac: orphan_mac,
            guest_ip: "172.16.0.9".parse().unwrap(),
            host_ip: HOST_IP,
        })
        .unwrap();

    let h = Harness::start(TestStore::default(), fabric.clone());

    wait_until("orphan deleted", || fabric.list_local_ifcs().unwrap().is_empty()).await;
    assert!(h.agent.interfaces().is_empty());

    // workers are up and reconcile normally after the orphan pass
    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    wait_until("local interface realized", || {
        fabric.list_local_ifcs().unwrap().len() == 1
    })
    .await;

    h.stop().await;
}

#[tokio::test]
async fn test_startup_pairs_surviving_interfaces() {
    let fabric = Arc::new(LogicalFabric::new());
    let a1_mac = derive_mac(42, "192.168.1.7".parse().unwrap());
    let a1_ifc = LocalNetIfc {
        name: ifc_name(a1_mac),
        vni: 42,
        guest_mac: a1_mac,
        guest_ip: "192.168.1.7".parse().unwrap(),
        host_ip: HOST_IP,
    };
    let b1_mac = derive_mac(42, "192.168.1.8".parse().unwrap());
    let b1_ifc = RemoteNetIfc {
        vni: 42,
        guest_mac: b1_mac,
        guest_ip: "192.168.1.8".parse().unwrap(),
        host_ip: OTHER_HOST_IP,
    };
    let stray = RemoteNetIfc {
        vni: 77,
        guest_mac: derive_mac(77, "192.168.9.9".parse().unwrap()),
        guest_ip: "192.168.9.9".parse().unwrap(),
        host_ip: OTHER_HOST_IP,
    };
    fabric.create_local_ifc(&a1_ifc).unwrap();
    fabric.create_remote_ifc(&b1_ifc).unwrap();
    fabric.create_remote_ifc(&stray).unwrap();

    let store = TestStore::default();
    store.seed_local(att("a1", "n1", 42, "192.168.1.7", "10.0.0.1"));
    store.seed_remote(42, att("b1", "n2", 42, "192.168.1.8", "10.0.0.2"));

    let h = Harness::start(store, fabric.clone());

    // the stray interface has no VN-state and goes away; the paired ones stay
    wait_until("stray remote interface deleted", || {
        fabric.list_remote_ifcs().unwrap().len() == 1
    })
    .await;
    settle().await;
    assert_eq!(fabric.list_local_ifcs().unwrap(), vec![a1_ifc.clone()]);
    assert_eq!(fabric.list_remote_ifcs().unwrap(), vec![b1_ifc.clone()]);
    assert_eq!(h.agent.interfaces().local(&NsName::new("ns1", "a1")), Some(a1_ifc));
    assert_eq!(h.agent.interfaces().remote(&NsName::new("ns1", "b1")), Some(b1_ifc));

    h.stop().await;
}

#[tokio::test]
async fn test_vni_move_converges_to_single_interface() {
    let fabric = Arc::new(LogicalFabric::new());
    let h = Harness::start(TestStore::default(), fabric.clone());

    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    wait_until("interface at the first VNI", || {
        fabric.list_local_ifcs().unwrap().len() == 1
    })
    .await;

    h.store.local().apply(att("a1", "n1", 43, "192.168.1.7", ""));

    let mac43 = derive_mac(43, "192.168.1.7".parse().unwrap());
    wait_until("interface moved to the second VNI", || {
        let ifcs = fabric.list_local_ifcs().unwrap();
        ifcs.len() == 1 && ifcs[0].vni == 43
    })
    .await;
    assert_eq!(fabric.list_local_ifcs().unwrap()[0].name, ifc_name(mac43));
    assert!(h.agent.vns().remote_cache(42).is_none());
    assert!(h.agent.vns().remote_cache(43).is_some());

    h.stop().await;
}

#[tokio::test]
async fn test_add_then_delete_restores_pre_state() {
    let fabric = Arc::new(LogicalFabric::new());
    let h = Harness::start(TestStore::default(), fabric.clone());

    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    wait_until("interface realized", || {
        fabric.list_local_ifcs().unwrap().len() == 1
    })
    .await;

    h.store.local().remove(&NsName::new("ns1", "a1"));
    wait_until("interface removed", || {
        fabric.list_local_ifcs().unwrap().is_empty()
    })
    .await;
    assert!(fabric.list_remote_ifcs().unwrap().is_empty());
    assert!(h.agent.interfaces().is_empty());
    assert!(h.agent.vns().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_status_write_conflict_is_benign() {
    let fabric = Arc::new(LogicalFabric::new());
    let store = TestStore::default();
    store.fail_next_write_with_conflict();
    let h = Harness::start(store, fabric.clone());

    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    wait_until("interface realized", || {
        fabric.list_local_ifcs().unwrap().len() == 1
    })
    .await;

    // the conflicted write is not retried by the agent itself
    settle().await;
    assert!(h.store.status_writes().is_empty());

    // the winning writer's event triggers the next round
    h.store.local().apply(att("a1", "n1", 42, "192.168.1.7", ""));
    wait_until("status written after the conflict", || {
        !h.store.status_writes().is_empty()
    })
    .await;

    h.stop().await;
}
