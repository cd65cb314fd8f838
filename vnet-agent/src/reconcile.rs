use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vnet_crds::v1alpha1::attachment::NetworkAttachment;
use vnet_fabric::{Fabric, LocalNetIfc, MacAddr, RemoteNetIfc};

use crate::cache::{AttachmentCache, CacheSubscriber, NsName, nsn_of};
use crate::ifc::IfcRegistry;
use crate::mac::{derive_mac, ifc_name};
use crate::metrics::{AgentMetrics, OutcomeLabels};
use crate::queue::WorkQueue;
use crate::store::{AttachmentStore, WriteOutcome};
use crate::vn::{SeenVnis, VnRegistry, VnUpdate};
use crate::{Error, Result};

/// The per-node connection agent. It keeps the node's interfaces in sync
/// with the attachments that are relevant to the node: the ones bound to it,
/// and the ones sharing a virtual network with at least one of those. Watch
/// events flow into a work queue of attachment identities; a pool of workers
/// drains the queue and drives the fabric toward the observed state.
pub struct ConnectionAgent {
    node_name: String,
    host_ip: Ipv4Addr,
    worker_count: usize,
    store: Arc<dyn AttachmentStore>,
    fabric: Arc<dyn Fabric>,
    queue: Arc<WorkQueue<NsName>>,
    local_cache: AttachmentCache,
    vns: VnRegistry,
    seen: Arc<SeenVnis>,
    ifcs: IfcRegistry,
    metrics: AgentMetrics,
    root: CancellationToken,
}

/// What a worker resolved an enqueued identity to.
enum Effective {
    /// Observed by more than one stream at once; wait for the resolving
    /// delete, which re-enqueues.
    Ambiguous,
    Attachment(Arc<NetworkAttachment>),
    Deleted,
}

impl ConnectionAgent {
    pub fn new(
        node_name: String,
        host_ip: Ipv4Addr,
        worker_count: usize,
        store: Arc<dyn AttachmentStore>,
        fabric: Arc<dyn Fabric>,
        metrics: AgentMetrics,
        root: CancellationToken,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new());
        let seen = Arc::new(SeenVnis::new());
        let local_cache = store.watch_local(
            Arc::new(LocalSubscriber {
                queue: Arc::clone(&queue),
            }),
            root.child_token(),
        );
        let vns = VnRegistry::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&seen),
            root.clone(),
        );
        Self {
            node_name,
            host_ip,
            worker_count,
            store,
            fabric,
            queue,
            local_cache,
            vns,
            seen,
            ifcs: IfcRegistry::new(),
            metrics,
            root,
        }
    }

    pub fn interfaces(&self) -> &IfcRegistry {
        &self.ifcs
    }

    pub fn vns(&self) -> &VnRegistry {
        &self.vns
    }

    pub(crate) fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    pub(crate) fn local_cache(&self) -> &AttachmentCache {
        &self.local_cache
    }

    /// Runs the agent until the root token is cancelled: waits for the local
    /// cache to sync, reconciles pre-existing host interfaces, then spawns
    /// the workers.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tokio::select! {
            _ = self.root.cancelled() => return Ok(()),
            _ = self.local_cache.ready() => {}
        }
        info!("local attachments cache synced");

        tokio::select! {
            _ = self.root.cancelled() => return Ok(()),
            res = self.sync_preexisting() => res?,
        }
        info!("pre-existing interfaces synced");

        let mut workers = Vec::with_capacity(self.worker_count);
        for worker in 0..self.worker_count {
            workers.push(tokio::spawn(Arc::clone(&self).worker(worker)));
        }
        info!("launched {} workers", self.worker_count);

        self.root.cancelled().await;
        self.queue.shut_down();
        for handle in workers {
            let _ = handle.await;
        }
        Ok(())
    }

    async fn worker(self: Arc<Self>, worker: usize) {
        while let Some(nsn) = self.queue.get().await {
            let result = self.reconcile(&nsn).await;
            let requeues = self.queue.requeues(&nsn);
            match result {
                Ok(()) => {
                    debug!(worker, %nsn, requeues, "finished attachment");
                    self.metrics
                        .reconciles
                        .get_or_create(&OutcomeLabels::ok())
                        .inc();
                    self.queue.forget(&nsn);
                }
                Err(e) => {
                    warn!(
                        worker,
                        %nsn,
                        requeues,
                        "failed processing attachment, requeuing: {e}"
                    );
                    self.metrics
                        .reconciles
                        .get_or_create(&OutcomeLabels::error())
                        .inc();
                    self.queue.add_rate_limited(nsn.clone());
                }
            }
            self.queue.done(&nsn);
            self.metrics.virtual_networks.set(self.vns.len() as i64);
            self.metrics.local_ifcs.set(self.ifcs.local_count() as i64);
            self.metrics.remote_ifcs.set(self.ifcs.remote_count() as i64);
        }
    }

    pub async fn reconcile(&self, nsn: &NsName) -> Result<()> {
        match self.effective_attachment(nsn) {
            Effective::Ambiguous => Ok(()),
            Effective::Attachment(att) => self.process_existing(nsn, att).await,
            Effective::Deleted => self.process_deleted(nsn),
        }
    }

    /// Resolves the current state of an attachment across the streams that
    /// may be observing it. The state is equivocal while the attachment has
    /// been seen under several VNIs, or by the local stream and a remote
    /// stream at once; both resolve with a future delete event, so no retry
    /// is scheduled here.
    fn effective_attachment(&self, nsn: &NsName) -> Effective {
        let (vni_count, only_vni) = self.seen.seen(nsn);
        if vni_count > 1 {
            debug!(%nsn, vni_count, "attachment seen under several VNIs, leaving it alone");
            return Effective::Ambiguous;
        }

        let as_remote = only_vni
            .and_then(|vni| self.vns.remote_cache(vni))
            .and_then(|cache| cache.get(nsn));
        let as_local = self.local_cache.get(nsn);

        match (as_local, as_remote) {
            (Some(_), Some(_)) => {
                debug!(%nsn, "attachment in both the local and a remote cache, leaving it alone");
                Effective::Ambiguous
            }
            (Some(att), None) | (None, Some(att)) => Effective::Attachment(att),
            (None, None) => Effective::Deleted,
        }
    }

    async fn process_existing(&self, nsn: &NsName, att: Arc<NetworkAttachment>) -> Result<()> {
        let status = att
            .status
            .as_ref()
            .ok_or_else(|| Error::MissingStatus(nsn.to_string()))?;
        let vni = status.address_vni;
        let is_local = att.spec.node == self.node_name;

        match self.vns.note_attachment(nsn, is_local, vni) {
            VnUpdate::TornDown(state) => {
                // the attachment turned remote and was the last local one of
                // its VN, so the whole VN stops being relevant to this node
                self.vns.teardown(state, vni);
                return Ok(());
            }
            VnUpdate::NoStateForRemote => {
                // the VN-state vanished between the cache lookup and here;
                // nothing guarantees this identity is enqueued for deletion
                self.seen.remove(nsn, vni);
                return self.process_deleted(nsn);
            }
            VnUpdate::Tracked => {}
        }

        let guest_ip: Ipv4Addr = status.ipv4.parse().map_err(|_| Error::BadAddress {
            nsn: nsn.to_string(),
            field: "status.ipv4",
            value: status.ipv4.clone(),
        })?;
        let host_ip = if is_local {
            self.host_ip
        } else {
            status.host_ip.parse().map_err(|_| Error::BadAddress {
                nsn: nsn.to_string(),
                field: "status.hostIP",
                value: status.host_ip.clone(),
            })?
        };
        let mac = derive_mac(vni, guest_ip);
        self.ensure_ifc(nsn, vni, mac, guest_ip, host_ip)?;

        if is_local {
            let desired_name = ifc_name(mac);
            let host_ip_str = self.host_ip.to_string();
            if status.host_ip != host_ip_str || status.ifc_name != desired_name {
                match self
                    .store
                    .write_status(Arc::clone(&att), self.host_ip, desired_name.clone())
                    .await?
                {
                    WriteOutcome::Applied => {
                        info!(%nsn, host_ip = %host_ip_str, name = %desired_name, "updated attachment status")
                    }
                    WriteOutcome::Conflict => {
                        // benign: the winning write produces an event that
                        // re-enqueues this attachment
                        debug!(%nsn, "attachment status update conflicted")
                    }
                }
            }
        }
        Ok(())
    }

    fn process_deleted(&self, nsn: &NsName) -> Result<()> {
        if let Some(vni) = self.vns.vni_of(nsn) {
            if let Some(state) = self.vns.remove_departed(&nsn.name, vni) {
                self.vns.teardown(state, vni);
            }
            self.vns.unset_vni(nsn);
        }

        if let Some(ifc) = self.ifcs.local(nsn) {
            self.fabric.delete_local_ifc(&ifc)?;
            self.ifcs.unset_local(nsn);
            debug!(%nsn, name = %ifc.name, "deleted local interface");
            return Ok(());
        }
        if let Some(ifc) = self.ifcs.remote(nsn) {
            self.fabric.delete_remote_ifc(&ifc)?;
            self.ifcs.unset_remote(nsn);
            debug!(%nsn, vni = ifc.vni, "deleted remote interface");
        }
        Ok(())
    }

    /// Brings the realized interface of `nsn` in line with the observed
    /// addresses: deletes a stale realization first, then creates the right
    /// kind. The stale delete must come first so that the fabric never sees
    /// two interfaces with one (VNI, guest IP) pair.
    fn ensure_ifc(
        &self,
        nsn: &NsName,
        vni: u32,
        mac: MacAddr,
        guest_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
    ) -> Result<()> {
        let old_local = self.ifcs.local(nsn);
        let old_remote = self.ifcs.remote(nsn);
        let up_to_date = match (&old_local, &old_remote) {
            (Some(ifc), _) => ifc.host_ip == host_ip && ifc.guest_mac == mac,
            (None, Some(ifc)) => ifc.host_ip == host_ip && ifc.guest_mac == mac,
            (None, None) => false,
        };
        if up_to_date {
            return Ok(());
        }

        if let Some(stale) = old_local {
            self.fabric.delete_local_ifc(&stale)?;
            self.ifcs.unset_local(nsn);
        } else if let Some(stale) = old_remote {
            self.fabric.delete_remote_ifc(&stale)?;
            self.ifcs.unset_remote(nsn);
        }

        if host_ip == self.host_ip {
            let ifc = LocalNetIfc {
                name: ifc_name(mac),
                vni,
                guest_mac: mac,
                guest_ip,
                host_ip,
            };
            self.fabric.create_local_ifc(&ifc)?;
            debug!(%nsn, name = %ifc.name, vni, "created local interface");
            self.ifcs.set_local(nsn, ifc);
        } else {
            let ifc = RemoteNetIfc {
                vni,
                guest_mac: mac,
                guest_ip,
                host_ip,
            };
            self.fabric.create_remote_ifc(&ifc)?;
            debug!(%nsn, vni, %host_ip, "created remote interface");
            self.ifcs.set_remote(nsn, ifc);
        }
        Ok(())
    }
}

/// Handler of the local stream: every event re-enqueues the attachment.
struct LocalSubscriber {
    queue: Arc<WorkQueue<NsName>>,
}

impl CacheSubscriber for LocalSubscriber {
    fn on_add(&self, att: &Arc<NetworkAttachment>) {
        self.queue.add(nsn_of(att));
    }

    fn on_update(&self, _old: &Arc<NetworkAttachment>, new: &Arc<NetworkAttachment>) {
        self.queue.add(nsn_of(new));
    }

    fn on_delete(&self, att: &Arc<NetworkAttachment>) {
        self.queue.add(nsn_of(att));
    }
}
