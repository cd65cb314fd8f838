use std::net::Ipv4Addr;
use std::pin::pin;
use std::sync::Arc;

use ahash::{HashSet, HashSetExt};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use kube::api::PostParams;
use kube::runtime::watcher::{self, Event, watcher};
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};
use vnet_crds::v1alpha1::attachment::NetworkAttachment;

use crate::cache::{AttachmentCache, CacheSubscriber, NsName, nsn_of};
use crate::{Error, Result};

// NetworkAttachment field names used to build field selectors.
const ATT_NODE_FIELD: &str = "spec.node";
const ATT_IP_FIELD: &str = "status.ipv4";
const ATT_HOST_IP_FIELD: &str = "status.hostIP";
const ATT_VNI_FIELD: &str = "status.addressVNI";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteOutcome {
    Applied,
    /// The optimistic update lost a concurrency race; the winning write will
    /// produce a watch event that re-enqueues the attachment.
    Conflict,
}

/// The agent's seam to the object store: filtered attachment watch streams
/// and the status write-back.
pub trait AttachmentStore: Send + Sync + 'static {
    /// Starts the watch over the attachments bound to this node that have a
    /// guest address, feeding a fresh cache. Must not block; the returned
    /// cache signals readiness once the initial list is in.
    fn watch_local(
        &self,
        subscriber: Arc<dyn CacheSubscriber>,
        stop: CancellationToken,
    ) -> AttachmentCache;

    /// Starts the watch over the attachments of one virtual network that are
    /// bound to other nodes. Must not block.
    fn watch_remote(
        &self,
        vni: u32,
        namespace: &str,
        subscriber: Arc<dyn CacheSubscriber>,
        stop: CancellationToken,
    ) -> AttachmentCache;

    /// Writes `status.hostIP` and `status.ifcName` of `att` with optimistic
    /// concurrency.
    fn write_status(
        &self,
        att: Arc<NetworkAttachment>,
        host_ip: Ipv4Addr,
        ifc_name: String,
    ) -> BoxFuture<'static, Result<WriteOutcome>>;
}

/// Store client backed by the Kubernetes API.
pub struct KubeStore {
    client: kube::Client,
    node_name: String,
    host_ip: Ipv4Addr,
}

impl KubeStore {
    pub fn new(client: kube::Client, node_name: String, host_ip: Ipv4Addr) -> Self {
        Self {
            client,
            node_name,
            host_ip,
        }
    }

    /// Selector matching attachments that run on this node and have a guest
    /// address.
    fn local_selector(&self) -> String {
        format!("{ATT_NODE_FIELD}={},{ATT_IP_FIELD}!=", self.node_name)
    }

    /// Selector matching attachments of the virtual network `vni` that run
    /// on other nodes and have both addresses set. The host-IP clause keeps
    /// an attachment that still carries this node's host IP after a re-bind
    /// out of the remote stream, where it could otherwise briefly appear.
    fn remote_selector(&self, vni: u32) -> String {
        format!(
            "{ATT_NODE_FIELD}!={},{ATT_HOST_IP_FIELD}!={},{ATT_IP_FIELD}!=,{ATT_HOST_IP_FIELD}!=,{ATT_VNI_FIELD}={vni}",
            self.node_name, self.host_ip,
        )
    }
}

impl AttachmentStore for KubeStore {
    fn watch_local(
        &self,
        subscriber: Arc<dyn CacheSubscriber>,
        stop: CancellationToken,
    ) -> AttachmentCache {
        let api: Api<NetworkAttachment> = Api::all(self.client.clone());
        let cfg = watcher::Config::default().fields(&self.local_selector());
        let cache = AttachmentCache::new(subscriber);
        let stream = watcher(api, cfg).default_backoff();
        tokio::spawn(run_cache_pump(stream, cache.clone(), stop));
        cache
    }

    fn watch_remote(
        &self,
        vni: u32,
        namespace: &str,
        subscriber: Arc<dyn CacheSubscriber>,
        stop: CancellationToken,
    ) -> AttachmentCache {
        let api: Api<NetworkAttachment> = Api::namespaced(self.client.clone(), namespace);
        let cfg = watcher::Config::default().fields(&self.remote_selector(vni));
        let cache = AttachmentCache::new(subscriber);
        let stream = watcher(api, cfg).default_backoff();
        tokio::spawn(run_cache_pump(stream, cache.clone(), stop));
        cache
    }

    fn write_status(
        &self,
        att: Arc<NetworkAttachment>,
        host_ip: Ipv4Addr,
        ifc_name: String,
    ) -> BoxFuture<'static, Result<WriteOutcome>> {
        let api: Api<NetworkAttachment> = Api::namespaced(
            self.client.clone(),
            &att.namespace().unwrap_or_default(),
        );
        Box::pin(async move {
            let mut updated = (*att).clone();
            let status = updated.status.get_or_insert_with(Default::default);
            status.host_ip = host_ip.to_string();
            status.ifc_name = ifc_name;
            let data = serde_json::to_vec(&updated)?;
            match api
                .replace_status(&updated.name_any(), &PostParams::default(), data)
                .await
            {
                Ok(_) => Ok(WriteOutcome::Applied),
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(WriteOutcome::Conflict),
                Err(e) => Err(Error::KubeError(e)),
            }
        })
    }
}

/// Drives one watch stream into its cache until the stream ends or `stop`
/// fires. A re-list (`Init` .. `InitDone`) is reconciled against the cache
/// so that deletions missed while the watch was down surface as delete
/// events.
pub async fn run_cache_pump<S>(stream: S, cache: AttachmentCache, stop: CancellationToken)
where
    S: Stream<Item = std::result::Result<Event<NetworkAttachment>, watcher::Error>> + Send,
{
    let mut stream = pin!(stream);
    let mut relist: Option<HashSet<NsName>> = None;
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        trace!("received event: {:?}", event);
        match event {
            Ok(Event::Init) => relist = Some(HashSet::new()),
            Ok(Event::InitApply(att)) => {
                let att = Arc::new(att);
                if let Some(seen) = &mut relist {
                    seen.insert(nsn_of(&att));
                }
                cache.apply(att);
            }
            Ok(Event::InitDone) => {
                if let Some(seen) = relist.take() {
                    cache.retain_keys(&seen);
                }
                cache.mark_ready();
            }
            Ok(Event::Apply(att)) => cache.apply(Arc::new(att)),
            Ok(Event::Delete(att)) => cache.remove(&nsn_of(&att)),
            Err(e) => {
                // the watcher backs off and re-lists on its own
                error!(%e, "attachment watch stream error");
            }
        }
    }
}
