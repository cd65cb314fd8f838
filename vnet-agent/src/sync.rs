use std::time::Duration;

use tracing::{debug, warn};
use vnet_fabric::{LocalNetIfc, RemoteNetIfc};

use crate::Result;
use crate::cache::nsn_of;
use crate::reconcile::ConnectionAgent;

/// How long to wait before retrying a failed fabric operation on a
/// pre-existing interface. Startup cannot proceed while orphans linger, so
/// retries are unbounded.
const FABRIC_RETRY_PERIOD: Duration = Duration::from_secs(1);

impl ConnectionAgent {
    /// One-shot pass pairing the interfaces already on the host with the
    /// attachments the store knows about. Runs after the local cache has
    /// synced and before the workers start, while the agent is still
    /// single-threaded.
    pub(crate) async fn sync_preexisting(&self) -> Result<()> {
        self.sync_preexisting_local().await?;
        self.sync_preexisting_remote().await
    }

    async fn sync_preexisting_local(&self) -> Result<()> {
        let preexisting = self.fabric().list_local_ifcs()?;
        for mut ifc in preexisting {
            let owners = self.local_cache().by_mac(&ifc.guest_mac);
            if owners.len() == 1 {
                // a local attachment with the same derived MAC owns this
                // interface; bind it
                let nsn = nsn_of(&owners[0]);
                let displaced = self.interfaces().local(&nsn);
                debug!(%nsn, name = %ifc.name, "paired pre-existing local interface with attachment");
                self.interfaces().set_local(&nsn, ifc.clone());
                match displaced {
                    // the attachment was already bound; its previous
                    // interface is now an orphan
                    Some(stale) => ifc = stale,
                    None => continue,
                }
            }
            self.delete_local_until_ok(&ifc).await;
        }
        Ok(())
    }

    async fn sync_preexisting_remote(&self) -> Result<()> {
        // Start the remote watch of every relevant VN first: deciding which
        // remote interfaces to keep requires looking up remote attachments.
        for att in self.local_cache().list() {
            let Some(status) = &att.status else { continue };
            let _ = self.vns().note_attachment(&nsn_of(&att), true, status.address_vni);
        }
        for (_vni, cache) in self.vns().remote_caches() {
            cache.ready().await;
        }

        let preexisting = self.fabric().list_remote_ifcs()?;
        for mut ifc in preexisting {
            let owners = match self.vns().remote_cache(ifc.vni) {
                Some(cache) => cache.by_mac(&ifc.guest_mac),
                // no local attachment keeps this VN relevant
                None => Vec::new(),
            };
            if owners.len() == 1 {
                let nsn = nsn_of(&owners[0]);
                let displaced = self.interfaces().remote(&nsn);
                debug!(%nsn, vni = ifc.vni, "paired pre-existing remote interface with attachment");
                self.interfaces().set_remote(&nsn, ifc.clone());
                match displaced {
                    Some(stale) => ifc = stale,
                    None => {
                        // the identity must not keep a local binding too
                        if let Some(stale_local) = self.interfaces().local(&nsn) {
                            self.delete_local_until_ok(&stale_local).await;
                            self.interfaces().unset_local(&nsn);
                        }
                        continue;
                    }
                }
            }
            self.delete_remote_until_ok(&ifc).await;
        }
        Ok(())
    }

    async fn delete_local_until_ok(&self, ifc: &LocalNetIfc) {
        let mut attempt = 1u32;
        while let Err(e) = self.fabric().delete_local_ifc(ifc) {
            warn!(name = %ifc.name, attempt, "deletion of orphan local interface failed: {e}");
            tokio::time::sleep(FABRIC_RETRY_PERIOD).await;
            attempt += 1;
        }
        debug!(name = %ifc.name, "deleted orphan local interface");
    }

    async fn delete_remote_until_ok(&self, ifc: &RemoteNetIfc) {
        let mut attempt = 1u32;
        while let Err(e) = self.fabric().delete_remote_ifc(ifc) {
            warn!(vni = ifc.vni, guest_ip = %ifc.guest_ip, attempt, "deletion of orphan remote interface failed: {e}");
            tokio::time::sleep(FABRIC_RETRY_PERIOD).await;
            attempt += 1;
        }
        debug!(vni = ifc.vni, guest_ip = %ifc.guest_ip, "deleted orphan remote interface");
    }
}
