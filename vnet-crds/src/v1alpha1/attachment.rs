use kube::{CustomResource, KubeSchema};
use serde::{Deserialize, Serialize};

pub const NAME_GROUP_NETWORK_ATTACHMENT: &str = "networkattachments.network.vnet.dev";

/// A NetworkAttachment is a logical guest endpoint (VM or container NIC) on a
/// virtual network. The spec binds the attachment to a node and a subnet; the
/// address fields of the status are filled in by the IPAM controller and the
/// host-side fields by the connection agent of the attachment's node.
#[derive(
    CustomResource, KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug,
)]
#[kube(
    group = "network.vnet.dev",
    version = "v1alpha1",
    kind = "NetworkAttachment",
    status = "NetworkAttachmentStatus",
    derive = "Default",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentSpec {
    /// Node is the name of the node where the attachment should appear.
    /// Immutable.
    pub node: String,

    /// Subnet is the object name of the subnet of this attachment. A subnet
    /// is confined to one namespace and one virtual network. Immutable.
    pub subnet: String,

    /// PostCreateExec is a command run in the connection agent's container
    /// after a new network interface has been created for this attachment.
    /// Not guaranteed to run if the interface was recycled rather than
    /// created. Immutable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_create_exec: Vec<String>,

    /// PostDeleteExec is a command run in the connection agent's container
    /// after the attachment's network interface is deleted. Its outcome is
    /// not reported anywhere.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_delete_exec: Vec<String>,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentStatus {
    #[serde(default, skip_serializing_if = "NetworkAttachmentErrors::is_empty")]
    pub errors: NetworkAttachmentErrors,

    /// AddressVNI is the VNI (21 significant bits) associated with this
    /// attachment's IP address assignment, or zero when there is no address.
    #[serde(rename = "addressVNI", default)]
    pub address_vni: u32,

    /// IPv4 is the address assigned to the guest, or empty when none has
    /// been assigned yet.
    #[serde(default)]
    pub ipv4: String,

    /// MACAddress is non-empty while there is a corresponding network
    /// interface on the attachment's node.
    #[serde(default)]
    pub mac_address: String,

    /// IfcName is the name of the network interface that implements this
    /// attachment on its node. Written by the connection agent.
    #[serde(default)]
    pub ifc_name: String,

    /// HostIP is the IP address of the node the attachment is bound to.
    /// Written by the connection agent.
    #[serde(rename = "hostIP", default)]
    pub host_ip: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_create_exec_report: Option<ExecReport>,
}

#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentErrors {
    /// IPAM holds errors about the IP address management for this attachment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ipam: Vec<String>,

    /// Host holds errors from the node where this attachment is placed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
}

impl NetworkAttachmentErrors {
    pub fn is_empty(&self) -> bool {
        self.ipam.is_empty() && self.host.is_empty()
    }
}

/// ExecReport reports on what happened when a PostCreateExec command ran.
#[derive(KubeSchema, Serialize, Deserialize, Default, PartialEq, Eq, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecReport {
    pub command: Vec<String>,

    /// ExitStatus is the exit status of the command, or a negative number
    /// to signal a prior problem (detailed in StdErr).
    pub exit_status: i32,

    /// RFC 3339 timestamps with seconds precision.
    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub stop_time: String,

    pub std_out: String,
    pub std_err: String,
}
