use std::net::Ipv4Addr;

use vnet_fabric::MacAddr;

/// Prefix of the interface names the agent derives from guest MACs.
pub const IFC_NAME_PREFIX: &str = "kos";

/// Derives the guest MAC for an attachment from its VNI (21 significant
/// bits) and guest IPv4 address. The derivation is a pure function, so an
/// interface found on the host can be paired with its owning attachment by
/// MAC alone. The locally-administered bit is always set.
pub fn derive_mac(vni: u32, guest_ip: Ipv4Addr) -> MacAddr {
    let ip = guest_ip.octets();
    MacAddr::new([
        ((vni >> 13) as u8 & 0xF8) | ((ip[0] & 0x02) << 1) | 0x02,
        ip[1],
        ip[2],
        ip[3],
        (vni >> 8) as u8,
        vni as u8,
    ])
}

/// Name of the network device implementing the attachment with the given
/// guest MAC.
pub fn ifc_name(mac: MacAddr) -> String {
    format!("{IFC_NAME_PREFIX}{}", mac.plain_hex())
}
