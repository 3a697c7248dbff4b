//! Datastore identifiers for vpnmgrd

use std::net::IpAddr;
use vpnmgr_common::InstanceIdentifier;

// CONFIG tables
/// VPN instances
pub const VPN_INSTANCES: &str = "vpn-instances";

/// VPN interface bindings
pub const VPN_INTERFACES: &str = "vpn-interfaces";

// OPERATIONAL tables
/// VPN instance operational entries
pub const VPN_INSTANCE_OP_DATA: &str = "vpn-instance-op-data";

/// Interface operational state
pub const INTERFACES_STATE: &str = "interfaces-state";

/// Bound VPN interface operational entries
pub const VPN_INTERFACE_OP_DATA: &str = "vpn-interface-op-data";

/// Learned IP to MAC bindings
pub const LEARNT_VPN_VIP_TO_PORT_DATA: &str = "learnt-vpn-vip-to-port-data";

/// `/vpn-instances/vpn-instance[name]`
pub fn vpn_instance(name: &str) -> InstanceIdentifier {
    InstanceIdentifier::builder(VPN_INSTANCES)
        .child("vpn-instance", name)
        .build()
}

/// `/vpn-instance-op-data/vpn-instance-op-data-entry[name]`
pub fn vpn_instance_op(name: &str) -> InstanceIdentifier {
    InstanceIdentifier::builder(VPN_INSTANCE_OP_DATA)
        .child("vpn-instance-op-data-entry", name)
        .build()
}

/// `/vpn-interfaces/vpn-interface[name]`
pub fn vpn_interface(name: &str) -> InstanceIdentifier {
    InstanceIdentifier::builder(VPN_INTERFACES)
        .child("vpn-interface", name)
        .build()
}

/// `/vpn-interfaces/vpn-interface[*]`
pub fn vpn_interfaces_wildcard() -> InstanceIdentifier {
    InstanceIdentifier::builder(VPN_INTERFACES)
        .any("vpn-interface")
        .build()
}

/// `/interfaces-state/interface[name]`
pub fn interface_state(name: &str) -> InstanceIdentifier {
    InstanceIdentifier::builder(INTERFACES_STATE)
        .child("interface", name)
        .build()
}

/// `/vpn-interface-op-data/vpn-interface-op-data-entry[name]`
pub fn vpn_interface_op(name: &str) -> InstanceIdentifier {
    InstanceIdentifier::builder(VPN_INTERFACE_OP_DATA)
        .child("vpn-interface-op-data-entry", name)
        .build()
}

/// `/learnt-vpn-vip-to-port-data/learnt-vpn-vip-to-port[vpn:ip]`
pub fn learnt_vip_to_port(vpn_name: &str, ip: IpAddr) -> InstanceIdentifier {
    InstanceIdentifier::builder(LEARNT_VPN_VIP_TO_PORT_DATA)
        .child("learnt-vpn-vip-to-port", format!("{}:{}", vpn_name, ip))
        .build()
}
