//! Type definitions for vpnmgrd

use serde::{Deserialize, Serialize};

/// VPN interface configuration (`vpn-interfaces/vpn-interface`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VpnInterface {
    /// Interface name
    pub name: String,
    /// VPN instance the interface is bound to
    pub vpn_instance_name: String,
    /// Configured addresses (prefix notation)
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}

impl VpnInterface {
    /// Create a new VpnInterface
    pub fn new(name: impl Into<String>, vpn_instance_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vpn_instance_name: vpn_instance_name.into(),
            ip_addresses: Vec::new(),
        }
    }

    /// Add an address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.ip_addresses.push(address.into());
        self
    }
}

/// Operational entry of a VPN instance (`vpn-instance-op-data`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VpnInstanceOpData {
    pub vpn_instance_name: String,
    /// Allocated VPN id
    pub vpn_id: u32,
    /// Route distinguisher
    #[serde(default)]
    pub vrf_id: Option<String>,
}

/// Operational state of a bound VPN interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceOpState {
    Active,
    Inactive,
}

/// Operational entry of a bound VPN interface (`vpn-interface-op-data`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VpnInterfaceOpData {
    pub name: String,
    pub vpn_instance_name: String,
    pub vpn_id: u32,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    pub state: InterfaceOpState,
}

/// Learned IP to MAC binding (`learnt-vpn-vip-to-port-data`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LearntVipToPort {
    pub vpn_name: String,
    pub port_fixedip: String,
    pub mac_address: String,
    pub port_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_vpn_interface_kebab_case() {
        let intf: VpnInterface = serde_json::from_value(json!({
            "name": "tap0",
            "vpn-instance-name": "vpn1",
            "ip-addresses": ["10.0.0.1/24"]
        }))
        .unwrap();
        assert_eq!(
            intf,
            VpnInterface::new("tap0", "vpn1").with_address("10.0.0.1/24")
        );
    }

    #[test]
    fn test_vpn_interface_addresses_default() {
        let intf: VpnInterface =
            serde_json::from_value(json!({"name": "tap0", "vpn-instance-name": "vpn1"})).unwrap();
        assert!(intf.ip_addresses.is_empty());
    }

    #[test]
    fn test_op_state_serialization() {
        let op = VpnInterfaceOpData {
            name: "tap0".to_string(),
            vpn_instance_name: "vpn1".to_string(),
            vpn_id: 7,
            ip_addresses: vec![],
            state: InterfaceOpState::Active,
        };
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["state"], "active");
        assert_eq!(value["vpn-id"], 7);
    }
}
