//! VPN interface manager daemon
//!
//! Binds `vpn-interface` configuration to VPN instances once the instance
//! and the underlying interface are operational, and keeps the learned IP
//! to MAC cache for VPN ports.

mod config;
mod mac_entry_cache;
mod tables;
mod types;
mod vpn_interface;

pub use config::{LoggingConfig, MacCacheConfig, VpnMgrConfig, DEFAULT_CONFIG_PATH};
pub use mac_entry_cache::{MacEntryCache, MacEntryKey};
pub use tables::*;
pub use types::*;
pub use vpn_interface::{VpnInterfaceHandler, VpnInterfaceManager};
