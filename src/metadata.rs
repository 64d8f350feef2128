//! # Guest Metadata Payloads
//!
//! Assembles the two documents the guest init fetches from the VMM
//! metadata service at the link-local address during boot:
//!
//! - `GET /ipconfig` - address, netmask, DNS, and routes
//! - `GET /runtimeConfig` - entrypoint, cmd, environment, workdir
//!
//! Both are JSON with fixed field names; the VMM metadata store takes
//! them as string-valued children of a root object. The field names are
//! a wire contract with the guest init and must not drift.

use crate::constants::{DEFAULT_ROUTE_NETWORK, PRIMARY_DNS, SECONDARY_DNS};
use crate::error::Result;
use crate::network::TapInterface;
use crate::registry::RuntimeConfig;
use serde::{Deserialize, Serialize};

/// One guest route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Gateway address.
    pub gw: String,
    /// Destination network in CIDR form.
    pub network: String,
}

/// The `ipconfig` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// Guest address in `<ip>/<prefix>` form.
    pub ip_cidr: String,
    pub primary_dns: String,
    pub secondary_dns: String,
    pub routes: Vec<Route>,
}

impl IpConfig {
    /// Builds the document for a TAP assignment: the assigned address
    /// plus a default route via the bridge router and public DNS.
    pub fn for_tap(tap: &TapInterface) -> Self {
        Self {
            ip_cidr: format!("{}/{}", tap.ip, tap.prefix_len),
            primary_dns: PRIMARY_DNS.to_string(),
            secondary_dns: SECONDARY_DNS.to_string(),
            routes: vec![Route {
                gw: tap.gateway.to_string(),
                network: DEFAULT_ROUTE_NETWORK.to_string(),
            }],
        }
    }
}

/// Root object handed to the VMM metadata store. Children are
/// pre-serialised JSON strings, which is how the guest reads them back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsContents {
    pub ipconfig: String,
    #[serde(rename = "runtimeConfig")]
    pub runtime_config: String,
}

impl MmdsContents {
    /// Serialises both documents for a VM's TAP assignment and image
    /// runtime configuration.
    pub fn assemble(tap: &TapInterface, runtime: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            ipconfig: serde_json::to_string(&IpConfig::for_tap(tap))?,
            runtime_config: serde_json::to_string(runtime)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tap() -> TapInterface {
        TapInterface {
            name: "tap0".into(),
            ifindex: 7,
            mac: "aa:bb:cc:dd:ee:ff".into(),
            ip: Ipv4Addr::new(10, 100, 0, 2),
            prefix_len: 24,
            gateway: Ipv4Addr::new(10, 100, 0, 1),
        }
    }

    #[test]
    fn ipconfig_carries_cidr_dns_and_default_route() {
        let config = IpConfig::for_tap(&tap());
        assert_eq!(config.ip_cidr, "10.100.0.2/24");
        assert_eq!(config.primary_dns, "8.8.8.8");
        assert_eq!(config.secondary_dns, "8.8.4.4");
        assert_eq!(
            config.routes,
            vec![Route {
                gw: "10.100.0.1".into(),
                network: "0.0.0.0/0".into(),
            }]
        );
    }

    #[test]
    fn ipconfig_wire_field_names_are_fixed() {
        let json = serde_json::to_string(&IpConfig::for_tap(&tap())).unwrap();
        for field in ["\"ip_cidr\"", "\"primary_dns\"", "\"secondary_dns\"", "\"routes\"", "\"gw\"", "\"network\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn mmds_children_are_serialised_strings() {
        let runtime = RuntimeConfig {
            entrypoint: vec!["/entry".into()],
            cmd: vec!["serve".into()],
            env: vec!["K=V".into()],
            workdir: "/srv".into(),
        };
        let contents = MmdsContents::assemble(&tap(), &runtime).unwrap();

        // Children must round-trip as standalone JSON documents.
        let ip: IpConfig = serde_json::from_str(&contents.ipconfig).unwrap();
        assert_eq!(ip.ip_cidr, "10.100.0.2/24");
        let rt: RuntimeConfig = serde_json::from_str(&contents.runtime_config).unwrap();
        assert_eq!(rt, runtime);

        let root = serde_json::to_string(&contents).unwrap();
        assert!(root.contains("\"ipconfig\""));
        assert!(root.contains("\"runtimeConfig\""));
    }
}
