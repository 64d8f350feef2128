//! # Ingress Packet Whitelisting
//!
//! Pins each TAP interface to its assigned identity: an in-kernel
//! classifier on the interface's ingress path drops every frame whose
//! source MAC is not the assigned MAC, and every IPv4 frame whose source
//! address is not the assigned IP. This stops a guest from spoofing
//! packets or claiming an address it was not given.
//!
//! The classifier program is an opaque object embedded at build time. It
//! reads two allow maps pinned in the globals namespace, keyed by
//! interface index:
//!
//! | pin | value |
//! |-----|-------|
//! | `.../ifce_allowed_ip`   | IPv4, little-endian in the low 32 bits |
//! | `.../ifce_allowed_macs` | MAC, big-endian in the low 48 bits |
//!
//! The encodings are part of the contract with the classifier object and
//! must be bit-exact.
//!
//! ## Install Ordering
//!
//! `install` ensures the `clsact` discipline, loads the classifier, then
//! writes the allow-map entries, so the interface filters from the
//! first frame it could ever deliver.
//!
//! ## Capability Seams
//!
//! The `tc` invocations, the ifindex→name resolution, and the map opener
//! are injected so the whole policy is testable without a kernel.

use crate::bpfmap::{open_pinned_map, MapOpener};
use crate::constants::{ALLOWED_IP_MAP_PIN, ALLOWED_MAC_MAP_PIN};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::Write;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Compiled ingress classifier, embedded verbatim.
///
/// Regenerate with:
/// `clang -g -O2 -Wall -target bpf -c bpf/ingress_filter.c -o bpf/ingress_filter.o`
pub static INGRESS_FILTER_OBJECT: &[u8] = include_bytes!("../bpf/ingress_filter.o");

// =============================================================================
// Capability Traits
// =============================================================================

/// Runs one `tc` command and yields its combined output.
#[async_trait]
pub trait TcRunner: Send + Sync {
    async fn tc(&self, args: &[&str]) -> Result<String>;
}

/// Resolves a kernel interface index to its current name.
#[async_trait]
pub trait LinkNamer: Send + Sync {
    async fn name_of(&self, ifindex: u32) -> Result<String>;
}

/// Maintains per-interface source whitelisting.
#[async_trait]
pub trait PacketWhitelister: Send + Sync {
    /// Idempotently ensures the ingress classifier is attached to
    /// `ifindex` and whitelists exactly (`ip`, `mac`).
    async fn install(&self, ifindex: u32, ip: &str, mac: &str) -> Result<()>;

    /// Rewrites the whitelisted (`ip`, `mac`) for an interface that
    /// already carries the classifier.
    async fn update(&self, ifindex: u32, ip: &str, mac: &str) -> Result<()>;
}

// =============================================================================
// Default Helpers
// =============================================================================

/// Invokes the system `tc` binary.
#[derive(Debug, Default, Clone)]
pub struct SystemTcRunner;

#[async_trait]
impl TcRunner for SystemTcRunner {
    async fn tc(&self, args: &[&str]) -> Result<String> {
        debug!("tc {}", args.join(" "));
        let result = Command::new("tc").args(args).output().await?;

        let stdout = String::from_utf8_lossy(&result.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&result.stderr).into_owned();
        if !result.status.success() {
            return Err(Error::SubprocessFailed {
                command: format!("tc {}", args.join(" ")),
                stdout,
                stderr,
            });
        }
        Ok(stdout + &stderr)
    }
}

/// Resolves interface names through sysfs.
#[derive(Debug, Default, Clone)]
pub struct SysfsLinkNamer;

#[async_trait]
impl LinkNamer for SysfsLinkNamer {
    async fn name_of(&self, ifindex: u32) -> Result<String> {
        let mut entries = tokio::fs::read_dir("/sys/class/net").await?;
        while let Some(entry) = entries.next_entry().await? {
            let index_file = entry.path().join("ifindex");
            let Ok(contents) = tokio::fs::read_to_string(&index_file).await else {
                continue;
            };
            if contents.trim().parse::<u32>() == Ok(ifindex) {
                return Ok(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Err(Error::LinkNotFound(ifindex))
    }
}

// =============================================================================
// Value Encodings
// =============================================================================

/// Encodes an IPv4 address the way the classifier compares it against
/// `iphdr.saddr`: octet 0 in the low byte, high 32 bits zero.
pub(crate) fn encode_ipv4(addr: std::net::Ipv4Addr) -> u64 {
    u64::from(u32::from_le_bytes(addr.octets()))
}

/// Encodes a MAC the way the classifier folds `h_source`: octet 0 in
/// bits [47:40], octet 5 in the low byte, high 16 bits zero.
pub(crate) fn encode_mac(octets: [u8; 6]) -> u64 {
    octets.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Parses a colon-separated six-octet MAC.
pub(crate) fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::InvalidMac(mac.to_string()));
    }
    let mut octets = [0u8; 6];
    for (slot, part) in octets.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(mac.to_string()))?;
    }
    Ok(octets)
}

fn parse_ipv4(ip: &str) -> Result<std::net::Ipv4Addr> {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4),
        _ => Err(Error::InvalidIp(ip.to_string())),
    }
}

// =============================================================================
// Whitelister
// =============================================================================

/// Whitelister driving `tc` and the pinned allow maps.
pub struct TcPacketWhitelister {
    tc: Arc<dyn TcRunner>,
    links: Arc<dyn LinkNamer>,
    open_map: Arc<MapOpener>,
}

impl Default for TcPacketWhitelister {
    fn default() -> Self {
        Self::new()
    }
}

impl TcPacketWhitelister {
    /// Whitelister using the system `tc`, sysfs name resolution, and the
    /// real pinned maps.
    pub fn new() -> Self {
        Self::with_helpers(
            Arc::new(SystemTcRunner),
            Arc::new(SysfsLinkNamer),
            Arc::new(open_pinned_map),
        )
    }

    /// Whitelister with explicit helpers, for composition and tests.
    pub fn with_helpers(
        tc: Arc<dyn TcRunner>,
        links: Arc<dyn LinkNamer>,
        open_map: Arc<MapOpener>,
    ) -> Self {
        Self {
            tc,
            links,
            open_map,
        }
    }

    /// Ensures the classifier-action discipline exists on `interface`.
    ///
    /// Some kernels create TAP devices with `fq_codel` as the root
    /// qdisc; that is replaced with `noqueue` first. Anything other than
    /// clsact/noqueue is a configuration this component cannot safely
    /// displace.
    async fn ensure_clsact(&self, interface: &str) -> Result<()> {
        let mut state = self.tc.tc(&["qdisc", "show", "dev", interface]).await?;

        if state.contains("clsact") {
            return Ok(());
        }

        if state.contains("fq_codel") {
            self.tc
                .tc(&["qdisc", "replace", "dev", interface, "root", "noqueue"])
                .await?;
            state = self.tc.tc(&["qdisc", "show", "dev", interface]).await?;
        }

        if state.contains("noqueue") {
            self.tc.tc(&["qdisc", "add", "dev", interface, "clsact"]).await?;
            return Ok(());
        }

        Err(Error::UnexpectedQdisc {
            interface: interface.to_string(),
            qdisc: state.trim().to_string(),
        })
    }

    /// Replaces whatever ingress filter is present with the embedded
    /// classifier object, staged to a temp file for `tc` to read.
    async fn load_classifier(&self, interface: &str) -> Result<()> {
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(INGRESS_FILTER_OBJECT)?;
        staged.flush()?;

        self.tc
            .tc(&["filter", "del", "dev", interface, "ingress"])
            .await?;

        let object_path = path_str(staged.path());
        self.tc
            .tc(&[
                "filter",
                "add",
                "dev",
                interface,
                "ingress",
                "bpf",
                "da",
                "obj",
                &object_path,
                "sec",
                "ingress",
            ])
            .await?;
        Ok(())
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[async_trait]
impl PacketWhitelister for TcPacketWhitelister {
    async fn install(&self, ifindex: u32, ip: &str, mac: &str) -> Result<()> {
        let interface = self.links.name_of(ifindex).await?;
        info!("installing ingress whitelist on {interface} (ifindex {ifindex})");

        self.ensure_clsact(&interface).await?;
        self.load_classifier(&interface).await?;
        self.update(ifindex, ip, mac).await
    }

    async fn update(&self, ifindex: u32, ip: &str, mac: &str) -> Result<()> {
        let addr = parse_ipv4(ip)?;
        let octets = parse_mac(mac)?;

        debug!("whitelisting ifindex {ifindex}: {addr} / {mac}");

        let ip_map = (self.open_map)(ALLOWED_IP_MAP_PIN)?;
        ip_map.set(ifindex, encode_ipv4(addr))?;

        let mac_map = (self.open_map)(ALLOWED_MAC_MAP_PIN)?;
        mac_map.set(ifindex, encode_mac(octets))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_encoding_is_little_endian_in_low_bits() {
        assert_eq!(encode_ipv4("172.19.0.2".parse().unwrap()), 0x0200_13AC);
        assert_eq!(encode_ipv4("3.32.232.192".parse().unwrap()), 0xC0E8_2003);
    }

    #[test]
    fn mac_encoding_is_big_endian_in_low_bits() {
        assert_eq!(
            encode_mac(parse_mac("aa:bb:cc:dd:ee:ff").unwrap()),
            0x0000_AABB_CCDD_EEFF
        );
        assert_eq!(
            encode_mac(parse_mac("84:f6:fa:00:33:ab").unwrap()),
            0x0000_84F6_FA00_33AB
        );
    }

    #[test]
    fn hostnames_are_not_addresses() {
        assert!(matches!(
            parse_ipv4("google.com"),
            Err(Error::InvalidIp(_))
        ));
    }

    #[test]
    fn ipv6_is_refused() {
        assert!(parse_ipv4("fe80::19f1:67:adca:3eb3").is_err());
    }

    #[test]
    fn overlong_mac_is_refused() {
        assert!(parse_mac("84:f6:fa:00:33:ab:dd:ee").is_err());
    }

    #[test]
    fn short_mac_is_refused() {
        assert!(parse_mac("84:f6:fa").is_err());
    }

    #[test]
    fn garbage_mac_octet_is_refused() {
        assert!(parse_mac("84:f6:fa:00:33:gg").is_err());
    }

    #[test]
    fn classifier_object_is_embedded() {
        assert!(!INGRESS_FILTER_OBJECT.is_empty());
    }
}
