//! # VM Network Manager
//!
//! Provisions the isolated L2 network VMs live on: a single bridge in
//! the host network namespace, one TAP per VM enslaved to it, and
//! deterministic IP/MAC assignment out of a configured subnet. Every
//! TAP gets the ingress whitelist installed before it is handed out,
//! so a guest can never speak as anything but its assignment.
//!
//! The manager is authoritative for its namespace: a pre-existing
//! bridge with the well-known name is torn down (enslaved links first)
//! and recreated at construction.
//!
//! ## Address Assignment
//!
//! The router takes the first usable host of the subnet; VMs get
//! consecutive addresses after it. Assignment is a monotonically
//! advancing cursor guarded by one lock: `release_tap` deletes the link
//! but does not return the address to the pool. That is acceptable
//! while the manager owns the whole subnet; a reclaiming allocator is
//! future work for long-lived managers.
//!
//! ## Capability Seam
//!
//! All link manipulation goes through [`LinkOps`]; the default
//! implementation drives rtnetlink plus the tun ioctls for TAP
//! creation. Tests substitute an in-memory double.

use crate::constants::BRIDGE_NAME;
use crate::error::{Error, Result};
use crate::packetfilter::{PacketWhitelister, TcPacketWhitelister};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use netlink_packet_route::link::nlas::Nla;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

// =============================================================================
// Subnet Arithmetic
// =============================================================================

/// An IPv4 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    /// Parses `a.b.c.d/prefix`, normalising the address down to the
    /// network address. IPv6 and hostnames do not parse.
    pub fn parse(cidr: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidSubnet {
            subnet: cidr.to_string(),
            reason: reason.to_string(),
        };

        let (addr, prefix) = cidr.split_once('/').ok_or_else(|| invalid("missing prefix"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("not an IPv4 address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
        if prefix > 32 {
            return Err(invalid("prefix longer than 32 bits"));
        }

        let mask = mask_for(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_for(self.prefix))
    }

    /// Highest address of the subnet. For /31 this is the far host, not
    /// a broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask_for(self.prefix))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_for(self.prefix) == u32::from(self.network)
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

fn mask_for(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// Next assignable address after `current` within `subnet`.
///
/// Plain u32 arithmetic: the successor of `current`, refusing once the
/// next address would be at or past the broadcast address. A /31 has no
/// broadcast, so both of its addresses are assignable.
pub fn next_ip(subnet: Ipv4Subnet, current: Ipv4Addr) -> Result<Ipv4Addr> {
    if !subnet.contains(current) {
        return Err(Error::InvalidSubnet {
            subnet: subnet.to_string(),
            reason: format!("{current} is not inside the subnet"),
        });
    }

    let start = u32::from(current);
    let mask = mask_for(subnet.prefix_len());
    let finish = (start & mask) | !mask;

    if subnet.prefix_len() == 31 {
        if start >= finish {
            return Err(Error::SubnetFull);
        }
    } else if start >= finish - 1 {
        return Err(Error::SubnetFull);
    }

    Ok(Ipv4Addr::from(start + 1))
}

// =============================================================================
// MAC Generation
// =============================================================================

/// Six random bytes with the locally-administered bit set and the
/// multicast bit cleared.
pub(crate) fn random_mac() -> [u8; 6] {
    use rand::RngCore;

    let mut mac = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut mac);
    mac[0] = (mac[0] | 0x02) & 0xFE;
    mac
}

pub(crate) fn format_mac(octets: [u8; 6]) -> String {
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// =============================================================================
// TAP Record
// =============================================================================

/// A TAP device plus its MAC/IP assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapInterface {
    /// Kernel-assigned interface name, e.g. `tap3`.
    pub name: String,
    /// Kernel interface index; unique for the lifetime of the TAP.
    pub ifindex: u32,
    /// Assigned MAC, colon-separated lowercase hex.
    pub mac: String,
    /// Assigned IPv4; the guest self-assigns it after boot.
    pub ip: Ipv4Addr,
    /// Prefix length of the VM subnet.
    pub prefix_len: u8,
    /// Default gateway: the router address held by the bridge.
    pub gateway: Ipv4Addr,
}

impl TapInterface {
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_for(self.prefix_len))
    }
}

// =============================================================================
// Link Operations Capability
// =============================================================================

/// Host-namespace link manipulation needed by the manager.
#[async_trait]
pub trait LinkOps: Send + Sync {
    /// Index of the link named `name`, if present.
    async fn link_index(&self, name: &str) -> Result<Option<u32>>;

    /// `(index, name)` of every link whose master is `master`.
    async fn links_enslaved_to(&self, master: u32) -> Result<Vec<(u32, String)>>;

    /// Deletes a link by index.
    async fn delete_link(&self, index: u32) -> Result<()>;

    /// Creates a bridge with the given MAC and returns its index.
    async fn create_bridge(&self, name: &str, mac: [u8; 6]) -> Result<u32>;

    /// Brings a link up.
    async fn set_link_up(&self, index: u32) -> Result<()>;

    /// Adds an IPv4 address with prefix to a link.
    async fn add_address(&self, index: u32, addr: Ipv4Addr, prefix: u8) -> Result<()>;

    /// Creates a persistent TAP device, kernel-named; returns
    /// `(name, index)`.
    async fn create_tap(&self) -> Result<(String, u32)>;

    /// Enslaves a link to a master link.
    async fn set_master(&self, index: u32, master: u32) -> Result<()>;
}

fn netlink_failure(operation: &'static str, error: rtnetlink::Error) -> Error {
    Error::Netlink {
        operation,
        reason: error.to_string(),
    }
}

/// Default [`LinkOps`] over an rtnetlink connection, plus the tun
/// ioctls for TAP creation.
pub struct RtnetlinkOps {
    handle: rtnetlink::Handle,
}

impl RtnetlinkOps {
    /// Connects to rtnetlink in the current network namespace; the
    /// connection task runs until the process exits.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }
}

#[async_trait]
impl LinkOps for RtnetlinkOps {
    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(found) => Ok(found.map(|link| link.header.index)),
            // The kernel answers a name miss with an error, not an
            // empty dump.
            Err(rtnetlink::Error::NetlinkError(_)) => Ok(None),
            Err(e) => Err(netlink_failure("link get", e)),
        }
    }

    async fn links_enslaved_to(&self, master: u32) -> Result<Vec<(u32, String)>> {
        let mut links = self.handle.link().get().execute();
        let mut enslaved = Vec::new();
        while let Some(link) = links
            .try_next()
            .await
            .map_err(|e| netlink_failure("link list", e))?
        {
            let mut name = None;
            let mut link_master = None;
            for nla in &link.nlas {
                match nla {
                    Nla::IfName(n) => name = Some(n.clone()),
                    Nla::Master(m) => link_master = Some(*m),
                    _ => {}
                }
            }
            if link_master == Some(master) {
                enslaved.push((link.header.index, name.unwrap_or_default()));
            }
        }
        Ok(enslaved)
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| netlink_failure("link del", e))
    }

    async fn create_bridge(&self, name: &str, mac: [u8; 6]) -> Result<u32> {
        let mut request = self.handle.link().add().bridge(name.to_string());
        request.message_mut().nlas.push(Nla::Address(mac.to_vec()));
        request
            .execute()
            .await
            .map_err(|e| netlink_failure("bridge add", e))?;

        self.link_index(name).await?.ok_or(Error::Netlink {
            operation: "bridge add",
            reason: format!("bridge {name} vanished after creation"),
        })
    }

    async fn set_link_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| netlink_failure("link set up", e))
    }

    async fn add_address(&self, index: u32, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        self.handle
            .address()
            .add(index, IpAddr::V4(addr), prefix)
            .execute()
            .await
            .map_err(|e| netlink_failure("addr add", e))
    }

    async fn create_tap(&self) -> Result<(String, u32)> {
        let name = tokio::task::spawn_blocking(create_persistent_tap)
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        let index = self.link_index(&name).await?.ok_or(Error::Netlink {
            operation: "tap create",
            reason: format!("tap {name} vanished after creation"),
        })?;
        Ok((name, index))
    }

    async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .master(master)
            .execute()
            .await
            .map_err(|e| netlink_failure("link set master", e))
    }
}

// =============================================================================
// TAP Creation (tun ioctls)
// =============================================================================

// From <linux/if_tun.h>; identical on x86_64 and aarch64.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

/// `struct ifreq` as TUNSETIFF reads it: name plus the flags arm of the
/// union, padded to the union's 24 bytes.
#[repr(C)]
struct IfReq {
    name: [u8; 16],
    flags: libc::c_short,
    _pad: [u8; 22],
}

/// Creates a kernel-named persistent TAP (`tap%d`) and returns the name
/// the kernel picked. The device outlives the creating fd; the VMM
/// opens it by name later.
fn create_persistent_tap() -> Result<String> {
    use std::os::unix::io::AsRawFd;

    let tun = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/net/tun")?;

    let mut request = IfReq {
        name: [0; 16],
        flags: IFF_TAP | IFF_NO_PI,
        _pad: [0; 22],
    };

    // SAFETY: `request` is a properly laid out ifreq that outlives the
    // call; the fd is open for the duration.
    let rc = unsafe { libc::ioctl(tun.as_raw_fd(), TUNSETIFF, &mut request) };
    if rc < 0 {
        return Err(Error::Syscall {
            operation: "ioctl(TUNSETIFF)",
            source: std::io::Error::last_os_error(),
        });
    }

    // SAFETY: plain value argument.
    let rc = unsafe { libc::ioctl(tun.as_raw_fd(), TUNSETPERSIST, 1) };
    if rc < 0 {
        return Err(Error::Syscall {
            operation: "ioctl(TUNSETPERSIST)",
            source: std::io::Error::last_os_error(),
        });
    }

    let len = request.name.iter().position(|b| *b == 0).unwrap_or(16);
    Ok(String::from_utf8_lossy(&request.name[..len]).into_owned())
}

// =============================================================================
// Network Manager
// =============================================================================

/// Owner of the VM bridge, the subnet, and all TAP assignments.
pub struct NetworkManager {
    links: Arc<dyn LinkOps>,
    whitelister: Arc<dyn PacketWhitelister>,
    subnet: Ipv4Subnet,
    router: Ipv4Addr,
    bridge_index: u32,
    last_assigned: Mutex<Ipv4Addr>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("subnet", &self.subnet)
            .field("router", &self.router)
            .field("bridge_index", &self.bridge_index)
            .finish()
    }
}

impl NetworkManager {
    /// Manager over the real host namespace: rtnetlink link ops and the
    /// tc-driven whitelister.
    pub async fn with_defaults(vm_subnet: &str) -> Result<Self> {
        Self::new(
            vm_subnet,
            Arc::new(RtnetlinkOps::new()?),
            Arc::new(TcPacketWhitelister::new()),
        )
        .await
    }

    /// Builds the manager: validates the subnet, takes ownership of the
    /// bridge name (tearing down whatever held it), and creates the
    /// bridge holding the router address. Bridge setup failure is fatal
    /// to the manager.
    pub async fn new(
        vm_subnet: &str,
        links: Arc<dyn LinkOps>,
        whitelister: Arc<dyn PacketWhitelister>,
    ) -> Result<Self> {
        let subnet = Ipv4Subnet::parse(vm_subnet)?;
        if subnet.prefix_len() > 31 {
            return Err(Error::InvalidSubnet {
                subnet: vm_subnet.to_string(),
                reason: "must contain room for at least two hosts".to_string(),
            });
        }

        let router = next_ip(subnet, subnet.network()).map_err(|_| Error::InvalidSubnet {
            subnet: vm_subnet.to_string(),
            reason: "too small to hold a router address".to_string(),
        })?;

        // Take over the bridge name: whatever was enslaved belongs to a
        // previous life of this manager.
        if let Some(old) = links.link_index(BRIDGE_NAME).await? {
            info!("cleaning up old bridge {BRIDGE_NAME}");
            for (index, name) in links.links_enslaved_to(old).await? {
                debug!("deleting enslaved link {name}");
                links.delete_link(index).await?;
            }
            links.delete_link(old).await?;
        }

        let bridge_index = links.create_bridge(BRIDGE_NAME, random_mac()).await?;
        links.set_link_up(bridge_index).await?;
        links
            .add_address(bridge_index, router, subnet.prefix_len())
            .await?;

        info!("bridge {BRIDGE_NAME} up with router address {router}/{}", subnet.prefix_len());

        Ok(Self {
            links,
            whitelister,
            subnet,
            router,
            bridge_index,
            last_assigned: Mutex::new(router),
        })
    }

    /// The router address VMs use as their default gateway.
    pub fn router(&self) -> Ipv4Addr {
        self.router
    }

    /// The subnet this manager assigns from.
    pub fn subnet(&self) -> Ipv4Subnet {
        self.subnet
    }

    /// Creates a TAP enslaved to the bridge, assigns it the next free
    /// IP and a fresh MAC, and installs the ingress whitelist.
    ///
    /// If whitelist installation fails the TAP stays behind unreturned
    /// and the manager should be treated as degraded; the address is
    /// not reused either way.
    pub async fn create_tap(&self) -> Result<TapInterface> {
        let mac = random_mac();

        // One lock around cursor advance and link work serialises all
        // TAP creations.
        let mut cursor = self.last_assigned.lock().await;
        let ip = next_ip(self.subnet, *cursor)?;

        let (name, ifindex) = self.links.create_tap().await?;
        debug!("created tap {name} (ifindex {ifindex}) for {ip}");

        self.links.set_master(ifindex, self.bridge_index).await?;
        self.links.set_link_up(ifindex).await?;
        *cursor = ip;

        self.whitelister
            .install(ifindex, &ip.to_string(), &format_mac(mac))
            .await?;

        Ok(TapInterface {
            name,
            ifindex,
            mac: format_mac(mac),
            ip,
            prefix_len: self.subnet.prefix_len(),
            gateway: self.router,
        })
    }

    /// Deletes the TAP link. The address assignment is not reclaimed.
    pub async fn release_tap(&self, tap: &TapInterface) -> Result<()> {
        debug!("releasing tap {} (ifindex {})", tap.name, tap.ifindex);
        self.links.delete_link(tap.ifindex).await
    }
}
