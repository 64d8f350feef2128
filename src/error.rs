//! Error types for the orchestrator.

use std::path::PathBuf;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while materialising images, configuring the
/// network, or driving the VMM.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Validation
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// A VM subnet that is not usable IPv4.
    #[error("invalid VM subnet '{subnet}': {reason}")]
    InvalidSubnet { subnet: String, reason: String },

    /// An address that does not parse as IPv4.
    #[error("invalid IPv4 address: {0}")]
    InvalidIp(String),

    /// An address that does not parse as a six-octet MAC.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    // =========================================================================
    // Image/Registry
    // =========================================================================
    /// Image or tag could not be resolved at the registry.
    #[error("image not found '{reference}': {reason}")]
    ImageNotFound { reference: String, reason: String },

    /// Transport failure talking to the registry.
    #[error("registry unreachable for '{reference}': {reason}")]
    RegistryUnreachable { reference: String, reason: String },

    /// Layer carries a media type the squasher cannot extract.
    #[error("unsupported layer media type '{media_type}' for layer {digest}")]
    UnsupportedLayer { digest: String, media_type: String },

    /// Index holds no linux manifest for this platform.
    #[error("no suitable manifest for this platform; available: [{}]", .available.join(", "))]
    NoSuitableManifest { available: Vec<String> },

    /// Built for a platform with no manifest preference list.
    #[error("unknown host platform; cannot choose a manifest")]
    UnsupportedHostPlatform,

    /// Layer content did not match its declared digest.
    #[error("layer digest mismatch: expected {expected}, computed {computed}")]
    LayerDigestMismatch { expected: String, computed: String },

    // =========================================================================
    // Networking
    // =========================================================================
    /// No free IPv4 left in the VM subnet.
    #[error("VM subnet is full")]
    SubnetFull,

    /// Interface not present in the host namespace.
    #[error("no link with index {0}")]
    LinkNotFound(u32),

    /// Interface carries a queueing configuration we cannot displace.
    #[error("interface {interface} has unexpected qdisc configuration: {qdisc}")]
    UnexpectedQdisc { interface: String, qdisc: String },

    /// Netlink request failed.
    #[error("netlink {operation} failed: {reason}")]
    Netlink { operation: &'static str, reason: String },

    // =========================================================================
    // Kernel Maps
    // =========================================================================
    /// Pinned map does not have the expected type or key/value sizes.
    #[error("kernel map {pin} has wrong shape: {reason}")]
    WrongMapShape { pin: String, reason: String },

    /// Key not present in the kernel map.
    #[error("no entry for key {0} in kernel map")]
    MapEntryNotFound(u32),

    // =========================================================================
    // VM Lifecycle
    // =========================================================================
    /// VMM socket did not become responsive within the deadline.
    #[error("VMM at {socket} not reachable within {timeout:?}")]
    VmmNotReachable {
        socket: PathBuf,
        timeout: std::time::Duration,
    },

    /// VMM rejected a configuration request.
    #[error("VMM returned {status} for {endpoint}: {body}")]
    VmmProtocol {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// Second configure-and-start on the same instance.
    #[error("VM instance {0} already started")]
    AlreadyStarted(String),

    // =========================================================================
    // Host Plumbing
    // =========================================================================
    /// External helper exited non-zero.
    #[error("'{command}' failed: {stdout} {stderr}")]
    SubprocessFailed {
        command: String,
        stdout: String,
        stderr: String,
    },

    /// Required external helper is not on PATH.
    #[error("required tool '{0}' is unavailable")]
    ToolMissing(&'static str),

    /// Underlying kernel call failed.
    #[error("{operation} failed: {source}")]
    Syscall {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
