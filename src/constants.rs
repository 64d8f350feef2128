//! Constants for the orchestrator.
//!
//! All well-known names, pinned paths, timeouts, and VM defaults are
//! defined here to ensure consistency and prevent magic numbers
//! throughout the codebase.

use std::time::Duration;

// =============================================================================
// Image References
// =============================================================================

/// Registry used when a reference does not name one.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag used when a reference does not name one.
pub const DEFAULT_TAG: &str = "latest";

/// Docker gzipped whole-fs layer media type.
pub const DOCKER_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// OCI gzipped whole-fs layer media type.
pub const OCI_LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Layer media types the squasher will extract.
pub const ACCEPTED_LAYER_MEDIA_TYPES: [&str; 2] =
    [DOCKER_LAYER_MEDIA_TYPE, OCI_LAYER_MEDIA_TYPE];

// =============================================================================
// Squasher
// =============================================================================

/// Working-tree subdirectory created under the configured temp directory.
pub const SQUASH_WORK_DIR: &str = "squashwork";

/// External packer invoked to turn the working tree into a squashed image.
pub const PACKER_COMMAND: &str = "mksquashfs";

// =============================================================================
// Networking
// =============================================================================

/// Name of the L2 bridge joining all TAP interfaces in the host netns.
pub const BRIDGE_NAME: &str = "vmbridge";

/// Pinned allow-map of interface index to permitted source IPv4.
pub const ALLOWED_IP_MAP_PIN: &str = "/sys/fs/bpf/tc/globals/ifce_allowed_ip";

/// Pinned allow-map of interface index to permitted source MAC.
pub const ALLOWED_MAC_MAP_PIN: &str = "/sys/fs/bpf/tc/globals/ifce_allowed_macs";

// =============================================================================
// Scratch Storage
// =============================================================================

/// Scratch image sizes are given in decimal megabytes.
pub const BYTES_PER_MEGABYTE: u64 = 1_000_000;

/// External formatter invoked on freshly allocated scratch images.
pub const MKFS_COMMAND: &str = "mkfs.ext4";

// =============================================================================
// Metadata Service
// =============================================================================

/// Primary nameserver handed to guests.
pub const PRIMARY_DNS: &str = "8.8.8.8";

/// Secondary nameserver handed to guests.
pub const SECONDARY_DNS: &str = "8.8.4.4";

/// Destination of the default route handed to guests.
pub const DEFAULT_ROUTE_NETWORK: &str = "0.0.0.0/0";

// =============================================================================
// VM Lifecycle
// =============================================================================

/// Per-instance runtime directory; sockets live at `<dir>/<id>/vm.sock`.
pub const VMM_RUNTIME_DIR: &str = "/run/emberbox";

/// Default path of the VMM binary.
pub const DEFAULT_VMM_BIN: &str = "./firecracker";

/// Default guest kernel image.
pub const DEFAULT_KERNEL_IMAGE: &str = "./vmlinux";

/// Default guest initrd.
pub const DEFAULT_INITRD: &str = "./initrd.cpio";

/// Kernel command line for guests.
pub const VM_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// vCPUs presented to each guest.
pub const VM_VCPU_COUNT: u32 = 1;

/// Guest memory in MiB.
pub const VM_MEMORY_MIB: u32 = 256;

/// Cadence of the VMM readiness probe.
pub const VMM_READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Deadline for the VMM REST endpoint to come up after spawn.
pub const VMM_READY_DEADLINE: Duration = Duration::from_secs(2);

/// Per-request timeout for VMM API calls.
pub const VMM_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
