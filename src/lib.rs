//! # emberbox
//!
//! **Minimal container-over-microVM orchestrator**
//!
//! This crate takes an OCI/Docker image reference, materialises a
//! bootable read-only root filesystem, allocates per-instance writable
//! scratch storage, provisions an isolated L2 network with per-VM
//! anti-spoofing enforcement, and launches a hardware-virtualised
//! microVM whose in-guest init pivots into the prepared root and
//! executes the image's entrypoint.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                              │
//! │        pull image → start N VMs → wait for all of them            │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐   ┌─────────────────────────────────┐    │
//! │  │  Image Pipeline      │   │  Network                        │    │
//! │  │  registry → index    │   │  vmbridge + TAP per VM          │    │
//! │  │  → platform manifest │   │  deterministic IP/MAC           │    │
//! │  │  → layers (ordered)  │   │  ingress classifier per TAP     │    │
//! │  │  → squashed image    │   │  (allow maps keyed by ifindex)  │    │
//! │  └──────────────────────┘   └─────────────────────────────────┘    │
//! │  ┌──────────────────────┐   ┌─────────────────────────────────┐    │
//! │  │  Scratch Storage     │   │  VM Lifecycle                   │    │
//! │  │  <id>.ext4 per VM    │   │  VMM child + socket REST API    │    │
//! │  │                      │   │  machine→boot→drives→nic→mmds   │    │
//! │  │                      │   │  →InstanceStart, then reap      │    │
//! │  └──────────────────────┘   └─────────────────────────────────┘    │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Anti-Spoofing Model
//!
//! Every TAP carries an in-kernel ingress classifier that drops any
//! frame whose source MAC or source IPv4 does not match the
//! per-interface assignment. The classifier reads two pinned kernel
//! maps maintained by this crate; the maps are global, keyed by
//! interface index, and safe for concurrent writers because ifindexes
//! are disjoint across VMs.
//!
//! # Guest Boot Contract
//!
//! The guest init fetches two documents from the VMM metadata service
//! at `169.254.169.254` during boot: `ipconfig` (address, DNS, routes)
//! and `runtimeConfig` (entrypoint, cmd, environment, workdir). Both
//! are assembled here and handed to the VMM before `InstanceStart`.
//!
//! # External Collaborators
//!
//! The in-guest init, the compiled classifier object, `tar`-equivalent
//! extraction, `mksquashfs`, `mkfs.ext4`, `tc`, and the registry
//! protocol are collaborators behind narrow capability traits; each has
//! a default implementation and an obvious in-memory double for tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use emberbox::{
//!     LayerSquasher, NetworkManager, OciRegistryClient, Orchestrator,
//!     ScratchStorage, SquashRequest, VmmConfig, VmmManager,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> emberbox::Result<()> {
//!     let squasher = Arc::new(LayerSquasher::new(Arc::new(OciRegistryClient::new())));
//!     let storage = Arc::new(ScratchStorage::new(Path::new("/var/lib/emberbox"))?);
//!     let network = Arc::new(NetworkManager::with_defaults("10.100.0.0/24").await?);
//!     let vmm = Arc::new(VmmManager::new(VmmConfig::default()));
//!
//!     let orchestrator = Orchestrator::new(squasher, storage, network, vmm);
//!     let request = SquashRequest::default().with_image("redis", "latest");
//!     orchestrator.run(request, Path::new("/var/lib/emberbox/redis.sqsh"), 3).await
//! }
//! ```

// =============================================================================
// Modules
// =============================================================================

mod error;

pub mod bpfmap;
pub mod constants;
pub mod metadata;
pub mod network;
pub mod orchestrator;
pub mod packetfilter;
pub mod platform;
pub mod registry;
pub mod squasher;
pub mod storage;
pub mod vmm;

// =============================================================================
// Facade Re-exports
// =============================================================================

pub use error::{Error, Result};

pub use bpfmap::{open_pinned_map, KernelMap, PinnedMap};
pub use metadata::{IpConfig, MmdsContents, Route};
pub use network::{
    next_ip, Ipv4Subnet, LinkOps, NetworkManager, RtnetlinkOps, TapInterface,
};
pub use orchestrator::Orchestrator;
pub use packetfilter::{
    LinkNamer, PacketWhitelister, SysfsLinkNamer, SystemTcRunner, TcPacketWhitelister, TcRunner,
    INGRESS_FILTER_OBJECT,
};
pub use platform::{select_manifest, PlatformVariant};
pub use registry::{
    FetchedImage, ImageReference, ImageRegistry, LayerHandle, ManifestDescriptor,
    OciRegistryClient, RuntimeConfig,
};
pub use squasher::{
    GzipTarExtractor, LayerSquasher, MksquashfsPacker, SquashRequest, TarballExtractor,
    TreePacker,
};
pub use storage::ScratchStorage;
pub use vmm::{VmConfig, VmInstance, VmState, VmmConfig, VmmManager};
