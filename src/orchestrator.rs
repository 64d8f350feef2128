//! # Orchestrator Facade
//!
//! Composes the whole pipeline: pull and squash the image once, then
//! for every requested VM allocate scratch storage, provision an
//! anti-spoofed TAP, assemble the guest metadata, and drive a VMM to
//! boot, with one task per VM running concurrently; then wait for all
//! of them.
//!
//! Per-VM failures clean up what that VM had already claimed (child
//! killed, TAP released); the first error is surfaced to the caller
//! after the remaining instances are torn down.

use crate::error::Result;
use crate::network::{NetworkManager, TapInterface};
use crate::registry::RuntimeConfig;
use crate::squasher::{LayerSquasher, SquashRequest};
use crate::storage::ScratchStorage;
use crate::vmm::{VmConfig, VmInstance, VmmManager};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Default scratch image size in decimal megabytes.
const DEFAULT_SCRATCH_MB: u64 = 512;

/// Ties image materialisation, storage, networking, and VM lifecycle
/// together.
pub struct Orchestrator {
    squasher: Arc<LayerSquasher>,
    storage: Arc<ScratchStorage>,
    network: Arc<NetworkManager>,
    vmm: Arc<VmmManager>,
    scratch_mb: u64,
}

impl Orchestrator {
    pub fn new(
        squasher: Arc<LayerSquasher>,
        storage: Arc<ScratchStorage>,
        network: Arc<NetworkManager>,
        vmm: Arc<VmmManager>,
    ) -> Self {
        Self {
            squasher,
            storage,
            network,
            vmm,
            scratch_mb: DEFAULT_SCRATCH_MB,
        }
    }

    /// Sets the per-VM scratch image size.
    pub fn with_scratch_mb(mut self, scratch_mb: u64) -> Self {
        self.scratch_mb = scratch_mb;
        self
    }

    /// Pulls `request`, squashes it to `root_image`, boots `count` VMs
    /// from it, and blocks until every VM has exited.
    pub async fn run(
        &self,
        request: SquashRequest,
        root_image: &Path,
        count: usize,
    ) -> Result<()> {
        let (root, runtime) = self.squasher.pull_and_squash(&request, root_image).await?;
        info!(
            "root image ready at {} for {count} instance(s)",
            root.display()
        );

        let mut launches = JoinSet::new();
        for _ in 0..count {
            let storage = Arc::clone(&self.storage);
            let network = Arc::clone(&self.network);
            let vmm = Arc::clone(&self.vmm);
            let root = root.clone();
            let runtime = runtime.clone();
            let scratch_mb = self.scratch_mb;

            launches.spawn(async move {
                launch_one(storage, network, vmm, root, runtime, scratch_mb).await
            });
        }

        let mut running: Vec<(VmInstance, TapInterface)> = Vec::with_capacity(count);
        let mut first_failure = None;
        while let Some(joined) = launches.join_next().await {
            match joined {
                Ok(Ok(launched)) => running.push(launched),
                Ok(Err(e)) => {
                    first_failure.get_or_insert(e);
                }
                Err(e) => {
                    first_failure
                        .get_or_insert(crate::error::Error::Io(std::io::Error::other(e)));
                }
            }
        }

        if let Some(failure) = first_failure {
            warn!("aborting launch: {failure}");
            for (vm, tap) in &running {
                vm.shutdown().await;
                if let Err(e) = self.network.release_tap(tap).await {
                    warn!("failed to release {}: {e}", tap.name);
                }
            }
            return Err(failure);
        }

        for (vm, _) in &running {
            vm.wait().await;
        }
        for (_, tap) in &running {
            if let Err(e) = self.network.release_tap(tap).await {
                warn!("failed to release {}: {e}", tap.name);
            }
        }

        Ok(())
    }
}

/// Brings up a single VM; cleans up everything it claimed on failure.
async fn launch_one(
    storage: Arc<ScratchStorage>,
    network: Arc<NetworkManager>,
    vmm: Arc<VmmManager>,
    root: PathBuf,
    runtime: RuntimeConfig,
    scratch_mb: u64,
) -> Result<(VmInstance, TapInterface)> {
    let mut vm = vmm.start_instance().await?;

    let scratch = match storage.create_image(vm.id(), scratch_mb).await {
        Ok(scratch) => scratch,
        Err(e) => {
            vm.shutdown().await;
            return Err(e);
        }
    };

    let tap = match network.create_tap().await {
        Ok(tap) => tap,
        Err(e) => {
            vm.shutdown().await;
            return Err(e);
        }
    };

    let config = VmConfig {
        root_image: root,
        scratch_image: scratch,
        tap: tap.clone(),
        runtime,
    };

    if let Err(e) = vm.configure_and_start(&config).await {
        vm.shutdown().await;
        if let Err(release) = network.release_tap(&tap).await {
            warn!("failed to release {}: {release}", tap.name);
        }
        return Err(e);
    }

    Ok((vm, tap))
}
