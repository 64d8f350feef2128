//! # VM Lifecycle Controller
//!
//! Supervises one VMM child per VM and drives it over its per-instance
//! Unix-socket REST API through the required configuration order:
//!
//! ```text
//! Spawned ──(REST answers 200)──► Online ──(all PUTs 204)──► Configured
//!    │                                                          │
//!    │                                             InstanceStart│204
//!    ▼                                                          ▼
//!  Dead ◄──────────────(child exits)──────────────────────── Running
//! ```
//!
//! `InstanceStart` never goes out before machine, boot, drive, network,
//! and metadata configuration have all been accepted. Any non-204
//! answer aborts configuration with the response body attached; the
//! caller is expected to `shutdown` the instance.
//!
//! The REST client is a deliberately small HTTP/1.1 implementation over
//! `tokio::net::UnixStream`: one connection per request, a fixed API,
//! tiny bodies.

use crate::constants::{
    DEFAULT_INITRD, DEFAULT_KERNEL_IMAGE, DEFAULT_VMM_BIN, VMM_READY_DEADLINE,
    VMM_READY_POLL_INTERVAL, VMM_REQUEST_TIMEOUT, VMM_RUNTIME_DIR, VM_BOOT_ARGS, VM_MEMORY_MIB,
    VM_VCPU_COUNT,
};
use crate::error::{Error, Result};
use crate::metadata::MmdsContents;
use crate::network::TapInterface;
use crate::registry::RuntimeConfig;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// Configuration
// =============================================================================

/// Where the VMM binary and guest boot assets live.
#[derive(Debug, Clone)]
pub struct VmmConfig {
    /// Path of the VMM binary.
    pub vmm_bin: PathBuf,
    /// Guest kernel image handed to every VM.
    pub kernel_image: PathBuf,
    /// Guest initrd handed to every VM.
    pub initrd: PathBuf,
    /// Directory holding per-instance state (API sockets).
    pub runtime_dir: PathBuf,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            vmm_bin: PathBuf::from(DEFAULT_VMM_BIN),
            kernel_image: PathBuf::from(DEFAULT_KERNEL_IMAGE),
            initrd: PathBuf::from(DEFAULT_INITRD),
            runtime_dir: PathBuf::from(VMM_RUNTIME_DIR),
        }
    }
}

impl VmmConfig {
    pub fn with_vmm_bin(mut self, path: &Path) -> Self {
        self.vmm_bin = path.to_path_buf();
        self
    }

    pub fn with_kernel_image(mut self, path: &Path) -> Self {
        self.kernel_image = path.to_path_buf();
        self
    }

    pub fn with_initrd(mut self, path: &Path) -> Self {
        self.initrd = path.to_path_buf();
        self
    }

    pub fn with_runtime_dir(mut self, path: &Path) -> Self {
        self.runtime_dir = path.to_path_buf();
        self
    }
}

/// Everything one VM boots from: images, network assignment, and the
/// runtime configuration served to the guest init.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Read-only squashed root filesystem image.
    pub root_image: PathBuf,
    /// Writable scratch image.
    pub scratch_image: PathBuf,
    /// TAP assignment produced by the network manager.
    pub tap: TapInterface,
    /// Runtime configuration carried by the image.
    pub runtime: RuntimeConfig,
}

// =============================================================================
// VMM API Bodies
// =============================================================================

// Field names mirror the VMM API documentation.

#[derive(Serialize)]
struct MachineConfiguration {
    vcpu_count: u32,
    mem_size_mib: u32,
    ht_enabled: bool,
}

#[derive(Serialize)]
struct BootSource {
    kernel_image_path: String,
    initrd_path: String,
    boot_args: String,
}

#[derive(Serialize)]
struct DriveSpec {
    drive_id: String,
    is_read_only: bool,
    path_on_host: String,
}

#[derive(Serialize)]
struct NetworkInterfaceSpec {
    iface_id: String,
    host_dev_name: String,
    guest_mac: String,
    allow_mmds_requests: bool,
}

#[derive(Serialize)]
struct ActionBody {
    action_type: String,
}

// =============================================================================
// Manager
// =============================================================================

/// Spawns and hands out VM instances.
#[derive(Debug, Clone, Default)]
pub struct VmmManager {
    config: VmmConfig,
}

impl VmmManager {
    pub fn new(config: VmmConfig) -> Self {
        Self { config }
    }

    /// Spawns a VMM child with a fresh id and API socket, forwards its
    /// output, and starts the supervisor that reaps it. The instance
    /// comes back unconfigured.
    pub async fn start_instance(&self) -> Result<VmInstance> {
        let id = Uuid::new_v4().to_string();
        let instance_dir = self.config.runtime_dir.join(&id[..10]);
        let socket_path = instance_dir.join("vm.sock");

        let mut builder = std::fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o770);
        }
        builder.recursive(true).create(&instance_dir)?;

        let mut child = Command::new(&self.config.vmm_bin)
            .arg("--id")
            .arg(&id)
            .arg("--api-sock")
            .arg(&socket_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        info!("spawned VMM {} (socket {})", id, socket_path.display());

        // Both pipes are drained for the life of the child; the VMM's
        // console chatter lands on our stdout.
        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stdout, &mut tokio::io::stdout()).await;
            });
        }
        if let Some(mut stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut stderr, &mut tokio::io::stdout()).await;
            });
        }

        let pid = child.id();
        let finished = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = watch::channel(false);

        let supervisor_id = id.clone();
        let supervisor_finished = Arc::clone(&finished);
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("VM instance {supervisor_id} exited: {status}"),
                Err(e) => warn!("failed to reap VM instance {supervisor_id}: {e}"),
            }
            supervisor_finished.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(true);
        });

        Ok(VmInstance {
            id,
            socket_path,
            kernel_image: self.config.kernel_image.clone(),
            initrd: self.config.initrd.clone(),
            started: false,
            finished,
            exit_rx,
            pid,
        })
    }
}

// =============================================================================
// Instance
// =============================================================================

/// Coarse instance state, derived from the started/finished flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Child running, boot not triggered.
    Spawned,
    /// Boot triggered, child alive.
    Running,
    /// Child reaped. Terminal.
    Dead,
}

/// One VMM child plus its API socket.
pub struct VmInstance {
    id: String,
    socket_path: PathBuf,
    kernel_image: PathBuf,
    initrd: PathBuf,
    started: bool,
    finished: Arc<AtomicBool>,
    exit_rx: watch::Receiver<bool>,
    pid: Option<u32>,
}

impl VmInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> VmState {
        if self.finished.load(Ordering::SeqCst) {
            VmState::Dead
        } else if self.started {
            VmState::Running
        } else {
            VmState::Spawned
        }
    }

    /// Pushes the full configuration in the required order and triggers
    /// boot. Refuses a second call. On failure the child keeps running;
    /// call [`VmInstance::shutdown`].
    pub async fn configure_and_start(&mut self, config: &VmConfig) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted(self.id.clone()));
        }

        self.wait_for_online().await?;

        self.put(
            "/machine-config",
            &MachineConfiguration {
                vcpu_count: VM_VCPU_COUNT,
                mem_size_mib: VM_MEMORY_MIB,
                ht_enabled: false,
            },
        )
        .await?;

        self.put(
            "/boot-source",
            &BootSource {
                kernel_image_path: self.kernel_image.display().to_string(),
                initrd_path: self.initrd.display().to_string(),
                boot_args: VM_BOOT_ARGS.to_string(),
            },
        )
        .await?;

        self.put(
            "/drives/vda",
            &DriveSpec {
                drive_id: "vda".to_string(),
                is_read_only: true,
                path_on_host: config.root_image.display().to_string(),
            },
        )
        .await?;

        self.put(
            "/drives/vdb",
            &DriveSpec {
                drive_id: "vdb".to_string(),
                is_read_only: false,
                path_on_host: config.scratch_image.display().to_string(),
            },
        )
        .await?;

        self.put(
            "/network-interfaces/eth0",
            &NetworkInterfaceSpec {
                iface_id: "eth0".to_string(),
                host_dev_name: config.tap.name.clone(),
                guest_mac: config.tap.mac.clone(),
                allow_mmds_requests: true,
            },
        )
        .await?;

        self.put("/mmds", &MmdsContents::assemble(&config.tap, &config.runtime)?)
            .await?;

        self.put(
            "/actions",
            &ActionBody {
                action_type: "InstanceStart".to_string(),
            },
        )
        .await?;

        self.started = true;
        info!("VM instance {} running", self.id);
        Ok(())
    }

    /// Blocks until the supervisor has reaped the child.
    pub async fn wait(&self) {
        let mut exited = self.exit_rx.clone();
        if *exited.borrow() {
            return;
        }
        // Either the flag flips or the supervisor is gone; both mean
        // the child is down.
        let _ = exited.changed().await;
    }

    /// Kills the child and waits for it to be reaped.
    ///
    /// TODO: ask the guest init for a polite shutdown over vsock before
    /// escalating to a kill.
    pub async fn shutdown(&self) {
        if !self.finished.load(Ordering::SeqCst) {
            if let Some(pid) = self.pid {
                debug!("killing VM instance {} (pid {pid})", self.id);
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        self.wait().await;
    }

    /// Polls the API root until it answers 200 or the deadline passes.
    /// Connection errors are expected while the VMM is still coming up.
    async fn wait_for_online(&self) -> Result<()> {
        let deadline = Instant::now() + VMM_READY_DEADLINE;
        loop {
            tokio::time::sleep(VMM_READY_POLL_INTERVAL).await;
            if Instant::now() >= deadline {
                return Err(Error::VmmNotReachable {
                    socket: self.socket_path.clone(),
                    timeout: VMM_READY_DEADLINE,
                });
            }

            match self.request("GET", "/", None).await {
                Ok((200, _)) => return Ok(()),
                Ok((status, _)) => debug!("VMM probe answered {status}, retrying"),
                Err(_) => {}
            }
        }
    }

    async fn put<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let json = serde_json::to_string(body)?;
        let (status, response) = self.request("PUT", endpoint, Some(&json)).await?;
        if status != 204 {
            return Err(Error::VmmProtocol {
                endpoint: endpoint.to_string(),
                status,
                body: response,
            });
        }
        debug!("VMM accepted {endpoint}");
        Ok(())
    }

    /// One HTTP/1.1 exchange over a fresh socket connection.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<(u16, String)> {
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await?;
            let payload = body.unwrap_or("");
            let head = format!(
                "{method} {path} HTTP/1.1\r\n\
                 Host: localhost\r\n\
                 Content-Type: application/json\r\n\
                 Content-Length: {}\r\n\r\n",
                payload.len()
            );
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(payload.as_bytes()).await?;
            read_response(stream).await
        };

        let (status, body) = tokio::time::timeout(VMM_REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("VMM API request to {path} timed out"),
                ))
            })??;
        Ok((status, body))
    }
}

/// Parses status line, headers, and a content-length body.
async fn read_response(stream: UnixStream) -> std::io::Result<(u16, String)> {
    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed status line: {status_line:?}"),
            )
        })?;

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        let read = reader.read_line(&mut header).await?;
        if read == 0 || header.trim().is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}
