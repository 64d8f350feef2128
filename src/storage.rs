//! # Scratch Storage Allocator
//!
//! Allocates per-VM writable filesystem images. Each VM pairs its
//! read-only squashed root with one scratch image: the space-efficient
//! root can be shared across instances while writes land here.
//!
//! Backed by plain files for now; the seam is small enough to move onto
//! something more interesting later.

use crate::constants::{BYTES_PER_MEGABYTE, MKFS_COMMAND};
use crate::error::{Error, Result};
use crate::squasher::tool_on_path;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, warn};

/// Allocates writable ext4 images under a base directory.
pub struct ScratchStorage {
    base: PathBuf,
}

impl ScratchStorage {
    /// Creates the allocator, making sure the base directory exists.
    /// The base is resolved to an absolute path so returned image paths
    /// are usable from any working directory.
    pub fn new(base: &Path) -> Result<Self> {
        fs::create_dir_all(base)?;
        Ok(Self {
            base: fs::canonicalize(base)?,
        })
    }

    /// Verifies the filesystem formatter is available.
    pub fn ensure_required_tools() -> Result<()> {
        if !tool_on_path(MKFS_COMMAND) {
            return Err(Error::ToolMissing(MKFS_COMMAND));
        }
        Ok(())
    }

    /// Creates `<base>/<id>.ext4` of `size_mb` decimal megabytes,
    /// preallocated and formatted. The partial file is removed on any
    /// failure. Returns the absolute image path.
    pub async fn create_image(&self, id: &str, size_mb: u64) -> Result<PathBuf> {
        let path = self.base.join(format!("{id}.ext4"));
        debug!("allocating scratch image {} ({size_mb} MB)", path.display());

        let file = fs::File::create(&path)?;
        if let Err(e) = preallocate(&file, size_mb * BYTES_PER_MEGABYTE) {
            drop(file);
            remove_partial(&path);
            return Err(e);
        }
        drop(file);

        let result = Command::new(MKFS_COMMAND).arg(&path).output().await;
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                remove_partial(&path);
                return Err(e.into());
            }
        };
        if !output.status.success() {
            remove_partial(&path);
            return Err(Error::SubprocessFailed {
                command: format!("{MKFS_COMMAND} {}", path.display()),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(path)
    }
}

fn preallocate(file: &fs::File, bytes: u64) -> Result<()> {
    nix::fcntl::fallocate(
        file.as_raw_fd(),
        nix::fcntl::FallocateFlags::empty(),
        0,
        bytes as i64,
    )
    .map_err(|errno| Error::Syscall {
        operation: "fallocate",
        source: std::io::Error::from_raw_os_error(errno as i32),
    })?;
    Ok(())
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("failed to remove partial image {}: {e}", path.display());
    }
}
