//! # Layer Squasher
//!
//! Turns a registry image into a single read-only squashed filesystem
//! image: selects the platform manifest, streams each gzipped layer
//! tarball into a working tree in declared order, then packs the tree.
//!
//! ## Working Tree
//!
//! Extraction happens under `<temp_dir>/squashwork`. The directory is
//! recreated (mode 0700) on entry and removed on every exit path,
//! including errors and cancellation, via an RAII guard.
//!
//! ## Capability Seams
//!
//! Extraction and packing are opaque helpers behind [`TarballExtractor`]
//! and [`TreePacker`]. The defaults stream gzip+tar in-process and shell
//! out to `mksquashfs`; tests substitute recording doubles.
//!
//! ## Layer Integrity
//!
//! Each compressed layer stream is hashed while it is extracted and the
//! result checked against the layer's declared digest.

use crate::constants::{ACCEPTED_LAYER_MEDIA_TYPES, PACKER_COMMAND, SQUASH_WORK_DIR};
use crate::error::{Error, Result};
use crate::platform::{select_manifest, PlatformVariant};
use crate::registry::{ImageReference, ImageRegistry, RuntimeConfig};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tokio::process::Command;
use tracing::{debug, info, warn};

// =============================================================================
// Request Options
// =============================================================================

/// What to pull and where to stage it.
#[derive(Debug, Clone)]
pub struct SquashRequest {
    /// Image name, e.g. `redis`.
    pub image: String,
    /// Tag, e.g. `latest`.
    pub tag: String,
    /// Registry host.
    pub registry: String,
    /// Platform the image must be able to boot on.
    pub platform: PlatformVariant,
    /// Directory the working tree is created under.
    pub temp_dir: PathBuf,
}

impl Default for SquashRequest {
    fn default() -> Self {
        Self {
            image: "ubuntu".to_string(),
            tag: crate::constants::DEFAULT_TAG.to_string(),
            registry: crate::constants::DEFAULT_REGISTRY.to_string(),
            platform: PlatformVariant::built(),
            temp_dir: PathBuf::from("."),
        }
    }
}

impl SquashRequest {
    /// Sets the image and tag to retrieve.
    pub fn with_image(mut self, image: &str, tag: &str) -> Self {
        self.image = image.to_string();
        self.tag = tag.to_string();
        self
    }

    /// Sets the registry the image is retrieved from.
    pub fn with_registry(mut self, registry: &str) -> Self {
        self.registry = registry.to_string();
        self
    }

    /// Sets the platform the image is selected for.
    pub fn with_platform(mut self, platform: PlatformVariant) -> Self {
        self.platform = platform;
        self
    }

    /// Sets the directory used for staging; a subdirectory is created
    /// underneath, so it does not need to be empty.
    pub fn with_temp_dir(mut self, dir: &Path) -> Self {
        self.temp_dir = dir.to_path_buf();
        self
    }
}

// =============================================================================
// Extraction / Packing Capabilities
// =============================================================================

/// Extracts one compressed layer archive into a directory.
pub trait TarballExtractor: Send + Sync {
    /// Unpacks `archive` into `dir`, preserving permissions. The
    /// extractor may stop reading at the archive's end marker; it does
    /// not have to drain the stream.
    fn extract(&self, archive: &mut (dyn Read + Send), dir: &Path) -> Result<()>;
}

/// Packs a fully materialised tree into a single squashed image.
#[async_trait]
pub trait TreePacker: Send + Sync {
    /// Verifies the packer can run at all. Called before any network
    /// work so a missing helper fails fast.
    fn preflight(&self) -> Result<()> {
        Ok(())
    }

    /// Packs `dir` into the image at `output`.
    async fn pack(&self, dir: &Path, output: &Path) -> Result<()>;
}

/// In-process gzip + tar extraction.
#[derive(Debug, Default, Clone)]
pub struct GzipTarExtractor;

impl TarballExtractor for GzipTarExtractor {
    fn extract(&self, archive: &mut (dyn Read + Send), dir: &Path) -> Result<()> {
        let mut unpacker = Archive::new(GzDecoder::new(archive));
        unpacker.set_preserve_permissions(true);
        unpacker.set_preserve_mtime(true);
        unpacker.unpack(dir)?;
        Ok(())
    }
}

/// Packs via the external `mksquashfs` helper.
#[derive(Debug, Default, Clone)]
pub struct MksquashfsPacker;

#[async_trait]
impl TreePacker for MksquashfsPacker {
    fn preflight(&self) -> Result<()> {
        if !tool_on_path(PACKER_COMMAND) {
            return Err(Error::ToolMissing(PACKER_COMMAND));
        }
        Ok(())
    }

    async fn pack(&self, dir: &Path, output: &Path) -> Result<()> {
        debug!("packing {} into {}", dir.display(), output.display());
        let result = Command::new(PACKER_COMMAND)
            .arg(dir)
            .arg(output)
            .output()
            .await?;

        if !result.status.success() {
            return Err(Error::SubprocessFailed {
                command: PACKER_COMMAND.to_string(),
                stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// Checks whether an executable is reachable through `PATH`.
pub(crate) fn tool_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

// =============================================================================
// Working Tree Guard
// =============================================================================

/// Working tree that removes itself on drop, so every exit path (early
/// error, cancellation, success) leaves no residue behind.
struct WorkTree {
    path: PathBuf,
}

impl WorkTree {
    fn create(temp_dir: &Path) -> Result<Self> {
        let path = temp_dir.join(SQUASH_WORK_DIR);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        let mut builder = fs::DirBuilder::new();
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.recursive(true).create(&path)?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkTree {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!("failed to remove working tree {}: {e}", self.path.display());
        }
    }
}

// =============================================================================
// Layer Hashing
// =============================================================================

/// Reader wrapper feeding everything it passes through into a digest.
struct DigestingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

// =============================================================================
// Squasher
// =============================================================================

/// Pulls an image and squashes its layers into one read-only image.
pub struct LayerSquasher {
    registry: Arc<dyn ImageRegistry>,
    extractor: Arc<dyn TarballExtractor>,
    packer: Arc<dyn TreePacker>,
}

impl LayerSquasher {
    /// Builds a squasher with the default in-process extractor and
    /// `mksquashfs` packer.
    pub fn new(registry: Arc<dyn ImageRegistry>) -> Self {
        Self::with_helpers(
            registry,
            Arc::new(GzipTarExtractor),
            Arc::new(MksquashfsPacker),
        )
    }

    /// Builds a squasher with explicit extract/pack helpers.
    pub fn with_helpers(
        registry: Arc<dyn ImageRegistry>,
        extractor: Arc<dyn TarballExtractor>,
        packer: Arc<dyn TreePacker>,
    ) -> Self {
        Self {
            registry,
            extractor,
            packer,
        }
    }

    /// Pulls the requested image for its platform and packs the squashed
    /// image at `output`. Returns the output path and the image's
    /// runtime configuration.
    pub async fn pull_and_squash(
        &self,
        request: &SquashRequest,
        output: &Path,
    ) -> Result<(PathBuf, RuntimeConfig)> {
        self.packer.preflight()?;

        let reference = ImageReference::new(&request.registry, &request.image, &request.tag);

        let index = self.registry.fetch_index(&reference).await?;
        let chosen = select_manifest(request.platform, &index)?;
        info!(
            "selected manifest {} ({}) for {}",
            chosen.digest,
            chosen.describe(),
            reference
        );

        let image = self.registry.fetch_image(&reference, &chosen.digest).await?;

        let work = WorkTree::create(&request.temp_dir)?;
        for layer in &image.layers {
            if !ACCEPTED_LAYER_MEDIA_TYPES.contains(&layer.media_type()) {
                return Err(Error::UnsupportedLayer {
                    digest: layer.digest().to_string(),
                    media_type: layer.media_type().to_string(),
                });
            }

            debug!("extracting layer {}", layer.digest());
            let computed = self
                .extract_layer(layer.compressed()?, work.path().to_path_buf())
                .await?;
            verify_layer_digest(layer.digest(), &computed)?;
        }

        self.packer.pack(work.path(), output).await?;

        Ok((output.to_path_buf(), image.config))
        // `work` drops here, removing the tree.
    }

    /// Runs one blocking extraction off the async runtime and returns
    /// the hex digest of the full compressed blob.
    async fn extract_layer(
        &self,
        archive: Box<dyn Read + Send>,
        dir: PathBuf,
    ) -> Result<String> {
        let extractor = Arc::clone(&self.extractor);

        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut reader = DigestingReader {
                inner: archive,
                hasher: Sha256::new(),
            };
            extractor.extract(&mut reader, &dir)?;

            // The unpacker stops at the end-of-archive marker; trailing
            // padding and the gzip trailer still count toward the blob
            // digest.
            std::io::copy(&mut reader, &mut std::io::sink())?;

            Ok(format!("{:x}", reader.hasher.finalize()))
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// Compares a computed sha256 hex digest against a declared
/// `sha256:<hex>` digest. Other algorithms are not checked.
fn verify_layer_digest(declared: &str, computed_hex: &str) -> Result<()> {
    match declared.strip_prefix("sha256:") {
        Some(expected) if expected.eq_ignore_ascii_case(computed_hex) => Ok(()),
        Some(_) => Err(Error::LayerDigestMismatch {
            expected: declared.to_string(),
            computed: format!("sha256:{computed_hex}"),
        }),
        None => {
            debug!("layer digest {declared} uses an unchecked algorithm");
            Ok(())
        }
    }
}
