//! # OCI Registry Fetcher
//!
//! Resolves image references against a registry: reference → multi-arch
//! index → platform manifest → layers + runtime config.
//!
//! ## Capability Seam
//!
//! The low-level registry protocol is a collaborator, not part of the
//! core: everything downstream consumes the [`ImageRegistry`] trait,
//! which returns manifest descriptors, layer handles, and the image's
//! runtime configuration. The default implementation,
//! [`OciRegistryClient`], speaks HTTPS to an OCI-compliant registry via
//! `oci-distribution`. Tests substitute in-memory doubles.
//!
//! ## Reference Canonicalisation
//!
//! - empty registry → `index.docker.io`
//! - empty tag → `latest`
//!
//! ## Layer Order
//!
//! Layer handles come back in the image's declared order: `layers[0]` is
//! the base, later layers overlay earlier ones. The squasher depends on
//! this ordering.
//!
//! ## Authentication
//!
//! Anonymous access only in v1.

use crate::constants::{DEFAULT_REGISTRY, DEFAULT_TAG};
use crate::error::{Error, Result};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciManifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};
use std::sync::Mutex;
use tracing::{debug, info};

// =============================================================================
// Image Reference
// =============================================================================

/// A canonicalised (registry, repository, tag) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, e.g. `index.docker.io`.
    pub registry: String,
    /// Repository within the registry, e.g. `library/redis`.
    pub repository: String,
    /// Tag, e.g. `latest`.
    pub tag: String,
}

impl ImageReference {
    /// Builds a reference from explicit parts, applying defaults for
    /// empty registry and tag.
    pub fn new(registry: &str, repository: &str, tag: &str) -> Self {
        Self {
            registry: if registry.is_empty() {
                DEFAULT_REGISTRY.to_string()
            } else {
                registry.to_string()
            },
            repository: repository.to_string(),
            tag: if tag.is_empty() {
                DEFAULT_TAG.to_string()
            } else {
                tag.to_string()
            },
        }
    }

    /// Parses a user-supplied reference such as `redis`, `redis:7`, or
    /// `ghcr.io/org/app:v1`.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(Error::InvalidReference {
                reference: reference.to_string(),
                reason: "empty reference".to_string(),
            });
        }

        if !reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
        {
            return Err(Error::InvalidReference {
                reference: reference.to_string(),
                reason: "contains invalid characters".to_string(),
            });
        }

        // A leading segment with a dot, a colon, or `localhost` names a
        // registry; everything else is repository path.
        let (registry, rest) = match reference.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (String::new(), reference.to_string()),
        };

        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
            _ => (rest, String::new()),
        };

        if repository.is_empty() {
            return Err(Error::InvalidReference {
                reference: reference.to_string(),
                reason: "missing repository".to_string(),
            });
        }

        Ok(Self::new(&registry, &repository, &tag))
    }

    /// The full `registry/repository:tag` form.
    pub fn whole(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    /// The `registry/repository@digest` form addressing resolved content.
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}/{}@{}", self.registry, self.repository, digest)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.whole())
    }
}

// =============================================================================
// Index and Layers
// =============================================================================

/// One entry of a multi-arch index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDescriptor {
    /// Content digest of the per-platform manifest.
    pub digest: String,
    /// Operating system the manifest targets, e.g. `linux`.
    pub os: String,
    /// CPU architecture tag, e.g. `amd64` or `arm64`.
    pub architecture: String,
    /// Architecture variant, e.g. `v8`; empty when absent.
    pub variant: String,
}

impl ManifestDescriptor {
    /// The `architecture || variant` tag used for platform selection.
    pub fn platform_tag(&self) -> String {
        format!("{}{}", self.architecture, self.variant)
    }

    /// Human-readable platform description for error reporting.
    pub fn describe(&self) -> String {
        if self.variant.is_empty() {
            format!("{}/{}", self.os, self.architecture)
        } else {
            format!("{}/{}/{}", self.os, self.architecture, self.variant)
        }
    }
}

/// Handle to one image layer: digest, media type, and a single-shot
/// streaming reader over the gzipped tarball.
pub struct LayerHandle {
    digest: String,
    media_type: String,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
}

impl LayerHandle {
    /// Wraps an arbitrary reader as a layer stream.
    pub fn new(digest: &str, media_type: &str, reader: Box<dyn Read + Send>) -> Self {
        Self {
            digest: digest.to_string(),
            media_type: media_type.to_string(),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Wraps already-fetched bytes as a layer stream.
    pub fn from_bytes(digest: &str, media_type: &str, bytes: Vec<u8>) -> Self {
        Self::new(digest, media_type, Box::new(Cursor::new(bytes)))
    }

    /// Layer content digest (over the compressed bytes).
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Layer media type.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Takes the compressed stream. Readers are single-shot: a second
    /// call fails.
    pub fn compressed(&self) -> Result<Box<dyn Read + Send>> {
        self.reader
            .lock()
            .expect("layer reader lock poisoned")
            .take()
            .ok_or_else(|| {
                Error::Io(std::io::Error::other(format!(
                    "compressed stream for layer {} already consumed",
                    self.digest
                )))
            })
    }
}

impl std::fmt::Debug for LayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerHandle")
            .field("digest", &self.digest)
            .field("media_type", &self.media_type)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Runtime Config
// =============================================================================

/// Runtime configuration carried by the image, applied by the guest init
/// after boot.
///
/// Serialises with the field names of the guest metadata contract.
/// `env` entries are `KEY=VALUE` strings in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Ordered argv prefix; may be empty.
    pub entrypoint: Vec<String>,
    /// Ordered argv continuation.
    pub cmd: Vec<String>,
    /// `KEY=VALUE` pairs, insertion order preserved.
    #[serde(rename = "environment")]
    pub env: Vec<String>,
    /// Directory switched to before exec.
    pub workdir: String,
}

/// `config` section of an OCI image config blob, with the upstream
/// field casing.
#[derive(Debug, Default, Deserialize)]
struct ImageConfigSection {
    #[serde(default, rename = "Entrypoint")]
    entrypoint: Option<Vec<String>>,
    #[serde(default, rename = "Cmd")]
    cmd: Option<Vec<String>>,
    #[serde(default, rename = "Env")]
    env: Option<Vec<String>>,
    #[serde(default, rename = "WorkingDir")]
    working_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImageConfigBlob {
    #[serde(default)]
    config: Option<ImageConfigSection>,
}

impl RuntimeConfig {
    /// Parses the runtime configuration out of a raw image config blob.
    pub fn from_image_config(blob: &str) -> Result<Self> {
        let parsed: ImageConfigBlob = serde_json::from_str(blob)?;
        let section = parsed.config.unwrap_or_default();
        Ok(Self {
            entrypoint: section.entrypoint.unwrap_or_default(),
            cmd: section.cmd.unwrap_or_default(),
            env: section.env.unwrap_or_default(),
            workdir: section.working_dir.unwrap_or_default(),
        })
    }
}

// =============================================================================
// Registry Capability
// =============================================================================

/// Layers and config of one resolved, platform-specific image.
#[derive(Debug)]
pub struct FetchedImage {
    /// Digest of the per-platform manifest this image was fetched by.
    pub digest: String,
    /// Layer handles in declared order (base first).
    pub layers: Vec<LayerHandle>,
    /// Runtime configuration carried by the image.
    pub config: RuntimeConfig,
}

/// Abstracted registry access.
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Yields the manifest descriptors available for a reference.
    async fn fetch_index(&self, reference: &ImageReference) -> Result<Vec<ManifestDescriptor>>;

    /// Yields the ordered layers and parsed config of the manifest named
    /// by `digest`.
    async fn fetch_image(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<FetchedImage>;
}

// =============================================================================
// Default HTTPS Implementation
// =============================================================================

/// Registry client speaking HTTPS to an OCI-compliant registry.
///
/// Anonymous pulls only; a fresh protocol client is built per operation.
#[derive(Debug, Default, Clone)]
pub struct OciRegistryClient;

impl OciRegistryClient {
    pub fn new() -> Self {
        Self
    }

    fn client() -> Client {
        Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        })
    }

    fn parse_remote(&self, reference: &ImageReference, raw: &str) -> Result<Reference> {
        raw.parse().map_err(|e| Error::InvalidReference {
            reference: reference.whole(),
            reason: format!("{e}"),
        })
    }

    /// Splits resolution failures from transport failures on a best-effort
    /// basis; the protocol library folds both into one error type.
    fn classify_pull_error(
        reference: &ImageReference,
        error: oci_distribution::errors::OciDistributionError,
    ) -> Error {
        let reason = error.to_string();
        if reason.to_lowercase().contains("not found") {
            Error::ImageNotFound {
                reference: reference.whole(),
                reason,
            }
        } else {
            Error::RegistryUnreachable {
                reference: reference.whole(),
                reason,
            }
        }
    }
}

#[async_trait]
impl ImageRegistry for OciRegistryClient {
    async fn fetch_index(&self, reference: &ImageReference) -> Result<Vec<ManifestDescriptor>> {
        let remote = self.parse_remote(reference, &reference.whole())?;
        let mut client = Self::client();

        info!("fetching index for {}", reference);

        let (manifest, digest) = client
            .pull_manifest(&remote, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| Self::classify_pull_error(reference, e))?;

        match manifest {
            OciManifest::ImageIndex(index) => {
                let descriptors = index
                    .manifests
                    .into_iter()
                    .filter_map(|entry| {
                        let platform = entry.platform?;
                        Some(ManifestDescriptor {
                            digest: entry.digest,
                            os: platform.os,
                            architecture: platform.architecture,
                            variant: platform.variant.unwrap_or_default(),
                        })
                    })
                    .collect();
                Ok(descriptors)
            }
            OciManifest::Image(_) => Err(Error::ImageNotFound {
                reference: reference.whole(),
                reason: format!("{digest} is not a multi-arch image index"),
            }),
        }
    }

    async fn fetch_image(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<FetchedImage> {
        let remote = self.parse_remote(reference, &reference.with_digest(digest))?;
        let mut client = Self::client();

        info!("fetching image {}@{}", reference, digest);

        let (manifest, _, config_blob) = client
            .pull_manifest_and_config(&remote, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| Self::classify_pull_error(reference, e))?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            debug!("fetching layer {} ({} bytes)", layer.digest, layer.size);

            let mut data = Vec::new();
            client
                .pull_blob(&remote, &layer.digest, &mut data)
                .await
                .map_err(|e| Self::classify_pull_error(reference, e))?;

            layers.push(LayerHandle::from_bytes(
                &layer.digest,
                &layer.media_type,
                data,
            ));
        }

        let config = RuntimeConfig::from_image_config(&config_blob)?;

        Ok(FetchedImage {
            digest: digest.to_string(),
            layers,
            config,
        })
    }
}
